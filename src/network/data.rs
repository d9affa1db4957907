//! Data channel: raw events from producers to a data collector.
//!
//! Each producer opens one TCP connection and sends every event as one frame holding its
//! native serialization. A single connection per producer keeps the producer's order.

use super::frame::{read_frame, write_frame};
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::producer::EventSink;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Producer side of the data channel.
pub struct DataSender {
    stream: TcpStream,
    peer: SocketAddr,
}

impl DataSender {
    /// Connect to the collector at `addr`.
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!(%peer, "data channel connected");
        Ok(Self { stream, peer })
    }
}

#[async_trait]
impl EventSink for DataSender {
    async fn send(&mut self, event: Event) -> AppResult<()> {
        write_frame(&mut self.stream, &event.to_bytes())
            .await
            .map_err(|e| DaqError::Protocol(format!("data channel to {}: {e}", self.peer)))
    }
}

/// Collector side of the data channel; forwards every received event to a channel.
pub struct DataReceiver {
    listener: TcpListener,
}

impl DataReceiver {
    /// Listen on `addr`.
    pub async fn bind(addr: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "data channel listening");
        Ok(Self { listener })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept producers until `events` is closed.
    pub async fn run(self, events: mpsc::Sender<Event>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let events = events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_producer(socket, peer, events).await {
                                warn!(%peer, error = %e, "data connection closed with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "data channel accept failed"),
                },
                _ = events.closed() => {
                    debug!("event consumer gone, data channel stops accepting");
                    break;
                }
            }
        }
    }

    async fn handle_producer(
        mut socket: TcpStream,
        peer: SocketAddr,
        events: mpsc::Sender<Event>,
    ) -> AppResult<()> {
        info!(%peer, "producer connected to data channel");
        let mut received = 0u64;
        while let Some(frame) = read_frame(&mut socket).await? {
            let event = Event::from_bytes(&frame).map_err(|e| {
                DaqError::Protocol(format!("frame {received} from {peer} is not an event: {e}"))
            })?;
            received += 1;
            if events.send(event).await.is_err() {
                break;
            }
        }
        info!(%peer, events = received, "producer left data channel");
        Ok(())
    }
}
