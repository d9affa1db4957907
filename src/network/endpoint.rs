//! Control channel server and client.
//!
//! A [`CommandEndpoint`] exposes one component actor on a TCP port. Each client gets a
//! session; requests are answered in order, and a session idle for longer than the read
//! timeout is closed. [`RemoteLink`] is the run controller's client for an endpoint.

use super::frame::{read_frame, write_frame};
use super::protocol::{CommandRequest, ResponseStatus, StatusResponse};
use crate::error::{AppResult, DaqError};
use crate::run_control::{Command, ComponentHandle, ComponentKind, ComponentLink, ComponentStatus};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const READ_TIMEOUT: Duration = Duration::from_secs(600);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
// Time given to in-flight replies after the component terminated
const SHUTDOWN_LINGER: Duration = Duration::from_millis(200);

/// TCP server for the control channel of one component.
pub struct CommandEndpoint {
    listener: TcpListener,
    handle: ComponentHandle,
    read_timeout: Duration,
    command_timeout: Duration,
}

impl CommandEndpoint {
    /// Listen on `addr` for commands to `handle`.
    pub async fn bind(addr: &str, handle: ComponentHandle) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(component = handle.name(), addr = %listener.local_addr()?, "command endpoint listening");
        Ok(Self {
            listener,
            handle,
            read_timeout: READ_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
        })
    }

    /// Close sessions idle for longer than `read_timeout`.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Bound on the component's answer to one command.
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the component has terminated.
    pub async fn run(self) -> AppResult<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let handle = self.handle.clone();
                        let read_timeout = self.read_timeout;
                        let command_timeout = self.command_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_client(socket, peer, handle, read_timeout, command_timeout).await
                            {
                                warn!(%peer, error = %e, "control session error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "control channel accept failed"),
                },
                _ = self.handle.terminated() => {
                    info!(component = self.handle.name(), "component terminated, endpoint closing");
                    tokio::time::sleep(SHUTDOWN_LINGER).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_client(
        mut socket: TcpStream,
        peer: SocketAddr,
        handle: ComponentHandle,
        read_timeout: Duration,
        command_timeout: Duration,
    ) -> AppResult<()> {
        let session = Uuid::new_v4();
        info!(%peer, %session, component = handle.name(), "run control connected");

        loop {
            let frame = match timeout(read_timeout, read_frame(&mut socket)).await {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    info!(%peer, %session, "run control disconnected");
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    info!(%peer, %session, "idle control session closed");
                    break;
                }
            };

            let response = match CommandRequest::decode(&frame) {
                Ok(request) => Self::process_request(request, &handle, command_timeout).await,
                Err(e) => {
                    error!(%peer, error = %e, "failed to decode request");
                    StatusResponse::error(
                        0,
                        ResponseStatus::InvalidRequest,
                        handle.name(),
                        format!("Failed to decode request: {e}"),
                    )
                }
            };
            write_frame(&mut socket, &response.encode()).await?;
        }
        Ok(())
    }

    async fn process_request(
        request: CommandRequest,
        handle: &ComponentHandle,
        command_timeout: Duration,
    ) -> StatusResponse {
        debug!(command = %request.command, run = request.run_number, "request received");
        if request.name != handle.name() {
            return StatusResponse::error(
                request.request_id,
                ResponseStatus::InvalidRequest,
                handle.name(),
                format!("command for '{}' reached '{}'", request.name, handle.name()),
            );
        }
        let command = match request.to_command() {
            Ok(command) => command,
            Err(e) => {
                return StatusResponse::error(
                    request.request_id,
                    ResponseStatus::InvalidRequest,
                    handle.name(),
                    e.to_string(),
                )
            }
        };
        match timeout(command_timeout, handle.request(command)).await {
            Ok(Ok(status)) => StatusResponse::from_status(request.request_id, &status),
            Ok(Err(e)) => StatusResponse::error(
                request.request_id,
                ResponseStatus::Error,
                handle.name(),
                e.to_string(),
            ),
            Err(_) => StatusResponse::error(
                request.request_id,
                ResponseStatus::Timeout,
                handle.name(),
                format!("no answer within {command_timeout:?}"),
            ),
        }
    }
}

/// Run controller's connection to a [`CommandEndpoint`].
///
/// The TCP connection is opened on first use and reopened once if it was lost.
pub struct RemoteLink {
    name: String,
    kind: ComponentKind,
    addr: String,
    connection: Mutex<Option<TcpStream>>,
    next_request: AtomicU32,
}

impl RemoteLink {
    /// Link to component `name` served at `addr`.
    pub fn new(name: impl Into<String>, kind: ComponentKind, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            addr: addr.into(),
            connection: Mutex::new(None),
            next_request: AtomicU32::new(1),
        }
    }

    async fn exchange(stream: &mut TcpStream, request: &[u8]) -> AppResult<Vec<u8>> {
        write_frame(stream, request).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| DaqError::Protocol("endpoint closed the connection".to_string()))
    }
}

#[async_trait]
impl ComponentLink for RemoteLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn send(&self, command: Command) -> AppResult<ComponentStatus> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let request = CommandRequest::new(request_id, &self.name, &command)?.encode();

        let mut connection = self.connection.lock().await;
        let mut reply = None;
        for attempt in 0..2 {
            // Held outside the slot during the exchange; a cancelled send drops it
            let mut stream = match connection.take() {
                Some(stream) => stream,
                None => {
                    let stream = TcpStream::connect(&self.addr).await?;
                    stream.set_nodelay(true)?;
                    stream
                }
            };
            match Self::exchange(&mut stream, &request).await {
                Ok(bytes) => {
                    *connection = Some(stream);
                    reply = Some(bytes);
                    break;
                }
                Err(e) => {
                    if attempt == 1 {
                        return Err(e);
                    }
                    debug!(component = %self.name, error = %e, "control connection lost, reconnecting");
                }
            }
        }
        let reply = reply.ok_or_else(|| DaqError::Protocol("no reply".to_string()))?;

        let response = StatusResponse::decode(&reply)?;
        if response.request_id != request_id {
            *connection = None;
            return Err(DaqError::Protocol(format!(
                "request {request_id} got the reply to request {}",
                response.request_id
            )));
        }
        match response.status {
            ResponseStatus::Success => Ok(response.to_status()),
            ResponseStatus::Timeout => Err(DaqError::Timeout {
                operation: format!("{} answering {}", self.name, command.kind()),
                after: COMMAND_TIMEOUT,
            }),
            ResponseStatus::Error | ResponseStatus::InvalidRequest => {
                Err(DaqError::Protocol(response.error))
            }
        }
    }
}
