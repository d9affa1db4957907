//! How a run controller reaches its components.
//!
//! A component runs as an actor task that receives [`ControlMessage`]s on an mpsc channel
//! and answers each one through a oneshot. [`ComponentHandle`] is the sending half.
//! [`ComponentLink`] hides whether the actor lives in this process ([`LocalLink`]) or
//! behind a command endpoint on another host
//! ([`RemoteLink`](crate::network::RemoteLink)).

use super::state::{Command, ComponentStatus, State};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

/// What a component does in a run; decides start and stop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Emits raw events.
    Producer,
    /// Receives and stores raw events.
    Collector,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentKind::Producer => write!(f, "producer"),
            ComponentKind::Collector => write!(f, "collector"),
        }
    }
}

/// Command delivered to a component actor.
#[derive(Debug)]
pub struct ControlMessage {
    /// The command.
    pub command: Command,
    /// Where the status after the command goes.
    pub reply: oneshot::Sender<ComponentStatus>,
}

/// Sending half of a component actor.
#[derive(Debug, Clone)]
pub struct ComponentHandle {
    name: String,
    kind: ComponentKind,
    sender: mpsc::Sender<ControlMessage>,
    state: watch::Receiver<State>,
}

impl ComponentHandle {
    /// Wrap the command channel of an actor.
    pub fn new(
        name: impl Into<String>,
        kind: ComponentKind,
        sender: mpsc::Sender<ControlMessage>,
        state: watch::Receiver<State>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            sender,
            state,
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component kind.
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Last state published by the actor.
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Send `command` and wait for the resulting status.
    pub async fn request(&self, command: Command) -> AppResult<ComponentStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControlMessage { command, reply: tx })
            .await
            .map_err(|_| DaqError::Protocol(format!("component '{}' has shut down", self.name)))?;
        rx.await.map_err(|_| {
            DaqError::Protocol(format!("component '{}' dropped the command", self.name))
        })
    }

    /// Resolve once the component reached [`State::Terminated`].
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        while *state.borrow_and_update() != State::Terminated {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Connection from the run controller to one component.
#[async_trait]
pub trait ComponentLink: Send + Sync {
    /// Logical name of the component.
    fn name(&self) -> &str;

    /// Kind of the component.
    fn kind(&self) -> ComponentKind;

    /// Deliver `command` and return the status the component reported afterwards.
    ///
    /// An `Err` means the component could not be reached; a rejected command is an `Ok`
    /// status whose state is not the requested one.
    async fn send(&self, command: Command) -> AppResult<ComponentStatus>;
}

/// Link to an actor in the same process.
pub struct LocalLink {
    handle: ComponentHandle,
}

impl LocalLink {
    /// Link over `handle`.
    pub fn new(handle: ComponentHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ComponentLink for LocalLink {
    fn name(&self) -> &str {
        self.handle.name()
    }

    fn kind(&self) -> ComponentKind {
        self.handle.kind()
    }

    async fn send(&self, command: Command) -> AppResult<ComponentStatus> {
        self.handle.request(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_control::state::StateMachine;

    fn echo_actor() -> ComponentHandle {
        let (tx, mut rx) = mpsc::channel::<ControlMessage>(4);
        let mut machine = StateMachine::new("echo");
        let handle = ComponentHandle::new("echo", ComponentKind::Collector, tx, machine.subscribe());
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let kind = msg.command.kind();
                if machine.check(kind).is_ok() {
                    if let Some(target) = State::target_of(kind) {
                        machine.set(target);
                    }
                }
                let _ = msg.reply.send(machine.status());
            }
        });
        handle
    }

    #[tokio::test]
    async fn test_local_link_round_trip() {
        let handle = echo_actor();
        let link = LocalLink::new(handle.clone());
        assert_eq!(link.name(), "echo");
        assert_eq!(link.kind(), ComponentKind::Collector);

        let status = link.send(Command::Configure(toml::Table::new())).await.unwrap();
        assert_eq!(status.state, State::Configured);

        let status = link.send(Command::StopRun).await.unwrap();
        assert_eq!(status.state, State::Configured);
        assert!(status.last_error.unwrap().contains("StopRun"));
    }

    #[tokio::test]
    async fn test_terminated_resolves() {
        let handle = echo_actor();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.terminated().await })
        };
        handle.request(Command::Terminate).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_request_to_stopped_actor_fails() {
        let (tx, rx) = mpsc::channel::<ControlMessage>(1);
        let (_state_tx, state_rx) = watch::channel(State::Unconfigured);
        drop(rx);
        let handle = ComponentHandle::new("gone", ComponentKind::Producer, tx, state_rx);
        assert!(matches!(
            handle.request(Command::Status).await,
            Err(DaqError::Protocol(_))
        ));
    }
}
