//! Run-control protocol: component lifecycle, links and the run controller.
//!
//! A run is driven by one [`RunControl`] implementation talking to every producer and data
//! collector through a [`ComponentLink`]. Components enforce the lifecycle themselves with
//! a [`StateMachine`]; the controller only advances when all of them agree.

pub mod controller;
pub mod link;
pub mod state;

use crate::error::AppResult;
use crate::registry::Registry;
use async_trait::async_trait;
use std::sync::Arc;

pub use controller::RunController;
pub use link::{ComponentHandle, ComponentKind, ComponentLink, ControlMessage, LocalLink};
pub use state::{Command, CommandKind, ComponentStatus, State, StateMachine};

/// Single authority issuing lifecycle commands for a run.
#[async_trait]
pub trait RunControl: Send + Sync {
    /// Add a component and the parameters it is configured with.
    fn add_component(&mut self, link: Arc<dyn ComponentLink>, params: toml::Table);

    /// Names of the connected components, in the order they were added.
    fn components(&self) -> Vec<String>;

    /// Number of the current or last run.
    fn run_number(&self) -> Option<u32>;

    /// Configure every component.
    async fn configure(&mut self) -> AppResult<()>;

    /// Start run `run_number` on every component.
    async fn start_run(&mut self, run_number: u32) -> AppResult<()>;

    /// Stop the current run on every component.
    async fn stop_run(&mut self) -> AppResult<()>;

    /// Terminate every component.
    async fn terminate(&mut self) -> AppResult<()>;

    /// Ask every component for its status.
    async fn status(&self) -> Vec<(String, AppResult<ComponentStatus>)>;
}

/// Register the built-in run controller.
pub fn register(registry: &mut Registry) -> AppResult<()> {
    registry.register_run_controller("default", |config, log| {
        Box::new(RunController::new(config.clone(), log)) as Box<dyn RunControl>
    })
}
