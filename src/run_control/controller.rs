//! Synchronized run control over every connected component.

use super::link::{ComponentKind, ComponentLink};
use super::state::{Command, CommandKind, ComponentStatus, State};
use super::RunControl;
use crate::config::RunControlConfig;
use crate::error::{AppResult, ComponentFailure, DaqError};
use crate::log_collector::{LogCollector, LogLevel, LogRecord};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

struct Component {
    link: Arc<dyn ComponentLink>,
    params: toml::Table,
}

/// Run controller broadcasting each command to all components and refusing to advance
/// the run unless every one of them reached the requested state.
///
/// Collectors are started before producers and stopped after them, so no producer stream
/// begins before something is listening or ends after the file was closed.
pub struct RunController {
    config: RunControlConfig,
    log: Arc<dyn LogCollector>,
    components: Vec<Component>,
    run_number: Option<u32>,
}

impl RunController {
    /// Controller with no components.
    pub fn new(config: RunControlConfig, log: Arc<dyn LogCollector>) -> Self {
        Self {
            config,
            log,
            components: Vec::new(),
            run_number: None,
        }
    }

    fn links(&self, kind: Option<ComponentKind>) -> Vec<Arc<dyn ComponentLink>> {
        self.components
            .iter()
            .filter(|c| kind.map_or(true, |k| c.link.kind() == k))
            .map(|c| Arc::clone(&c.link))
            .collect()
    }

    /// Send one command to `links` concurrently and require `target` from every reply.
    async fn broadcast(
        &self,
        links: Vec<Arc<dyn ComponentLink>>,
        command: impl Fn(&str) -> Command,
        target: State,
        bound: Duration,
    ) -> AppResult<Vec<ComponentStatus>> {
        let requests = links.iter().map(|link| {
            let command = command(link.name());
            let kind = command.kind();
            async move {
                let outcome = match timeout(bound, link.send(command)).await {
                    Ok(result) => result,
                    Err(_) => Err(DaqError::Timeout {
                        operation: format!("waiting for {} to answer {kind}", link.name()),
                        after: bound,
                    }),
                };
                (link.name().to_string(), outcome)
            }
        });
        let replies = join_all(requests).await;

        let mut statuses = Vec::with_capacity(replies.len());
        let mut failures = Vec::new();
        for (name, outcome) in replies {
            match outcome {
                Ok(status) if status.state == target => {
                    self.log.log(LogRecord::new(
                        LogLevel::Info,
                        &name,
                        format!("{} (run {}, {} events)", status.state, status.run_number, status.events),
                    ));
                    statuses.push(status);
                }
                Ok(status) => {
                    let message = status.last_error.clone().unwrap_or_else(|| {
                        format!("reached {} instead of {target}", status.state)
                    });
                    failures.push(ComponentFailure {
                        name: name.clone(),
                        state: status.state.to_string(),
                        message,
                    });
                    statuses.push(status);
                }
                Err(err) => failures.push(ComponentFailure {
                    name: name.clone(),
                    state: "unreachable".to_string(),
                    message: err.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            return Ok(statuses);
        }
        for failure in &failures {
            error!(
                component = %failure.name,
                state = %failure.state,
                error = %failure.message,
                "component did not reach {target}"
            );
            self.log.log(LogRecord::new(
                LogLevel::Error,
                &failure.name,
                format!("[{}] {}", failure.state, failure.message),
            ));
        }
        Err(DaqError::RunBlocked {
            command: command_name(target).to_string(),
            failures,
        })
    }

    fn params_for(&self, name: &str) -> toml::Table {
        self.components
            .iter()
            .find(|c| c.link.name() == name)
            .map(|c| c.params.clone())
            .unwrap_or_default()
    }
}

fn command_name(target: State) -> CommandKind {
    match target {
        State::Configured => CommandKind::Configure,
        State::Running => CommandKind::StartRun,
        State::Stopped => CommandKind::StopRun,
        State::Terminated => CommandKind::Terminate,
        State::Unconfigured | State::Error => CommandKind::Status,
    }
}

#[async_trait]
impl RunControl for RunController {
    fn add_component(&mut self, link: Arc<dyn ComponentLink>, params: toml::Table) {
        info!(component = link.name(), kind = %link.kind(), "component added");
        self.components.push(Component { link, params });
    }

    fn components(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|c| c.link.name().to_string())
            .collect()
    }

    fn run_number(&self) -> Option<u32> {
        self.run_number
    }

    async fn configure(&mut self) -> AppResult<()> {
        info!(components = self.components.len(), "configuring");
        let links = self.links(None);
        self.broadcast(
            links,
            |name| Command::Configure(self.params_for(name)),
            State::Configured,
            self.config.command_timeout,
        )
        .await?;
        Ok(())
    }

    async fn start_run(&mut self, run_number: u32) -> AppResult<()> {
        info!(run = run_number, "starting run");
        for kind in [ComponentKind::Collector, ComponentKind::Producer] {
            let links = self.links(Some(kind));
            self.broadcast(
                links,
                |_| Command::StartRun(run_number),
                State::Running,
                self.config.command_timeout,
            )
            .await?;
        }
        self.run_number = Some(run_number);
        self.log.log(LogRecord::new(
            LogLevel::Info,
            "RunControl",
            format!("run {run_number} started"),
        ));
        Ok(())
    }

    async fn stop_run(&mut self) -> AppResult<()> {
        info!(run = ?self.run_number, "stopping run");
        let mut statuses = Vec::new();
        for kind in [ComponentKind::Producer, ComponentKind::Collector] {
            let links = self.links(Some(kind));
            statuses.extend(
                self.broadcast(links, |_| Command::StopRun, State::Stopped, self.config.command_timeout)
                    .await?,
            );
        }
        for status in &statuses {
            info!(
                component = %status.name,
                run = status.run_number,
                events = status.events,
                "run summary"
            );
        }
        self.log.log(LogRecord::new(
            LogLevel::Info,
            "RunControl",
            format!("run {} stopped", self.run_number.unwrap_or_default()),
        ));
        Ok(())
    }

    async fn terminate(&mut self) -> AppResult<()> {
        info!("terminating");
        let mut result = Ok(());
        for kind in [ComponentKind::Producer, ComponentKind::Collector] {
            let links = self.links(Some(kind));
            if let Err(err) = self
                .broadcast(links, |_| Command::Terminate, State::Terminated, self.config.terminate_timeout)
                .await
            {
                // Collectors are still terminated when a producer is not
                result = Err(err);
            }
        }
        if let Err(e) = self.log.flush() {
            warn!(error = %e, "cannot flush log collector");
        }
        result
    }

    async fn status(&self) -> Vec<(String, AppResult<ComponentStatus>)> {
        let bound = self.config.command_timeout;
        let requests = self.components.iter().map(|c| async move {
            let outcome = match timeout(bound, c.link.send(Command::Status)).await {
                Ok(result) => result,
                Err(_) => Err(DaqError::Timeout {
                    operation: format!("waiting for status of {}", c.link.name()),
                    after: bound,
                }),
            };
            (c.link.name().to_string(), outcome)
        });
        join_all(requests).await
    }
}
