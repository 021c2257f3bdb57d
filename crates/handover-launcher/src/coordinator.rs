use anyhow::Context;
use handover_process::ProcessRole;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::handoff::HandoffStore;
use crate::scanner::{LogScanner, ScanHit};
use crate::supervisor::{ChildEvent, ProcessSupervisor};

/// Pipeline-wide lifecycle. A single instance, transitioned only inside the
/// coordinator task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    StartingAgent,
    EndpointCaptured,
    StartingUi,
    Running,
    Restarting,
    ShuttingDown,
    Stopped,
}

/// Drives the pipeline: agent first, endpoint handoff, then UI; any
/// unplanned child exit loops the whole sequence back through a fixed
/// restart delay. Restart attempts are unbounded.
pub struct RestartCoordinator {
    config: Config,
    supervisor: ProcessSupervisor,
    scanner: LogScanner,
    store: HandoffStore,
    state: SupervisorState,
    restart_at: Option<tokio::time::Instant>,
    events: mpsc::UnboundedReceiver<ChildEvent>,
    shutdown: watch::Receiver<bool>,
}

async fn restart_deadline(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl RestartCoordinator {
    pub fn new(
        config: Config,
        supervisor: ProcessSupervisor,
        events: mpsc::UnboundedReceiver<ChildEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let store = HandoffStore::new(config.handoff_path.clone());
        Self {
            config,
            supervisor,
            scanner: LogScanner::new(),
            store,
            state: SupervisorState::Idle,
            restart_at: None,
            events,
            shutdown,
        }
    }

    /// Runs until an external termination request (Ok) or a fatal agent
    /// spawn failure (Err, non-zero exit).
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.start_cycle().await?;

        loop {
            let restart_at = self.restart_at;
            tokio::select! {
                _ = restart_deadline(restart_at) => {
                    self.start_cycle().await?;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.shut_down().await;
                        return Ok(());
                    }
                }
                ev = self.events.recv() => {
                    let Some(ev) = ev else {
                        // Event channel closed: nothing left to supervise.
                        self.shut_down().await;
                        return Ok(());
                    };
                    self.handle_event(ev).await?;
                }
            }
        }
    }

    /// Entry into StartingAgent, from Idle or Restarting. The handoff record
    /// is nulled before any new agent process exists.
    async fn start_cycle(&mut self) -> anyhow::Result<()> {
        self.state = SupervisorState::StartingAgent;
        self.restart_at = None;
        self.scanner.reset();
        self.store.clear().await.context("clear handoff record")?;

        // Agent spawn failure is fatal: there is nothing to restart around.
        if let Err(err) = self
            .supervisor
            .start(ProcessRole::Agent, &self.config.agent)
            .await
        {
            self.state = SupervisorState::Stopped;
            return Err(err).context("start agent process");
        }
        tracing::info!("agent started; waiting for session endpoint");
        Ok(())
    }

    async fn handle_event(&mut self, ev: ChildEvent) -> anyhow::Result<()> {
        match ev {
            ChildEvent::Output {
                role,
                source,
                chunk,
            } => {
                for line in chunk.lines() {
                    println!("[{role}] {line}");
                }
                for hit in self.scanner.feed(role, source, &chunk) {
                    self.handle_hit(hit).await?;
                }
            }
            ChildEvent::Exited {
                role,
                code,
                signal,
                planned,
            } => {
                self.handle_exit(role, code, signal, planned).await?;
            }
        }
        Ok(())
    }

    async fn handle_hit(&mut self, hit: ScanHit) -> anyhow::Result<()> {
        match hit {
            ScanHit::Endpoint(endpoint) => {
                if self.state != SupervisorState::StartingAgent {
                    return Ok(());
                }
                self.state = SupervisorState::EndpointCaptured;
                self.store
                    .write(Some(&endpoint))
                    .await
                    .context("persist session endpoint")?;
                tracing::info!(%endpoint, "session endpoint captured");

                // The UI starts only after the endpoint is persisted, so a
                // Viewer polling after UI startup always finds a value.
                self.state = SupervisorState::StartingUi;
                match self.supervisor.start(ProcessRole::Ui, &self.config.ui).await {
                    Ok(_) => tracing::info!("ui started; waiting for readiness"),
                    Err(err) => {
                        // Unlike the agent, a UI spawn failure is recoverable.
                        tracing::error!(error = %err, "ui failed to spawn; restarting pipeline");
                        self.begin_restart().await?;
                    }
                }
            }
            ScanHit::AgentJoined => {
                tracing::info!("agent confirmed session join");
            }
            ScanHit::UiReady => {
                if self.state == SupervisorState::StartingUi {
                    self.state = SupervisorState::Running;
                    tracing::info!("pipeline running; viewer ui is ready");
                }
            }
        }
        Ok(())
    }

    async fn handle_exit(
        &mut self,
        role: ProcessRole,
        code: Option<i32>,
        signal: Option<i32>,
        planned: bool,
    ) -> anyhow::Result<()> {
        let expected = planned
            || matches!(
                self.state,
                SupervisorState::Restarting
                    | SupervisorState::ShuttingDown
                    | SupervisorState::Stopped
            );
        if expected {
            tracing::debug!(%role, code = ?code, signal = ?signal, "expected child exit");
            return Ok(());
        }

        tracing::warn!(
            %role,
            code = ?code,
            signal = ?signal,
            delay_ms = self.config.restart_delay.as_millis() as u64,
            "child exited unexpectedly; restart pending"
        );
        self.begin_restart().await
    }

    /// Stops any still-live sibling, then arms the fixed restart delay. The
    /// delay is a debounce against restart storms, not a backoff curve.
    async fn begin_restart(&mut self) -> anyhow::Result<()> {
        self.state = SupervisorState::Restarting;

        for role in [ProcessRole::Agent, ProcessRole::Ui] {
            if self.supervisor.is_live(role).await {
                self.supervisor.stop(role, self.config.stop_grace).await?;
            }
        }

        self.restart_at = Some(tokio::time::Instant::now() + self.config.restart_delay);
        Ok(())
    }

    /// Terminal shutdown: graceful stop of both children, UI first.
    async fn shut_down(&mut self) {
        self.state = SupervisorState::ShuttingDown;
        self.restart_at = None;
        tracing::info!("shutting down launcher");

        for role in [ProcessRole::Ui, ProcessRole::Agent] {
            if let Err(err) = self.supervisor.stop(role, self.config.stop_grace).await {
                tracing::warn!(%role, error = %err, "stop failed during shutdown");
            }
        }

        self.state = SupervisorState::Stopped;
        tracing::info!("launcher stopped");
    }
}
