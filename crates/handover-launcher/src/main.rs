mod config;
mod coordinator;
mod handoff;
mod scanner;
mod supervisor;

use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        agent = %config.agent.command,
        ui = %config.ui.command,
        handoff = %config.handoff_path.display(),
        "handover launcher starting"
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listeners(shutdown_tx);

    let supervisor = supervisor::ProcessSupervisor::new(event_tx);
    let coordinator =
        coordinator::RestartCoordinator::new(config, supervisor, event_rx, shutdown_rx);
    coordinator.run().await
}

#[cfg(unix)]
fn spawn_signal_listeners(shutdown: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    let tx = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
        tracing::info!("received SIGTERM");
        let _ = tx.send(true);
    });

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        sigint.recv().await;
        tracing::info!("received SIGINT");
        let _ = shutdown.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_signal_listeners(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c");
            let _ = shutdown.send(true);
        }
    });
}
