//! Process entrypoint: loads configuration, wires the core pipeline to a
//! host-agnostic collector/primitive/transport stack, and runs the
//! orchestrator's tick loop until shutdown.

use endpoint_agent_common::config::Config;
use endpoint_agent_core::stubs::{EmptyEventLogSource, EmptyMetricCollector, StubPrimitiveExecutor};
use endpoint_agent_core::Orchestrator;
use endpoint_agent_queue::PendingReportsQueue;
use endpoint_agent_telemetry::HttpTransport;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config().await?;
    info!(data_dir = %config.agent.data_dir.display(), tick_interval_ms = config.agent.tick_interval_ms, "starting endpoint agent");

    tokio::fs::create_dir_all(&config.agent.data_dir).await?;

    let queue = PendingReportsQueue::new(config.agent.data_dir.clone(), config.queue.clone());
    let transport = match HttpTransport::new(
        config.transport.server_url.clone(),
        config.transport.request_timeout_ms,
        queue,
    ) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, "failed to initialize transport");
            std::process::exit(1);
        }
    };
    transport.load().await;

    let orchestrator = Orchestrator::new(config.clone(), Arc::new(StubPrimitiveExecutor::default()));
    orchestrator.load().await;
    info!("orchestrator state loaded");

    let collectors: Vec<Arc<dyn endpoint_agent_core::ports::MetricCollector>> = vec![Arc::new(EmptyMetricCollector)];
    let event_log = EmptyEventLogSource;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tick_interval = std::time::Duration::from_millis(config.agent.tick_interval_ms);
    let flush_interval = std::time::Duration::from_millis(config.profiler.flush_interval_ms);

    let exit_code = run(
        &orchestrator,
        &transport,
        &collectors,
        &event_log,
        tick_interval,
        flush_interval,
        shutdown_rx,
        shutdown_tx,
    )
    .await;

    std::process::exit(exit_code);
}

/// The main loop: a tick timer drives the orchestrator, a slower flush
/// timer persists profiler/pattern state and pushes a metric-report, and a
/// third poll drains the pending-reports queue and server-pushed control
/// messages. `Ctrl-C` starts a cooperative shutdown: the current tick is
/// allowed to finish, state is flushed once more, then the process exits.
#[allow(clippy::too_many_arguments)]
async fn run(
    orchestrator: &Orchestrator,
    transport: &HttpTransport,
    collectors: &[Arc<dyn endpoint_agent_core::ports::MetricCollector>],
    event_log: &dyn endpoint_agent_core::ports::EventLogSource,
    tick_interval: std::time::Duration,
    flush_interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) -> i32 {
    let mut ticker = tokio::time::interval(tick_interval);
    let mut flusher = tokio::time::interval(flush_interval);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining current work");
            let _ = shutdown_tx.send(true);
        }
    });

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = chrono::Utc::now();
                if let Err(err) = orchestrator.tick(collectors, event_log, Some(transport), now).await {
                    warn!(error = %err, "tick failed");
                }
                if let Err(err) = transport.flush_pending(now).await {
                    warn!(error = %err, "failed to flush pending reports");
                }
                for message in poll_control(transport).await {
                    if let Err(err) = orchestrator.apply_control(message).await {
                        warn!(error = %err, "failed to apply control message");
                    }
                }
            }
            _ = flusher.tick() => {
                if let Err(err) = orchestrator.flush().await {
                    error!(error = %err, "failed to flush persisted state");
                    return 1;
                }
                let now = chrono::Utc::now();
                let _ = transport.send(orchestrator.metric_report().await).await;
                let _ = transport.cleanup_old(now).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(err) = orchestrator.flush().await {
        error!(error = %err, "failed to flush persisted state during shutdown");
        return 1;
    }
    let _ = transport.flush_pending(chrono::Utc::now()).await;
    info!("shutdown complete");
    0
}

async fn poll_control(transport: &HttpTransport) -> Vec<endpoint_agent_core::ports::ControlMessage> {
    use endpoint_agent_core::ports::Transport;
    match transport.poll_control().await {
        Ok(messages) => messages,
        Err(err) => {
            warn!(error = %err, "failed to poll control messages");
            Vec::new()
        }
    }
}

async fn load_config() -> anyhow::Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "loading configuration from file");
            Ok(Config::load(std::path::Path::new(&path)).await?)
        }
        None => {
            info!("no configuration file given, using defaults");
            Ok(Config::default())
        }
    }
}
