use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roster::collab::{MemoryIdentity, SandboxPayments, TracingActivityLog};
use roster::clock::SystemClock;
use roster::engine::{Collaborators, Engine};
use roster::notify::NotifyHub;
use roster::settings::Settings;
use roster::wire::{self, ServerContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    roster::observability::init(settings.metrics_port)?;

    std::fs::create_dir_all(&settings.data_dir)?;

    let identity = match &settings.members_file {
        Some(path) => MemoryIdentity::from_json_file(path)?,
        None => {
            tracing::warn!("no members_file configured; every member request will be rejected");
            MemoryIdentity::new()
        }
    };
    let hub = Arc::new(NotifyHub::new());
    let collaborators = Collaborators {
        identity: Arc::new(identity),
        notifier: hub.clone(),
        activity: Arc::new(TracingActivityLog),
        payments: Arc::new(SandboxPayments::new()),
        clock: Arc::new(SystemClock),
    };
    let engine = Arc::new(Engine::new(settings.engine_config()?, collaborators)?);

    tokio::spawn(roster::reaper::run_reaper(
        engine.clone(),
        Duration::from_secs(settings.reaper_interval_secs.max(1)),
    ));

    let ctx = Arc::new(ServerContext {
        engine,
        hub: Some(hub),
        admin_token: settings.admin_token.clone(),
    });
    let max_connections = settings.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("roster listening on {addr}");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  timezone: {}", settings.timezone);
    info!("  max_connections: {max_connections}");
    info!("  metrics: {}", settings.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(roster::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(roster::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roster::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, ctx).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roster::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("roster stopped");
    Ok(())
}
