#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::thread::JoinHandle;

use axum::Router;
use tracing::{error, info, warn};
use trackpage_adapter::{build_sync_engine, publish_router, AdapterRuntimeConfig};
use trackpage_engines::connect_session::ConnectSessionBroker;
use trackpage_engines::session_vault::SessionVault;
use trackpage_os::{shared_poll_status, PollLoop, PollPhase, PollShutdown, SharedPollStatus, SystemClock};
use trackpage_tools::{default_credential_provider, init_tracing};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        error!("trackpage_http failed: {err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AdapterRuntimeConfig::from_env()?;
    let output = config.output_location();
    output.ensure_exists()?;
    let status = shared_poll_status();
    let shutdown = PollShutdown::new();

    let poll_thread = if config.sync_enabled {
        Some(start_poll_thread(&config, status.clone(), shutdown.clone())?)
    } else {
        if let Ok(mut s) = status.lock() {
            s.phase = PollPhase::Disabled;
        }
        None
    };

    info!(
        output = %output.root().display(),
        sync_enabled = config.sync_enabled,
        interval_secs = config.poll.interval.as_secs(),
        backfill_days = config.poll.backfill_days,
        "trackpage_http starting"
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(config.bind, publish_router(output, status), shutdown.clone()));

    shutdown.request();
    if let Some(handle) = poll_thread {
        if handle.join().is_err() {
            error!("poll thread panicked");
        }
    }
    served?;
    Ok(())
}

/// Authenticates before anything is served. A session that cannot be established is
/// the one fatal startup failure.
fn start_poll_thread(
    config: &AdapterRuntimeConfig,
    status: SharedPollStatus,
    shutdown: PollShutdown,
) -> Result<JoinHandle<()>, Box<dyn std::error::Error>> {
    let broker = ConnectSessionBroker::from_env(SessionVault::default_local())?;
    let client = broker.establish(&default_credential_provider())?;
    info!(api_base = %client.config().api_base, "connect session established");

    let engine = build_sync_engine(config, Box::new(client))?;
    let poll = PollLoop::new(engine, SystemClock, config.poll, status);
    let handle = std::thread::Builder::new()
        .name("trackpage-poll".to_string())
        .spawn(move || poll.run(&shutdown))?;
    Ok(handle)
}

async fn serve(addr: SocketAddr, app: Router, shutdown: PollShutdown) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("trackpage_http listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler unavailable: {err}");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            shutdown.request();
        })
        .await
}
