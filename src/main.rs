use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use voicegate::backend::NatsDialer;
use voicegate::gateway::GatewayMetrics;
use voicegate::gateway::http::serve_connection;
use voicegate::{Config, ConnectionPool, Gateway, SlotManager};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "🎙️ voicegate";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> std::io::Result<()> {
    setup().await;
    run_forever().await
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

async fn setup() {
    // This has to be the first thing we do, because it initializes the config
    Config::init().await;

    init_tracing();
}

fn init_tracing() {
    let config = Config::snapshot();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run_forever() -> std::io::Result<()> {
    // Config might reload, but the fields used by run_forever are set at startup
    let config = Config::snapshot();
    let backend = &config.gateway.backend;

    let dialer = NatsDialer::new("voicegate")
        .with_credentials_file(backend.credentials_file.clone())
        .with_token(backend.token.clone());

    let (pool, fill_error) = ConnectionPool::new(&backend.url, backend.pool_size, dialer).await;
    if let Some(err) = fill_error {
        warn!("starting with an empty pool, connections will be dialed on demand: {err}");
    }
    let pool = Arc::new(pool);

    let slots = Arc::new(SlotManager::new(
        &config.gateway.slots.prefix,
        config.gateway.slots.count,
    ));

    let metrics = GatewayMetrics::new()
        .map_err(|e| std::io::Error::other(format!("metrics registry: {e}")))?;

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&pool),
        slots,
        config.gateway.session.clone(),
        metrics,
        CancellationToken::new(),
    ));

    let tls = voicegate::tls::acceptor(config.gateway.tls.as_ref())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let socket = if config.listen_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_reuseaddr(true)?;
    socket.bind(config.listen_addr)?;

    let listener: TcpListener = socket.listen(1024)?;

    info!(
        "{} listening on {} ({}), backend {}, {} slots",
        APP_NAME,
        config.listen_addr,
        if tls.is_some() { "wss" } else { "ws" },
        backend.url,
        config.gateway.slots.count
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("{} shutting down", APP_NAME);
                break;
            }

            accept_res = listener.accept() => {
                let (stream, peer) = match accept_res {
                    Ok(v) => v,
                    Err(e) => { error!("accept error: {e}"); continue; }
                };

                // Audio frames are small and latency-bound.
                let _ = stream.set_nodelay(true);

                let gateway = Arc::clone(&gateway);
                let tls = tls.clone();

                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve_connection(stream, peer, gateway).await,
                            Err(e) => error!("client {peer} tls handshake failed: {e}"),
                        },
                        None => serve_connection(stream, peer, gateway).await,
                    }
                });
            }
        }
    }

    gateway.shutdown();
    wait_for_sessions(&gateway).await;
    pool.drain();

    let stats = pool.stats();
    info!(
        "pool for {} drained: {} dialed over lifetime, {} idle at exit",
        stats.target, stats.dialed, stats.idle
    );

    Ok(())
}

// Teardown returns the connection before the slot, so a full slot set means
// every borrowed connection is back in the pool.
async fn wait_for_sessions(gateway: &Gateway<NatsDialer>) {
    let slots = gateway.slots();
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

    while slots.available() < slots.capacity() {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "{} sessions still open after {:?}",
                slots.capacity() - slots.available(),
                SHUTDOWN_GRACE
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
