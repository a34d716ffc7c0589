use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use roomslot::dispatch::{self, LogPushSender, PushSender};
use roomslot::engine::{Engine, EngineConfig};
use roomslot::notify::NotifyHub;
use roomslot::store::MemoryStore;
use roomslot::{tasks, wire};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("ROOMSLOT_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    roomslot::observability::init(metrics_port)?;

    let port = std::env::var("ROOMSLOT_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("ROOMSLOT_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("ROOMSLOT_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("ROOMSLOT_PASSWORD").unwrap_or_else(|_| "roomslot".into());
    let max_connections: usize = env_or("ROOMSLOT_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("ROOMSLOT_COMPACT_THRESHOLD", 1000);
    let reminder_lead = Duration::from_secs(env_or("ROOMSLOT_REMINDER_LEAD_SECS", 900));
    let dispatch_interval = Duration::from_millis(env_or("ROOMSLOT_DISPATCH_INTERVAL_MS", 1000));
    let config = EngineConfig {
        recheck_overlap_on_update: env_or("ROOMSLOT_RECHECK_ON_UPDATE", false),
    };

    let tls_cert = std::env::var("ROOMSLOT_TLS_CERT").ok();
    let tls_key = std::env::var("ROOMSLOT_TLS_KEY").ok();
    let tls_acceptor = roomslot::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;

    let store = Arc::new(MemoryStore::open(&PathBuf::from(&data_dir).join("roomslot.wal"))?);
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::with_memory_store(store.clone(), notify.clone(), config.clone()));

    tokio::spawn(tasks::run_compactor(store.clone(), compact_threshold));
    let sender: Arc<dyn PushSender> = Arc::new(LogPushSender);
    tokio::spawn(dispatch::run_dispatcher(store.clone(), sender.clone(), dispatch_interval));
    tasks::spawn_reminder_bridge(&notify, store.clone(), reminder_lead);

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("roomslot listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  recheck_overlap_on_update: {}", config.recheck_overlap_on_update);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        metrics::counter!(roomslot::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(roomslot::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roomslot::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let store = store.clone();
                let sender = sender.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, store, sender, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roomslot::observability::CONNECTIONS_ACTIVE).decrement(1.0);
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

    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("roomslot stopped");
    Ok(())
}
