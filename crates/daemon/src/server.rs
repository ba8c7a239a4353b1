//! Accept loop and daemon lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use warden_core::EngineFactory;

use crate::connection::Connection;
use crate::service_cache::ServiceCache;
use crate::shutdown::ShutdownToken;
use crate::transport::{Acceptor, SocketAddress};
use crate::worker::WorkerPool;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket: SocketAddress,
    /// Exit after this long without connections; zero disables.
    pub idle_timeout: Duration,
    pub accept_timeout: Duration,
    pub worker_idle_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Background remote-config polling; zero disables.
    pub rc_poll_interval: Duration,
    pub pid_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: SocketAddress::Path(PathBuf::from("warden.sock")),
            idle_timeout: Duration::from_secs(1800),
            accept_timeout: Duration::from_secs(1),
            worker_idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            rc_poll_interval: Duration::from_secs(5),
            pid_file: None,
        }
    }
}

/// Serve connections until idle timeout or `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if another helper is running, the socket cannot be set
/// up, or accepting fails fatally.
#[instrument(skip_all, fields(socket = %config.socket, idle_timeout = ?config.idle_timeout))]
pub fn run(
    config: &DaemonConfig,
    factory: Arc<dyn EngineFactory>,
    shutdown: &ShutdownToken,
) -> eyre::Result<()> {
    if !matches!(config.socket, SocketAddress::Fd(_))
        && crate::client::is_helper_running(&config.socket)
    {
        warn!("another helper is already running");
        return Err(eyre::eyre!(
            "another helper is already running at {}",
            config.socket
        ));
    }

    let acceptor = Acceptor::bind(&config.socket)?;
    acceptor.set_accept_timeout(config.accept_timeout)?;

    if let Some(pid_file) = &config.pid_file {
        if let Some(dir) = pid_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(pid_file, std::process::id().to_string())?;
    }

    let cache = Arc::new(ServiceCache::new(factory));
    let pool = WorkerPool::new(config.worker_idle_timeout);
    let poller = spawn_poller(config.rc_poll_interval, &cache, shutdown)?;
    info!(pid = std::process::id(), "helper started");

    let result = accept_loop(config, &acceptor, &pool, &cache, shutdown);
    if let Err(e) = &result {
        error!(%e, "accept failed");
    }

    shutdown.cancel();
    pool.stop();
    if !pool.wait(config.shutdown_grace) {
        warn!(
            workers = pool.live_workers(),
            "workers still running after grace period, abandoning them"
        );
    }
    if let Some(poller) = poller {
        let _ = poller.join();
    }
    drop(acceptor);
    if let Some(pid_file) = &config.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    info!("helper stopped");

    result.map_err(Into::into)
}

fn accept_loop(
    config: &DaemonConfig,
    acceptor: &Acceptor,
    pool: &WorkerPool,
    cache: &Arc<ServiceCache>,
    shutdown: &ShutdownToken,
) -> std::io::Result<()> {
    let mut last_activity = Instant::now();

    while !shutdown.is_cancelled() {
        if let Some(stream) = acceptor.accept()? {
            debug!("accepted connection");
            last_activity = Instant::now();
            let connection = Connection::new(stream, Arc::clone(cache), shutdown.clone());
            if let Err(e) = pool.launch(Box::new(move || connection.serve())) {
                warn!(%e, "cannot launch connection");
            }
            continue;
        }

        if pool.busy_workers() > 0 {
            last_activity = Instant::now();
        } else if !config.idle_timeout.is_zero() && last_activity.elapsed() >= config.idle_timeout
        {
            info!("idle timeout, shutting down");
            break;
        }
    }
    Ok(())
}

fn spawn_poller(
    interval: Duration,
    cache: &Arc<ServiceCache>,
    shutdown: &ShutdownToken,
) -> std::io::Result<Option<JoinHandle<()>>> {
    if interval.is_zero() {
        return Ok(None);
    }
    let cache = Arc::clone(cache);
    let shutdown = shutdown.clone();
    std::thread::Builder::new()
        .name("warden-rc-poll".into())
        .spawn(move || {
            while !shutdown.wait_timeout(interval) {
                cache.poll_all();
            }
            debug!("remote config poller stopped");
        })
        .map(Some)
}
