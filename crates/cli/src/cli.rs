//! CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use warden_core::HelperConfig;
use warden_daemon::{DaemonConfig, SocketAddress};

const DEFAULT_IDLE_TIMEOUT: u64 = 1800;
const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_WORKER_IDLE_TIMEOUT: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE: u64 = 5;
const DEFAULT_RC_POLL_INTERVAL: u64 = 5;

#[derive(Parser)]
#[command(name = "warden", about = "Local WAF helper daemon")]
pub struct Cli {
    /// Socket address: a path, `@name` (abstract namespace) or `fd:N`
    #[arg(long, env = "WARDEN_SOCKET", global = true)]
    pub socket: Option<SocketAddress>,

    /// TOML config file (default: ~/.config/warden/config.toml if present)
    #[arg(long, env = "WARDEN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the helper in the foreground
    Serve(ServeArgs),
    /// Exit 0 if a helper accepts connections on the socket
    Ping,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Seconds without connections before exiting, 0 = never [default: 1800]
    #[arg(long)]
    pub idle_timeout: Option<u64>,
    /// Accept poll interval in milliseconds [default: 1000]
    #[arg(long)]
    pub accept_timeout_ms: Option<u64>,
    /// Seconds an idle worker thread waits for work [default: 60]
    #[arg(long)]
    pub worker_idle_timeout: Option<u64>,
    /// Seconds to wait for connections on shutdown [default: 5]
    #[arg(long)]
    pub shutdown_grace: Option<u64>,
    /// Seconds between remote config polls, 0 = disabled [default: 5]
    #[arg(long)]
    pub rc_poll_interval: Option<u64>,
}

/// Socket from the command line, then the config file, then the default.
///
/// # Errors
///
/// Returns an error if the file's socket value is invalid or the runtime
/// directory cannot be determined.
pub fn resolve_socket(
    cli: Option<&SocketAddress>,
    file: &HelperConfig,
) -> eyre::Result<SocketAddress> {
    if let Some(socket) = cli {
        return Ok(socket.clone());
    }
    if let Some(socket) = &file.socket {
        return socket
            .parse()
            .map_err(|e| eyre::eyre!("invalid socket {socket:?} in config file: {e}"));
    }
    Ok(SocketAddress::default_path()?)
}

impl ServeArgs {
    /// Merge with the config file; command line values win.
    #[must_use]
    pub fn daemon_config(
        &self,
        socket: SocketAddress,
        file: &HelperConfig,
        pid_file: Option<PathBuf>,
    ) -> DaemonConfig {
        let pick = |cli: Option<u64>, file: Option<u64>, default: u64| {
            cli.or(file).unwrap_or(default)
        };
        DaemonConfig {
            socket,
            idle_timeout: Duration::from_secs(pick(
                self.idle_timeout,
                file.idle_timeout,
                DEFAULT_IDLE_TIMEOUT,
            )),
            accept_timeout: Duration::from_millis(pick(
                self.accept_timeout_ms,
                file.accept_timeout_ms,
                DEFAULT_ACCEPT_TIMEOUT_MS,
            )),
            worker_idle_timeout: Duration::from_secs(pick(
                self.worker_idle_timeout,
                file.worker_idle_timeout,
                DEFAULT_WORKER_IDLE_TIMEOUT,
            )),
            shutdown_grace: Duration::from_secs(pick(
                self.shutdown_grace,
                file.shutdown_grace,
                DEFAULT_SHUTDOWN_GRACE,
            )),
            rc_poll_interval: Duration::from_secs(pick(
                self.rc_poll_interval,
                file.rc_poll_interval,
                DEFAULT_RC_POLL_INTERVAL,
            )),
            pid_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_overrides() {
        let config = ServeArgs::default().daemon_config(
            SocketAddress::Abstract("w".into()),
            &HelperConfig::default(),
            None,
        );
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.accept_timeout, Duration::from_millis(1000));
        assert_eq!(config.worker_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.rc_poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn command_line_beats_file() {
        let file = HelperConfig {
            idle_timeout: Some(10),
            rc_poll_interval: Some(0),
            ..HelperConfig::default()
        };
        let args = ServeArgs {
            idle_timeout: Some(20),
            ..ServeArgs::default()
        };
        let config = args.daemon_config(SocketAddress::Fd(3), &file, None);
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.rc_poll_interval, Duration::ZERO);
    }

    #[test]
    fn socket_resolution_order() {
        let file = HelperConfig {
            socket: Some("@from-file".into()),
            ..HelperConfig::default()
        };
        let cli = SocketAddress::Path("/tmp/cli.sock".into());
        assert_eq!(resolve_socket(Some(&cli), &file).unwrap(), cli);
        assert_eq!(
            resolve_socket(None, &file).unwrap(),
            SocketAddress::Abstract("from-file".into())
        );

        let bad = HelperConfig {
            socket: Some("fd:nope".into()),
            ..HelperConfig::default()
        };
        assert!(resolve_socket(None, &bad).is_err());
    }

    #[test]
    fn parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "warden",
            "--socket",
            "@warden",
            "serve",
            "--idle-timeout",
            "0",
            "--accept-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(cli.socket, Some(SocketAddress::Abstract("warden".into())));
        let Some(Command::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.idle_timeout, Some(0));
        assert_eq!(args.accept_timeout_ms, Some(250));
    }
}
