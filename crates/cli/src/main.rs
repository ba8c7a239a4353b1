//! Warden CLI - local WAF helper daemon.

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use warden_core::HelperConfig;
use warden_core::engine::basic::BasicEngineFactory;
use warden_daemon::{ShutdownToken, SocketAddress};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_writer(std::io::stderr).with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();
    // Panics stay contained in the worker that raised them; make sure they
    // reach the log as well as stderr.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(%info, "panic");
        default_hook(info);
    }));

    let cli = cli::Cli::parse();

    let file = match HelperConfig::resolve(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("warden: {e}");
            return ExitCode::FAILURE;
        }
    };
    let socket = match cli::resolve_socket(cli.socket.as_ref(), &file) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("warden: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(cli::Command::Ping) => run_ping(&socket),
        Some(cli::Command::Serve(args)) => run_serve(&args, socket, &file),
        None => run_serve(&cli::ServeArgs::default(), socket, &file),
    }
}

fn run_ping(socket: &SocketAddress) -> ExitCode {
    match warden_daemon::ping(socket) {
        Ok(()) => {
            println!("warden is running at {socket}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("warden is not running at {socket}: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_serve(args: &cli::ServeArgs, socket: SocketAddress, file: &HelperConfig) -> ExitCode {
    let pid_file = match warden_daemon::transport::pid_file_path() {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(%e, "cannot determine pid file location, running without one");
            None
        }
    };
    let config = args.daemon_config(socket, file, pid_file);
    info!(?config, "starting helper");

    match warden_daemon::run(&config, Arc::new(BasicEngineFactory), &ShutdownToken::new()) {
        Ok(()) => {
            info!("helper shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            warn!(%e, "helper error");
            eprintln!("warden: {e}");
            ExitCode::FAILURE
        }
    }
}
