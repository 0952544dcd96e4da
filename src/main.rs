use echo_mux::config::{Config, Mode};
use echo_mux::{client, handoff, runtime};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    // Initialize logging; stdout is left to program output
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.mode {
        Mode::Serve => run_server(&config),
        Mode::Client => run_client(&config),
        Mode::Handoff => run_handoff(&config),
    }
}

/// Serve until killed; only setup failures come back.
fn run_server(config: &Config) -> ExitCode {
    info!(
        host = %config.server.host,
        port = config.server.port,
        max_connections = config.server.max_connections,
        backlog = config.server.backlog,
        "Starting echo-mux server"
    );

    match runtime::run(&config.server) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server setup failed");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run_client(config: &Config) -> ExitCode {
    let mut stdout = std::io::stdout().lock();
    match client::run(&config.client, &mut stdout) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Client failed");
            ExitCode::from(5)
        }
    }
}

fn run_handoff(config: &Config) -> ExitCode {
    match handoff::run_demo(&config.handoff) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Handoff demo failed");
            ExitCode::from(5)
        }
    }
}
