//! Extended API server - apiserver and database services over mutual TLS.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use extended_apiserver::{
    certstore::{CertFs, OsFs},
    cli::{Cli, Command},
    config::Config,
    server::{Service, issue_client},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let fs: Arc<dyn CertFs> = Arc::new(OsFs);

    match &cli.command {
        Command::IssueClient { ca, name } => run_issue_client(&config, fs, ca, name),
        Command::Apiserver { .. } => run_service(Service::apiserver(&config, fs)).await,
        Command::Database { .. } => run_service(Service::database(&config, fs)).await,
    }
}

/// Issue one client certificate and print where it went
fn run_issue_client(config: &Config, fs: Arc<dyn CertFs>, ca: &str, name: &str) -> ExitCode {
    match issue_client(config, fs, ca, name) {
        Ok(issued) => {
            println!("{}", issued.cert_file.display());
            println!("{}", issued.key_file.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to issue client certificate: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Start a prepared service and serve until a shutdown signal
async fn run_service(service: extended_apiserver::Result<Service>) -> ExitCode {
    let service = match service {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to prepare service: {e}");
            return ExitCode::FAILURE;
        }
    };

    let name = service.name();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = name,
        address = %service.address(),
        "Starting"
    );

    let running = match service.start().await {
        Ok(r) => r,
        Err(e) => {
            error!(service = name, "Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = running.run_until_signal().await {
        error!(service = name, "Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!(service = name, "Shutdown complete");
    ExitCode::SUCCESS
}
