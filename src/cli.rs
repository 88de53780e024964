//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// Two-tier mutual-TLS services with request-header identity delegation
#[derive(Parser, Debug)]
#[command(name = "extended-apiserver")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "EXTENDED_APISERVER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "EXTENDED_APISERVER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EXTENDED_APISERVER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Root directory of the certificate stores
    #[arg(long, global = true)]
    pub cert_dir: Option<PathBuf>,

    /// Service to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the primary service
    Apiserver {
        /// Forward /database/{resource} to the database service
        #[arg(long)]
        send_proxy_request: bool,
    },

    /// Run the secondary service
    Database {
        /// Accept identities delegated by the apiserver
        #[arg(long)]
        receive_proxy_request: bool,
    },

    /// Issue an extra client certificate under an existing CA
    IssueClient {
        /// CA directory name (e.g. "database")
        #[arg(long)]
        ca: String,

        /// Common name of the new certificate
        #[arg(long)]
        name: String,
    },
}

impl Cli {
    /// Apply flag overrides on top of the loaded configuration.
    ///
    /// Flags can only switch a mode on; a mode enabled in the file stays on.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.cert_dir {
            config.cert_dir.clone_from(dir);
        }
        match self.command {
            Command::Apiserver { send_proxy_request } => {
                config.apiserver.send_proxy_request |= send_proxy_request;
            }
            Command::Database {
                receive_proxy_request,
            } => {
                config.database.receive_proxy_request |= receive_proxy_request;
            }
            Command::IssueClient { .. } => {}
        }
    }
}
