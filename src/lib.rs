//! Extended API server library
//!
//! Two services that talk to each other over mutual TLS, with identity
//! delegation through a request header.
//!
//! # Features
//!
//! - **Certificate store**: one CA per directory, leaf issuance, PEM on disk
//! - **Trust delegation**: a peer whose certificate chains to the delegation
//!   CA may assert the caller's identity in `X-Remote-User`; everyone else is
//!   identified by their certificate CN
//! - **Forwarding**: the apiserver relays `/database/*` requests as the
//!   original caller, with per-host connection limits and a fixed timeout
//! - **Bootstrap**: both services issue their own certificates at startup and
//!   shut down gracefully

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod certstore;
pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod server;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
