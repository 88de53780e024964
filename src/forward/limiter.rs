//! Per-destination connection limiter.
//!
//! Each `host:port` gets its own semaphore, created on first use.  A permit
//! stands for one in-flight outbound connection and is released when dropped.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Error, Result};

/// Bounds concurrent outbound requests per destination host.
#[derive(Debug)]
pub struct HostLimiter {
    max_per_host: usize,
    hosts: DashMap<String, Arc<Semaphore>>,
}

impl HostLimiter {
    /// Limiter allowing `max_per_host` concurrent requests to each host.
    #[must_use]
    pub fn new(max_per_host: usize) -> Self {
        Self {
            max_per_host: max_per_host.max(1),
            hosts: DashMap::new(),
        }
    }

    /// Wait for a slot towards `host`.
    pub async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(host);
        semaphore
            .acquire_owned()
            .await
            .map_err(|e| Error::Transport(format!("connection limiter for {host} closed: {e}")))
    }

    /// Slots currently free towards `host`.
    pub fn available(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map_or(self.max_per_host, |s| s.available_permits())
    }

    fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        if let Some(existing) = self.hosts.get(host) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.hosts
                .entry(host.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
                .value(),
        )
    }
}
