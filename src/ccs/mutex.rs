//! Named volatile mutex on the cluster config store
//!
//! A lease `{owner, expires_at_ms}` under `/ovs/locks/<name>`, taken and
//! released with compare-and-swap. An expired lease may be stolen, so a
//! crashed holder blocks others for at most the TTL.

use crate::ccs::{keys, Configuration};
use crate::common::{timestamp_now_millis, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: String,
    expires_at_ms: u64,
}

pub struct VolatileMutex {
    ccs: Configuration,
    name: String,
    ttl: Duration,
}

impl VolatileMutex {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    pub fn new(ccs: &Configuration, name: impl Into<String>) -> Self {
        Self {
            ccs: ccs.clone(),
            name: name.into(),
            ttl: Self::DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the lease, polling for at most `wait`.
    pub async fn acquire(&self, wait: Duration) -> Result<VolatileMutexGuard> {
        let key = keys::lock(&self.name);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(&key)? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(crate::Error::LockContention(self.name.clone()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn try_acquire(&self, key: &str) -> Result<Option<VolatileMutexGuard>> {
        let now = timestamp_now_millis();
        let current = self.ccs.get_raw(key)?;
        if let Some(raw) = &current {
            let lease: Lease = serde_json::from_slice(raw)?;
            if lease.expires_at_ms > now {
                return Ok(None);
            }
            tracing::warn!(lock = %self.name, owner = %lease.owner, "Stealing expired lease");
        }

        let lease = Lease {
            owner: uuid::Uuid::new_v4().to_string(),
            expires_at_ms: now + self.ttl.as_millis() as u64,
        };
        let raw = Configuration::serialize(&lease)?;
        if self
            .ccs
            .compare_and_set_raw(key, current.as_deref(), Some(raw.clone()))?
        {
            tracing::debug!(lock = %self.name, "Acquired");
            Ok(Some(VolatileMutexGuard {
                ccs: self.ccs.clone(),
                key: key.to_string(),
                raw,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Releases the lease on drop, unless it expired and was taken over.
pub struct VolatileMutexGuard {
    ccs: Configuration,
    key: String,
    raw: Vec<u8>,
}

impl Drop for VolatileMutexGuard {
    fn drop(&mut self) {
        match self
            .ccs
            .compare_and_set_raw(&self.key, Some(&self.raw), None)
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %self.key, "Lease was taken over before release"),
            Err(e) => tracing::error!(key = %self.key, "Failed to release lease: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_dropped() {
        let ccs = Configuration::in_memory();
        let mutex = VolatileMutex::new(&ccs, "prepare_mds_h1");

        let guard = mutex.acquire(Duration::from_millis(10)).await.unwrap();
        let second = mutex.acquire(Duration::from_millis(120)).await;
        assert!(matches!(second, Err(crate::Error::LockContention(_))));

        drop(guard);
        assert!(ccs.get_raw(&keys::lock("prepare_mds_h1")).unwrap().is_none());
        assert!(mutex.acquire(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stolen() {
        let ccs = Configuration::in_memory();
        let short = VolatileMutex::new(&ccs, "ports").with_ttl(Duration::from_millis(1));
        let stale = short.acquire(Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let other = VolatileMutex::new(&ccs, "ports");
        let fresh = other.acquire(Duration::from_millis(10)).await.unwrap();
        // releasing the stale guard must not drop the new holder's lease
        drop(stale);
        assert!(ccs.get_raw(&keys::lock("ports")).unwrap().is_some());
        drop(fresh);
        assert!(ccs.get_raw(&keys::lock("ports")).unwrap().is_none());
    }
}
