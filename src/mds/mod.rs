//! Metadata server placement: load, registry, reality sync, safety and
//! catch-up.

pub mod catchup;
pub mod load;
pub mod registry;
pub mod safety;
pub mod sync;

pub use catchup::{mds_catchup, CatchUpContext, CatchUpReport};
pub use load::{get_mds_load, mds_load};
pub use registry::{get_preferred_mds, prepare_mds_service, remove_mds_service};
pub use safety::{ensure_safety, SafetyOutcome};
pub use sync::sync_vdisk_to_reality;

use crate::ccs::{keys, Configuration};
use crate::common::Result;
use crate::dal::VPoolId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-vPool MDS tuning, stored at `/ovs/vpools/<id>/mds_config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdsConfig {
    /// Slaves further behind than this are caught up before promotion
    #[serde(default = "default_tlogs")]
    pub mds_tlogs: u64,
    /// Target number of MDS copies per vdisk
    #[serde(default = "default_safety")]
    pub mds_safety: usize,
    /// Load percentage above which a service takes no new vdisks
    #[serde(default = "default_maxload")]
    pub mds_maxload: u32,
    #[serde(default = "default_mds_timeout")]
    pub mds_client_connection_timeout: u64,
    #[serde(default = "default_sr_timeout")]
    pub sr_client_connection_timeout: u64,
}

fn default_tlogs() -> u64 {
    100
}
fn default_safety() -> usize {
    3
}
fn default_maxload() -> u32 {
    75
}
fn default_mds_timeout() -> u64 {
    120
}
fn default_sr_timeout() -> u64 {
    300
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            mds_tlogs: default_tlogs(),
            mds_safety: default_safety(),
            mds_maxload: default_maxload(),
            mds_client_connection_timeout: default_mds_timeout(),
            sr_client_connection_timeout: default_sr_timeout(),
        }
    }
}

impl MdsConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.mds_safety) {
            return Err(crate::Error::InvalidParameter(format!(
                "mds_safety must be between 1 and 5, got {}",
                self.mds_safety
            )));
        }
        if self.mds_maxload < 10 {
            return Err(crate::Error::InvalidParameter(format!(
                "mds_maxload must be at least 10, got {}",
                self.mds_maxload
            )));
        }
        Ok(())
    }

    /// Stored config of a vPool, defaults when none was written
    pub fn load(ccs: &Configuration, vpool: VPoolId) -> Result<Self> {
        let config = ccs.get_or(&keys::mds_config(vpool), Self::default())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, ccs: &Configuration, vpool: VPoolId) -> Result<()> {
        self.validate()?;
        ccs.set(&keys::mds_config(vpool), self)
    }

    pub fn mds_timeout(&self) -> Duration {
        Duration::from_secs(self.mds_client_connection_timeout)
    }

    pub fn sr_timeout(&self) -> Duration {
        Duration::from_secs(self.sr_client_connection_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_absent() {
        let ccs = Configuration::in_memory();
        let config = MdsConfig::load(&ccs, VPoolId::new()).unwrap();
        assert_eq!(config, MdsConfig::default());
        assert_eq!(config.mds_tlogs, 100);
        assert_eq!(config.sr_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_override() {
        let ccs = Configuration::in_memory();
        let vpool = VPoolId::new();
        ccs.set(&(keys::mds_config(vpool) + "|mds_safety"), &2).unwrap();
        let config = MdsConfig::load(&ccs, vpool).unwrap();
        assert_eq!(config.mds_safety, 2);
        assert_eq!(config.mds_maxload, 75);
    }

    #[test]
    fn test_validation() {
        let mut config = MdsConfig::default();
        config.mds_safety = 6;
        assert!(config.validate().is_err());
        config.mds_safety = 1;
        config.mds_maxload = 9;
        assert!(config.validate().is_err());
        config.mds_maxload = 10;
        assert!(config.validate().is_ok());
    }
}
