//! Controller configuration (per-host settings file)
//!
//! Cluster-wide settings live in the cluster config store, see [`crate::ccs`].
//! This file only carries what a single controller process needs to boot.

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the controller configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ovs/controller.toml";

/// Environment prefix for overrides, e.g. `OVS_CONTROLLER__BIND_ADDR`
const ENV_PREFIX: &str = "OVS_CONTROLLER";

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Machine id of this host
    #[serde(default = "default_machine_id")]
    pub machine_id: String,

    /// Address used by the rest of the cluster to reach this host
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Bind address for the admin and host-agent HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Port the host agent listens on, identical on every host
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// RocksDB path of the data access layer. Only the controller that owns
    /// the DAL serves the admin API and runs the periodic checkups.
    #[serde(default)]
    pub dal_path: Option<PathBuf>,

    /// Cluster config store backend
    #[serde(default)]
    pub ccs: CcsBackend,

    /// Seconds between two MDS checkups (0 disables)
    #[serde(default = "default_mds_checkup_interval")]
    pub mds_checkup_interval_secs: u64,

    /// Seconds between two DTL checkups (0 disables)
    #[serde(default = "default_dtl_checkup_interval")]
    pub dtl_checkup_interval_secs: u64,

    /// Connect timeout for the short-lived host reachability check
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_ms: u64,

    /// Number of 1s polls of the volumedriver startup counter
    #[serde(default = "default_startup_poll_attempts")]
    pub startup_poll_attempts: u32,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CcsBackend {
    #[default]
    Memory,
    Sled {
        path: PathBuf,
    },
}

fn default_machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], default_agent_port()))
}
fn default_agent_port() -> u16 {
    7070
}
fn default_mds_checkup_interval() -> u64 {
    1800
}
fn default_dtl_checkup_interval() -> u64 {
    3600
}
fn default_reachability_timeout() -> u64 {
    2000
}
fn default_startup_poll_attempts() -> u32 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            machine_id: default_machine_id(),
            ip: default_ip(),
            bind_addr: default_bind_addr(),
            agent_port: default_agent_port(),
            dal_path: None,
            ccs: CcsBackend::default(),
            mds_checkup_interval_secs: default_mds_checkup_interval(),
            dtl_checkup_interval_secs: default_dtl_checkup_interval(),
            reachability_timeout_ms: default_reachability_timeout(),
            startup_poll_attempts: default_startup_poll_attempts(),
            log_level: default_log_level(),
        }
    }
}

impl ControllerConfig {
    /// Load from a TOML file (optional) with environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let cfg: ControllerConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine_id.is_empty() {
            return Err(crate::Error::InvalidConfig("machine_id cannot be empty".into()));
        }
        if self.startup_poll_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "startup_poll_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    /// Whether this controller owns the DAL (admin API + checkups).
    pub fn is_master(&self) -> bool {
        self.dal_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.agent_port, 7070);
        assert_eq!(cfg.ccs, CcsBackend::Memory);
        assert_eq!(cfg.startup_poll_attempts, 60);
        assert!(!cfg.is_master());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
machine_id = "abc123"
ip = "10.100.1.1"
dal_path = "/var/lib/ovs/dal"
mds_checkup_interval_secs = 60

[ccs]
backend = "sled"
path = "/var/lib/ovs/ccs"
"#
        )
        .unwrap();

        let cfg = ControllerConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.machine_id, "abc123");
        assert_eq!(cfg.ip, "10.100.1.1");
        assert_eq!(cfg.mds_checkup_interval_secs, 60);
        assert_eq!(
            cfg.ccs,
            CcsBackend::Sled {
                path: PathBuf::from("/var/lib/ovs/ccs")
            }
        );
        assert!(cfg.is_master());
    }
}
