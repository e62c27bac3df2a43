//! Parameters of a vPool creation or extension

use crate::common::{validate_ipv4, validate_vpool_name, Result};
use crate::dal::{BackendInfo, CachingInfo, DtlMode, DtlTransport, VPool, VPoolConfiguration};
use crate::mds::MdsConfig;
use serde::{Deserialize, Serialize};

/// Allowed SCO sizes in MiB
pub const SCO_SIZES: [u32; 6] = [4, 8, 16, 32, 64, 128];
/// Allowed cluster sizes in KiB
pub const CLUSTER_SIZES: [u32; 5] = [4, 8, 16, 32, 64];
pub const WRITE_BUFFER_RANGE: (u32, u32) = (128, 10240);
pub const MAX_PROXIES: usize = 16;

const DEFAULT_WRITE_BUFFER: u32 = 1024;

/// Number of SCOs per tlog for a given SCO size
pub fn tlog_multiplier(sco_size: u32) -> u32 {
    match sco_size {
        4 => 16,
        8 => 8,
        16 => 4,
        32 => 2,
        _ => 1,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VPoolParameters {
    pub vpool_name: String,
    /// Ip of the host receiving the new StorageDriver
    pub storagerouter_ip: String,
    /// Ip the StorageDriver serves data on
    pub storage_ip: String,
    pub backend: BackendInfo,
    #[serde(default)]
    pub caching: CachingInfo,
    #[serde(default = "default_proxies")]
    pub proxies: usize,
    /// SCO size in MiB
    #[serde(default)]
    pub sco_size: Option<u32>,
    /// Cluster size in KiB
    #[serde(default)]
    pub cluster_size: Option<u32>,
    /// Write buffer in MiB
    #[serde(default)]
    pub write_buffer: Option<u32>,
    #[serde(default)]
    pub dtl_mode: Option<DtlMode>,
    #[serde(default)]
    pub dtl_transport: Option<DtlTransport>,
    /// MDS tuning of a new vPool; ignored when extending
    #[serde(default)]
    pub mds_config: Option<MdsConfig>,
}

fn default_proxies() -> usize {
    1
}

impl VPoolParameters {
    pub fn new(
        vpool_name: impl Into<String>,
        storagerouter_ip: impl Into<String>,
        backend: BackendInfo,
    ) -> Self {
        let storagerouter_ip = storagerouter_ip.into();
        Self {
            vpool_name: vpool_name.into(),
            storage_ip: storagerouter_ip.clone(),
            storagerouter_ip,
            backend,
            caching: CachingInfo::default(),
            proxies: default_proxies(),
            sco_size: None,
            cluster_size: None,
            write_buffer: None,
            dtl_mode: None,
            dtl_transport: None,
            mds_config: None,
        }
    }

    /// Check every rule, reporting all violations at once. When extending,
    /// `existing` is the vPool being extended.
    pub fn validate(&self, existing: Option<&VPool>) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = validate_vpool_name(&self.vpool_name) {
            errors.push(e.to_string());
        }
        for ip in [&self.storagerouter_ip, &self.storage_ip] {
            if let Err(e) = validate_ipv4(ip) {
                errors.push(e.to_string());
            }
        }
        if self.proxies == 0 || self.proxies > MAX_PROXIES {
            errors.push(format!(
                "proxies must be between 1 and {}, got {}",
                MAX_PROXIES, self.proxies
            ));
        }
        if let Some(sco) = self.sco_size {
            if !SCO_SIZES.contains(&sco) {
                errors.push(format!("sco_size must be one of {:?}, got {}", SCO_SIZES, sco));
            }
        }
        if let Some(cluster) = self.cluster_size {
            if !CLUSTER_SIZES.contains(&cluster) {
                errors.push(format!(
                    "cluster_size must be one of {:?}, got {}",
                    CLUSTER_SIZES, cluster
                ));
            }
        }
        let write_buffer = self.write_buffer();
        if write_buffer < WRITE_BUFFER_RANGE.0 || write_buffer > WRITE_BUFFER_RANGE.1 {
            errors.push(format!(
                "write_buffer must be between {} and {} MiB, got {}",
                WRITE_BUFFER_RANGE.0, WRITE_BUFFER_RANGE.1, write_buffer
            ));
        }
        if self.sco_size == Some(128) && write_buffer < 256 {
            errors.push("a sco_size of 128 requires a write_buffer of at least 256 MiB".into());
        }
        for cache in [&self.caching.fragment_cache, &self.caching.block_cache] {
            if let Some(backend) = &cache.backend {
                if backend.backend_id == self.backend.backend_id {
                    errors.push(format!(
                        "backend {} cannot be used as its own cache",
                        backend.name
                    ));
                }
            }
        }
        if let Some(mds) = &self.mds_config {
            if let Err(e) = mds.validate() {
                errors.push(e.to_string());
            }
        }

        if let Some(vpool) = existing {
            let current = &vpool.configuration;
            let mismatch = |name: &str, given: String, actual: String| {
                format!(
                    "{} {} differs from the {} of vPool {}",
                    name, given, actual, vpool.name
                )
            };
            if let Some(sco) = self.sco_size.filter(|s| *s != current.sco_size) {
                errors.push(mismatch("sco_size", sco.to_string(), current.sco_size.to_string()));
            }
            if let Some(cluster) = self.cluster_size.filter(|c| *c != current.cluster_size) {
                errors.push(mismatch(
                    "cluster_size",
                    cluster.to_string(),
                    current.cluster_size.to_string(),
                ));
            }
            if let Some(mode) = self.dtl_mode.filter(|m| *m != current.dtl_mode) {
                errors.push(mismatch("dtl_mode", mode.to_string(), current.dtl_mode.to_string()));
            }
            if let Some(transport) = self.dtl_transport.filter(|t| *t != current.dtl_transport) {
                errors.push(mismatch(
                    "dtl_transport",
                    transport.to_string(),
                    current.dtl_transport.to_string(),
                ));
            }
            if self.backend.backend_id != vpool.backend.backend_id {
                errors.push(mismatch(
                    "backend",
                    self.backend.backend_id.clone(),
                    vpool.backend.backend_id.clone(),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::InvalidParameter(errors.join("; ")))
        }
    }

    pub fn write_buffer(&self) -> u32 {
        self.write_buffer.unwrap_or(DEFAULT_WRITE_BUFFER)
    }

    /// Pool-wide knobs of a new vPool
    pub fn configuration(&self) -> VPoolConfiguration {
        let defaults = VPoolConfiguration::default();
        VPoolConfiguration {
            sco_size: self.sco_size.unwrap_or(defaults.sco_size),
            cluster_size: self.cluster_size.unwrap_or(defaults.cluster_size),
            dtl_mode: self.dtl_mode.unwrap_or(defaults.dtl_mode),
            dtl_transport: self.dtl_transport.unwrap_or(defaults.dtl_transport),
        }
    }
}

/// Ratio between the write buffer and the SCOs a single tlog covers
pub fn non_disposable_scos_factor(write_buffer: u32, sco_size: u32) -> f64 {
    write_buffer as f64 / tlog_multiplier(sco_size) as f64 / sco_size as f64
}
