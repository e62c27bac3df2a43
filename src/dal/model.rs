//! Entities of the data access layer
//!
//! Every entity is one record in a typed table keyed by its id. Relations are
//! plain id references; junctions with attributes are records of their own.
//! Rows are bincode-encoded when persisted, so no self-describing types
//! (internally tagged enums, `serde_json::Value`) appear here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|_| {
                    crate::Error::InvalidParameter(format!(
                        "invalid {} '{}'",
                        stringify!($name),
                        s
                    ))
                })
            }
        }
    };
}

entity_id!(VPoolId);
entity_id!(StorageDriverId);
entity_id!(
    /// Storage router (host) id
    StorageRouterId
);
entity_id!(DomainId);
entity_id!(StorageRouterDomainId);
entity_id!(VDiskId);
entity_id!(VDiskDomainId);
entity_id!(ServiceId);
entity_id!(MdsServiceId);
entity_id!(MdsServiceVDiskId);
entity_id!(DiskPartitionId);
entity_id!(StorageDriverPartitionId);
entity_id!(AlbaProxyId);

// === vPool ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VPoolStatus {
    Installing,
    Running,
    Extending,
    Shrinking,
    Failure,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtlMode {
    #[serde(rename = "sync")]
    Sync,
    #[serde(rename = "a_sync")]
    Async,
    #[serde(rename = "no_sync")]
    NoSync,
}

impl FromStr for DtlMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "sync" => Ok(DtlMode::Sync),
            "a_sync" => Ok(DtlMode::Async),
            "no_sync" => Ok(DtlMode::NoSync),
            other => Err(crate::Error::InvalidParameter(format!(
                "invalid DTL mode '{}', expected sync, a_sync or no_sync",
                other
            ))),
        }
    }
}

impl fmt::Display for DtlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DtlMode::Sync => "sync",
            DtlMode::Async => "a_sync",
            DtlMode::NoSync => "no_sync",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlTransport {
    Tcp,
    Rdma,
}

impl FromStr for DtlTransport {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "tcp" => Ok(DtlTransport::Tcp),
            "rdma" => Ok(DtlTransport::Rdma),
            other => Err(crate::Error::InvalidParameter(format!(
                "invalid DTL transport '{}', expected tcp or rdma",
                other
            ))),
        }
    }
}

impl fmt::Display for DtlTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DtlTransport::Tcp => "tcp",
            DtlTransport::Rdma => "rdma",
        })
    }
}

/// Connection to the management API of a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConnection {
    pub host: String,
    pub port: u16,
    /// The backend is managed by this cluster
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Id of the ALBA backend, also the key of its Arakoon config
    pub backend_id: String,
    pub name: String,
    pub preset: String,
    pub connection: BackendConnection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Cache on a local partition
    pub local: bool,
    /// Cache on another ALBA backend
    pub backend: Option<BackendInfo>,
    pub cache_on_read: bool,
    pub cache_on_write: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            local: true,
            backend: None,
            cache_on_read: false,
            cache_on_write: true,
        }
    }
}

impl CacheSettings {
    pub fn disabled() -> Self {
        Self {
            local: false,
            backend: None,
            cache_on_read: false,
            cache_on_write: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_on_read || self.cache_on_write
    }
}

/// Caching policy of a vPool on one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingInfo {
    pub fragment_cache: CacheSettings,
    pub block_cache: CacheSettings,
}

impl CachingInfo {
    /// A proxy on this host keeps a cache on a local WRITE partition
    pub fn uses_local_cache(&self) -> bool {
        [&self.fragment_cache, &self.block_cache]
            .iter()
            .any(|c| c.is_enabled() && c.local && c.backend.is_none())
    }
}

/// vPool-wide knobs every StorageDriver of the pool must agree on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VPoolConfiguration {
    /// SCO size in MiB
    pub sco_size: u32,
    /// Cluster size in KiB
    pub cluster_size: u32,
    pub dtl_mode: DtlMode,
    pub dtl_transport: DtlTransport,
}

impl Default for VPoolConfiguration {
    fn default() -> Self {
        Self {
            sco_size: 4,
            cluster_size: 4,
            dtl_mode: DtlMode::Async,
            dtl_transport: DtlTransport::Tcp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VPool {
    pub id: VPoolId,
    pub name: String,
    pub status: VPoolStatus,
    pub metadata_store_bits: u8,
    pub backend: BackendInfo,
    pub caching_info: BTreeMap<StorageRouterId, CachingInfo>,
    pub configuration: VPoolConfiguration,
}

// === Hosts and domains ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Master,
    Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRouter {
    pub id: StorageRouterId,
    pub name: String,
    pub ip: String,
    pub machine_id: String,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
}

/// Host membership of a domain; `backup` marks a recovery domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRouterDomain {
    pub id: StorageRouterDomainId,
    pub storagerouter: StorageRouterId,
    pub domain: DomainId,
    pub backup: bool,
}

// === StorageDrivers ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDriverPorts {
    pub management: u16,
    pub xmlrpc: u16,
    pub dtl: u16,
    pub edge: u16,
}

impl StorageDriverPorts {
    pub fn all(&self) -> [u16; 4] {
        [self.management, self.xmlrpc, self.dtl, self.edge]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDriver {
    pub id: StorageDriverId,
    pub vpool: VPoolId,
    pub storagerouter: StorageRouterId,
    /// Volume router id, the RPC identity of this instance
    pub storagedriver_id: String,
    pub cluster_ip: String,
    pub storage_ip: String,
    pub ports: StorageDriverPorts,
    pub mountpoint: String,
}

// === Volumes ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDisk {
    pub id: VDiskId,
    pub name: String,
    pub volume_id: String,
    pub vpool: VPoolId,
    pub storagerouter: Option<StorageRouterId>,
    pub has_manual_dtl: bool,
}

/// Admin-chosen DTL domain of a vdisk; `sync` pins the DTL mode to SYNC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDiskDomain {
    pub id: VDiskDomainId,
    pub vdisk: VDiskId,
    pub domain: DomainId,
    pub sync: bool,
}

// === Services ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    MetadataServer,
    AlbaProxy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub service_type: ServiceType,
    pub storagerouter: StorageRouterId,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdsService {
    pub id: MdsServiceId,
    pub vpool: VPoolId,
    /// Index of this MDS within (vPool, host)
    pub number: u32,
    pub service: ServiceId,
    /// Target maximum number of vdisks; negative means "always 50%", zero
    /// means the service is never picked.
    pub capacity: i64,
}

impl MdsService {
    pub const DEFAULT_CAPACITY: i64 = 100;
}

/// Order-sensitive edge vdisk -> MDS service; position 0 is the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdsServiceVDisk {
    pub id: MdsServiceVDiskId,
    pub vdisk: VDiskId,
    pub mds_service: MdsServiceId,
    pub is_master: bool,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbaProxy {
    pub id: AlbaProxyId,
    pub storagedriver: StorageDriverId,
    pub service: ServiceId,
}

// === Partitions ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskRole {
    Db,
    Write,
    Dtl,
    Scrub,
    Read,
}

impl FromStr for DiskRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DB" => Ok(DiskRole::Db),
            "WRITE" => Ok(DiskRole::Write),
            "DTL" => Ok(DiskRole::Dtl),
            "SCRUB" => Ok(DiskRole::Scrub),
            "READ" => Ok(DiskRole::Read),
            other => Err(crate::Error::InvalidParameter(format!(
                "unknown partition role '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubRole {
    Sco,
    Fcache,
    Fd,
    Tlog,
    Md,
    Mds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskPartition {
    pub id: DiskPartitionId,
    pub storagerouter: StorageRouterId,
    pub mountpoint: String,
    pub size: u64,
    pub roles: Vec<DiskRole>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDriverPartition {
    pub id: StorageDriverPartitionId,
    pub storagedriver: StorageDriverId,
    pub partition: DiskPartitionId,
    pub role: DiskRole,
    pub sub_role: Option<SubRole>,
    pub number: u32,
    pub size: Option<u64>,
    pub path: String,
    pub mds_service: Option<MdsServiceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parse_round_trip() {
        let id = VDiskId::new();
        assert_eq!(id.to_string().parse::<VDiskId>().unwrap(), id);
        assert!("not-a-uuid".parse::<VDiskId>().is_err());
    }

    #[test]
    fn test_dtl_mode_names() {
        assert_eq!("a_sync".parse::<DtlMode>().unwrap(), DtlMode::Async);
        assert_eq!(DtlMode::NoSync.to_string(), "no_sync");
        assert_eq!(serde_json::to_string(&DtlMode::Sync).unwrap(), "\"sync\"");
        assert!("async".parse::<DtlMode>().is_err());
    }

    #[test]
    fn test_local_cache_detection() {
        let mut info = CachingInfo::default();
        assert!(info.uses_local_cache());
        info.fragment_cache = CacheSettings::disabled();
        info.block_cache = CacheSettings::disabled();
        assert!(!info.uses_local_cache());
    }
}
