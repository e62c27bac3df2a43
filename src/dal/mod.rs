//! Data access layer
//!
//! Typed in-memory tables behind a lock, optionally persisted to RocksDB.
//! Writes run against a draft copy and are committed only when the closure
//! succeeds, so a failed multi-row update leaves no partial state behind.

pub mod model;
pub mod persist;

pub use model::*;
pub use persist::DalPersistence;

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

fn not_found(what: &str, id: impl std::fmt::Display) -> crate::Error {
    crate::Error::NotFound(format!("{} {}", what, id))
}

/// All entity tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    pub vpools: BTreeMap<VPoolId, VPool>,
    pub storagerouters: BTreeMap<StorageRouterId, StorageRouter>,
    pub domains: BTreeMap<DomainId, Domain>,
    pub storagerouter_domains: BTreeMap<StorageRouterDomainId, StorageRouterDomain>,
    pub storagedrivers: BTreeMap<StorageDriverId, StorageDriver>,
    pub vdisks: BTreeMap<VDiskId, VDisk>,
    pub vdisk_domains: BTreeMap<VDiskDomainId, VDiskDomain>,
    pub services: BTreeMap<ServiceId, Service>,
    pub mds_services: BTreeMap<MdsServiceId, MdsService>,
    pub mds_service_vdisks: BTreeMap<MdsServiceVDiskId, MdsServiceVDisk>,
    pub disk_partitions: BTreeMap<DiskPartitionId, DiskPartition>,
    pub storagedriver_partitions: BTreeMap<StorageDriverPartitionId, StorageDriverPartition>,
    pub alba_proxies: BTreeMap<AlbaProxyId, AlbaProxy>,
}

impl Tables {
    // === vPools ===

    pub fn vpool(&self, id: VPoolId) -> Result<&VPool> {
        self.vpools.get(&id).ok_or_else(|| not_found("vPool", id))
    }

    pub fn vpool_mut(&mut self, id: VPoolId) -> Result<&mut VPool> {
        self.vpools.get_mut(&id).ok_or_else(|| not_found("vPool", id))
    }

    pub fn vpool_by_name(&self, name: &str) -> Option<&VPool> {
        self.vpools.values().find(|v| v.name == name)
    }

    // === Hosts ===

    pub fn storagerouter(&self, id: StorageRouterId) -> Result<&StorageRouter> {
        self.storagerouters
            .get(&id)
            .ok_or_else(|| not_found("StorageRouter", id))
    }

    pub fn storagerouter_by_ip(&self, ip: &str) -> Option<&StorageRouter> {
        self.storagerouters.values().find(|sr| sr.ip == ip)
    }

    pub fn storagerouter_by_machine_id(&self, machine_id: &str) -> Option<&StorageRouter> {
        self.storagerouters
            .values()
            .find(|sr| sr.machine_id == machine_id)
    }

    pub fn domain_by_name(&self, name: &str) -> Option<&Domain> {
        self.domains.values().find(|d| d.name == name)
    }

    /// Domains of a host, regular (`backup == false`) or recovery
    pub fn domains_of(&self, storagerouter: StorageRouterId, backup: bool) -> BTreeSet<DomainId> {
        self.storagerouter_domains
            .values()
            .filter(|j| j.storagerouter == storagerouter && j.backup == backup)
            .map(|j| j.domain)
            .collect()
    }

    pub fn has_domains(&self, storagerouter: StorageRouterId) -> bool {
        self.storagerouter_domains
            .values()
            .any(|j| j.storagerouter == storagerouter)
    }

    /// Hosts for which `domain` is a regular domain
    pub fn storagerouters_in_domain(&self, domain: DomainId) -> BTreeSet<StorageRouterId> {
        self.storagerouter_domains
            .values()
            .filter(|j| j.domain == domain && !j.backup)
            .map(|j| j.storagerouter)
            .collect()
    }

    // === StorageDrivers ===

    pub fn storagedriver(&self, id: StorageDriverId) -> Result<&StorageDriver> {
        self.storagedrivers
            .get(&id)
            .ok_or_else(|| not_found("StorageDriver", id))
    }

    pub fn storagedrivers_of_vpool(&self, vpool: VPoolId) -> Vec<&StorageDriver> {
        self.storagedrivers
            .values()
            .filter(|sd| sd.vpool == vpool)
            .collect()
    }

    pub fn storagedrivers_on(&self, storagerouter: StorageRouterId) -> Vec<&StorageDriver> {
        self.storagedrivers
            .values()
            .filter(|sd| sd.storagerouter == storagerouter)
            .collect()
    }

    pub fn storagedriver_for(
        &self,
        vpool: VPoolId,
        storagerouter: StorageRouterId,
    ) -> Option<&StorageDriver> {
        self.storagedrivers
            .values()
            .find(|sd| sd.vpool == vpool && sd.storagerouter == storagerouter)
    }

    /// Hosts carrying a StorageDriver of the vPool
    pub fn vpool_hosts(&self, vpool: VPoolId) -> BTreeSet<StorageRouterId> {
        self.storagedrivers_of_vpool(vpool)
            .into_iter()
            .map(|sd| sd.storagerouter)
            .collect()
    }

    pub fn storagedriver_partitions_of(
        &self,
        storagedriver: StorageDriverId,
    ) -> Vec<&StorageDriverPartition> {
        self.storagedriver_partitions
            .values()
            .filter(|p| p.storagedriver == storagedriver)
            .collect()
    }

    pub fn alba_proxies_of(&self, storagedriver: StorageDriverId) -> Vec<&AlbaProxy> {
        self.alba_proxies
            .values()
            .filter(|p| p.storagedriver == storagedriver)
            .collect()
    }

    /// Every port taken on a host by StorageDrivers, their proxies and MDS services
    pub fn used_ports(&self, storagerouter: StorageRouterId) -> BTreeSet<u16> {
        let mut ports: BTreeSet<u16> = self
            .storagedrivers_on(storagerouter)
            .into_iter()
            .flat_map(|sd| sd.ports.all())
            .collect();
        ports.extend(
            self.services
                .values()
                .filter(|s| s.storagerouter == storagerouter)
                .flat_map(|s| s.ports.iter().copied()),
        );
        ports
    }

    pub fn disk_partitions_of(&self, storagerouter: StorageRouterId) -> Vec<&DiskPartition> {
        self.disk_partitions
            .values()
            .filter(|p| p.storagerouter == storagerouter)
            .collect()
    }

    // === vDisks ===

    pub fn vdisk(&self, id: VDiskId) -> Result<&VDisk> {
        self.vdisks.get(&id).ok_or_else(|| not_found("vDisk", id))
    }

    pub fn vdisk_mut(&mut self, id: VDiskId) -> Result<&mut VDisk> {
        self.vdisks.get_mut(&id).ok_or_else(|| not_found("vDisk", id))
    }

    pub fn vdisks_of_vpool(&self, vpool: VPoolId) -> Vec<&VDisk> {
        self.vdisks.values().filter(|v| v.vpool == vpool).collect()
    }

    pub fn vdisk_domains_of(&self, vdisk: VDiskId) -> Vec<&VDiskDomain> {
        self.vdisk_domains
            .values()
            .filter(|j| j.vdisk == vdisk)
            .collect()
    }

    // === MDS services ===

    pub fn service(&self, id: ServiceId) -> Result<&Service> {
        self.services.get(&id).ok_or_else(|| not_found("Service", id))
    }

    pub fn mds_service(&self, id: MdsServiceId) -> Result<&MdsService> {
        self.mds_services
            .get(&id)
            .ok_or_else(|| not_found("MDS service", id))
    }

    pub fn mds_services_of_vpool(&self, vpool: VPoolId) -> Vec<&MdsService> {
        self.mds_services
            .values()
            .filter(|m| m.vpool == vpool)
            .collect()
    }

    /// MDS services of a vPool on one host, ordered by number
    pub fn mds_services_on(
        &self,
        vpool: VPoolId,
        storagerouter: StorageRouterId,
    ) -> Vec<&MdsService> {
        let mut services: Vec<&MdsService> = self
            .mds_services
            .values()
            .filter(|m| m.vpool == vpool)
            .filter(|m| {
                self.services
                    .get(&m.service)
                    .map(|s| s.storagerouter == storagerouter)
                    .unwrap_or(false)
            })
            .collect();
        services.sort_by_key(|m| m.number);
        services
    }

    /// Host and port an MDS service listens on
    pub fn mds_socket(&self, id: MdsServiceId) -> Result<(StorageRouterId, String, u16)> {
        let mds = self.mds_service(id)?;
        let service = self.service(mds.service)?;
        let host = self.storagerouter(service.storagerouter)?;
        let port = service.ports.first().copied().ok_or_else(|| {
            crate::Error::Internal(format!("service {} has no port", service.name))
        })?;
        Ok((host.id, host.ip.clone(), port))
    }

    /// MDS service of a vPool behind `ip:port`
    pub fn mds_service_by_socket(&self, vpool: VPoolId, ip: &str, port: u16) -> Option<MdsServiceId> {
        self.mds_services_of_vpool(vpool)
            .into_iter()
            .find(|m| {
                matches!(self.mds_socket(m.id), Ok((_, ref mip, mport)) if mip == ip && mport == port)
            })
            .map(|m| m.id)
    }

    /// MDS junctions of a vdisk in configuration order
    pub fn mds_junctions_of(&self, vdisk: VDiskId) -> Vec<&MdsServiceVDisk> {
        let mut junctions: Vec<&MdsServiceVDisk> = self
            .mds_service_vdisks
            .values()
            .filter(|j| j.vdisk == vdisk)
            .collect();
        junctions.sort_by_key(|j| j.position);
        junctions
    }

    pub fn vdisk_count_of(&self, mds_service: MdsServiceId) -> usize {
        self.mds_service_vdisks
            .values()
            .filter(|j| j.mds_service == mds_service)
            .count()
    }
}

/// Shared handle on the tables
pub struct Dal {
    tables: RwLock<Tables>,
    persistence: Option<DalPersistence>,
}

impl Dal {
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            persistence: None,
        }
    }

    /// Open a RocksDB-backed DAL, loading every persisted row
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let persistence = DalPersistence::open(path)?;
        let tables = persistence.load()?;
        tracing::info!(
            vpools = tables.vpools.len(),
            vdisks = tables.vdisks.len(),
            "Loaded data access layer"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            persistence: Some(persistence),
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    /// Apply `f` to a draft; commit (and persist) only on success.
    pub fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut draft = tables.clone();
        let result = f(&mut draft)?;
        if let Some(persistence) = &self.persistence {
            persistence.sync(&tables, &draft)?;
        }
        *tables = draft;
        Ok(result)
    }

    /// Point-in-time copy, for long computations across RPCs
    pub fn snapshot(&self) -> Tables {
        self.read(Tables::clone)
    }
}
