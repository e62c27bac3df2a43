//! RPC contracts towards the volume router, the MDS, the object backend and
//! the per-host agent, plus the pool handing out cached clients.

pub mod http;
pub mod sim;

use crate::ccs::ArakoonConfig;
use crate::common::{ProcessIdentity, Result};
use crate::dal::{BackendInfo, DtlMode, StorageRouter, StorageRouterId, VPoolId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One entry of a volume's metadata backend config; the first is the master
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MdsNodeConfig {
    pub ip: String,
    pub port: u16,
}

impl MdsNodeConfig {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl std::fmt::Display for MdsNodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MdsRole {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeStatus {
    Running,
    Halted,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub live_status: VolumeStatus,
    /// Volume router id of the current owner
    pub owner: String,
    pub metadata_backend_config: Vec<MdsNodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlConfig {
    pub host: String,
    pub port: u16,
    pub mode: DtlMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DtlConfigMode {
    Automatic,
    Manual,
}

/// Entry of the volume router cluster registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    pub vrouter_id: String,
    pub host: String,
    pub message_port: u16,
    pub xmlrpc_host: String,
    pub xmlrpc_port: u16,
    pub failovercache_host: String,
    pub failovercache_port: u16,
    pub network_server_uri: String,
    pub node_distance_map: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbaNode {
    pub node_id: String,
    pub ip: String,
}

/// Per-MDS RPC
#[async_trait]
pub trait MdsClient: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>>;
    /// Idempotent: an existing namespace is not an error.
    async fn create_namespace(&self, volume_id: &str) -> Result<()>;
    async fn remove_namespace(&self, volume_id: &str) -> Result<()>;
    async fn get_role(&self, volume_id: &str) -> Result<MdsRole>;
    async fn set_role(&self, volume_id: &str, role: MdsRole) -> Result<()>;
    /// Replay tlogs from the backend; returns the number of tlogs the
    /// namespace is (or, with `dry_run`, would be) behind the master.
    async fn catch_up(&self, volume_id: &str, dry_run: bool) -> Result<u64>;
}

/// Per-vPool volume router RPC
#[async_trait]
pub trait StorageRouterClient: Send + Sync {
    async fn info_volume(&self, volume_id: &str) -> Result<VolumeInfo>;
    /// Volumes of the vPool, optionally only those owned by one router
    async fn list_volumes(&self, router_id: Option<&str>) -> Result<Vec<String>>;
    async fn update_metadata_backend_config(
        &self,
        volume_id: &str,
        config: &[MdsNodeConfig],
        req_timeout: Duration,
    ) -> Result<()>;

    async fn get_node_configs(&self) -> Result<Vec<ClusterNodeConfig>>;
    async fn set_node_configs(&self, configs: &[ClusterNodeConfig]) -> Result<()>;
    async fn erase_node_configs(&self) -> Result<()>;
    /// Make a live router re-read the cluster registry
    async fn update_cluster_node_configs(&self, router_id: &str, timeout: Duration) -> Result<()>;

    /// `None` removes the DTL of the volume
    async fn set_manual_dtl_config(&self, volume_id: &str, config: Option<&DtlConfig>)
        -> Result<()>;
    async fn get_dtl_config(&self, volume_id: &str) -> Result<Option<DtlConfig>>;
    async fn get_dtl_config_mode(&self, volume_id: &str) -> Result<DtlConfigMode>;

    /// Tear down the filesystem on the backend; last router of a vPool only.
    async fn destroy_filesystem(&self) -> Result<()>;
}

/// Management API of an ALBA backend
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn get_arakoon_config(&self, backend_id: &str) -> Result<ArakoonConfig>;
    async fn list_alba_nodes(&self, backend_id: &str) -> Result<Vec<AlbaNode>>;
}

/// Supporting actions on one host
#[async_trait]
pub trait HostAgent: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn create_dirs(&self, paths: &[String]) -> Result<()>;
    async fn remove_dirs(&self, paths: &[String]) -> Result<()>;
    async fn dir_exists(&self, path: &str) -> Result<bool>;
    /// Free bytes on the filesystem holding `path`
    async fn available_space(&self, path: &str) -> Result<u64>;

    async fn add_service(&self, name: &str, params: &BTreeMap<String, String>) -> Result<()>;
    async fn start_service(&self, name: &str) -> Result<()>;
    async fn stop_service(&self, name: &str) -> Result<()>;
    async fn remove_service(&self, name: &str) -> Result<()>;
    async fn has_service(&self, name: &str) -> Result<bool>;
    /// Identity of the main process of a running service
    async fn service_identity(&self, name: &str) -> Result<Option<ProcessIdentity>>;
    /// Identity of the worker (controller) process on the host
    async fn worker_identity(&self) -> Result<ProcessIdentity>;
    /// Monotonic value that grows every time the service is (re)started
    async fn startup_counter(&self, name: &str) -> Result<u64>;
}

/// Address of the volume router cluster of a vPool, through one of its members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterTarget {
    pub vpool: VPoolId,
    pub vpool_name: String,
    pub router_id: String,
    pub ip: String,
    pub port: u16,
}

/// Builds transport-level clients
pub trait ClientFactory: Send + Sync {
    fn mds_client(&self, ip: &str, port: u16, timeout: Duration) -> Result<Arc<dyn MdsClient>>;
    fn storagerouter_client(
        &self,
        target: &RouterTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn StorageRouterClient>>;
    fn backend_client(&self, backend: &BackendInfo) -> Result<Arc<dyn BackendClient>>;
    fn host_agent(&self, host: &StorageRouter) -> Result<Arc<dyn HostAgent>>;
}

/// Volume router service name of a vPool
pub fn volumedriver_service(vpool_name: &str) -> String {
    format!("ovs-volumedriver_{}", vpool_name)
}

type Cache<K, V> = Mutex<HashMap<K, V>>;

fn cached<K, V, F>(cache: &Cache<K, V>, key: K, build: F) -> Result<V>
where
    K: std::hash::Hash + Eq,
    V: Clone,
    F: FnOnce() -> Result<V>,
{
    let mut map = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(value) = map.get(&key) {
        return Ok(value.clone());
    }
    let value = build()?;
    map.insert(key, value.clone());
    Ok(value)
}

/// Clients cached by stable entity keys, shared by every controller
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    reachability_timeout: Duration,
    mds: Cache<(String, u16, u64), Arc<dyn MdsClient>>,
    routers: Cache<(VPoolId, String, u64), Arc<dyn StorageRouterClient>>,
    backends: Cache<String, Arc<dyn BackendClient>>,
    agents: Cache<StorageRouterId, Arc<dyn HostAgent>>,
    volumedrivers: Cache<(StorageRouterId, String), ProcessIdentity>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, reachability_timeout: Duration) -> Self {
        Self {
            factory,
            reachability_timeout,
            mds: Mutex::new(HashMap::new()),
            routers: Mutex::new(HashMap::new()),
            backends: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            volumedrivers: Mutex::new(HashMap::new()),
        }
    }

    pub fn mds(&self, ip: &str, port: u16, timeout: Duration) -> Result<Arc<dyn MdsClient>> {
        cached(
            &self.mds,
            (ip.to_string(), port, timeout.as_secs()),
            || self.factory.mds_client(ip, port, timeout),
        )
    }

    pub fn router(
        &self,
        target: &RouterTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn StorageRouterClient>> {
        cached(
            &self.routers,
            (target.vpool, target.router_id.clone(), timeout.as_secs()),
            || self.factory.storagerouter_client(target, timeout),
        )
    }

    pub fn backend(&self, backend: &BackendInfo) -> Result<Arc<dyn BackendClient>> {
        cached(&self.backends, backend.backend_id.clone(), || {
            self.factory.backend_client(backend)
        })
    }

    pub fn agent(&self, host: &StorageRouter) -> Result<Arc<dyn HostAgent>> {
        cached(&self.agents, host.id, || self.factory.host_agent(host))
    }

    /// Short-lived connectivity check of a host
    pub async fn is_reachable(&self, host: &StorageRouter) -> bool {
        let agent = match self.agent(host) {
            Ok(agent) => agent,
            Err(_) => return false,
        };
        matches!(
            tokio::time::timeout(self.reachability_timeout, agent.ping()).await,
            Ok(Ok(()))
        )
    }

    /// Identity of the volume router of a vPool on a host, cached until
    /// invalidated. `None` when the router is not running.
    pub async fn volumedriver_identity(
        &self,
        host: &StorageRouter,
        vpool_name: &str,
    ) -> Result<Option<ProcessIdentity>> {
        let key = (host.id, vpool_name.to_string());
        {
            let map = self
                .volumedrivers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(identity) = map.get(&key) {
                return Ok(Some(*identity));
            }
        }
        let identity = self
            .agent(host)?
            .service_identity(&volumedriver_service(vpool_name))
            .await?;
        if let Some(identity) = identity {
            self.volumedrivers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, identity);
        }
        Ok(identity)
    }

    pub fn invalidate_volumedriver_identity(&self, host: StorageRouterId, vpool_name: &str) {
        self.volumedrivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(host, vpool_name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::sim::SimCluster;
    use crate::dal::NodeType;

    fn host(ip: &str) -> StorageRouter {
        StorageRouter {
            id: StorageRouterId::new(),
            name: ip.to_string(),
            ip: ip.to_string(),
            machine_id: ip.to_string(),
            node_type: NodeType::Master,
        }
    }

    #[tokio::test]
    async fn test_reachability_follows_host_state() {
        let sim = SimCluster::new();
        let pool = ClientPool::new(sim.factory(), Duration::from_millis(200));
        let h = host("10.0.0.1");
        sim.add_host(&h.ip);
        assert!(pool.is_reachable(&h).await);
        sim.set_reachable(&h.ip, false);
        assert!(!pool.is_reachable(&h).await);
    }

    #[tokio::test]
    async fn test_volumedriver_identity_is_cached_until_invalidated() {
        let sim = SimCluster::new();
        let pool = ClientPool::new(sim.factory(), Duration::from_millis(200));
        let h = host("10.0.0.1");
        sim.add_host(&h.ip);
        sim.start_volumedriver(&h.ip, "pool");

        let first = pool.volumedriver_identity(&h, "pool").await.unwrap().unwrap();
        sim.restart_service(&h.ip, &volumedriver_service("pool"));
        let cached = pool.volumedriver_identity(&h, "pool").await.unwrap().unwrap();
        assert_eq!(first, cached);

        pool.invalidate_volumedriver_identity(h.id, "pool");
        let fresh = pool.volumedriver_identity(&h, "pool").await.unwrap().unwrap();
        assert_ne!(first, fresh);
    }
}
