//! In-process simulation of the volume routers, MDS instances, backends and
//! host agents of a cluster.
//!
//! Used by the scenario tests and by `ovs-controller --simulate` for dry
//! runs. The simulation enforces the contracts the controllers depend on:
//! namespaces must exist before a config referencing them is pushed, and a
//! master handover may not share a push with the outgoing master.

use crate::ccs::ArakoonConfig;
use crate::clients::{
    AlbaNode, BackendClient, ClientFactory, ClusterNodeConfig, DtlConfig, DtlConfigMode,
    HostAgent, MdsClient, MdsNodeConfig, MdsRole, RouterTarget, StorageRouterClient, VolumeInfo,
    VolumeStatus,
};
use crate::common::{ProcessIdentity, Result};
use crate::dal::{BackendInfo, StorageRouter, VPoolId};
use crate::Error;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_FREE_SPACE: u64 = 100 * 1024 * 1024 * 1024;

/// Failure injected into a simulated RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Upstream,
    Unreachable,
    MasterLookupFailed,
}

impl FaultKind {
    fn to_error(self, op: &str, target: &str) -> Error {
        let msg = format!("injected failure in {} on {}", op, target);
        match self {
            FaultKind::Timeout => Error::UpstreamTimeout(msg),
            FaultKind::Upstream => Error::UpstreamError(msg),
            FaultKind::Unreachable => Error::Unreachable(msg),
            FaultKind::MasterLookupFailed => Error::MasterLookupFailed(msg),
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    op: String,
    target: Option<String>,
    kind: FaultKind,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct SimService {
    params: BTreeMap<String, String>,
    identity: Option<ProcessIdentity>,
    starts: u64,
}

#[derive(Debug, Clone)]
struct SimHost {
    reachable: bool,
    dirs: BTreeSet<String>,
    free_space: BTreeMap<String, u64>,
    services: BTreeMap<String, SimService>,
    worker: ProcessIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimVolume {
    pub vpool: VPoolId,
    pub owner: String,
    pub status: VolumeStatus,
    pub mds_config: Vec<MdsNodeConfig>,
    pub dtl: Option<DtlConfig>,
    pub dtl_mode: DtlConfigMode,
}

#[derive(Debug, Clone)]
struct SimNamespace {
    role: MdsRole,
    tlogs_behind: u64,
}

#[derive(Debug, Default)]
struct SimState {
    hosts: BTreeMap<String, SimHost>,
    volumes: BTreeMap<String, SimVolume>,
    mds: BTreeMap<(String, u16), BTreeMap<String, SimNamespace>>,
    registries: BTreeMap<VPoolId, Vec<ClusterNodeConfig>>,
    backends: BTreeMap<String, (ArakoonConfig, Vec<AlbaNode>)>,
    faults: Vec<Fault>,
    calls: Vec<String>,
    active_catch_ups: usize,
    max_concurrent_catch_ups: usize,
    catch_up_delay: Duration,
    next_pid: u32,
    clock: u64,
}

impl SimState {
    fn new_identity(&mut self) -> ProcessIdentity {
        self.next_pid += 1;
        self.clock += 100;
        ProcessIdentity::new(1000 + self.next_pid, self.clock)
    }

    /// Record a call and fire a matching fault, if any
    fn enter(&mut self, op: &str, target: &str, detail: &str) -> Result<()> {
        let entry = if detail.is_empty() {
            format!("{} {}", op, target)
        } else {
            format!("{} {} {}", op, target, detail)
        };
        self.calls.push(entry);

        let hit = self.faults.iter().position(|f| {
            f.op == op && f.target.as_deref().map(|t| t == target).unwrap_or(true)
        });
        if let Some(idx) = hit {
            let fault = &mut self.faults[idx];
            let kind = fault.kind;
            let exhausted = match fault.remaining.as_mut() {
                Some(n) => {
                    *n -= 1;
                    *n == 0
                }
                None => false,
            };
            if exhausted {
                self.faults.remove(idx);
            }
            return Err(kind.to_error(op, target));
        }
        Ok(())
    }

    fn host(&self, ip: &str) -> Result<&SimHost> {
        let host = self
            .hosts
            .get(ip)
            .ok_or_else(|| Error::Unreachable(format!("unknown host {}", ip)))?;
        if !host.reachable {
            return Err(Error::Unreachable(format!("host {} is down", ip)));
        }
        Ok(host)
    }

    fn host_mut(&mut self, ip: &str) -> Result<&mut SimHost> {
        self.host(ip)?;
        self.hosts
            .get_mut(ip)
            .ok_or_else(|| Error::Unreachable(format!("unknown host {}", ip)))
    }

    fn volume_mut(&mut self, volume_id: &str) -> Result<&mut SimVolume> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_id)))
    }

    fn namespace_mut(&mut self, ip: &str, port: u16, volume_id: &str) -> Result<&mut SimNamespace> {
        self.mds
            .get_mut(&(ip.to_string(), port))
            .and_then(|m| m.get_mut(volume_id))
            .ok_or_else(|| Error::NamespaceNotFound(format!("{} on {}:{}", volume_id, ip, port)))
    }
}

/// Handle on the simulated cluster; clones share state
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn factory(&self) -> Arc<dyn ClientFactory> {
        Arc::new(SimFactory { sim: self.clone() })
    }

    // === Hosts ===

    pub fn add_host(&self, ip: &str) {
        let mut state = self.lock();
        let worker = state.new_identity();
        state.hosts.insert(
            ip.to_string(),
            SimHost {
                reachable: true,
                dirs: BTreeSet::new(),
                free_space: BTreeMap::new(),
                services: BTreeMap::new(),
                worker,
            },
        );
    }

    pub fn set_reachable(&self, ip: &str, reachable: bool) {
        if let Some(host) = self.lock().hosts.get_mut(ip) {
            host.reachable = reachable;
        }
    }

    pub fn set_free_space(&self, ip: &str, path: &str, bytes: u64) {
        if let Some(host) = self.lock().hosts.get_mut(ip) {
            host.free_space.insert(path.to_string(), bytes);
        }
    }

    /// Respawn the worker on a host; its identity changes
    pub fn restart_worker(&self, ip: &str) {
        let mut state = self.lock();
        let identity = state.new_identity();
        if let Some(host) = state.hosts.get_mut(ip) {
            host.worker = identity;
        }
    }

    pub fn worker_identity(&self, ip: &str) -> Option<ProcessIdentity> {
        self.lock().hosts.get(ip).map(|h| h.worker)
    }

    pub fn start_volumedriver(&self, ip: &str, vpool_name: &str) {
        let name = crate::clients::volumedriver_service(vpool_name);
        let mut state = self.lock();
        let identity = state.new_identity();
        if let Some(host) = state.hosts.get_mut(ip) {
            let service = host.services.entry(name).or_insert_with(|| SimService {
                params: BTreeMap::new(),
                identity: None,
                starts: 0,
            });
            service.identity = Some(identity);
            service.starts += 1;
        }
    }

    pub fn restart_service(&self, ip: &str, name: &str) {
        let mut state = self.lock();
        let identity = state.new_identity();
        if let Some(service) = state.hosts.get_mut(ip).and_then(|h| h.services.get_mut(name)) {
            service.identity = Some(identity);
            service.starts += 1;
        }
    }

    pub fn dirs(&self, ip: &str) -> BTreeSet<String> {
        self.lock()
            .hosts
            .get(ip)
            .map(|h| h.dirs.clone())
            .unwrap_or_default()
    }

    pub fn services(&self, ip: &str) -> Vec<String> {
        self.lock()
            .hosts
            .get(ip)
            .map(|h| h.services.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn service_params(&self, ip: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .hosts
            .get(ip)
            .and_then(|h| h.services.get(name))
            .map(|s| s.params.clone())
    }

    pub fn is_running(&self, ip: &str, name: &str) -> bool {
        self.lock()
            .hosts
            .get(ip)
            .and_then(|h| h.services.get(name))
            .map(|s| s.identity.is_some())
            .unwrap_or(false)
    }

    // === Volumes and MDS ===

    /// Register a running volume; namespaces are created on every MDS in
    /// `config`, the first as master.
    pub fn add_volume(&self, vpool: VPoolId, volume_id: &str, owner: &str, config: Vec<MdsNodeConfig>) {
        let mut state = self.lock();
        for (i, node) in config.iter().enumerate() {
            let role = if i == 0 { MdsRole::Master } else { MdsRole::Slave };
            state
                .mds
                .entry((node.ip.clone(), node.port))
                .or_default()
                .insert(
                    volume_id.to_string(),
                    SimNamespace {
                        role,
                        tlogs_behind: 0,
                    },
                );
        }
        state.volumes.insert(
            volume_id.to_string(),
            SimVolume {
                vpool,
                owner: owner.to_string(),
                status: VolumeStatus::Running,
                mds_config: config,
                dtl: None,
                dtl_mode: DtlConfigMode::Automatic,
            },
        );
    }

    pub fn volume(&self, volume_id: &str) -> Option<SimVolume> {
        self.lock().volumes.get(volume_id).cloned()
    }

    pub fn set_volume_status(&self, volume_id: &str, status: VolumeStatus) {
        if let Some(volume) = self.lock().volumes.get_mut(volume_id) {
            volume.status = status;
        }
    }

    pub fn set_dtl(&self, volume_id: &str, dtl: Option<DtlConfig>) {
        if let Some(volume) = self.lock().volumes.get_mut(volume_id) {
            volume.dtl = dtl;
        }
    }

    pub fn set_tlogs_behind(&self, ip: &str, port: u16, volume_id: &str, tlogs: u64) {
        if let Ok(ns) = self.lock().namespace_mut(ip, port, volume_id) {
            ns.tlogs_behind = tlogs;
        }
    }

    pub fn namespaces(&self, ip: &str, port: u16) -> Vec<String> {
        self.lock()
            .mds
            .get(&(ip.to_string(), port))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn role(&self, ip: &str, port: u16, volume_id: &str) -> Option<MdsRole> {
        self.lock()
            .mds
            .get(&(ip.to_string(), port))
            .and_then(|m| m.get(volume_id))
            .map(|ns| ns.role)
    }

    pub fn set_catch_up_delay(&self, delay: Duration) {
        self.lock().catch_up_delay = delay;
    }

    pub fn max_concurrent_catch_ups(&self) -> usize {
        self.lock().max_concurrent_catch_ups
    }

    // === Registry and backends ===

    pub fn registry(&self, vpool: VPoolId) -> Option<Vec<ClusterNodeConfig>> {
        self.lock().registries.get(&vpool).cloned()
    }

    pub fn add_backend(&self, backend_id: &str, config: ArakoonConfig, nodes: Vec<AlbaNode>) {
        self.lock()
            .backends
            .insert(backend_id.to_string(), (config, nodes));
    }

    // === Faults and call log ===

    /// Fail the next call of `op` (on `target`, when given)
    pub fn fail_once(&self, op: &str, target: Option<&str>, kind: FaultKind) {
        self.lock().faults.push(Fault {
            op: op.to_string(),
            target: target.map(str::to_string),
            kind,
            remaining: Some(1),
        });
    }

    pub fn fail_always(&self, op: &str, target: Option<&str>, kind: FaultKind) {
        self.lock().faults.push(Fault {
            op: op.to_string(),
            target: target.map(str::to_string),
            kind,
            remaining: None,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls whose entry starts with `prefix`, e.g. `"catch_up 10.0.0.1:26300"`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

struct SimFactory {
    sim: SimCluster,
}

impl ClientFactory for SimFactory {
    fn mds_client(&self, ip: &str, port: u16, _timeout: Duration) -> Result<Arc<dyn MdsClient>> {
        Ok(Arc::new(SimMds {
            sim: self.sim.clone(),
            ip: ip.to_string(),
            port,
        }))
    }

    fn storagerouter_client(
        &self,
        target: &RouterTarget,
        _timeout: Duration,
    ) -> Result<Arc<dyn StorageRouterClient>> {
        Ok(Arc::new(SimRouter {
            sim: self.sim.clone(),
            target: target.clone(),
        }))
    }

    fn backend_client(&self, _backend: &BackendInfo) -> Result<Arc<dyn BackendClient>> {
        Ok(Arc::new(SimBackend {
            sim: self.sim.clone(),
        }))
    }

    fn host_agent(&self, host: &StorageRouter) -> Result<Arc<dyn HostAgent>> {
        Ok(Arc::new(SimAgent {
            sim: self.sim.clone(),
            ip: host.ip.clone(),
        }))
    }
}

struct SimMds {
    sim: SimCluster,
    ip: String,
    port: u16,
}

impl SimMds {
    fn socket(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[async_trait]
impl MdsClient for SimMds {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut state = self.sim.lock();
        state.enter("list_namespaces", &self.socket(), "")?;
        state.host(&self.ip)?;
        Ok(state
            .mds
            .get(&(self.ip.clone(), self.port))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_namespace(&self, volume_id: &str) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("create_namespace", &self.socket(), volume_id)?;
        state.host(&self.ip)?;
        state
            .mds
            .entry((self.ip.clone(), self.port))
            .or_default()
            .entry(volume_id.to_string())
            .or_insert(SimNamespace {
                role: MdsRole::Master,
                tlogs_behind: 0,
            });
        Ok(())
    }

    async fn remove_namespace(&self, volume_id: &str) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("remove_namespace", &self.socket(), volume_id)?;
        state.host(&self.ip)?;
        match state
            .mds
            .get_mut(&(self.ip.clone(), self.port))
            .and_then(|m| m.remove(volume_id))
        {
            Some(_) => Ok(()),
            None => Err(Error::NamespaceNotFound(format!(
                "{} on {}",
                volume_id,
                self.socket()
            ))),
        }
    }

    async fn get_role(&self, volume_id: &str) -> Result<MdsRole> {
        let mut state = self.sim.lock();
        state.enter("get_role", &self.socket(), volume_id)?;
        state.host(&self.ip)?;
        Ok(state.namespace_mut(&self.ip, self.port, volume_id)?.role)
    }

    async fn set_role(&self, volume_id: &str, role: MdsRole) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("set_role", &self.socket(), &format!("{} {:?}", volume_id, role))?;
        state.host(&self.ip)?;
        state.namespace_mut(&self.ip, self.port, volume_id)?.role = role;
        Ok(())
    }

    async fn catch_up(&self, volume_id: &str, dry_run: bool) -> Result<u64> {
        let delay = {
            let mut state = self.sim.lock();
            state.enter(
                "catch_up",
                &self.socket(),
                &format!("{} dry_run={}", volume_id, dry_run),
            )?;
            state.host(&self.ip)?;
            let behind = state.namespace_mut(&self.ip, self.port, volume_id)?.tlogs_behind;
            if dry_run {
                return Ok(behind);
            }
            state.active_catch_ups += 1;
            state.max_concurrent_catch_ups =
                state.max_concurrent_catch_ups.max(state.active_catch_ups);
            state.catch_up_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.sim.lock();
        state.active_catch_ups -= 1;
        state.namespace_mut(&self.ip, self.port, volume_id)?.tlogs_behind = 0;
        Ok(0)
    }
}

struct SimRouter {
    sim: SimCluster,
    target: RouterTarget,
}

#[async_trait]
impl StorageRouterClient for SimRouter {
    async fn info_volume(&self, volume_id: &str) -> Result<VolumeInfo> {
        let mut state = self.sim.lock();
        state.enter("info_volume", &self.target.router_id, volume_id)?;
        state.host(&self.target.ip)?;
        let volume = state.volume_mut(volume_id)?;
        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            live_status: volume.status,
            owner: volume.owner.clone(),
            metadata_backend_config: volume.mds_config.clone(),
        })
    }

    async fn list_volumes(&self, router_id: Option<&str>) -> Result<Vec<String>> {
        let mut state = self.sim.lock();
        state.enter("list_volumes", &self.target.router_id, router_id.unwrap_or(""))?;
        state.host(&self.target.ip)?;
        Ok(state
            .volumes
            .iter()
            .filter(|(_, v)| v.vpool == self.target.vpool)
            .filter(|(_, v)| router_id.map(|r| v.owner == r).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn update_metadata_backend_config(
        &self,
        volume_id: &str,
        config: &[MdsNodeConfig],
        _req_timeout: Duration,
    ) -> Result<()> {
        let mut state = self.sim.lock();
        let rendered: Vec<String> = config.iter().map(|c| c.to_string()).collect();
        state.enter(
            "update_metadata_backend_config",
            &self.target.router_id,
            &format!("{} [{}]", volume_id, rendered.join(",")),
        )?;
        state.host(&self.target.ip)?;
        if config.is_empty() {
            return Err(Error::UpstreamError("empty metadata backend config".into()));
        }
        for node in config {
            let present = state
                .mds
                .get(&(node.ip.clone(), node.port))
                .map(|m| m.contains_key(volume_id))
                .unwrap_or(false);
            if !present {
                return Err(Error::UpstreamError(format!(
                    "no namespace {} on {}",
                    volume_id, node
                )));
            }
        }
        let current = state.volume_mut(volume_id)?.mds_config.clone();
        if let Some(old_master) = current.first() {
            if *old_master != config[0] && config[1..].contains(old_master) {
                return Err(Error::UpstreamError(format!(
                    "master handover to {} cannot keep outgoing master {} in the same update",
                    config[0], old_master
                )));
            }
        }
        state.namespace_mut(&config[0].ip, config[0].port, volume_id)?.role = MdsRole::Master;
        state.volume_mut(volume_id)?.mds_config = config.to_vec();
        Ok(())
    }

    async fn get_node_configs(&self) -> Result<Vec<ClusterNodeConfig>> {
        let mut state = self.sim.lock();
        state.enter("get_node_configs", &self.target.router_id, "")?;
        state.host(&self.target.ip)?;
        Ok(state
            .registries
            .get(&self.target.vpool)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_node_configs(&self, configs: &[ClusterNodeConfig]) -> Result<()> {
        let mut state = self.sim.lock();
        let ids: Vec<&str> = configs.iter().map(|c| c.vrouter_id.as_str()).collect();
        state.enter("set_node_configs", &self.target.router_id, &ids.join(","))?;
        state.host(&self.target.ip)?;
        state.registries.insert(self.target.vpool, configs.to_vec());
        Ok(())
    }

    async fn erase_node_configs(&self) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("erase_node_configs", &self.target.router_id, "")?;
        state.host(&self.target.ip)?;
        state.registries.remove(&self.target.vpool);
        Ok(())
    }

    async fn update_cluster_node_configs(&self, router_id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("update_cluster_node_configs", router_id, "")?;
        state.host(&self.target.ip)?;
        Ok(())
    }

    async fn set_manual_dtl_config(
        &self,
        volume_id: &str,
        config: Option<&DtlConfig>,
    ) -> Result<()> {
        let mut state = self.sim.lock();
        let detail = match config {
            Some(c) => format!("{} {}:{} {}", volume_id, c.host, c.port, c.mode),
            None => format!("{} none", volume_id),
        };
        state.enter("set_manual_dtl_config", &self.target.router_id, &detail)?;
        state.host(&self.target.ip)?;
        let volume = state.volume_mut(volume_id)?;
        volume.dtl = config.cloned();
        volume.dtl_mode = DtlConfigMode::Manual;
        Ok(())
    }

    async fn get_dtl_config(&self, volume_id: &str) -> Result<Option<DtlConfig>> {
        let mut state = self.sim.lock();
        state.enter("get_dtl_config", &self.target.router_id, volume_id)?;
        state.host(&self.target.ip)?;
        Ok(state.volume_mut(volume_id)?.dtl.clone())
    }

    async fn get_dtl_config_mode(&self, volume_id: &str) -> Result<DtlConfigMode> {
        let mut state = self.sim.lock();
        state.enter("get_dtl_config_mode", &self.target.router_id, volume_id)?;
        state.host(&self.target.ip)?;
        Ok(state.volume_mut(volume_id)?.dtl_mode)
    }

    async fn destroy_filesystem(&self) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("destroy_filesystem", &self.target.router_id, "")?;
        state.host(&self.target.ip)?;
        let vpool = self.target.vpool;
        state.volumes.retain(|_, v| v.vpool != vpool);
        Ok(())
    }
}

struct SimBackend {
    sim: SimCluster,
}

#[async_trait]
impl BackendClient for SimBackend {
    async fn get_arakoon_config(&self, backend_id: &str) -> Result<ArakoonConfig> {
        let mut state = self.sim.lock();
        state.enter("get_arakoon_config", backend_id, "")?;
        state
            .backends
            .get(backend_id)
            .map(|(config, _)| config.clone())
            .ok_or_else(|| Error::NotFound(format!("backend {}", backend_id)))
    }

    async fn list_alba_nodes(&self, backend_id: &str) -> Result<Vec<AlbaNode>> {
        let mut state = self.sim.lock();
        state.enter("list_alba_nodes", backend_id, "")?;
        state
            .backends
            .get(backend_id)
            .map(|(_, nodes)| nodes.clone())
            .ok_or_else(|| Error::NotFound(format!("backend {}", backend_id)))
    }
}

struct SimAgent {
    sim: SimCluster,
    ip: String,
}

#[async_trait]
impl HostAgent for SimAgent {
    async fn ping(&self) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("ping", &self.ip, "")?;
        state.host(&self.ip)?;
        Ok(())
    }

    async fn create_dirs(&self, paths: &[String]) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("create_dirs", &self.ip, &paths.join(","))?;
        state.host_mut(&self.ip)?.dirs.extend(paths.iter().cloned());
        Ok(())
    }

    async fn remove_dirs(&self, paths: &[String]) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("remove_dirs", &self.ip, &paths.join(","))?;
        let host = state.host_mut(&self.ip)?;
        host.dirs.retain(|d| {
            !paths
                .iter()
                .any(|p| d == p || d.starts_with(&format!("{}/", p)))
        });
        Ok(())
    }

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        let mut state = self.sim.lock();
        state.enter("dir_exists", &self.ip, path)?;
        Ok(state.host(&self.ip)?.dirs.contains(path))
    }

    async fn available_space(&self, path: &str) -> Result<u64> {
        let mut state = self.sim.lock();
        state.enter("available_space", &self.ip, path)?;
        Ok(state
            .host(&self.ip)?
            .free_space
            .get(path)
            .copied()
            .unwrap_or(DEFAULT_FREE_SPACE))
    }

    async fn add_service(&self, name: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("add_service", &self.ip, name)?;
        state.host_mut(&self.ip)?.services.insert(
            name.to_string(),
            SimService {
                params: params.clone(),
                identity: None,
                starts: 0,
            },
        );
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("start_service", &self.ip, name)?;
        state.host(&self.ip)?;
        let identity = state.new_identity();
        let service = state
            .host_mut(&self.ip)?
            .services
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("service {}", name)))?;
        if service.identity.is_none() {
            service.identity = Some(identity);
            service.starts += 1;
        }
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("stop_service", &self.ip, name)?;
        let service = state
            .host_mut(&self.ip)?
            .services
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("service {}", name)))?;
        service.identity = None;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        let mut state = self.sim.lock();
        state.enter("remove_service", &self.ip, name)?;
        state.host_mut(&self.ip)?.services.remove(name);
        Ok(())
    }

    async fn has_service(&self, name: &str) -> Result<bool> {
        let mut state = self.sim.lock();
        state.enter("has_service", &self.ip, name)?;
        Ok(state.host(&self.ip)?.services.contains_key(name))
    }

    async fn service_identity(&self, name: &str) -> Result<Option<ProcessIdentity>> {
        let mut state = self.sim.lock();
        state.enter("service_identity", &self.ip, name)?;
        Ok(state
            .host(&self.ip)?
            .services
            .get(name)
            .and_then(|s| s.identity))
    }

    async fn worker_identity(&self) -> Result<ProcessIdentity> {
        let mut state = self.sim.lock();
        state.enter("worker_identity", &self.ip, "")?;
        Ok(state.host(&self.ip)?.worker)
    }

    async fn startup_counter(&self, name: &str) -> Result<u64> {
        let mut state = self.sim.lock();
        state.enter("startup_counter", &self.ip, name)?;
        state
            .host(&self.ip)?
            .services
            .get(name)
            .map(|s| s.starts)
            .ok_or_else(|| Error::NotFound(format!("service {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(sim: &SimCluster, vpool: VPoolId, ip: &str) -> Arc<dyn StorageRouterClient> {
        sim.factory()
            .storagerouter_client(
                &RouterTarget {
                    vpool,
                    vpool_name: "pool".into(),
                    router_id: format!("pool{}", ip),
                    ip: ip.into(),
                    port: 26201,
                },
                Duration::from_secs(1),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_push_requires_namespaces() {
        let sim = SimCluster::new();
        sim.add_host("10.0.0.1");
        let vpool = VPoolId::new();
        let a = MdsNodeConfig::new("10.0.0.1", 26300);
        let b = MdsNodeConfig::new("10.0.0.1", 26301);
        sim.add_volume(vpool, "vol1", "r1", vec![a.clone()]);

        let client = router(&sim, vpool, "10.0.0.1");
        let res = client
            .update_metadata_backend_config("vol1", &[a.clone(), b.clone()], Duration::from_secs(1))
            .await;
        assert!(matches!(res, Err(Error::UpstreamError(_))));

        let mds = sim.factory().mds_client("10.0.0.1", 26301, Duration::from_secs(1)).unwrap();
        mds.create_namespace("vol1").await.unwrap();
        client
            .update_metadata_backend_config("vol1", &[a.clone(), b.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sim.volume("vol1").unwrap().mds_config, vec![a, b]);
    }

    #[tokio::test]
    async fn test_handover_cannot_keep_outgoing_master() {
        let sim = SimCluster::new();
        sim.add_host("10.0.0.1");
        let vpool = VPoolId::new();
        let a = MdsNodeConfig::new("10.0.0.1", 26300);
        let b = MdsNodeConfig::new("10.0.0.1", 26301);
        sim.add_volume(vpool, "vol1", "r1", vec![a.clone(), b.clone()]);

        let client = router(&sim, vpool, "10.0.0.1");
        let swapped = [b.clone(), a.clone()];
        assert!(client
            .update_metadata_backend_config("vol1", &swapped, Duration::from_secs(1))
            .await
            .is_err());
        client
            .update_metadata_backend_config("vol1", &[b.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        client
            .update_metadata_backend_config("vol1", &swapped, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sim.role("10.0.0.1", 26301, "vol1"), Some(MdsRole::Master));
    }

    #[tokio::test]
    async fn test_one_shot_fault() {
        let sim = SimCluster::new();
        sim.add_host("10.0.0.1");
        sim.fail_once("ping", Some("10.0.0.1"), FaultKind::Unreachable);
        let host = StorageRouter {
            id: crate::dal::StorageRouterId::new(),
            name: "n1".into(),
            ip: "10.0.0.1".into(),
            machine_id: "m1".into(),
            node_type: crate::dal::NodeType::Master,
        };
        let agent = sim.factory().host_agent(&host).unwrap();
        assert!(agent.ping().await.is_err());
        assert!(agent.ping().await.is_ok());
        assert_eq!(sim.calls_matching("ping 10.0.0.1").len(), 2);
    }
}
