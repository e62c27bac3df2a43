//! Adding and removing StorageDrivers
//!
//! `add_vpool` creates a vPool or extends it to one more host. Every side
//! effect is recorded in a [`Ledger`] so a failure halfway can be undone:
//! the vPool goes to FAILURE, the new rows, directories, services and CCS
//! keys are removed, and the cluster registry is rewritten without the new
//! StorageDriver. `remove_storagedriver` is the reverse and keeps going when
//! a step fails, reporting `errors_found` instead.

use crate::ccs::arakoon::ArakoonNode;
use crate::ccs::{keys, ArakoonConfig, Configuration};
use crate::clients::{volumedriver_service, ClusterNodeConfig, HostAgent};
use crate::common::{format_bytes, Cancellation, Result};
use crate::dal::{
    AlbaProxy, AlbaProxyId, MdsServiceId, NodeType, Service, ServiceId, ServiceType,
    StorageDriver, StorageDriverId, StorageRouter, StorageRouterId, Tables, VPool, VPoolId,
    VPoolStatus,
};
use crate::dtl::{dtl_checkup, DtlScope};
use crate::locality::node_distance;
use crate::mds::safety::ensure_safety_while_shrinking;
use crate::mds::{prepare_mds_service, remove_mds_service, MdsConfig};
use crate::vpool::params::VPoolParameters;
use crate::vpool::partitions::plan_partitions;
use crate::vpool::ports::{allocate_storagedriver_ports, AllocatedPorts};
use crate::vpool::{proxy, sdconfig};
use crate::Context;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const WATCHER_SERVICE: &str = "ovs-watcher-volumedriver";
const METADATA_STORE_BITS: u8 = 5;
const AMQP_PORT: u16 = 5672;

pub fn dtl_service(vpool_name: &str) -> String {
    format!("ovs-dtl_{}", vpool_name)
}

pub fn proxy_service(vpool_name: &str, number: usize) -> String {
    format!("ovs-albaproxy_{}_{}", vpool_name, number)
}

/// Volume router id of the StorageDriver of a vPool on a host
pub fn storagedriver_id(vpool_name: &str, machine_id: &str) -> String {
    format!("{}{}", vpool_name, machine_id)
}

#[derive(Debug, Clone)]
pub struct AddVPoolReport {
    pub vpool: VPoolId,
    pub storagedriver: StorageDriverId,
    pub created_vpool: bool,
    pub mds_service: MdsServiceId,
}

#[derive(Debug, Default)]
pub struct RemovalReport {
    pub errors_found: bool,
    pub errors: Vec<String>,
    pub vpool_removed: bool,
}

impl RemovalReport {
    fn step<T>(&mut self, what: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("{} failed: {}", what, e);
                self.errors_found = true;
                self.errors.push(format!("{}: {}", what, e));
                None
            }
        }
    }
}

/// Side effects of an add/extend, in the order they happened
#[derive(Debug, Default)]
struct Ledger {
    created_vpool: bool,
    dirs: Vec<String>,
    services: Vec<String>,
    watcher_added: bool,
    registry_touched: bool,
    mds_service: Option<MdsServiceId>,
}

/// Arakoon cluster backing the volume registry and the lock store
struct VoldrvCluster {
    cluster_id: String,
    nodes: Vec<ArakoonNode>,
}

impl VoldrvCluster {
    fn load(ccs: &Configuration) -> Result<Self> {
        let cluster_id: String = ccs.get(keys::ARAKOON_VOLDRV)?.ok_or_else(|| {
            crate::Error::PreconditionFailed("no voldrv Arakoon cluster is configured".into())
        })?;
        let config = ArakoonConfig::load_cluster(ccs, &cluster_id)?.ok_or_else(|| {
            crate::Error::PreconditionFailed(format!(
                "Arakoon cluster {} has no configuration",
                cluster_id
            ))
        })?;
        Ok(Self {
            nodes: config.nodes(),
            cluster_id,
        })
    }
}

/// Volume router cluster entry of a StorageDriver, derived from the DAL
pub fn compute_cluster_node_config(
    tables: &Tables,
    storagedriver: StorageDriverId,
) -> Result<ClusterNodeConfig> {
    let sd = tables.storagedriver(storagedriver)?;
    let node_distance_map = tables
        .storagedrivers_of_vpool(sd.vpool)
        .into_iter()
        .filter(|other| other.id != sd.id)
        .map(|other| {
            (
                other.storagedriver_id.clone(),
                node_distance(tables, sd.storagerouter, other.storagerouter),
            )
        })
        .collect();
    Ok(ClusterNodeConfig {
        vrouter_id: sd.storagedriver_id.clone(),
        host: sd.storage_ip.clone(),
        message_port: sd.ports.management,
        xmlrpc_host: sd.cluster_ip.clone(),
        xmlrpc_port: sd.ports.xmlrpc,
        failovercache_host: sd.storage_ip.clone(),
        failovercache_port: sd.ports.dtl,
        network_server_uri: format!("tcp://{}:{}", sd.storage_ip, sd.ports.edge),
        node_distance_map,
    })
}

/// Push the registry of a vPool built from its StorageDrivers minus
/// `exclude`, then make every live router except `skip_reload` re-read it.
async fn update_registry(
    ctx: &Context,
    vpool: VPoolId,
    exclude: Option<StorageDriverId>,
    skip_reload: Option<StorageDriverId>,
) -> Result<()> {
    let tables = ctx.dal.snapshot();
    let members: Vec<&StorageDriver> = tables
        .storagedrivers_of_vpool(vpool)
        .into_iter()
        .filter(|sd| Some(sd.id) != exclude)
        .collect();
    let configs = members
        .iter()
        .map(|sd| compute_cluster_node_config(&tables, sd.id))
        .collect::<Result<Vec<_>>>()?;
    let via = members
        .iter()
        .find(|sd| Some(sd.id) != skip_reload)
        .or_else(|| members.first())
        .ok_or_else(|| {
            crate::Error::PreconditionFailed(format!("vPool {} has no StorageDrivers", vpool))
        })?;
    let timeout = MdsConfig::load(&ctx.ccs, vpool)?.sr_timeout();
    ctx.router_for_storagedriver(&tables, via, timeout)?
        .set_node_configs(&configs)
        .await?;

    for sd in members.iter().filter(|sd| Some(sd.id) != skip_reload) {
        ctx.router_for_storagedriver(&tables, sd, timeout)?
            .update_cluster_node_configs(&sd.storagedriver_id, ctx.tunables.registry_update_timeout)
            .await?;
    }
    tracing::info!(vpool = %vpool, members = configs.len(), "Cluster registry updated");
    Ok(())
}

fn set_status(ctx: &Context, vpool: VPoolId, status: VPoolStatus) -> Result<()> {
    ctx.dal.write(|t| {
        t.vpool_mut(vpool)?.status = status;
        Ok(())
    })
}

/// Create the vPool (or flag it extending) and the StorageDriver with its
/// proxies, in one DAL transaction
fn register_rows(
    ctx: &Context,
    params: &VPoolParameters,
    host: &StorageRouter,
    existing: Option<&VPool>,
    ports: &AllocatedPorts,
) -> Result<StorageDriver> {
    ctx.dal.write(|t| {
        let vpool = match existing {
            Some(vpool) => {
                let row = t.vpool_mut(vpool.id)?;
                row.status = VPoolStatus::Extending;
                row.caching_info.insert(host.id, params.caching.clone());
                vpool.id
            }
            None => {
                if t.vpool_by_name(&params.vpool_name).is_some() {
                    return Err(crate::Error::PreconditionFailed(format!(
                        "vPool {} already exists",
                        params.vpool_name
                    )));
                }
                let vpool = VPool {
                    id: VPoolId::new(),
                    name: params.vpool_name.clone(),
                    status: VPoolStatus::Installing,
                    metadata_store_bits: METADATA_STORE_BITS,
                    backend: params.backend.clone(),
                    caching_info: [(host.id, params.caching.clone())].into_iter().collect(),
                    configuration: params.configuration(),
                };
                let id = vpool.id;
                t.vpools.insert(id, vpool);
                id
            }
        };

        let sd = StorageDriver {
            id: StorageDriverId::new(),
            vpool,
            storagerouter: host.id,
            storagedriver_id: storagedriver_id(&params.vpool_name, &host.machine_id),
            cluster_ip: host.ip.clone(),
            storage_ip: params.storage_ip.clone(),
            ports: ports.storagedriver,
            mountpoint: format!("/mnt/{}", params.vpool_name),
        };
        t.storagedrivers.insert(sd.id, sd.clone());
        for (number, port) in ports.proxies.iter().enumerate() {
            let service = Service {
                id: ServiceId::new(),
                name: format!("albaproxy_{}_{}", params.vpool_name, number),
                service_type: ServiceType::AlbaProxy,
                storagerouter: host.id,
                ports: vec![*port],
            };
            let proxy = AlbaProxy {
                id: AlbaProxyId::new(),
                storagedriver: sd.id,
                service: service.id,
            };
            t.services.insert(service.id, service);
            t.alba_proxies.insert(proxy.id, proxy);
        }
        Ok(sd)
    })
}

/// Proxies of a StorageDriver with their port, ordered by port
fn proxies_of(tables: &Tables, storagedriver: StorageDriverId) -> Vec<(AlbaProxy, u16)> {
    let mut proxies: Vec<(AlbaProxy, u16)> = tables
        .alba_proxies_of(storagedriver)
        .into_iter()
        .filter_map(|p| {
            let port = tables.service(p.service).ok()?.ports.first().copied()?;
            Some((p.clone(), port))
        })
        .collect();
    proxies.sort_by_key(|(_, port)| *port);
    proxies
}

fn amqp_settings(ctx: &Context, tables: &Tables) -> Result<(Vec<String>, String)> {
    let user: String = ctx
        .ccs
        .get_or(&format!("{}|user", keys::MESSAGEQUEUE), "ovs".to_string())?;
    let password: String = ctx
        .ccs
        .get_or(&format!("{}|password", keys::MESSAGEQUEUE), "ovs".to_string())?;
    let protocol: String = ctx
        .ccs
        .get_or(&format!("{}|protocol", keys::MESSAGEQUEUE), "amqp".to_string())?;
    let routing_key: String = ctx.ccs.get_or(
        &format!("{}|queues.storagedriver", keys::MESSAGEQUEUE),
        "volumerouter".to_string(),
    )?;
    let uris = tables
        .storagerouters
        .values()
        .filter(|sr| sr.node_type == NodeType::Master)
        .map(|sr| format!("{}://{}:{}@{}:{}", protocol, user, password, sr.ip, AMQP_PORT))
        .collect();
    Ok((uris, routing_key))
}

fn params_map(entries: &[(&str, String)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Start the volume router and wait for its startup counter to move
async fn start_volumedriver(ctx: &Context, agent: &Arc<dyn HostAgent>, name: &str) -> Result<()> {
    let before = agent.startup_counter(name).await?;
    agent.start_service(name).await?;
    for _ in 0..ctx.tunables.startup_poll_attempts {
        if agent.startup_counter(name).await? > before {
            return Ok(());
        }
        tokio::time::sleep(ctx.tunables.startup_poll_interval).await;
    }
    Err(crate::Error::UpstreamTimeout(format!(
        "{} did not report a startup",
        name
    )))
}

/// Everything after the DAL rows exist; failures here are rolled back
#[allow(clippy::too_many_arguments)]
async fn deploy(
    ctx: &Context,
    params: &VPoolParameters,
    host: &StorageRouter,
    sd: &StorageDriver,
    alba_nodes: &[crate::clients::AlbaNode],
    voldrv: &VoldrvCluster,
    ledger: &mut Ledger,
) -> Result<MdsServiceId> {
    let agent = ctx.clients.agent(host)?;
    let tables = ctx.dal.snapshot();
    let vpool = tables.vpool(sd.vpool)?.clone();

    let disks = tables.disk_partitions_of(host.id);
    let mut free = BTreeMap::new();
    for disk in &disks {
        free.insert(
            disk.mountpoint.clone(),
            agent.available_space(&disk.mountpoint).await?,
        );
    }
    let local_cache = params.caching.uses_local_cache();
    let plan = plan_partitions(
        &disks,
        &free,
        sd.id,
        &vpool.name,
        params.proxies,
        local_cache,
    )?;
    for (path, size) in &plan.sco_mount_points {
        tracing::info!(vpool = %vpool.name, storagerouter = %host.name, "SCO cache {} of {}", path, format_bytes(*size));
    }
    ctx.dal.write(|t| {
        for partition in &plan.partitions {
            t.storagedriver_partitions
                .insert(partition.id, partition.clone());
        }
        Ok(())
    })?;
    let mut dirs = vec![sd.mountpoint.clone()];
    dirs.extend(plan.dirs());
    ledger.dirs = dirs.clone();
    agent.create_dirs(&dirs).await?;

    if ledger.created_vpool {
        params
            .mds_config
            .clone()
            .unwrap_or_default()
            .save(&ctx.ccs, vpool.id)?;
    }

    let tables = ctx.dal.snapshot();
    let preference = proxy::read_preference(&tables, host, alba_nodes);
    let proxies = proxies_of(&tables, sd.id);
    for (number, (alba_proxy, port)) in proxies.iter().enumerate() {
        let fcache = plan.fcache_paths.get(number);
        let block_path = fcache.map(|(path, size)| (format!("{}/blocks", path), *size));
        let main = proxy::main_config(&proxy::ProxySpec {
            vpool: vpool.id,
            backend: &vpool.backend,
            storage_ip: &sd.storage_ip,
            port: *port,
            read_preference: preference.clone(),
            fragment_cache: proxy::cache_config(
                &params.caching.fragment_cache,
                vpool.id,
                fcache.map(|(path, size)| (path.as_str(), *size)),
            ),
            block_cache: proxy::cache_config(
                &params.caching.block_cache,
                vpool.id,
                block_path.as_ref().map(|(path, size)| (path.as_str(), *size)),
            ),
        });
        proxy::save_main_config(&ctx.ccs, vpool.id, alba_proxy.id, &main)?;
        if !ctx.ccs.exists(&keys::scrub_proxy(vpool.id))? {
            proxy::save_scrub_config(&ctx.ccs, vpool.id, &proxy::scrub_config(&main))?;
        }
    }

    let (amqp_uris, routing_key) = amqp_settings(ctx, &tables)?;
    let proxy_ports: Vec<u16> = proxies.iter().map(|(_, port)| *port).collect();
    let sections = sdconfig::build_sections(&sdconfig::SectionInputs {
        vpool_name: &vpool.name,
        storagedriver: sd,
        configuration: &vpool.configuration,
        write_buffer: params.write_buffer(),
        plan: &plan,
        proxy_ports: &proxy_ports,
        backend_preset: &vpool.backend.preset,
        voldrv_cluster_id: &voldrv.cluster_id,
        voldrv_nodes: &voldrv.nodes,
        amqp_uris: &amqp_uris,
        amqp_routing_key: &routing_key,
    });
    sdconfig::write_sections(&ctx.ccs, vpool.id, &sd.storagedriver_id, &sections)?;

    if !ledger.created_vpool {
        ledger.registry_touched = true;
        update_registry(ctx, vpool.id, None, Some(sd.id)).await?;
    }

    if !agent.has_service(WATCHER_SERVICE).await? {
        agent.add_service(WATCHER_SERVICE, &BTreeMap::new()).await?;
        ledger.watcher_added = true;
        agent.start_service(WATCHER_SERVICE).await?;
    }
    let config_url =
        Configuration::configuration_url(&keys::storagedriver_root(vpool.id, &sd.storagedriver_id));
    let dtl = dtl_service(&vpool.name);
    agent
        .add_service(
            &dtl,
            &params_map(&[
                ("VPOOL_NAME", vpool.name.clone()),
                ("DTL_PATH", plan.dtl_path.clone()),
                ("DTL_ADDRESS", sd.storage_ip.clone()),
                ("DTL_PORT", sd.ports.dtl.to_string()),
                ("DTL_TRANSPORT", vpool.configuration.dtl_transport.to_string()),
            ]),
        )
        .await?;
    ledger.services.push(dtl.clone());
    for (number, (alba_proxy, _)) in proxies.iter().enumerate() {
        let name = proxy_service(&vpool.name, number);
        agent
            .add_service(
                &name,
                &params_map(&[
                    ("VPOOL_NAME", vpool.name.clone()),
                    ("PROXY_ID", alba_proxy.id.to_string()),
                    (
                        "CONFIG_PATH",
                        Configuration::configuration_url(&keys::proxy_main(vpool.id, alba_proxy.id)),
                    ),
                ]),
            )
            .await?;
        ledger.services.push(name);
    }
    let voldrv_name = volumedriver_service(&vpool.name);
    agent
        .add_service(
            &voldrv_name,
            &params_map(&[
                ("VPOOL_NAME", vpool.name.clone()),
                ("VPOOL_MOUNTPOINT", sd.mountpoint.clone()),
                ("CONFIG_PATH", config_url),
            ]),
        )
        .await?;
    ledger.services.push(voldrv_name.clone());

    agent.start_service(&dtl).await?;
    for number in 0..proxies.len() {
        agent.start_service(&proxy_service(&vpool.name, number)).await?;
    }
    start_volumedriver(ctx, &agent, &voldrv_name).await?;

    if ledger.created_vpool {
        ledger.registry_touched = true;
        update_registry(ctx, vpool.id, None, None).await?;
    }

    let mds = prepare_mds_service(ctx, host.id, vpool.id, None).await?;
    ledger.mds_service = Some(mds);
    Ok(mds)
}

/// Undo a failed add/extend. Every step is attempted; failures are logged.
async fn rollback(ctx: &Context, host: &StorageRouter, sd: &StorageDriver, ledger: &Ledger) {
    let vpool = sd.vpool;
    tracing::error!(vpool = %vpool, storagerouter = %host.name, "Rolling back StorageDriver {}", sd.storagedriver_id);
    if let Err(e) = set_status(ctx, vpool, VPoolStatus::Failure) {
        tracing::error!("Could not flag vPool {} as failed: {}", vpool, e);
    }

    if let Some(mds) = ledger.mds_service {
        if let Err(e) = remove_mds_service(ctx, mds).await {
            tracing::warn!("Rollback: removing MDS service failed: {}", e);
        }
    }

    match ctx.clients.agent(host) {
        Ok(agent) => {
            for name in ledger.services.iter().rev() {
                if let Err(e) = agent.stop_service(name).await {
                    tracing::warn!("Rollback: stopping {} failed: {}", name, e);
                }
                if let Err(e) = agent.remove_service(name).await {
                    tracing::warn!("Rollback: removing {} failed: {}", name, e);
                }
            }
            let others_on_host = ctx.dal.read(|t| {
                t.storagedrivers_on(host.id)
                    .iter()
                    .any(|other| other.id != sd.id)
            });
            if ledger.watcher_added && !others_on_host {
                if let Err(e) = agent.stop_service(WATCHER_SERVICE).await {
                    tracing::warn!("Rollback: stopping watcher failed: {}", e);
                }
                if let Err(e) = agent.remove_service(WATCHER_SERVICE).await {
                    tracing::warn!("Rollback: removing watcher failed: {}", e);
                }
            }
            if !ledger.dirs.is_empty() {
                if let Err(e) = agent.remove_dirs(&ledger.dirs).await {
                    tracing::warn!("Rollback: removing directories failed: {}", e);
                }
            }
        }
        Err(e) => tracing::warn!("Rollback: no agent on {}: {}", host.name, e),
    }

    let tables = ctx.dal.snapshot();
    let remaining = tables
        .storagedrivers_of_vpool(vpool)
        .iter()
        .any(|other| other.id != sd.id);
    if ledger.registry_touched {
        let reverted = if remaining {
            update_registry(ctx, vpool, Some(sd.id), None).await
        } else {
            let timeout = MdsConfig::load(&ctx.ccs, vpool)
                .map(|c| c.sr_timeout())
                .unwrap_or_default();
            match ctx.router_for_storagedriver(&tables, sd, timeout) {
                Ok(router) => router.erase_node_configs().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = reverted {
            tracing::error!("Rollback: restoring the cluster registry failed: {}", e);
        }
    }

    for (alba_proxy, _) in proxies_of(&tables, sd.id) {
        if let Err(e) = ctx.ccs.delete(&keys::proxy_root(vpool, alba_proxy.id), true) {
            tracing::warn!("Rollback: removing proxy config failed: {}", e);
        }
    }
    if let Err(e) = ctx
        .ccs
        .delete(&keys::storagedriver_root(vpool, &sd.storagedriver_id), true)
    {
        tracing::warn!("Rollback: removing StorageDriver config failed: {}", e);
    }

    let removed = ctx.dal.write(|t| {
        remove_storagedriver_rows(t, sd);
        if t.storagedrivers_of_vpool(vpool).is_empty() {
            t.vpools.remove(&vpool);
            Ok(true)
        } else {
            t.vpool_mut(vpool)?.status = VPoolStatus::Running;
            Ok(false)
        }
    });
    match removed {
        Ok(true) => {
            if let Err(e) = ctx.ccs.delete(&keys::vpool_root(vpool), true) {
                tracing::warn!("Rollback: removing vPool config failed: {}", e);
            }
        }
        Ok(false) => {}
        Err(e) => tracing::error!("Rollback: cleaning the DAL failed: {}", e),
    }
}

/// DAL rows owned by a StorageDriver: partitions, proxies and the driver
fn remove_storagedriver_rows(t: &mut Tables, sd: &StorageDriver) {
    let partitions: Vec<_> = t
        .storagedriver_partitions_of(sd.id)
        .iter()
        .filter(|p| p.mds_service.is_none())
        .map(|p| p.id)
        .collect();
    for id in partitions {
        t.storagedriver_partitions.remove(&id);
    }
    let proxies: Vec<(AlbaProxyId, ServiceId)> = t
        .alba_proxies_of(sd.id)
        .iter()
        .map(|p| (p.id, p.service))
        .collect();
    for (proxy, service) in proxies {
        t.alba_proxies.remove(&proxy);
        t.services.remove(&service);
    }
    t.storagedrivers.remove(&sd.id);
    if let Some(vpool) = t.vpools.get_mut(&sd.vpool) {
        vpool.caching_info.remove(&sd.storagerouter);
    }
}

/// Create a vPool or extend it to the host at `params.storagerouter_ip`
pub async fn add_vpool(ctx: &Context, params: &VPoolParameters) -> Result<AddVPoolReport> {
    let tables = ctx.dal.snapshot();
    let host = tables
        .storagerouter_by_ip(&params.storagerouter_ip)
        .cloned()
        .ok_or_else(|| {
            crate::Error::NotFound(format!("StorageRouter with ip {}", params.storagerouter_ip))
        })?;
    let existing = tables.vpool_by_name(&params.vpool_name).cloned();
    params.validate(existing.as_ref())?;
    if let Some(vpool) = &existing {
        if vpool.status != VPoolStatus::Running {
            return Err(crate::Error::PreconditionFailed(format!(
                "vPool {} is {:?}",
                vpool.name, vpool.status
            )));
        }
        if tables.storagedriver_for(vpool.id, host.id).is_some() {
            return Err(crate::Error::PreconditionFailed(format!(
                "vPool {} already has a StorageDriver on {}",
                vpool.name, host.name
            )));
        }
    }
    if !ctx.clients.is_reachable(&host).await {
        return Err(crate::Error::Unreachable(format!("host {}", host.name)));
    }

    let voldrv = VoldrvCluster::load(&ctx.ccs)?;
    let backend = ctx.clients.backend(&params.backend)?;
    backend
        .get_arakoon_config(&params.backend.backend_id)
        .await?
        .save(&ctx.ccs, &params.backend.backend_id)?;
    for cache in [&params.caching.fragment_cache, &params.caching.block_cache] {
        if let Some(cache_backend) = &cache.backend {
            ctx.clients
                .backend(cache_backend)?
                .get_arakoon_config(&cache_backend.backend_id)
                .await?
                .save(&ctx.ccs, &cache_backend.backend_id)?;
        }
    }
    let alba_nodes = backend.list_alba_nodes(&params.backend.backend_id).await?;

    let (ports, guard) = allocate_storagedriver_ports(ctx, &host, params.proxies).await?;
    let sd = register_rows(ctx, params, &host, existing.as_ref(), &ports)?;
    drop(guard);
    tracing::info!(
        vpool = %params.vpool_name,
        storagerouter = %host.name,
        "Adding StorageDriver {}",
        sd.storagedriver_id
    );

    let mut ledger = Ledger {
        created_vpool: existing.is_none(),
        ..Ledger::default()
    };
    let mds_service = match deploy(ctx, params, &host, &sd, &alba_nodes, &voldrv, &mut ledger).await
    {
        Ok(mds) => mds,
        Err(e) => {
            tracing::error!(vpool = %params.vpool_name, "Adding StorageDriver failed: {}", e);
            rollback(ctx, &host, &sd, &ledger).await;
            return Err(e);
        }
    };
    set_status(ctx, sd.vpool, VPoolStatus::Running)?;

    let cancel = Cancellation::new();
    if let Err(e) = crate::ops::mds_checkup(ctx, Some(sd.vpool), &cancel).await {
        tracing::error!(vpool = %params.vpool_name, "MDS checkup after extension failed: {}", e);
    }
    if let Err(e) = dtl_checkup(ctx, DtlScope::VPool(sd.vpool), &cancel).await {
        tracing::error!(vpool = %params.vpool_name, "DTL checkup after extension failed: {}", e);
    }

    Ok(AddVPoolReport {
        vpool: sd.vpool,
        storagedriver: sd.id,
        created_vpool: ledger.created_vpool,
        mds_service,
    })
}

/// Remove a StorageDriver, and its vPool when it is the last one
pub async fn remove_storagedriver(
    ctx: &Context,
    storagedriver: StorageDriverId,
) -> Result<RemovalReport> {
    let tables = ctx.dal.snapshot();
    let sd = tables.storagedriver(storagedriver)?.clone();
    let vpool = tables.vpool(sd.vpool)?.clone();
    let host = tables.storagerouter(sd.storagerouter)?.clone();
    let last = tables.storagedrivers_of_vpool(vpool.id).len() == 1;
    let vdisks = tables.vdisks_of_vpool(vpool.id);
    if vdisks.iter().any(|v| v.storagerouter == Some(host.id)) {
        return Err(crate::Error::PreconditionFailed(format!(
            "vDisks of vPool {} still live on {}",
            vpool.name, host.name
        )));
    }
    if last && !vdisks.is_empty() {
        return Err(crate::Error::PreconditionFailed(format!(
            "vPool {} still has {} vDisks",
            vpool.name,
            vdisks.len()
        )));
    }
    let status = if last {
        VPoolStatus::Deleting
    } else {
        VPoolStatus::Shrinking
    };
    set_status(ctx, vpool.id, status)?;
    tracing::info!(vpool = %vpool.name, storagerouter = %host.name, last, "Removing StorageDriver {}", sd.storagedriver_id);

    let mut report = RemovalReport::default();
    let local_mds: Vec<MdsServiceId> = tables
        .mds_services_on(vpool.id, host.id)
        .iter()
        .map(|m| m.id)
        .collect();
    if !last {
        let excluded: BTreeSet<StorageRouterId> = [host.id].into_iter().collect();
        let affected: BTreeSet<_> = tables
            .mds_service_vdisks
            .values()
            .filter(|j| local_mds.contains(&j.mds_service))
            .map(|j| j.vdisk)
            .collect();
        for vdisk in affected {
            report.step(
                &format!("moving MDS of vDisk {} away", vdisk),
                ensure_safety_while_shrinking(ctx, vdisk, &excluded).await,
            );
        }
    }
    for mds in local_mds {
        report.step("removing MDS service", remove_mds_service(ctx, mds).await);
    }
    if !last {
        report.step(
            "updating the cluster registry",
            update_registry(ctx, vpool.id, Some(sd.id), None).await,
        );
    }

    let agent = report.step("connecting to the host agent", ctx.clients.agent(&host));
    let voldrv_name = volumedriver_service(&vpool.name);
    let dtl = dtl_service(&vpool.name);
    let proxy_count = tables.alba_proxies_of(sd.id).len();
    if let Some(agent) = &agent {
        report.step("stopping the volume router", agent.stop_service(&voldrv_name).await);
        report.step("stopping the DTL", agent.stop_service(&dtl).await);
    }

    if last {
        if let Some(agent) = &agent {
            for number in 0..proxy_count {
                report.step(
                    "starting a proxy",
                    agent.start_service(&proxy_service(&vpool.name, number)).await,
                );
            }
        }
        let timeout = MdsConfig::load(&ctx.ccs, vpool.id)
            .map(|c| c.sr_timeout())
            .unwrap_or_default();
        if let Some(router) = report.step(
            "connecting to the volume router",
            ctx.router_for_storagedriver(&tables, &sd, timeout),
        ) {
            match router.destroy_filesystem().await {
                Err(crate::Error::MasterLookupFailed(e)) => tracing::warn!(
                    vpool = %vpool.name,
                    "Backend already gone while destroying the filesystem: {}",
                    e
                ),
                other => {
                    report.step("destroying the filesystem", other);
                }
            }
            report.step(
                "erasing the cluster registry",
                router.erase_node_configs().await,
            );
        }
    }

    if let Some(agent) = &agent {
        for number in 0..proxy_count {
            let name = proxy_service(&vpool.name, number);
            report.step("stopping a proxy", agent.stop_service(&name).await);
            report.step("removing a proxy", agent.remove_service(&name).await);
        }
        report.step("removing the DTL", agent.remove_service(&dtl).await);
        report.step(
            "removing the volume router",
            agent.remove_service(&voldrv_name).await,
        );
    }

    for (alba_proxy, _) in proxies_of(&tables, sd.id) {
        report.step(
            "removing a proxy config",
            ctx.ccs.delete(&keys::proxy_root(vpool.id, alba_proxy.id), true),
        );
    }
    report.step(
        "removing the StorageDriver config",
        ctx.ccs
            .delete(&keys::storagedriver_root(vpool.id, &sd.storagedriver_id), true),
    );

    let mut dirs: Vec<String> = tables
        .storagedriver_partitions_of(sd.id)
        .iter()
        .filter(|p| p.mds_service.is_none())
        .map(|p| p.path.clone())
        .collect();
    dirs.push(sd.mountpoint.clone());
    if let Some(agent) = &agent {
        report.step("removing directories", agent.remove_dirs(&dirs).await);
    }

    let errors_found = report.errors_found;
    let vpool_removed = report.step(
        "cleaning the DAL",
        ctx.dal.write(|t| {
            remove_storagedriver_rows(t, &sd);
            let empty = t.storagedrivers_of_vpool(vpool.id).is_empty()
                && t.mds_services_of_vpool(vpool.id).is_empty()
                && t.vdisks_of_vpool(vpool.id).is_empty();
            if empty {
                t.vpools.remove(&vpool.id);
            } else {
                t.vpool_mut(vpool.id)?.status = if errors_found {
                    VPoolStatus::Failure
                } else {
                    VPoolStatus::Running
                };
            }
            Ok(empty)
        }),
    );
    if vpool_removed == Some(true) {
        report.vpool_removed = true;
        report.step(
            "removing the vPool config",
            ctx.ccs.delete(&keys::vpool_root(vpool.id), true),
        );
    }

    let host_idle = ctx.dal.read(|t| t.storagedrivers_on(host.id).is_empty());
    if let (true, Some(agent)) = (host_idle, &agent) {
        report.step("stopping the watcher", agent.stop_service(WATCHER_SERVICE).await);
        report.step("removing the watcher", agent.remove_service(WATCHER_SERVICE).await);
    }

    if report.errors_found {
        tracing::error!(vpool = %vpool.name, "StorageDriver removal finished with errors");
    } else {
        tracing::info!(vpool = %vpool.name, "StorageDriver {} removed", sd.storagedriver_id);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{
        Domain, DomainId, StorageDriverPorts, StorageRouterDomain, StorageRouterDomainId,
    };

    fn host(t: &mut Tables, ip: &str) -> StorageRouterId {
        let sr = StorageRouter {
            id: StorageRouterId::new(),
            name: format!("node-{}", ip),
            ip: ip.into(),
            machine_id: format!("m{}", ip),
            node_type: NodeType::Master,
        };
        let id = sr.id;
        t.storagerouters.insert(id, sr);
        id
    }

    fn storagedriver(t: &mut Tables, vpool: VPoolId, sr: StorageRouterId, ip: &str) -> StorageDriverId {
        let sd = StorageDriver {
            id: StorageDriverId::new(),
            vpool,
            storagerouter: sr,
            storagedriver_id: format!("pool{}", ip),
            cluster_ip: ip.into(),
            storage_ip: ip.into(),
            ports: StorageDriverPorts {
                management: 26200,
                xmlrpc: 26201,
                dtl: 26202,
                edge: 26203,
            },
            mountpoint: "/mnt/pool".into(),
        };
        let id = sd.id;
        t.storagedrivers.insert(id, sd);
        id
    }

    #[test]
    fn test_cluster_node_config_distances() {
        let mut t = Tables::default();
        let vpool = VPoolId::new();
        let a = host(&mut t, "10.0.0.1");
        let b = host(&mut t, "10.0.0.2");
        let c = host(&mut t, "10.0.0.3");
        let rack = Domain {
            id: DomainId::new(),
            name: "rack".into(),
        };
        for sr in [a, b] {
            let j = StorageRouterDomain {
                id: StorageRouterDomainId::new(),
                storagerouter: sr,
                domain: rack.id,
                backup: false,
            };
            t.storagerouter_domains.insert(j.id, j);
        }
        t.domains.insert(rack.id, rack);
        let sd_a = storagedriver(&mut t, vpool, a, "10.0.0.1");
        storagedriver(&mut t, vpool, b, "10.0.0.2");
        storagedriver(&mut t, vpool, c, "10.0.0.3");

        let config = compute_cluster_node_config(&t, sd_a).unwrap();
        assert_eq!(config.vrouter_id, "pool10.0.0.1");
        assert_eq!(config.network_server_uri, "tcp://10.0.0.1:26203");
        assert_eq!(config.failovercache_port, 26202);
        assert_eq!(config.node_distance_map.len(), 2);
        assert_eq!(config.node_distance_map["pool10.0.0.2"], 1);
        assert_eq!(config.node_distance_map["pool10.0.0.3"], 10_000);
    }

    #[test]
    fn test_service_names() {
        assert_eq!(dtl_service("pool"), "ovs-dtl_pool");
        assert_eq!(proxy_service("pool", 1), "ovs-albaproxy_pool_1");
        assert_eq!(storagedriver_id("pool", "abc"), "poolabc");
    }
}
