//! MDS service registry: provisioning and removal of metadata servers

use crate::ccs::VolatileMutex;
use crate::common::Result;
use crate::dal::{
    DiskRole, MdsService, MdsServiceId, Service, ServiceId, ServiceType, StorageDriverId,
    StorageDriverPartition, StorageDriverPartitionId, StorageRouterId, SubRole, Tables, VPoolId,
};
use crate::mds::load::get_mds_load;
use crate::vpool::ports::{pick_free_ports, port_range, PortKind};
use crate::vpool::sdconfig;
use crate::Context;
use serde_json::json;

/// Provision a new MDS service of `vpool` on `storagerouter`, optionally on a
/// given port (used when adopting a socket the volume router already knows).
pub async fn prepare_mds_service(
    ctx: &Context,
    storagerouter: StorageRouterId,
    vpool: VPoolId,
    port: Option<u16>,
) -> Result<MdsServiceId> {
    let _guard = VolatileMutex::new(&ctx.ccs, format!("prepare_mds_{}", storagerouter))
        .acquire(ctx.tunables.lock_wait)
        .await?;

    let tables = ctx.dal.snapshot();
    let host = tables.storagerouter(storagerouter)?.clone();
    let vpool_row = tables.vpool(vpool)?.clone();
    let storagedriver = tables
        .storagedriver_for(vpool, storagerouter)
        .cloned()
        .ok_or_else(|| {
            crate::Error::PreconditionFailed(format!(
                "vPool {} has no StorageDriver on {}",
                vpool_row.name, host.name
            ))
        })?;

    let port = match port {
        Some(port) => port,
        None => {
            let range = port_range(&ctx.ccs, &host.machine_id, PortKind::Mds)?;
            pick_free_ports(range, &tables.used_ports(storagerouter), 1)?[0]
        }
    };

    let mut db_partitions: Vec<_> = tables
        .disk_partitions_of(storagerouter)
        .into_iter()
        .filter(|p| p.roles.contains(&DiskRole::Db))
        .collect();
    db_partitions.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
    let db_partition = db_partitions.first().copied().ok_or_else(|| {
        crate::Error::PreconditionFailed(format!("host {} has no DB partition", host.name))
    })?;

    let number = tables
        .mds_services_on(vpool, storagerouter)
        .iter()
        .map(|m| m.number + 1)
        .max()
        .unwrap_or(0);
    let path = format!(
        "{}/mds_{}_{}",
        db_partition.mountpoint, vpool_row.name, number
    );

    let service = Service {
        id: ServiceId::new(),
        name: format!("metadataserver_{}_{}", vpool_row.name, number),
        service_type: ServiceType::MetadataServer,
        storagerouter,
        ports: vec![port],
    };
    let mds = MdsService {
        id: MdsServiceId::new(),
        vpool,
        number,
        service: service.id,
        capacity: MdsService::DEFAULT_CAPACITY,
    };
    let partition = StorageDriverPartition {
        id: StorageDriverPartitionId::new(),
        storagedriver: storagedriver.id,
        partition: db_partition.id,
        role: DiskRole::Db,
        sub_role: Some(SubRole::Mds),
        number,
        size: None,
        path: path.clone(),
        mds_service: Some(mds.id),
    };
    let mds_id = mds.id;
    let (service_id, partition_id) = (service.id, partition.id);

    ctx.dal.write(|t| {
        if t.mds_service_by_socket(vpool, &host.ip, port).is_some() {
            return Err(crate::Error::PreconditionFailed(format!(
                "an MDS of vPool {} already listens on {}:{}",
                vpool_row.name, host.ip, port
            )));
        }
        t.services.insert(service.id, service);
        t.mds_services.insert(mds.id, mds);
        t.storagedriver_partitions.insert(partition.id, partition);
        Ok(())
    })?;

    let provisioned: Result<()> = async {
        ctx.clients.agent(&host)?.create_dirs(&[path.clone()]).await?;
        render_metadata_server(ctx, storagedriver.id)
    }
    .await;

    if let Err(e) = provisioned {
        tracing::error!(
            vpool = %vpool_row.name,
            storagerouter = %host.name,
            "Provisioning MDS service {} failed, rolling back: {}",
            number,
            e
        );
        ctx.dal.write(|t| {
            t.storagedriver_partitions.remove(&partition_id);
            t.mds_services.remove(&mds_id);
            t.services.remove(&service_id);
            Ok(())
        })?;
        if let Err(render) = render_metadata_server(ctx, storagedriver.id) {
            tracing::warn!("Could not restore metadata_server section: {}", render);
        }
        return Err(e);
    }

    tracing::info!(
        vpool = %vpool_row.name,
        storagerouter = %host.name,
        port,
        "Provisioned MDS service {}",
        number
    );
    Ok(mds_id)
}

/// Remove an MDS service that no vdisk uses anymore
pub async fn remove_mds_service(ctx: &Context, mds_service: MdsServiceId) -> Result<()> {
    let tables = ctx.dal.snapshot();
    let mds = tables.mds_service(mds_service)?.clone();
    let vdisks = tables.vdisk_count_of(mds_service);
    if vdisks > 0 {
        return Err(crate::Error::PreconditionFailed(format!(
            "MDS service {} still serves {} vdisks",
            mds_service, vdisks
        )));
    }
    let service = tables.service(mds.service)?.clone();
    let host = tables.storagerouter(service.storagerouter)?.clone();
    let partitions: Vec<StorageDriverPartition> = tables
        .storagedriver_partitions
        .values()
        .filter(|p| p.mds_service == Some(mds_service))
        .cloned()
        .collect();

    ctx.dal.write(|t| {
        for partition in &partitions {
            t.storagedriver_partitions.remove(&partition.id);
        }
        t.mds_services.remove(&mds_service);
        t.services.remove(&service.id);
        Ok(())
    })?;

    let paths: Vec<String> = partitions.iter().map(|p| p.path.clone()).collect();
    if !paths.is_empty() {
        let removed = match ctx.clients.agent(&host) {
            Ok(agent) => agent.remove_dirs(&paths).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            tracing::warn!(storagerouter = %host.name, "Could not remove {:?}: {}", paths, e);
        }
    }

    if let Some(storagedriver) = tables.storagedriver_for(mds.vpool, host.id) {
        render_metadata_server(ctx, storagedriver.id)?;
    }
    tracing::info!(storagerouter = %host.name, "Removed MDS service {}", service.name);
    Ok(())
}

/// Least loaded MDS service of `vpool` on a host, with its current load
pub fn get_preferred_mds(
    tables: &Tables,
    storagerouter: StorageRouterId,
    vpool: VPoolId,
) -> Option<(MdsServiceId, f64)> {
    tables
        .mds_services_on(vpool, storagerouter)
        .into_iter()
        .map(|m| {
            let (load, _) = get_mds_load(m.capacity, tables.vdisk_count_of(m.id));
            (m.id, load)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Rewrite the `metadata_server` section of a StorageDriver from the MDS
/// services on its host
pub fn render_metadata_server(ctx: &Context, storagedriver: StorageDriverId) -> Result<()> {
    let tables = ctx.dal.snapshot();
    let sd = tables.storagedriver(storagedriver)?;
    let mut nodes = Vec::new();
    for mds in tables.mds_services_on(sd.vpool, sd.storagerouter) {
        let (_, ip, port) = tables.mds_socket(mds.id)?;
        let path = tables
            .storagedriver_partitions
            .values()
            .find(|p| p.mds_service == Some(mds.id))
            .map(|p| p.path.clone())
            .ok_or_else(|| {
                crate::Error::Internal(format!("MDS service {} has no partition", mds.id))
            })?;
        nodes.push(json!({
            "host": ip,
            "port": port,
            "db_directory": format!("{}/db", path),
            "scratch_directory": format!("{}/scratch", path),
        }));
    }
    sdconfig::write_section(
        &ctx.ccs,
        sd.vpool,
        &sd.storagedriver_id,
        "metadata_server",
        &json!({ "mds_nodes": nodes }),
    )
}
