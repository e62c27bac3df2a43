//! Reality sync: bring the MDS junctions of a vdisk in line with the
//! metadata backend config the volume router actually runs with.

use crate::clients::MdsNodeConfig;
use crate::common::Result;
use crate::dal::{MdsServiceId, MdsServiceVDisk, MdsServiceVDiskId, VDisk, VDiskId};
use crate::mds::{registry, MdsConfig};
use crate::Context;

pub async fn sync_vdisk_to_reality(ctx: &Context, vdisk: VDiskId) -> Result<()> {
    let tables = ctx.dal.snapshot();
    let vdisk = tables.vdisk(vdisk)?.clone();
    let config = MdsConfig::load(&ctx.ccs, vdisk.vpool)?;
    let router =
        ctx.router_for_vpool(&tables, vdisk.vpool, vdisk.storagerouter, config.sr_timeout())?;
    let info = router.info_volume(&vdisk.volume_id).await?;
    reconcile(ctx, &vdisk, &info.metadata_backend_config).await
}

/// Rewrite the junctions of `vdisk` to match `config`, position 0 being the
/// master. Sockets on known hosts without a matching MDS service are adopted.
/// When the master socket cannot be resolved no junction is marked master.
pub(crate) async fn reconcile(
    ctx: &Context,
    vdisk: &VDisk,
    config: &[MdsNodeConfig],
) -> Result<()> {
    let mut resolved: Vec<MdsServiceId> = Vec::new();
    let mut master_resolved = false;
    for (index, node) in config.iter().enumerate() {
        let tables = ctx.dal.snapshot();
        let id = match tables.mds_service_by_socket(vdisk.vpool, &node.ip, node.port) {
            Some(id) => Some(id),
            None => {
                let host = tables
                    .storagerouter_by_ip(&node.ip)
                    .filter(|h| tables.storagedriver_for(vdisk.vpool, h.id).is_some())
                    .map(|h| h.id);
                match host {
                    Some(host) => {
                        tracing::warn!(
                            vdisk = %vdisk.name,
                            "Adopting unknown MDS socket {}",
                            node
                        );
                        let id = registry::prepare_mds_service(
                            ctx,
                            host,
                            vdisk.vpool,
                            Some(node.port),
                        )
                        .await?;
                        Some(id)
                    }
                    None => {
                        tracing::warn!(
                            vdisk = %vdisk.name,
                            "MDS socket {} is not on a host of the vPool, skipping",
                            node
                        );
                        None
                    }
                }
            }
        };
        if let Some(id) = id {
            if index == 0 {
                master_resolved = true;
            }
            if !resolved.contains(&id) {
                resolved.push(id);
            }
        }
    }
    if !master_resolved && !config.is_empty() {
        tracing::warn!(
            vdisk = %vdisk.name,
            "Master MDS {} is unknown, no junction is marked master",
            config[0]
        );
    }
    apply_junctions(ctx, vdisk.id, &resolved, master_resolved)
}

fn apply_junctions(
    ctx: &Context,
    vdisk: VDiskId,
    services: &[MdsServiceId],
    has_master: bool,
) -> Result<()> {
    ctx.dal.write(|t| {
        let existing: Vec<MdsServiceVDisk> = t
            .mds_junctions_of(vdisk)
            .into_iter()
            .cloned()
            .collect();
        for junction in &existing {
            if !services.contains(&junction.mds_service) {
                t.mds_service_vdisks.remove(&junction.id);
            }
        }
        for (position, service) in services.iter().enumerate() {
            let position = position as u32;
            match existing.iter().find(|j| j.mds_service == *service) {
                Some(junction) => {
                    if let Some(row) = t.mds_service_vdisks.get_mut(&junction.id) {
                        row.position = position;
                        row.is_master = has_master && position == 0;
                    }
                }
                None => {
                    let id = MdsServiceVDiskId::new();
                    t.mds_service_vdisks.insert(
                        id,
                        MdsServiceVDisk {
                            id,
                            vdisk,
                            mds_service: *service,
                            is_master: has_master && position == 0,
                            position,
                        },
                    );
                }
            }
        }
        Ok(())
    })?;
    tracing::debug!(%vdisk, services = services.len(), "Synced MDS junctions");
    Ok(())
}
