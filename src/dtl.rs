//! DTL placement
//!
//! Picks the host mirroring the pending writes of a vdisk. Candidates come
//! in tiers (recovery domains, regular domains, everything else); the first
//! tier with a reachable host wins. A configured target that is still a
//! candidate is kept, otherwise the lexically smallest ip is taken.

use crate::clients::{DtlConfig, StorageRouterClient, VolumeStatus};
use crate::common::{Cancellation, Result};
use crate::dal::{DtlMode, StorageRouterId, Tables, VDisk, VDiskId, VPoolId};
use crate::locality;
use crate::mds::MdsConfig;
use crate::Context;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlOutcome {
    /// The configured DTL already matches the placement rules
    Unchanged,
    /// The vdisk carries a manual DTL and was left alone
    Manual,
    /// The volume is halted; nothing was looked at
    Halted,
    /// A new config was pushed; `None` removed the DTL
    Reconfigured { config: Option<DtlConfig> },
}

/// Which vdisks a DTL checkup covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlScope {
    All,
    VPool(VPoolId),
    VDisk(VDiskId),
}

#[derive(Debug, Default)]
pub struct DtlCheckupReport {
    pub checked: usize,
    pub reconfigured: usize,
    pub manual: usize,
    pub halted: usize,
    pub errors: Vec<(VDiskId, String)>,
}

async fn reachable_hosts(
    ctx: &Context,
    tables: &Tables,
    hosts: &BTreeSet<StorageRouterId>,
    cache: &mut BTreeMap<StorageRouterId, bool>,
) -> Result<BTreeSet<StorageRouterId>> {
    let mut unknown = Vec::new();
    for id in hosts.iter().filter(|id| !cache.contains_key(id)) {
        unknown.push((*id, tables.storagerouter(*id)?));
    }
    let checks = unknown
        .into_iter()
        .map(|(id, sr)| async move { (id, ctx.clients.is_reachable(sr).await) });
    cache.extend(join_all(checks).await);

    Ok(hosts
        .iter()
        .filter(|id| cache.get(id).copied().unwrap_or(false))
        .copied()
        .collect())
}

/// Host of the vPool whose StorageDriver serves a DTL on `ip`
fn dtl_host(tables: &Tables, vpool: VPoolId, ip: &str) -> Option<StorageRouterId> {
    tables
        .storagedrivers_of_vpool(vpool)
        .into_iter()
        .find(|sd| sd.storage_ip == ip || sd.cluster_ip == ip)
        .map(|sd| sd.storagerouter)
}

fn dtl_config_on(
    tables: &Tables,
    vpool: VPoolId,
    host: StorageRouterId,
    mode: DtlMode,
) -> Result<DtlConfig> {
    let sd = tables.storagedriver_for(vpool, host).ok_or_else(|| {
        crate::Error::PreconditionFailed(format!("host {} carries no StorageDriver", host))
    })?;
    Ok(DtlConfig {
        host: sd.storage_ip.clone(),
        port: sd.ports.dtl,
        mode,
    })
}

/// Mode of an automatically placed DTL
fn dtl_mode(tables: &Tables, vdisk: &VDisk) -> Result<DtlMode> {
    if tables.vdisk_domains_of(vdisk.id).iter().any(|j| j.sync) {
        return Ok(DtlMode::Sync);
    }
    Ok(tables.vpool(vdisk.vpool)?.configuration.dtl_mode)
}

/// Where the DTL of `vdisk` should live; `None` means no DTL
async fn desired_config(
    ctx: &Context,
    tables: &Tables,
    vdisk: &VDisk,
    host: StorageRouterId,
    current: Option<&DtlConfig>,
    cache: &mut BTreeMap<StorageRouterId, bool>,
) -> Result<Option<DtlConfig>> {
    let mode = dtl_mode(tables, vdisk)?;
    if mode == DtlMode::NoSync {
        return Ok(None);
    }

    let mut candidates = BTreeSet::new();
    for tier in locality::dtl_candidate_tiers(tables, vdisk.vpool, host) {
        candidates = reachable_hosts(ctx, tables, &tier, cache).await?;
        if !candidates.is_empty() {
            break;
        }
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    let sticky = current
        .and_then(|c| dtl_host(tables, vdisk.vpool, &c.host))
        .filter(|h| candidates.contains(h));
    let target = match sticky {
        Some(target) => target,
        None => {
            let mut by_ip: Vec<(&str, StorageRouterId)> = Vec::new();
            for id in &candidates {
                by_ip.push((tables.storagerouter(*id)?.ip.as_str(), *id));
            }
            by_ip.sort();
            match by_ip.first() {
                Some((_, id)) => *id,
                None => return Ok(None),
            }
        }
    };
    dtl_config_on(tables, vdisk.vpool, target, mode).map(Some)
}

/// Whether a manual DTL still points at a usable host
async fn manual_target_valid(
    ctx: &Context,
    tables: &Tables,
    vdisk: &VDisk,
    host: StorageRouterId,
    current: &DtlConfig,
) -> Result<bool> {
    let target = match dtl_host(tables, vdisk.vpool, &current.host) {
        Some(target) if target != host => target,
        _ => return Ok(false),
    };
    Ok(ctx
        .clients
        .is_reachable(tables.storagerouter(target)?)
        .await)
}

fn attached_host(vdisk: &VDisk) -> Result<StorageRouterId> {
    vdisk.storagerouter.ok_or_else(|| {
        crate::Error::PreconditionFailed(format!("vDisk {} is not attached to a host", vdisk.name))
    })
}

fn router_of(ctx: &Context, tables: &Tables, vdisk: &VDisk) -> Result<Arc<dyn StorageRouterClient>> {
    let config = MdsConfig::load(&ctx.ccs, vdisk.vpool)?;
    ctx.router_for_vpool(tables, vdisk.vpool, vdisk.storagerouter, config.sr_timeout())
}

async fn ensure_dtl_cached(
    ctx: &Context,
    vdisk: VDiskId,
    cache: &mut BTreeMap<StorageRouterId, bool>,
) -> Result<DtlOutcome> {
    let tables = ctx.dal.snapshot();
    let vdisk = tables.vdisk(vdisk)?.clone();
    let host = attached_host(&vdisk)?;
    let router = router_of(ctx, &tables, &vdisk)?;

    let info = router.info_volume(&vdisk.volume_id).await?;
    if info.live_status == VolumeStatus::Halted {
        return Ok(DtlOutcome::Halted);
    }
    let current = router.get_dtl_config(&vdisk.volume_id).await?;

    if vdisk.has_manual_dtl {
        if let Some(current) = &current {
            if !manual_target_valid(ctx, &tables, &vdisk, host, current).await? {
                tracing::warn!(
                    vdisk = %vdisk.name,
                    "OVS_WARNING: manual DTL of vDisk {} points at {}:{} which is no longer a valid target",
                    vdisk.name,
                    current.host,
                    current.port
                );
            }
        }
        return Ok(DtlOutcome::Manual);
    }

    let desired = desired_config(ctx, &tables, &vdisk, host, current.as_ref(), cache).await?;
    if desired == current {
        tracing::debug!(vdisk = %vdisk.name, "DTL configuration is up to date");
        return Ok(DtlOutcome::Unchanged);
    }
    match &desired {
        Some(config) => tracing::info!(
            vdisk = %vdisk.name,
            "Moving DTL to {}:{} ({})",
            config.host,
            config.port,
            config.mode
        ),
        None => tracing::info!(vdisk = %vdisk.name, "Removing DTL, no candidate host"),
    }
    router
        .set_manual_dtl_config(&vdisk.volume_id, desired.as_ref())
        .await?;
    Ok(DtlOutcome::Reconfigured { config: desired })
}

/// Place the DTL of one vdisk
pub async fn ensure_dtl(ctx: &Context, vdisk: VDiskId) -> Result<DtlOutcome> {
    ensure_dtl_cached(ctx, vdisk, &mut BTreeMap::new()).await
}

/// Run the DTL placement over a set of vdisks. Per-vdisk failures are
/// collected in the report.
pub async fn dtl_checkup(
    ctx: &Context,
    scope: DtlScope,
    cancel: &Cancellation,
) -> Result<DtlCheckupReport> {
    let vdisks: Vec<VDiskId> = ctx.dal.read(|t| -> Result<Vec<VDiskId>> {
        Ok(match scope {
            DtlScope::All => t.vdisks.keys().copied().collect(),
            DtlScope::VPool(vpool) => {
                t.vpool(vpool)?;
                t.vdisks_of_vpool(vpool).iter().map(|v| v.id).collect()
            }
            DtlScope::VDisk(vdisk) => vec![t.vdisk(vdisk)?.id],
        })
    })?;

    let mut report = DtlCheckupReport::default();
    let mut reachability = BTreeMap::new();
    for vdisk in vdisks {
        cancel.check()?;
        report.checked += 1;
        match ensure_dtl_cached(ctx, vdisk, &mut reachability).await {
            Ok(DtlOutcome::Unchanged) => {}
            Ok(DtlOutcome::Manual) => report.manual += 1,
            Ok(DtlOutcome::Halted) => report.halted += 1,
            Ok(DtlOutcome::Reconfigured { .. }) => report.reconfigured += 1,
            Err(e) => {
                tracing::error!(%vdisk, "DTL checkup failed: {}", e);
                report.errors.push((vdisk, e.to_string()));
            }
        }
    }
    tracing::info!(
        checked = report.checked,
        reconfigured = report.reconfigured,
        errors = report.errors.len(),
        "DTL checkup finished"
    );
    Ok(report)
}

/// Pin the DTL of a vdisk to `target`, or remove it with `None`. The vdisk
/// is flagged manual so the checkups leave it alone.
pub async fn set_manual_dtl(
    ctx: &Context,
    vdisk: VDiskId,
    target: Option<StorageRouterId>,
    mode: Option<DtlMode>,
) -> Result<Option<DtlConfig>> {
    let tables = ctx.dal.snapshot();
    let vdisk = tables.vdisk(vdisk)?.clone();
    let host = attached_host(&vdisk)?;
    let config = match target {
        Some(target) => {
            if target == host {
                return Err(crate::Error::InvalidParameter(format!(
                    "the DTL of vDisk {} cannot live on its own host",
                    vdisk.name
                )));
            }
            let mode = match mode.unwrap_or(tables.vpool(vdisk.vpool)?.configuration.dtl_mode) {
                DtlMode::NoSync => DtlMode::Async,
                mode => mode,
            };
            Some(
                dtl_config_on(&tables, vdisk.vpool, target, mode)
                    .map_err(|e| crate::Error::InvalidParameter(e.to_string()))?,
            )
        }
        None => None,
    };

    let router = router_of(ctx, &tables, &vdisk)?;
    router
        .set_manual_dtl_config(&vdisk.volume_id, config.as_ref())
        .await?;
    ctx.dal.write(|t| {
        t.vdisk_mut(vdisk.id)?.has_manual_dtl = true;
        Ok(())
    })?;
    tracing::info!(vdisk = %vdisk.name, "Manual DTL set");
    Ok(config)
}

/// Drop the manual flag of a vdisk and place its DTL automatically again
pub async fn clear_manual_dtl(ctx: &Context, vdisk: VDiskId) -> Result<DtlOutcome> {
    ctx.dal.write(|t| {
        t.vdisk_mut(vdisk)?.has_manual_dtl = false;
        Ok(())
    })?;
    ensure_dtl(ctx, vdisk).await
}
