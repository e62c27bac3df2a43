//! Periodic MDS checkups over running vPools

use crate::common::{Cancellation, Result};
use crate::dal::{StorageRouterId, VDiskId, VPoolId, VPoolStatus};
use crate::mds::{ensure_safety, get_preferred_mds, mds_catchup, prepare_mds_service, MdsConfig, SafetyOutcome};
use crate::Context;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Default, Serialize)]
pub struct MdsCheckupReport {
    pub vpools: usize,
    pub services_created: usize,
    pub vdisks_checked: usize,
    pub reconfigured: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct CatchUpCheckupReport {
    pub vdisks: usize,
    pub slaves_behind: usize,
    pub caught_up: usize,
    pub busy: usize,
    pub errors: Vec<String>,
}

/// Running vPools in scope, failing when an explicit vPool does not exist
fn running_vpools(ctx: &Context, scope: Option<VPoolId>) -> Result<Vec<(VPoolId, String)>> {
    ctx.dal.read(|t| {
        if let Some(vpool) = scope {
            t.vpool(vpool)?;
        }
        Ok(t.vpools
            .values()
            .filter(|v| scope.map_or(true, |s| s == v.id))
            .filter(|v| {
                if v.status != VPoolStatus::Running {
                    tracing::info!(vpool = %v.name, status = ?v.status, "Skipping vPool that is not running");
                }
                v.status == VPoolStatus::Running
            })
            .map(|v| (v.id, v.name.clone()))
            .collect())
    })
}

/// Give every StorageDriver host of the vPool an MDS service with headroom
async fn ensure_mds_headroom(
    ctx: &Context,
    vpool: VPoolId,
    vpool_name: &str,
    report: &mut MdsCheckupReport,
) -> Result<()> {
    let config = MdsConfig::load(&ctx.ccs, vpool)?;
    let tables = ctx.dal.snapshot();
    let hosts: BTreeSet<StorageRouterId> = tables.vpool_hosts(vpool);
    for host in hosts {
        let sr = tables.storagerouter(host)?;
        if !ctx.clients.is_reachable(sr).await {
            tracing::warn!(vpool = %vpool_name, storagerouter = %sr.name, "Host unreachable, not checking its MDS services");
            continue;
        }
        let overloaded = match get_preferred_mds(&tables, host, vpool) {
            Some((_, load)) => load >= config.mds_maxload as f64,
            None => true,
        };
        if !overloaded {
            continue;
        }
        match prepare_mds_service(ctx, host, vpool, None).await {
            Ok(mds) => {
                tracing::info!(vpool = %vpool_name, storagerouter = %sr.name, "Added MDS service {}", mds);
                report.services_created += 1;
            }
            Err(e) => {
                tracing::error!(vpool = %vpool_name, storagerouter = %sr.name, "Adding an MDS service failed: {}", e);
                report.errors.push(format!("{}: {}", sr.name, e));
            }
        }
    }
    Ok(())
}

/// Make sure every StorageDriver host of the running vPools has an MDS
/// service with headroom, then check the MDS safety of every vdisk.
pub async fn mds_checkup(
    ctx: &Context,
    scope: Option<VPoolId>,
    cancel: &Cancellation,
) -> Result<MdsCheckupReport> {
    let mut report = MdsCheckupReport::default();
    let no_exclusions = BTreeSet::new();
    for (vpool, name) in running_vpools(ctx, scope)? {
        cancel.check()?;
        report.vpools += 1;
        if let Err(e) = ensure_mds_headroom(ctx, vpool, &name, &mut report).await {
            tracing::error!(vpool = %name, "MDS headroom check failed: {}", e);
            report.errors.push(format!("{}: {}", name, e));
        }

        let vdisks: Vec<VDiskId> =
            ctx.dal.read(|t| t.vdisks_of_vpool(vpool).iter().map(|v| v.id).collect());
        for vdisk in vdisks {
            cancel.check()?;
            report.vdisks_checked += 1;
            match ensure_safety(ctx, vdisk, &no_exclusions).await {
                Ok(SafetyOutcome::Unchanged) => {}
                Ok(SafetyOutcome::Reconfigured { .. }) => report.reconfigured += 1,
                Err(e) => {
                    tracing::error!(%vdisk, vpool = %name, "MDS safety check failed: {}", e);
                    report.errors.push(format!("{}: {}", vdisk, e));
                }
            }
        }
    }
    tracing::info!(
        vpools = report.vpools,
        vdisks = report.vdisks_checked,
        reconfigured = report.reconfigured,
        errors = report.errors.len(),
        "MDS checkup finished"
    );
    Ok(report)
}

/// Catch up lagging MDS slaves of every vdisk in the running vPools
pub async fn catchup_checkup(
    ctx: &Context,
    scope: Option<VPoolId>,
    cancel: &Cancellation,
) -> Result<CatchUpCheckupReport> {
    let mut report = CatchUpCheckupReport::default();
    for (vpool, name) in running_vpools(ctx, scope)? {
        let vdisks: Vec<VDiskId> =
            ctx.dal.read(|t| t.vdisks_of_vpool(vpool).iter().map(|v| v.id).collect());
        for vdisk in vdisks {
            cancel.check()?;
            report.vdisks += 1;
            match mds_catchup(ctx, vdisk, false).await {
                Ok(outcome) => {
                    report.slaves_behind += outcome.slaves_behind;
                    report.caught_up += outcome.caught_up;
                    report.busy += outcome.busy;
                    report
                        .errors
                        .extend(outcome.errors.into_iter().map(|e| format!("{}: {}", vdisk, e)));
                }
                Err(e) => {
                    tracing::error!(%vdisk, vpool = %name, "MDS catch-up failed: {}", e);
                    report.errors.push(format!("{}: {}", vdisk, e));
                }
            }
        }
    }
    Ok(report)
}
