//! MDS safety: choose the ordered MDS configuration of one vdisk and apply it
//!
//! The configuration is `[master, slave, ...]`. The master lives on the host
//! of the vdisk whenever a usable local service exists; slaves are spread over
//! distinct hosts, primary domain first, recovery domain second, until the
//! configured safety is reached. Applying a configuration creates namespaces,
//! pushes the list to the volume router (in two steps on a master handover),
//! cleans up and finally syncs the DAL junctions to what the router runs.

use crate::clients::{MdsNodeConfig, MdsRole, VolumeStatus};
use crate::common::Result;
use crate::dal::{MdsServiceId, StorageRouterId, Tables, VDisk, VDiskId, VPoolStatus};
use crate::locality::{host_locality, recommended_split, Locality};
use crate::mds::{load::get_mds_load, sync, MdsConfig};
use crate::Context;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyOutcome {
    /// The current configuration is fine (or cannot be improved)
    Unchanged,
    Reconfigured { config: Vec<MdsNodeConfig> },
}

#[derive(Debug, Clone)]
struct Candidate {
    id: MdsServiceId,
    host: StorageRouterId,
    socket: MdsNodeConfig,
    /// Current load when this vdisk already uses the service, next load otherwise
    load: f64,
}

struct Assessment {
    candidates: BTreeMap<MdsServiceId, Candidate>,
    master: Option<MdsServiceId>,
    slaves: Vec<MdsServiceId>,
    locality: Locality,
    /// Number of services to place in the primary and secondary sets
    targets: (usize, usize),
    reasons: Vec<String>,
}

impl Assessment {
    fn host_of(&self, id: &MdsServiceId) -> Option<StorageRouterId> {
        self.candidates.get(id).map(|c| c.host)
    }

    fn in_use(&self, id: &MdsServiceId) -> bool {
        self.master.as_ref() == Some(id) || self.slaves.contains(id)
    }

    fn sorted_by_load(&self, mut ids: Vec<MdsServiceId>) -> Vec<MdsServiceId> {
        ids.sort_by(|a, b| {
            let load = |id| self.candidates.get(id).map(|c| c.load).unwrap_or(f64::INFINITY);
            load(a).total_cmp(&load(b)).then(a.cmp(b))
        });
        ids
    }
}

/// Split of `safety` over the primary and secondary sets given how many
/// usable hosts each set has. A short side is filled up from the other one.
pub(crate) fn selection_targets(
    safety: usize,
    primary_available: usize,
    secondary_available: usize,
    has_secondary: bool,
) -> (usize, usize) {
    let (recommended_primary, recommended_secondary) = recommended_split(safety, has_secondary);
    let mut primary = recommended_primary.min(primary_available);
    let mut secondary = recommended_secondary.min(secondary_available);
    primary += (safety - primary - secondary).min(primary_available - primary);
    secondary += (safety - primary - secondary).min(secondary_available - secondary);
    (primary, secondary)
}

fn assess(
    tables: &Tables,
    vdisk: &VDisk,
    host: StorageRouterId,
    config: &MdsConfig,
    current: &[MdsNodeConfig],
    excluded: &BTreeSet<StorageRouterId>,
) -> Result<Assessment> {
    let maxload = config.mds_maxload as f64;
    let locality = host_locality(tables, vdisk.vpool, host, excluded);
    let mut reasons = Vec::new();

    let mut master = None;
    let mut slaves = Vec::new();
    for (position, node) in current.iter().enumerate() {
        let id = tables
            .mds_service_by_socket(vdisk.vpool, &node.ip, node.port)
            .filter(|id| {
                tables
                    .mds_socket(*id)
                    .map(|(sr, _, _)| !excluded.contains(&sr))
                    .unwrap_or(false)
            });
        match id {
            Some(id) if position == 0 => master = Some(id),
            Some(id) => slaves.push(id),
            None => reasons.push(format!(
                "{} {} cannot be used anymore",
                if position == 0 { "master" } else { "slave" },
                node
            )),
        }
    }

    let mut candidates = BTreeMap::new();
    for mds in tables.mds_services_of_vpool(vdisk.vpool) {
        let (sr, ip, port) = tables.mds_socket(mds.id)?;
        if excluded.contains(&sr) {
            continue;
        }
        let (current_load, next_load) =
            get_mds_load(mds.capacity, tables.vdisk_count_of(mds.id));
        let in_use = master == Some(mds.id) || slaves.contains(&mds.id);
        candidates.insert(
            mds.id,
            Candidate {
                id: mds.id,
                host: sr,
                socket: MdsNodeConfig::new(ip, port),
                load: if in_use { current_load } else { next_load },
            },
        );
    }

    let available = |set: &BTreeSet<StorageRouterId>| {
        candidates
            .values()
            .filter(|c| set.contains(&c.host) && c.load <= maxload)
            .map(|c| c.host)
            .collect::<BTreeSet<_>>()
            .len()
    };
    let primary_available = available(&locality.primary);
    let secondary_available = available(&locality.secondary);
    let (recommended_primary, recommended_secondary) =
        recommended_split(config.mds_safety, !locality.secondary.is_empty());
    let targets = selection_targets(
        config.mds_safety,
        primary_available,
        secondary_available,
        !locality.secondary.is_empty(),
    );

    let mut assessment = Assessment {
        candidates,
        master,
        slaves,
        locality,
        targets,
        reasons,
    };
    let used: Vec<MdsServiceId> = assessment
        .master
        .into_iter()
        .chain(assessment.slaves.iter().copied())
        .collect();

    let mut used_hosts = BTreeSet::new();
    for id in &used {
        let candidate = &assessment.candidates[id];
        if !used_hosts.insert(candidate.host) {
            assessment
                .reasons
                .push(format!("multiple MDS services on the host of {}", candidate.socket));
        }
        if candidate.load > maxload {
            assessment
                .reasons
                .push(format!("MDS service {} is overloaded", candidate.socket));
        }
        if !assessment.locality.contains(candidate.host) {
            assessment.reasons.push(format!(
                "MDS service {} is outside the domains of the vdisk",
                candidate.socket
            ));
        }
    }

    if let Some(master) = assessment.master {
        let master_host = assessment.candidates[&master].host;
        if master_host != host {
            assessment.reasons.push("master is not local".to_string());
        }
        if !assessment.locality.primary.contains(&master_host) {
            assessment
                .reasons
                .push("master is not in the primary domain".to_string());
        }
    }

    let (target_primary, target_secondary) = assessment.targets;
    if used.len() < target_primary + target_secondary {
        assessment.reasons.push(format!(
            "not enough safety ({} of {})",
            used.len(),
            target_primary + target_secondary
        ));
    }
    if used.len() > config.mds_safety {
        assessment.reasons.push(format!(
            "too much safety ({} of {})",
            used.len(),
            config.mds_safety
        ));
    }

    let count_in = |set: &BTreeSet<StorageRouterId>| {
        used.iter()
            .filter(|id| set.contains(&assessment.candidates[*id].host))
            .count()
    };
    let primary_used = count_in(&assessment.locality.primary);
    let secondary_used = count_in(&assessment.locality.secondary);
    if primary_used < recommended_primary.min(primary_available) {
        assessment
            .reasons
            .push("not enough services in the primary domain".to_string());
    }
    if primary_used > target_primary {
        assessment
            .reasons
            .push("too many services in the primary domain".to_string());
    }
    if secondary_used < recommended_secondary.min(secondary_available) {
        assessment
            .reasons
            .push("not enough services in the recovery domain".to_string());
    }
    if secondary_used > target_secondary {
        assessment
            .reasons
            .push("too many services in the recovery domain".to_string());
    }

    let mut seen_secondary = false;
    for slave in &assessment.slaves {
        let slave_host = assessment.candidates[slave].host;
        if assessment.locality.secondary.contains(&slave_host) {
            seen_secondary = true;
        } else if seen_secondary && assessment.locality.primary.contains(&slave_host) {
            assessment
                .reasons
                .push("recovery domain slave before primary domain slave".to_string());
            break;
        }
    }

    Ok(assessment)
}

#[derive(Clone, Copy)]
enum Side {
    Primary,
    Secondary,
}

/// Accumulates the new configuration
struct Picker<'a> {
    ctx: &'a Context,
    tables: &'a Tables,
    assessment: &'a Assessment,
    maxload: f64,
    safety: usize,
    head: Vec<MdsServiceId>,
    primary: Vec<MdsServiceId>,
    secondary: Vec<MdsServiceId>,
    hosts: BTreeSet<StorageRouterId>,
    reachable: HashMap<StorageRouterId, bool>,
}

impl<'a> Picker<'a> {
    fn total(&self) -> usize {
        self.head.len() + self.primary.len() + self.secondary.len()
    }

    fn set(&self, side: Side) -> &BTreeSet<StorageRouterId> {
        match side {
            Side::Primary => &self.assessment.locality.primary,
            Side::Secondary => &self.assessment.locality.secondary,
        }
    }

    fn count(&self, side: Side) -> usize {
        let set = self.set(side);
        self.head
            .iter()
            .chain(&self.primary)
            .chain(&self.secondary)
            .filter(|id| {
                self.assessment
                    .host_of(id)
                    .map(|h| set.contains(&h))
                    .unwrap_or(false)
            })
            .count()
    }

    async fn is_reachable(&mut self, host: StorageRouterId) -> bool {
        if let Some(reachable) = self.reachable.get(&host) {
            return *reachable;
        }
        let reachable = match self.tables.storagerouter(host) {
            Ok(sr) => self.ctx.clients.is_reachable(sr).await,
            Err(_) => false,
        };
        self.reachable.insert(host, reachable);
        reachable
    }

    async fn fill(&mut self, pool: &[MdsServiceId], side: Side, limit: usize) {
        for id in pool {
            if self.count(side) >= limit || self.total() >= self.safety {
                break;
            }
            let candidate = match self.assessment.candidates.get(id) {
                Some(candidate) => candidate.clone(),
                None => continue,
            };
            if !self.set(side).contains(&candidate.host)
                || self.hosts.contains(&candidate.host)
                || candidate.load > self.maxload
            {
                continue;
            }
            if !self.is_reachable(candidate.host).await {
                tracing::warn!(
                    "Skipping MDS service {}: host is unreachable",
                    candidate.socket
                );
                continue;
            }
            self.hosts.insert(candidate.host);
            match side {
                Side::Primary => self.primary.push(*id),
                Side::Secondary => self.secondary.push(*id),
            }
        }
    }

    fn finish(self) -> Vec<MdsServiceId> {
        let mut services = self.head;
        services.extend(self.primary);
        services.extend(self.secondary);
        services
    }
}

/// Make sure the MDS configuration of a vdisk meets the safety, locality and
/// load constraints, reconfiguring it when one of them is violated.
///
/// The vPool of the vdisk must be RUNNING.
pub async fn ensure_safety(
    ctx: &Context,
    vdisk: VDiskId,
    excluded: &BTreeSet<StorageRouterId>,
) -> Result<SafetyOutcome> {
    ensure_safety_in(ctx, vdisk, excluded, VPoolStatus::Running).await
}

/// `ensure_safety` for the StorageDriver removal, which moves MDS services
/// off the leaving host while its vPool is SHRINKING.
pub(crate) async fn ensure_safety_while_shrinking(
    ctx: &Context,
    vdisk: VDiskId,
    excluded: &BTreeSet<StorageRouterId>,
) -> Result<SafetyOutcome> {
    ensure_safety_in(ctx, vdisk, excluded, VPoolStatus::Shrinking).await
}

async fn ensure_safety_in(
    ctx: &Context,
    vdisk: VDiskId,
    excluded: &BTreeSet<StorageRouterId>,
    required: VPoolStatus,
) -> Result<SafetyOutcome> {
    let tables = ctx.dal.snapshot();
    let vdisk = tables.vdisk(vdisk)?.clone();
    let status = tables.vpool(vdisk.vpool)?.status;
    if status != required {
        return Err(crate::Error::PreconditionFailed(format!(
            "vPool of vDisk {} is {:?}",
            vdisk.name, status
        )));
    }
    let host = vdisk.storagerouter.ok_or_else(|| {
        crate::Error::PreconditionFailed(format!("vDisk {} is not attached to a host", vdisk.name))
    })?;
    if excluded.contains(&host) {
        return Err(crate::Error::PreconditionFailed(format!(
            "the host of vDisk {} is excluded",
            vdisk.name
        )));
    }
    let config = MdsConfig::load(&ctx.ccs, vdisk.vpool)?;
    let router = ctx.router_for_vpool(&tables, vdisk.vpool, Some(host), config.sr_timeout())?;
    let info = router.info_volume(&vdisk.volume_id).await?;
    if info.live_status != VolumeStatus::Running {
        return Err(crate::Error::PreconditionFailed(format!(
            "vDisk {} is not running",
            vdisk.name
        )));
    }
    let current = info.metadata_backend_config;
    if current.is_empty() {
        return Err(crate::Error::PreconditionFailed(format!(
            "vDisk {} has no metadata backend config",
            vdisk.name
        )));
    }

    sync::reconcile(ctx, &vdisk, &current).await?;
    let tables = ctx.dal.snapshot();
    let assessment = assess(&tables, &vdisk, host, &config, &current, excluded)?;
    if assessment.reasons.is_empty() {
        tracing::debug!(vdisk = %vdisk.name, "MDS configuration is safe");
        return Ok(SafetyOutcome::Unchanged);
    }
    tracing::info!(
        vdisk = %vdisk.name,
        "Reconfiguring MDS: {}",
        assessment.reasons.join(", ")
    );

    let services = select(ctx, &tables, &assessment, &vdisk, host, &config).await?;
    if services.is_empty() {
        return Err(crate::Error::PreconditionFailed(format!(
            "no usable MDS service for vDisk {}",
            vdisk.name
        )));
    }
    let new_config: Vec<MdsNodeConfig> = services
        .iter()
        .map(|id| assessment.candidates[id].socket.clone())
        .collect();
    if new_config == current {
        tracing::info!(vdisk = %vdisk.name, "No better MDS configuration available");
        return Ok(SafetyOutcome::Unchanged);
    }

    apply(ctx, &vdisk, &assessment, &config, &current, &services, &new_config).await?;
    Ok(SafetyOutcome::Reconfigured { config: new_config })
}

async fn select(
    ctx: &Context,
    tables: &Tables,
    assessment: &Assessment,
    vdisk: &VDisk,
    host: StorageRouterId,
    config: &MdsConfig,
) -> Result<Vec<MdsServiceId>> {
    let maxload = config.mds_maxload as f64;
    let primary = &assessment.locality.primary;
    let mut head = Vec::new();
    let mut recyclable = assessment.sorted_by_load(assessment.slaves.clone());
    let mut former_master = None;

    let master_ok = assessment
        .master
        .and_then(|m| assessment.candidates.get(&m))
        .map(|c| c.host == host && c.load <= maxload && primary.contains(&c.host))
        .unwrap_or(false);

    if master_ok {
        head.extend(assessment.master);
    } else {
        let mut local: Vec<&Candidate> = assessment
            .candidates
            .values()
            .filter(|c| c.host == host && primary.contains(&c.host) && c.load <= maxload)
            .filter(|c| Some(c.id) != assessment.master)
            .collect();
        local.sort_by(|a, b| a.load.total_cmp(&b.load).then(a.id.cmp(&b.id)));

        match local.iter().find(|c| assessment.slaves.contains(&c.id)) {
            Some(slave) => {
                let client =
                    ctx.clients
                        .mds(&slave.socket.ip, slave.socket.port, config.mds_timeout())?;
                let behind = client.catch_up(&vdisk.volume_id, true).await?;
                recyclable.retain(|id| *id != slave.id);
                if behind < config.mds_tlogs {
                    tracing::info!(
                        vdisk = %vdisk.name,
                        "Catching up local slave {} ({} tlogs behind) before promotion",
                        slave.socket,
                        behind
                    );
                    client.catch_up(&vdisk.volume_id, false).await?;
                    head.push(slave.id);
                    former_master = assessment.master;
                } else {
                    tracing::info!(
                        vdisk = %vdisk.name,
                        "Local slave {} is {} tlogs behind, promotion deferred",
                        slave.socket,
                        behind
                    );
                    head.extend(assessment.master);
                    head.push(slave.id);
                }
            }
            None => {
                head.extend(assessment.master);
                if let Some(fresh) = local.first() {
                    head.push(fresh.id);
                }
            }
        }
    }

    let mut picker = Picker {
        ctx,
        tables,
        assessment,
        maxload,
        safety: config.mds_safety,
        hosts: head
            .iter()
            .filter_map(|id| assessment.host_of(id))
            .collect(),
        head,
        primary: Vec::new(),
        secondary: Vec::new(),
        reachable: HashMap::new(),
    };

    let recycled: Vec<MdsServiceId> = former_master.into_iter().chain(recyclable).collect();
    let fresh = assessment.sorted_by_load(
        assessment
            .candidates
            .keys()
            .filter(|id| !assessment.in_use(id))
            .copied()
            .collect(),
    );
    let (target_primary, target_secondary) = assessment.targets;

    picker.fill(&recycled, Side::Primary, target_primary).await;
    picker.fill(&fresh, Side::Primary, target_primary).await;
    picker.fill(&recycled, Side::Secondary, target_secondary).await;
    picker.fill(&fresh, Side::Secondary, target_secondary).await;
    if picker.total() < config.mds_safety {
        let all: Vec<MdsServiceId> = recycled.iter().chain(&fresh).copied().collect();
        picker.fill(&all, Side::Primary, config.mds_safety).await;
        picker.fill(&all, Side::Secondary, config.mds_safety).await;
    }
    Ok(picker.finish())
}

async fn apply(
    ctx: &Context,
    vdisk: &VDisk,
    assessment: &Assessment,
    config: &MdsConfig,
    current: &[MdsNodeConfig],
    services: &[MdsServiceId],
    new_config: &[MdsNodeConfig],
) -> Result<()> {
    let mds_timeout = config.mds_timeout();
    let mut created: Vec<MdsNodeConfig> = Vec::new();
    for id in services {
        if assessment.in_use(id) {
            continue;
        }
        let socket = &assessment.candidates[id].socket;
        let result = match ctx.clients.mds(&socket.ip, socket.port, mds_timeout) {
            Ok(client) => client.create_namespace(&vdisk.volume_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!(
                vdisk = %vdisk.name,
                "Creating namespace on {} failed: {}",
                socket,
                e
            );
            rollback_namespaces(ctx, vdisk, &created, mds_timeout).await;
            return Err(e);
        }
        created.push(socket.clone());
    }

    let mut pushes: Vec<Vec<MdsNodeConfig>> = Vec::new();
    if let Some(old_master) = current.first() {
        if *old_master != new_config[0] && new_config[1..].contains(old_master) {
            pushes.push(
                new_config
                    .iter()
                    .filter(|n| *n != old_master)
                    .cloned()
                    .collect(),
            );
        }
    }
    pushes.push(new_config.to_vec());

    let tables = ctx.dal.snapshot();
    let timeout = config.sr_timeout();
    let router = ctx.router_for_vpool(&tables, vdisk.vpool, vdisk.storagerouter, timeout)?;
    let mut accepted: Option<&Vec<MdsNodeConfig>> = None;
    for push in &pushes {
        let started = Instant::now();
        if let Err(e) = router
            .update_metadata_backend_config(&vdisk.volume_id, push, timeout)
            .await
        {
            let timed_out = matches!(e, crate::Error::UpstreamTimeout(_))
                || (e.is_upstream() && started.elapsed() >= timeout);
            if timed_out {
                log_manual_repair(vdisk, current, push, &created);
                return Err(match e {
                    crate::Error::UpstreamTimeout(_) => e,
                    other => crate::Error::UpstreamTimeout(other.to_string()),
                });
            }
            tracing::error!(
                vdisk = %vdisk.name,
                "Pushing MDS config failed: {}",
                e
            );
            let orphans: Vec<MdsNodeConfig> = created
                .iter()
                .filter(|s| !accepted.map(|a| a.contains(s)).unwrap_or(false))
                .cloned()
                .collect();
            rollback_namespaces(ctx, vdisk, &orphans, mds_timeout).await;
            if accepted.is_some() {
                if let Err(sync_err) = sync::sync_vdisk_to_reality(ctx, vdisk.id).await {
                    tracing::warn!(vdisk = %vdisk.name, "Reality sync failed: {}", sync_err);
                }
            }
            return Err(e);
        }
        accepted = Some(push);
    }

    for node in current {
        if new_config.contains(node) {
            continue;
        }
        let known = tables
            .mds_service_by_socket(vdisk.vpool, &node.ip, node.port)
            .map(|id| assessment.in_use(&id))
            .unwrap_or(false);
        if !known {
            continue;
        }
        let removed = match ctx.clients.mds(&node.ip, node.port, mds_timeout) {
            Ok(client) => client.remove_namespace(&vdisk.volume_id).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) | Err(crate::Error::NamespaceNotFound(_)) => {}
            Err(e) => tracing::warn!(
                vdisk = %vdisk.name,
                "Could not remove namespace on {}: {}",
                node,
                e
            ),
        }
    }

    for node in &new_config[1..] {
        let demoted: Result<()> = async {
            let client = ctx.clients.mds(&node.ip, node.port, mds_timeout)?;
            if client.get_role(&vdisk.volume_id).await? != MdsRole::Slave {
                client.set_role(&vdisk.volume_id, MdsRole::Slave).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = demoted {
            tracing::error!(
                vdisk = %vdisk.name,
                "Demoting {} to SLAVE failed after a successful config push: {}",
                node,
                e
            );
            return Err(crate::Error::Fatal(format!(
                "demotion of {} for vDisk {} failed: {}",
                node, vdisk.name, e
            )));
        }
    }

    sync::sync_vdisk_to_reality(ctx, vdisk.id).await?;
    tracing::info!(
        vdisk = %vdisk.name,
        "MDS configuration is now {}",
        new_config
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn rollback_namespaces(
    ctx: &Context,
    vdisk: &VDisk,
    created: &[MdsNodeConfig],
    timeout: std::time::Duration,
) {
    for socket in created {
        let removed = match ctx.clients.mds(&socket.ip, socket.port, timeout) {
            Ok(client) => client.remove_namespace(&vdisk.volume_id).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) | Err(crate::Error::NamespaceNotFound(_)) => {}
            Err(e) => tracing::warn!(
                vdisk = %vdisk.name,
                "Rollback of namespace on {} failed: {}",
                socket,
                e
            ),
        }
    }
}

fn log_manual_repair(
    vdisk: &VDisk,
    current: &[MdsNodeConfig],
    pushed: &[MdsNodeConfig],
    created: &[MdsNodeConfig],
) {
    let render = |nodes: &[MdsNodeConfig]| {
        nodes
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let orphaned: Vec<MdsNodeConfig> = current
        .iter()
        .filter(|n| !pushed.contains(n))
        .cloned()
        .collect();
    tracing::error!(
        vdisk = %vdisk.name,
        volume = %vdisk.volume_id,
        "Pushing MDS config [{}] timed out, the volume router may or may not have applied it. Manual repair:",
        render(pushed)
    );
    tracing::error!(
        vdisk = %vdisk.name,
        "  1. Check the metadata backend config the volume router reports for {}",
        vdisk.volume_id
    );
    tracing::error!(
        vdisk = %vdisk.name,
        "  2. Remove namespace {} on services no longer in that config: [{}]",
        vdisk.volume_id,
        render(&orphaned)
    );
    tracing::error!(
        vdisk = %vdisk.name,
        "  3. Set role SLAVE for {} on newly added services that are not master: [{}]",
        vdisk.volume_id,
        render(created)
    );
    tracing::error!(
        vdisk = %vdisk.name,
        "  4. Sync vDisk {} to reality",
        vdisk.id
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_without_recovery_domain() {
        assert_eq!(selection_targets(3, 1, 0, false), (1, 0));
        assert_eq!(selection_targets(3, 5, 0, false), (3, 0));
    }

    #[test]
    fn test_targets_with_recovery_domain() {
        assert_eq!(selection_targets(3, 4, 4, true), (2, 1));
        assert_eq!(selection_targets(4, 4, 4, true), (2, 2));
        // secondary short: primary backfills
        assert_eq!(selection_targets(4, 4, 1, true), (3, 1));
        // primary short: secondary backfills
        assert_eq!(selection_targets(3, 1, 2, true), (1, 2));
        assert_eq!(selection_targets(5, 1, 1, true), (1, 1));
    }
}
