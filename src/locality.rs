//! Domain-aware locality
//!
//! Given the host of a vdisk, which hosts are candidates for primary
//! (regular domain) and secondary (recovery domain) placement. Placement of
//! MDS slaves and DTL targets both start from here.

use crate::common::Result;
use crate::dal::{StorageRouterId, Tables, VDisk, VPoolId};
use std::collections::BTreeSet;

/// Distance reported to the volume router for hosts sharing nothing
pub const DISTANCE_FAR: u32 = 10_000;
pub const DISTANCE_BACKUP: u32 = 10;
pub const DISTANCE_NEAR: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    pub primary: BTreeSet<StorageRouterId>,
    pub secondary: BTreeSet<StorageRouterId>,
}

impl Locality {
    pub fn contains(&self, host: StorageRouterId) -> bool {
        self.primary.contains(&host) || self.secondary.contains(&host)
    }
}

/// Candidate hosts for data of `vpool` living on `host`.
///
/// Primary: hosts sharing a regular domain with `host`, or every vPool host
/// when `host` has no regular domain. Secondary: hosts for which a recovery
/// domain of `host` is regular, minus the primary set. Only hosts carrying a
/// StorageDriver of the vPool qualify; `excluded` hosts never do.
pub fn host_locality(
    tables: &Tables,
    vpool: VPoolId,
    host: StorageRouterId,
    excluded: &BTreeSet<StorageRouterId>,
) -> Locality {
    let vpool_hosts = tables.vpool_hosts(vpool);
    let members_of = |domains: BTreeSet<_>| -> BTreeSet<StorageRouterId> {
        domains
            .into_iter()
            .flat_map(|d| tables.storagerouters_in_domain(d))
            .filter(|sr| vpool_hosts.contains(sr) && !excluded.contains(sr))
            .collect()
    };

    let regular = tables.domains_of(host, false);
    let primary = if regular.is_empty() {
        vpool_hosts
            .iter()
            .filter(|sr| !excluded.contains(sr))
            .copied()
            .collect()
    } else {
        members_of(regular)
    };
    let secondary = members_of(tables.domains_of(host, true))
        .difference(&primary)
        .copied()
        .collect();

    Locality { primary, secondary }
}

pub fn vdisk_locality(
    tables: &Tables,
    vdisk: &VDisk,
    excluded: &BTreeSet<StorageRouterId>,
) -> Result<Locality> {
    let host = vdisk.storagerouter.ok_or_else(|| {
        crate::Error::PreconditionFailed(format!("vDisk {} is not attached to a host", vdisk.name))
    })?;
    Ok(host_locality(tables, vdisk.vpool, host, excluded))
}

/// How many of `safety` copies go to the primary and secondary sets
pub fn recommended_split(safety: usize, has_secondary: bool) -> (usize, usize) {
    if has_secondary {
        let primary = safety.div_ceil(2);
        (primary, safety - primary)
    } else {
        (safety, 0)
    }
}

/// Distance between two hosts as seen by the volume router cluster
pub fn node_distance(tables: &Tables, from: StorageRouterId, to: StorageRouterId) -> u32 {
    if from == to {
        return 0;
    }
    let to_regular = tables.domains_of(to, false);
    if !tables.domains_of(from, false).is_disjoint(&to_regular) {
        return DISTANCE_NEAR;
    }
    if !tables.domains_of(from, true).is_disjoint(&to_regular) {
        return DISTANCE_BACKUP;
    }
    DISTANCE_FAR
}

/// DTL candidate tiers for data of `vpool` on `host`, in priority order:
/// hosts in a recovery domain of `host`, hosts sharing a regular domain, and
/// every other vPool host. `host` itself never appears.
pub fn dtl_candidate_tiers(
    tables: &Tables,
    vpool: VPoolId,
    host: StorageRouterId,
) -> Vec<BTreeSet<StorageRouterId>> {
    let others: BTreeSet<StorageRouterId> = tables
        .vpool_hosts(vpool)
        .into_iter()
        .filter(|sr| *sr != host)
        .collect();
    let members_of = |domains: BTreeSet<_>| -> BTreeSet<StorageRouterId> {
        domains
            .into_iter()
            .flat_map(|d| tables.storagerouters_in_domain(d))
            .filter(|sr| others.contains(sr))
            .collect()
    };

    let backup = members_of(tables.domains_of(host, true));
    let regular: BTreeSet<_> = members_of(tables.domains_of(host, false))
        .difference(&backup)
        .copied()
        .collect();
    let rest = others
        .iter()
        .filter(|sr| !backup.contains(sr) && !regular.contains(sr))
        .copied()
        .collect();
    vec![backup, regular, rest]
}
