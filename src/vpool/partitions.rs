//! Partition layout of a new StorageDriver

use crate::common::Result;
use crate::dal::{
    DiskPartition, DiskRole, StorageDriverId, StorageDriverPartition, StorageDriverPartitionId,
    SubRole,
};
use std::collections::BTreeMap;

const GIB: u64 = 1024 * 1024 * 1024;
/// Smallest SCO cache from which the writecache gaps are fixed sizes
const FIXED_GAP_THRESHOLD: u64 = 20 * GIB;

/// Sub-partitions to create, with the values the StorageDriver config needs
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub partitions: Vec<StorageDriverPartition>,
    /// `(path, size)` of every SCO cache
    pub sco_mount_points: Vec<(String, u64)>,
    pub fcache_paths: Vec<(String, u64)>,
    pub fd_path: String,
    pub tlog_path: String,
    pub metadata_path: String,
    pub dtl_path: String,
    pub smallest_sco: u64,
}

impl PartitionPlan {
    /// Directories to create on the host
    pub fn dirs(&self) -> Vec<String> {
        self.partitions.iter().map(|p| p.path.clone()).collect()
    }

    /// Writecache `(trigger_gap, backoff_gap)` in bytes
    pub fn gaps(&self) -> (u64, u64) {
        writecache_gaps(self.smallest_sco)
    }
}

pub fn writecache_gaps(smallest_sco: u64) -> (u64, u64) {
    if smallest_sco >= FIXED_GAP_THRESHOLD {
        (GIB, 2 * GIB)
    } else {
        (smallest_sco * 5 / 100, smallest_sco * 10 / 100)
    }
}

fn with_role<'a>(partitions: &[&'a DiskPartition], role: DiskRole) -> Vec<&'a DiskPartition> {
    let mut found: Vec<&DiskPartition> = partitions
        .iter()
        .copied()
        .filter(|p| p.roles.contains(&role))
        .collect();
    found.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
    found
}

fn missing(role: &str) -> crate::Error {
    crate::Error::PreconditionFailed(format!("host has no {} partition", role))
}

/// Lay out the sub-partitions of a StorageDriver over the host partitions.
/// `free` maps each mountpoint to its available bytes. With `local_cache`,
/// 10% of the largest WRITE partition goes to the fragment caches of the
/// proxies and its SCO cache shrinks to 88%.
pub fn plan_partitions(
    partitions: &[&DiskPartition],
    free: &BTreeMap<String, u64>,
    storagedriver: StorageDriverId,
    vpool_name: &str,
    proxies: usize,
    local_cache: bool,
) -> Result<PartitionPlan> {
    let writes = with_role(partitions, DiskRole::Write);
    let db = *with_role(partitions, DiskRole::Db)
        .first()
        .ok_or_else(|| missing("DB"))?;
    let dtl = *with_role(partitions, DiskRole::Dtl)
        .first()
        .ok_or_else(|| missing("DTL"))?;
    let free_of = |p: &DiskPartition| free.get(&p.mountpoint).copied().unwrap_or(0);
    let largest = writes
        .iter()
        .copied()
        .max_by(|a, b| free_of(*a).cmp(&free_of(*b)).then(b.mountpoint.cmp(&a.mountpoint)))
        .ok_or_else(|| missing("WRITE"))?;

    let mut rows = Vec::new();
    let mut add = |partition: &DiskPartition,
                   role: DiskRole,
                   sub_role: Option<SubRole>,
                   number: u32,
                   size: Option<u64>,
                   path: String| {
        rows.push(StorageDriverPartition {
            id: StorageDriverPartitionId::new(),
            storagedriver,
            partition: partition.id,
            role,
            sub_role,
            number,
            size,
            path: path.clone(),
            mds_service: None,
        });
        path
    };

    let mut sco_mount_points = Vec::new();
    for (number, partition) in writes.iter().copied().enumerate() {
        let share = if local_cache && partition.id == largest.id { 88 } else { 98 };
        let size = free_of(partition) * share / 100;
        let path = add(
            partition,
            DiskRole::Write,
            Some(SubRole::Sco),
            number as u32,
            Some(size),
            format!("{}/sco_{}", partition.mountpoint, vpool_name),
        );
        sco_mount_points.push((path, size));
    }

    let mut fcache_paths = Vec::new();
    if local_cache {
        let size = free_of(largest) / 10 / proxies.max(1) as u64;
        for number in 0..proxies {
            let path = add(
                largest,
                DiskRole::Write,
                Some(SubRole::Fcache),
                number as u32,
                Some(size),
                format!("{}/fcache_{}_{}", largest.mountpoint, vpool_name, number),
            );
            fcache_paths.push((path, size));
        }
    }

    let fd_path = add(
        largest,
        DiskRole::Write,
        Some(SubRole::Fd),
        0,
        None,
        format!("{}/fd_{}", largest.mountpoint, vpool_name),
    );
    let tlog_path = add(
        db,
        DiskRole::Db,
        Some(SubRole::Tlog),
        0,
        None,
        format!("{}/tlogs_{}", db.mountpoint, vpool_name),
    );
    let metadata_path = add(
        db,
        DiskRole::Db,
        Some(SubRole::Md),
        0,
        None,
        format!("{}/metadata_{}", db.mountpoint, vpool_name),
    );
    let dtl_path = add(
        dtl,
        DiskRole::Dtl,
        None,
        0,
        None,
        format!("{}/foc_{}", dtl.mountpoint, vpool_name),
    );

    let smallest_sco = sco_mount_points
        .iter()
        .map(|(_, size)| *size)
        .min()
        .unwrap_or(0);
    Ok(PartitionPlan {
        partitions: rows,
        sco_mount_points,
        fcache_paths,
        fd_path,
        tlog_path,
        metadata_path,
        dtl_path,
        smallest_sco,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{DiskPartitionId, StorageRouterId};

    fn partition(mountpoint: &str, roles: &[DiskRole]) -> DiskPartition {
        DiskPartition {
            id: DiskPartitionId::new(),
            storagerouter: StorageRouterId::new(),
            mountpoint: mountpoint.into(),
            size: 0,
            roles: roles.to_vec(),
        }
    }

    #[test]
    fn test_layout_with_local_cache() {
        let w1 = partition("/mnt/ssd1", &[DiskRole::Write]);
        let w2 = partition("/mnt/ssd2", &[DiskRole::Write]);
        let db = partition("/mnt/db", &[DiskRole::Db, DiskRole::Dtl]);
        let free: BTreeMap<String, u64> = [
            ("/mnt/ssd1".to_string(), 100 * GIB),
            ("/mnt/ssd2".to_string(), 50 * GIB),
            ("/mnt/db".to_string(), 10 * GIB),
        ]
        .into_iter()
        .collect();

        let plan = plan_partitions(&[&w1, &w2, &db], &free, StorageDriverId::new(), "pool", 2, true)
            .unwrap();
        assert_eq!(
            plan.sco_mount_points,
            vec![
                ("/mnt/ssd1/sco_pool".to_string(), 88 * GIB),
                ("/mnt/ssd2/sco_pool".to_string(), 49 * GIB),
            ]
        );
        assert_eq!(plan.fcache_paths.len(), 2);
        assert_eq!(plan.fcache_paths[0].1, 5 * GIB);
        assert_eq!(plan.fd_path, "/mnt/ssd1/fd_pool");
        assert_eq!(plan.tlog_path, "/mnt/db/tlogs_pool");
        assert_eq!(plan.metadata_path, "/mnt/db/metadata_pool");
        assert_eq!(plan.dtl_path, "/mnt/db/foc_pool");
        assert_eq!(plan.smallest_sco, 49 * GIB);
        assert_eq!(plan.gaps(), (GIB, 2 * GIB));
        // 2 SCO + 2 FCACHE + FD + TLOG + MD + DTL
        assert_eq!(plan.partitions.len(), 8);
    }

    #[test]
    fn test_small_sco_gaps_are_relative() {
        assert_eq!(writecache_gaps(10 * GIB), (GIB / 2, GIB));
    }

    #[test]
    fn test_missing_roles() {
        let w = partition("/mnt/ssd1", &[DiskRole::Write]);
        let free = BTreeMap::new();
        let err = plan_partitions(&[&w], &free, StorageDriverId::new(), "pool", 1, false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("no DB partition"));
    }
}
