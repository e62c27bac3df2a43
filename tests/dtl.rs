//! DTL placement scenarios against the simulated cluster

mod common;

use common::{ip, Cluster, MDS_PORT};
use ovs_control::clients::{DtlConfig, VolumeStatus};
use ovs_control::common::Cancellation;
use ovs_control::dal::{
    DtlMode, StorageRouter, VDiskDomain, VDiskDomainId, VDiskId, VPoolId,
};
use ovs_control::dtl::{
    clear_manual_dtl, dtl_checkup, ensure_dtl, set_manual_dtl, DtlOutcome, DtlScope,
};
use ovs_control::Error;

const DTL_PORT: u16 = 26202;

fn dtl_on(n: usize, mode: DtlMode) -> DtlConfig {
    DtlConfig {
        host: ip(n),
        port: DTL_PORT,
        mode,
    }
}

/// `n` hosts with a StorageDriver each and vdisk `v1` on host 1
fn cluster(n: usize) -> (Cluster, VPoolId, Vec<StorageRouter>, VDiskId) {
    let cluster = Cluster::new();
    let vpool = cluster.add_vpool("pool");
    let mut hosts = Vec::new();
    for i in 1..=n {
        let host = cluster.add_host(i);
        cluster.add_storagedriver(vpool, &host);
        hosts.push(host);
    }
    let mds = cluster.add_mds(vpool, &hosts[0], MDS_PORT);
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![mds]);
    (cluster, vpool, hosts, vdisk)
}

fn current_dtl(cluster: &Cluster) -> Option<DtlConfig> {
    cluster.sim.volume("v1").unwrap().dtl
}

#[tokio::test]
async fn test_dtl_is_sticky() {
    let (cluster, _, _, vdisk) = cluster(5);
    let ctx = cluster.context("m1");
    cluster.sim.set_dtl("v1", Some(dtl_on(3, DtlMode::Async)));

    assert_eq!(ensure_dtl(&ctx, vdisk).await.unwrap(), DtlOutcome::Unchanged);
    assert_eq!(current_dtl(&cluster), Some(dtl_on(3, DtlMode::Async)));

    cluster.sim.set_reachable(&ip(3), false);
    assert_eq!(
        ensure_dtl(&ctx, vdisk).await.unwrap(),
        DtlOutcome::Reconfigured {
            config: Some(dtl_on(2, DtlMode::Async))
        }
    );

    // Host 3 coming back does not pull the DTL back
    cluster.sim.set_reachable(&ip(3), true);
    assert_eq!(ensure_dtl(&ctx, vdisk).await.unwrap(), DtlOutcome::Unchanged);
    assert_eq!(current_dtl(&cluster), Some(dtl_on(2, DtlMode::Async)));
}

#[tokio::test]
async fn test_recovery_domain_tier_comes_first() {
    let (cluster, _, hosts, vdisk) = cluster(5);
    cluster.join_domain(&hosts[0], "dc1", false);
    cluster.join_domain(&hosts[1], "dc1", false);
    cluster.join_domain(&hosts[3], "dc2", false);
    cluster.join_domain(&hosts[4], "dc2", false);
    cluster.join_domain(&hosts[0], "dc2", true);
    let ctx = cluster.context("m1");

    ensure_dtl(&ctx, vdisk).await.unwrap();
    assert_eq!(current_dtl(&cluster), Some(dtl_on(4, DtlMode::Async)));

    // Recovery domain down: fall back to the regular domain
    cluster.sim.set_reachable(&ip(4), false);
    cluster.sim.set_reachable(&ip(5), false);
    ensure_dtl(&ctx, vdisk).await.unwrap();
    assert_eq!(current_dtl(&cluster), Some(dtl_on(2, DtlMode::Async)));
}

#[tokio::test]
async fn test_no_candidate_removes_the_dtl() {
    let (cluster, _, _, vdisk) = cluster(2);
    let ctx = cluster.context("m1");
    cluster.sim.set_dtl("v1", Some(dtl_on(2, DtlMode::Async)));
    cluster.sim.set_reachable(&ip(2), false);

    assert_eq!(
        ensure_dtl(&ctx, vdisk).await.unwrap(),
        DtlOutcome::Reconfigured { config: None }
    );
    assert_eq!(current_dtl(&cluster), None);
}

#[tokio::test]
async fn test_no_sync_vpool_has_no_dtl() {
    let (cluster, vpool, _, vdisk) = cluster(3);
    cluster
        .dal
        .write(|t| {
            t.vpool_mut(vpool)?.configuration.dtl_mode = DtlMode::NoSync;
            Ok(())
        })
        .unwrap();
    cluster.sim.set_dtl("v1", Some(dtl_on(2, DtlMode::Async)));
    let ctx = cluster.context("m1");

    ensure_dtl(&ctx, vdisk).await.unwrap();
    assert_eq!(current_dtl(&cluster), None);
}

#[tokio::test]
async fn test_sync_domain_pins_the_mode() {
    let (cluster, _, hosts, vdisk) = cluster(3);
    cluster.join_domain(&hosts[0], "dc1", false);
    let domain = cluster.dal.read(|t| t.domain_by_name("dc1").unwrap().id);
    cluster
        .dal
        .write(|t| {
            let junction = VDiskDomain {
                id: VDiskDomainId::new(),
                vdisk,
                domain,
                sync: true,
            };
            t.vdisk_domains.insert(junction.id, junction);
            Ok(())
        })
        .unwrap();
    let ctx = cluster.context("m1");

    ensure_dtl(&ctx, vdisk).await.unwrap();
    assert_eq!(current_dtl(&cluster), Some(dtl_on(2, DtlMode::Sync)));
}

#[tokio::test]
async fn test_halted_volume_is_skipped() {
    let (cluster, _, _, vdisk) = cluster(3);
    cluster.sim.set_volume_status("v1", VolumeStatus::Halted);
    let ctx = cluster.context("m1");

    assert_eq!(ensure_dtl(&ctx, vdisk).await.unwrap(), DtlOutcome::Halted);
    assert!(cluster.sim.calls_matching("set_manual_dtl_config").is_empty());
}

#[tokio::test]
async fn test_manual_dtl() {
    let (cluster, _, hosts, vdisk) = cluster(5);
    let ctx = cluster.context("m1");

    let err = set_manual_dtl(&ctx, vdisk, Some(hosts[0].id), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    let config = set_manual_dtl(&ctx, vdisk, Some(hosts[3].id), Some(DtlMode::NoSync))
        .await
        .unwrap();
    assert_eq!(config, Some(dtl_on(4, DtlMode::Async)));
    assert!(cluster.dal.read(|t| t.vdisk(vdisk).unwrap().has_manual_dtl));

    // The checkups leave a manual DTL alone, even when its host is down
    cluster.sim.set_reachable(&ip(4), false);
    assert_eq!(ensure_dtl(&ctx, vdisk).await.unwrap(), DtlOutcome::Manual);
    assert_eq!(current_dtl(&cluster), Some(dtl_on(4, DtlMode::Async)));

    cluster.sim.set_reachable(&ip(4), true);
    assert_eq!(
        clear_manual_dtl(&ctx, vdisk).await.unwrap(),
        DtlOutcome::Unchanged
    );
    assert!(!cluster.dal.read(|t| t.vdisk(vdisk).unwrap().has_manual_dtl));
}

#[tokio::test]
async fn test_checkup_report() {
    let (cluster, vpool, hosts, vdisk) = cluster(3);
    let mds = cluster.add_mds(vpool, &hosts[1], MDS_PORT);
    cluster.add_vdisk(vpool, &hosts[1], "v2", vec![mds]);
    cluster.sim.set_dtl("v1", Some(dtl_on(2, DtlMode::Async)));
    let ctx = cluster.context("m1");
    let cancel = Cancellation::new();

    let report = dtl_checkup(&ctx, DtlScope::All, &cancel).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.reconfigured, 1);
    assert!(report.errors.is_empty());

    let report = dtl_checkup(&ctx, DtlScope::VDisk(vdisk), &cancel)
        .await
        .unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.reconfigured, 0);

    let err = dtl_checkup(&ctx, DtlScope::VPool(VPoolId::new()), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
