//! MDS safety scenarios against the simulated cluster

mod common;

use common::{ip, Cluster, MDS_PORT};
use ovs_control::clients::sim::FaultKind;
use ovs_control::clients::{MdsNodeConfig, MdsRole, VolumeStatus};
use ovs_control::dal::{DiskRole, StorageRouter, VPoolId, VPoolStatus};
use ovs_control::mds::{ensure_safety, sync_vdisk_to_reality, SafetyOutcome};
use ovs_control::Error;
use std::collections::BTreeSet;

/// `n` hosts, each with a StorageDriver and one MDS service of a vPool
fn cluster(n: usize) -> (Cluster, VPoolId, Vec<StorageRouter>, Vec<MdsNodeConfig>) {
    let cluster = Cluster::new();
    let vpool = cluster.add_vpool("pool");
    let mut hosts = Vec::new();
    let mut sockets = Vec::new();
    for i in 1..=n {
        let host = cluster.add_host(i);
        cluster.add_storagedriver(vpool, &host);
        sockets.push(cluster.add_mds(vpool, &host, MDS_PORT));
        hosts.push(host);
    }
    (cluster, vpool, hosts, sockets)
}

fn config_of(cluster: &Cluster, volume: &str) -> Vec<MdsNodeConfig> {
    cluster.sim.volume(volume).unwrap().mds_config
}

#[tokio::test]
async fn test_single_node_vpool() {
    let (cluster, vpool, hosts, sockets) = cluster(1);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);

    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    assert_eq!(outcome, SafetyOutcome::Unchanged);
    assert_eq!(config_of(&cluster, "v1"), vec![sockets[0].clone()]);
    assert_eq!(cluster.junctions(vdisk), vec![sockets[0].clone()]);

    // Idempotent
    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    assert_eq!(outcome, SafetyOutcome::Unchanged);
    assert!(cluster
        .sim
        .calls_matching("update_metadata_backend_config")
        .is_empty());
}

#[tokio::test]
async fn test_promote_local_slave() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(
        vpool,
        &hosts[0],
        "v1",
        vec![sockets[1].clone(), sockets[0].clone()],
    );
    cluster.sim.set_tlogs_behind(&ip(1), MDS_PORT, "v1", 10);

    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    let expected = vec![sockets[0].clone(), sockets[1].clone()];
    assert_eq!(
        outcome,
        SafetyOutcome::Reconfigured {
            config: expected.clone()
        }
    );
    assert_eq!(config_of(&cluster, "v1"), expected);
    assert_eq!(cluster.junctions(vdisk), expected);

    // Dry run first, then the real catch-up of the local slave
    let catch_ups = cluster
        .sim
        .calls_matching(&format!("catch_up {}:{}", ip(1), MDS_PORT));
    assert_eq!(catch_ups.len(), 2);
    assert!(catch_ups[0].ends_with("dry_run=true"));
    assert!(catch_ups[1].ends_with("dry_run=false"));

    // The outgoing master is dropped in a first push and re-added as slave
    let pushes = cluster.sim.calls_matching("update_metadata_backend_config");
    assert_eq!(pushes.len(), 2);
    assert!(pushes[0].ends_with(&format!("[{}]", sockets[0])));
    assert_eq!(
        cluster.sim.role(&ip(1), MDS_PORT, "v1"),
        Some(MdsRole::Master)
    );
    assert_eq!(cluster.sim.role(&ip(2), MDS_PORT, "v1"), Some(MdsRole::Slave));
}

#[tokio::test]
async fn test_deferred_promotion() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let current = vec![sockets[1].clone(), sockets[0].clone()];
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", current.clone());
    cluster.sim.set_tlogs_behind(&ip(1), MDS_PORT, "v1", 1000);

    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    assert_eq!(outcome, SafetyOutcome::Unchanged);
    assert_eq!(config_of(&cluster, "v1"), current);
    let catch_ups = cluster
        .sim
        .calls_matching(&format!("catch_up {}:{}", ip(1), MDS_PORT));
    assert_eq!(catch_ups.len(), 1);
    assert!(catch_ups[0].ends_with("dry_run=true"));

    // Once the slave has caught up the swap completes
    cluster.sim.set_tlogs_behind(&ip(1), MDS_PORT, "v1", 20);
    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    let expected = vec![sockets[0].clone(), sockets[1].clone()];
    assert_eq!(
        outcome,
        SafetyOutcome::Reconfigured {
            config: expected.clone()
        }
    );
    assert_eq!(config_of(&cluster, "v1"), expected);
}

#[tokio::test]
async fn test_excluded_slave_host_is_replaced() {
    let (cluster, vpool, hosts, sockets) = cluster(4);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", sockets[..3].to_vec());

    let excluded = BTreeSet::from([hosts[1].id]);
    let outcome = ensure_safety(&ctx, vdisk, &excluded).await.unwrap();
    let config = match outcome {
        SafetyOutcome::Reconfigured { config } => config,
        other => panic!("expected a reconfiguration, got {:?}", other),
    };
    assert_eq!(config.len(), 3);
    assert_eq!(config[0], sockets[0]);
    assert!(!config.contains(&sockets[1]));
    assert!(config.contains(&sockets[3]));
    assert!(cluster
        .sim
        .namespaces(&ip(4), MDS_PORT)
        .contains(&"v1".to_string()));
    assert_eq!(cluster.sim.role(&ip(4), MDS_PORT, "v1"), Some(MdsRole::Slave));
}

#[tokio::test]
async fn test_excluding_the_vdisk_host_is_refused() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);

    let excluded = BTreeSet::from([hosts[0].id]);
    let err = ensure_safety(&ctx, vdisk, &excluded).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_halted_volume_is_refused() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);
    cluster.sim.set_volume_status("v1", VolumeStatus::Halted);

    let err = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
    assert_eq!(config_of(&cluster, "v1"), vec![sockets[0].clone()]);
}

#[tokio::test]
async fn test_domains_split_primary_and_recovery() {
    let (cluster, vpool, hosts, sockets) = cluster(4);
    cluster.join_domain(&hosts[0], "dc1", false);
    cluster.join_domain(&hosts[1], "dc1", false);
    cluster.join_domain(&hosts[2], "dc2", false);
    cluster.join_domain(&hosts[3], "dc2", false);
    cluster.join_domain(&hosts[0], "dc2", true);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);

    ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    let config = config_of(&cluster, "v1");
    assert_eq!(config.len(), 3);
    assert_eq!(config[0], sockets[0]);
    assert_eq!(config[1], sockets[1]);
    assert!(config[2] == sockets[2] || config[2] == sockets[3]);

    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    assert_eq!(outcome, SafetyOutcome::Unchanged);
}

#[tokio::test]
async fn test_too_much_safety_is_reduced() {
    let (cluster, vpool, hosts, sockets) = cluster(3);
    cluster.set_mds_config(vpool, 2, 100);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", sockets.clone());

    ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    let config = config_of(&cluster, "v1");
    assert_eq!(config.len(), 2);
    assert_eq!(config[0], sockets[0]);
    let dropped = sockets.iter().find(|s| !config.contains(s)).unwrap();
    assert!(!cluster
        .sim
        .namespaces(&dropped.ip, dropped.port)
        .contains(&"v1".to_string()));
    assert_eq!(cluster.junctions(vdisk), config);
}

#[tokio::test]
async fn test_unreachable_hosts_are_skipped() {
    let (cluster, vpool, hosts, sockets) = cluster(3);
    cluster.sim.set_reachable(&ip(3), false);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);

    ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    assert_eq!(
        config_of(&cluster, "v1"),
        vec![sockets[0].clone(), sockets[1].clone()]
    );

    // Nothing better exists while host 3 is down
    let outcome = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    assert_eq!(outcome, SafetyOutcome::Unchanged);
}

#[tokio::test]
async fn test_failed_push_removes_new_namespaces() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);
    cluster
        .sim
        .fail_once("update_metadata_backend_config", None, FaultKind::Upstream);

    let err = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamError(_)));
    assert_eq!(config_of(&cluster, "v1"), vec![sockets[0].clone()]);
    assert!(cluster.sim.namespaces(&ip(2), MDS_PORT).is_empty());
}

#[tokio::test]
async fn test_push_timeout_leaves_state_for_manual_repair() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);
    cluster
        .sim
        .fail_once("update_metadata_backend_config", None, FaultKind::Timeout);

    let err = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamTimeout(_)));
    assert!(cluster
        .sim
        .namespaces(&ip(2), MDS_PORT)
        .contains(&"v1".to_string()));
}

#[tokio::test]
async fn test_reality_sync_adopts_unknown_socket() {
    let (cluster, vpool, hosts, sockets) = cluster(1);
    let second = cluster.add_host(2);
    cluster.add_storagedriver(vpool, &second);
    cluster.add_partition(&second, "/mnt/db", &[DiskRole::Db]);
    let ctx = cluster.context("m1");
    let unknown = MdsNodeConfig::new(ip(2), 26350);
    let vdisk = cluster.add_vdisk(
        vpool,
        &hosts[0],
        "v1",
        vec![sockets[0].clone(), unknown.clone()],
    );

    sync_vdisk_to_reality(&ctx, vdisk).await.unwrap();
    assert_eq!(cluster.junctions(vdisk), vec![sockets[0].clone(), unknown]);
    let adopted = cluster
        .dal
        .read(|t| t.mds_service_by_socket(vpool, &ip(2), 26350));
    assert!(adopted.is_some());
    assert!(cluster.sim.dirs(&ip(2)).contains("/mnt/db/mds_pool_0"));
}

#[tokio::test]
async fn test_vpool_must_be_running() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);
    cluster
        .dal
        .write(|t| {
            t.vpool_mut(vpool)?.status = VPoolStatus::Extending;
            Ok(())
        })
        .unwrap();

    let err = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
    assert!(cluster.sim.calls_matching("create_namespace").is_empty());
    assert!(cluster
        .sim
        .calls_matching("update_metadata_backend_config")
        .is_empty());
}

#[tokio::test]
async fn test_failed_demotion_is_fatal() {
    let (cluster, vpool, hosts, sockets) = cluster(2);
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(
        vpool,
        &hosts[0],
        "v1",
        vec![sockets[1].clone(), sockets[0].clone()],
    );
    cluster.sim.set_tlogs_behind(&ip(1), MDS_PORT, "v1", 10);
    cluster.sim.fail_once(
        "set_role",
        Some(&format!("{}:{}", ip(2), MDS_PORT)),
        FaultKind::Upstream,
    );

    let err = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "{:?}", err);
    // The router already runs the new config; only the demotion is missing
    assert_eq!(
        config_of(&cluster, "v1"),
        vec![sockets[0].clone(), sockets[1].clone()]
    );
    assert_eq!(
        cluster.sim.role(&ip(2), MDS_PORT, "v1"),
        Some(MdsRole::Master)
    );
}

#[tokio::test]
async fn test_failed_namespace_creation_rolls_back() {
    let (cluster, vpool, hosts, sockets) = cluster(3);
    let ctx = cluster.context("m1");
    // A vdisk on host 3 makes its MDS the busier one, so host 2 is created first
    let busy = cluster.add_vdisk(vpool, &hosts[2], "v2", vec![sockets[2].clone()]);
    sync_vdisk_to_reality(&ctx, busy).await.unwrap();
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);
    let third = format!("{}:{}", ip(3), MDS_PORT);
    cluster
        .sim
        .fail_once("create_namespace", Some(&third), FaultKind::Upstream);

    let err = ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamError(_)), "{:?}", err);

    let second = format!("{}:{}", ip(2), MDS_PORT);
    assert_eq!(
        cluster
            .sim
            .calls_matching(&format!("create_namespace {} v1", second))
            .len(),
        1
    );
    assert_eq!(
        cluster
            .sim
            .calls_matching(&format!("remove_namespace {} v1", second))
            .len(),
        1
    );
    assert!(cluster.sim.namespaces(&ip(2), MDS_PORT).is_empty());
    assert_eq!(config_of(&cluster, "v1"), vec![sockets[0].clone()]);
    assert!(cluster
        .sim
        .calls_matching("update_metadata_backend_config")
        .is_empty());
}

#[tokio::test]
async fn test_unknown_master_socket_marks_no_master() {
    let (cluster, vpool, hosts, sockets) = cluster(1);
    let ctx = cluster.context("m1");
    let foreign = MdsNodeConfig::new("10.0.9.9".to_string(), MDS_PORT);
    let vdisk = cluster.add_vdisk(
        vpool,
        &hosts[0],
        "v1",
        vec![foreign, sockets[0].clone()],
    );

    sync_vdisk_to_reality(&ctx, vdisk).await.unwrap();
    assert_eq!(cluster.junctions(vdisk), vec![sockets[0].clone()]);
    cluster.dal.read(|t| {
        assert!(t.mds_junctions_of(vdisk).iter().all(|j| !j.is_master));
    });
}
