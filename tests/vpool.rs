//! vPool creation, extension and removal through the installer

mod common;

use common::{ip, Cluster};
use ovs_control::clients::sim::FaultKind;
use ovs_control::clients::{volumedriver_service, MdsNodeConfig};
use ovs_control::dal::VPoolStatus;
use ovs_control::vpool::installer::{dtl_service, proxy_service, WATCHER_SERVICE};
use ovs_control::mds::sync_vdisk_to_reality;
use ovs_control::vpool::{add_vpool, remove_storagedriver};

#[tokio::test]
async fn test_create_extend_and_remove() {
    let cluster = Cluster::new();
    let first = cluster.bootstrap_host(1).await;
    let ctx = cluster.context("m1");

    let created = add_vpool(&ctx, &cluster.vpool_parameters("pool", &first))
        .await
        .unwrap();
    assert!(created.created_vpool);
    for service in [
        volumedriver_service("pool"),
        dtl_service("pool"),
        proxy_service("pool", 0),
        WATCHER_SERVICE.to_string(),
    ] {
        assert!(cluster.sim.is_running(&ip(1), &service), "{} not running", service);
    }
    assert_eq!(cluster.sim.registry(created.vpool).unwrap().len(), 1);
    assert_eq!(
        cluster.dal.read(|t| t.vpool(created.vpool).unwrap().status),
        VPoolStatus::Running
    );

    let second = cluster.bootstrap_host(2).await;
    let extended = add_vpool(&ctx, &cluster.vpool_parameters("pool", &second))
        .await
        .unwrap();
    assert!(!extended.created_vpool);
    assert_eq!(extended.vpool, created.vpool);
    assert_eq!(cluster.sim.registry(created.vpool).unwrap().len(), 2);

    let report = remove_storagedriver(&ctx, extended.storagedriver)
        .await
        .unwrap();
    assert!(!report.errors_found, "{:?}", report.errors);
    assert!(!report.vpool_removed);
    assert_eq!(cluster.sim.registry(created.vpool).unwrap().len(), 1);
    assert!(cluster.sim.dirs(&ip(2)).is_empty());
    assert!(cluster.sim.services(&ip(2)).is_empty());

    let report = remove_storagedriver(&ctx, created.storagedriver)
        .await
        .unwrap();
    assert!(!report.errors_found, "{:?}", report.errors);
    assert!(report.vpool_removed);
    assert!(cluster.dal.read(|t| t.vpool_by_name("pool").is_none()));
    assert!(cluster.sim.dirs(&ip(1)).is_empty());
    assert_eq!(cluster.sim.registry(created.vpool), None);
}

#[tokio::test]
async fn test_failed_creation_leaves_nothing_behind() {
    let cluster = Cluster::new();
    let host = cluster.bootstrap_host(1).await;
    let ctx = cluster.context("m1");
    cluster
        .sim
        .fail_once("update_cluster_node_configs", None, FaultKind::Upstream);

    add_vpool(&ctx, &cluster.vpool_parameters("pool", &host))
        .await
        .unwrap_err();

    cluster.dal.read(|t| {
        assert!(t.vpools.is_empty());
        assert!(t.storagedrivers.is_empty());
        assert!(t.storagedriver_partitions.is_empty());
        assert!(t.alba_proxies.is_empty());
        assert!(t.mds_services.is_empty());
    });
    assert!(cluster.sim.dirs(&ip(1)).is_empty());
    assert!(cluster.sim.services(&ip(1)).is_empty());
    assert!(cluster.sim.calls_matching("erase_node_configs").len() == 1);
}

#[tokio::test]
async fn test_failed_extension_restores_the_registry() {
    let cluster = Cluster::new();
    let first = cluster.bootstrap_host(1).await;
    let ctx = cluster.context("m1");
    let created = add_vpool(&ctx, &cluster.vpool_parameters("pool", &first))
        .await
        .unwrap();
    let before = cluster.sim.registry(created.vpool);

    let second = cluster.bootstrap_host(2).await;
    cluster
        .sim
        .fail_once("start_service", Some(&ip(2)), FaultKind::Upstream);
    add_vpool(&ctx, &cluster.vpool_parameters("pool", &second))
        .await
        .unwrap_err();

    assert_eq!(cluster.sim.registry(created.vpool), before);
    cluster.dal.read(|t| {
        assert_eq!(t.vpool(created.vpool).unwrap().status, VPoolStatus::Running);
        assert!(t.storagedriver_for(created.vpool, second.id).is_none());
        assert!(t.mds_services_on(created.vpool, second.id).is_empty());
    });
    assert!(cluster.sim.dirs(&ip(2)).is_empty());
    assert!(cluster.sim.services(&ip(2)).is_empty());
    assert!(cluster.sim.is_running(&ip(1), &volumedriver_service("pool")));
}

#[tokio::test]
async fn test_vdisks_block_the_removal() {
    let cluster = Cluster::new();
    let host = cluster.bootstrap_host(1).await;
    let ctx = cluster.context("m1");
    let created = add_vpool(&ctx, &cluster.vpool_parameters("pool", &host))
        .await
        .unwrap();
    cluster.add_vdisk(created.vpool, &host, "v1", Vec::new());

    let err = remove_storagedriver(&ctx, created.storagedriver)
        .await
        .unwrap_err();
    assert!(matches!(err, ovs_control::Error::PreconditionFailed(_)));
    assert_eq!(
        cluster.dal.read(|t| t.vpool(created.vpool).unwrap().status),
        VPoolStatus::Running
    );
}

#[tokio::test]
async fn test_rollback_removes_services_that_refuse_to_stop() {
    let cluster = Cluster::new();
    let host = cluster.bootstrap_host(1).await;
    let ctx = cluster.context("m1");
    cluster
        .sim
        .fail_once("update_cluster_node_configs", None, FaultKind::Upstream);
    cluster
        .sim
        .fail_always("stop_service", Some(&ip(1)), FaultKind::Upstream);

    add_vpool(&ctx, &cluster.vpool_parameters("pool", &host))
        .await
        .unwrap_err();

    assert_eq!(
        cluster
            .sim
            .calls_matching(&format!("stop_service {} {}", ip(1), WATCHER_SERVICE))
            .len(),
        1
    );
    assert!(cluster.sim.services(&ip(1)).is_empty());
    assert!(cluster.sim.dirs(&ip(1)).is_empty());
}

#[tokio::test]
async fn test_shrinking_moves_mds_off_the_leaving_host() {
    let cluster = Cluster::new();
    let first = cluster.bootstrap_host(1).await;
    let ctx = cluster.context("m1");
    let created = add_vpool(&ctx, &cluster.vpool_parameters("pool", &first))
        .await
        .unwrap();
    let second = cluster.bootstrap_host(2).await;
    let extended = add_vpool(&ctx, &cluster.vpool_parameters("pool", &second))
        .await
        .unwrap();

    let socket = |mds| {
        cluster.dal.read(|t| {
            let (_, ip, port) = t.mds_socket(mds).unwrap();
            MdsNodeConfig::new(ip, port)
        })
    };
    let (master, slave) = (socket(created.mds_service), socket(extended.mds_service));
    let vdisk = cluster.add_vdisk(created.vpool, &first, "v1", vec![master.clone(), slave]);
    sync_vdisk_to_reality(&ctx, vdisk).await.unwrap();

    let report = remove_storagedriver(&ctx, extended.storagedriver)
        .await
        .unwrap();
    assert!(!report.errors_found, "{:?}", report.errors);
    assert_eq!(
        cluster.sim.volume("v1").unwrap().mds_config,
        vec![master.clone()]
    );
    assert_eq!(cluster.junctions(vdisk), vec![master]);
    assert_eq!(
        cluster.dal.read(|t| t.vpool(created.vpool).unwrap().status),
        VPoolStatus::Running
    );
}
