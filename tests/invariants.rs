//! Placement invariants over random cluster layouts

mod common;

use common::{Cluster, MDS_PORT};
use ovs_control::dal::StorageRouterId;
use ovs_control::dtl::{ensure_dtl, DtlOutcome};
use ovs_control::locality::host_locality;
use ovs_control::mds::ensure_safety;
use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Per host: an optional regular domain and an optional recovery domain
type Layout = Vec<(Option<usize>, Option<usize>)>;

struct Placement {
    /// MDS hosts in config order, taken from the volume router
    config_hosts: Vec<StorageRouterId>,
    junction_hosts: Vec<StorageRouterId>,
    masters: usize,
    candidates: usize,
    primary: BTreeSet<StorageRouterId>,
    has_regular_domain: bool,
    dtl_first: DtlOutcome,
    dtl_second: DtlOutcome,
    dtl_unchanged: bool,
}

async fn place(layout: &Layout, safety: usize) -> Placement {
    let cluster = Cluster::new();
    let vpool = cluster.add_vpool("pool");
    cluster.set_mds_config(vpool, safety, 100);
    let mut hosts = Vec::new();
    let mut sockets = Vec::new();
    for (i, (regular, backup)) in layout.iter().enumerate() {
        let host = cluster.add_host(i + 1);
        cluster.add_storagedriver(vpool, &host);
        sockets.push(cluster.add_mds(vpool, &host, MDS_PORT));
        if let Some(d) = regular {
            cluster.join_domain(&host, &format!("dc{}", d), false);
        }
        if let Some(d) = backup {
            cluster.join_domain(&host, &format!("dc{}", d), true);
        }
        hosts.push(host);
    }
    let ctx = cluster.context("m1");
    let vdisk = cluster.add_vdisk(vpool, &hosts[0], "v1", vec![sockets[0].clone()]);

    ensure_safety(&ctx, vdisk, &BTreeSet::new()).await.unwrap();
    let dtl_first = ensure_dtl(&ctx, vdisk).await.unwrap();
    let dtl_before = cluster.sim.volume("v1").unwrap();
    let dtl_second = ensure_dtl(&ctx, vdisk).await.unwrap();
    let dtl_after = cluster.sim.volume("v1").unwrap();

    let host_of = |ip: &str| {
        hosts
            .iter()
            .find(|h| h.ip == ip)
            .map(|h| h.id)
            .unwrap()
    };
    let config_hosts = dtl_after
        .mds_config
        .iter()
        .map(|n| host_of(&n.ip))
        .collect();
    let (junction_hosts, masters, locality, has_regular_domain) = cluster.dal.read(|t| {
        let junctions = t.mds_junctions_of(vdisk);
        let junction_hosts = junctions
            .iter()
            .map(|j| t.mds_socket(j.mds_service).unwrap().0)
            .collect::<Vec<_>>();
        let masters = junctions.iter().filter(|j| j.is_master).count();
        let locality = host_locality(t, vpool, hosts[0].id, &BTreeSet::new());
        (
            junction_hosts,
            masters,
            locality,
            !t.domains_of(hosts[0].id, false).is_empty(),
        )
    });

    Placement {
        config_hosts,
        junction_hosts,
        masters,
        candidates: locality.primary.len() + locality.secondary.len(),
        primary: locality.primary,
        has_regular_domain,
        dtl_first,
        dtl_second,
        dtl_unchanged: dtl_before.dtl == dtl_after.dtl
            && dtl_before.dtl_mode == dtl_after.dtl_mode,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_mds_and_dtl_placement(
        layout in vec((option::of(0..3usize), option::of(0..3usize)), 2..6),
        safety in 1..=5usize,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let p = runtime.block_on(place(&layout, safety));

        let distinct: BTreeSet<_> = p.config_hosts.iter().collect();
        prop_assert_eq!(distinct.len(), p.config_hosts.len());
        prop_assert_eq!(distinct.len(), safety.min(p.candidates));

        let junction_distinct: BTreeSet<_> = p.junction_hosts.iter().collect();
        prop_assert_eq!(junction_distinct.len(), p.junction_hosts.len());
        prop_assert_eq!(&p.junction_hosts, &p.config_hosts);
        prop_assert_eq!(p.masters, 1);

        if p.has_regular_domain {
            prop_assert!(p.primary.contains(&p.config_hosts[0]));
        }

        prop_assert_eq!(p.dtl_second, DtlOutcome::Unchanged, "first run: {:?}", p.dtl_first);
        prop_assert!(p.dtl_unchanged);
    }
}
