//! Key layout of the cluster config store

use std::fmt::Display;

/// Cluster id of the volume driver Arakoon cluster
pub const ARAKOON_VOLDRV: &str = "/ovs/framework/arakoon_clusters|voldrv";

/// Message queue settings (`user`, `password`, `protocol`, `queues.storagedriver`)
pub const MESSAGEQUEUE: &str = "/ovs/framework/messagequeue";

pub fn host_root(machine_id: &str) -> String {
    format!("/ovs/framework/hosts/{}", machine_id)
}

pub fn host_ip(machine_id: &str) -> String {
    format!("/ovs/framework/hosts/{}/ip", machine_id)
}

/// Port ranges of a host; address a range with `|mds` or `|storagedriver`
pub fn host_ports(machine_id: &str) -> String {
    format!("/ovs/framework/hosts/{}/ports", machine_id)
}

pub fn host_version(machine_id: &str) -> String {
    format!("/ovs/framework/hosts/{}/version", machine_id)
}

/// Install-time options of a host (`extra_filesystems`)
pub fn host_setup(machine_id: &str) -> String {
    format!("/ovs/framework/hosts/{}/setup", machine_id)
}

pub fn vpool_root(vpool_id: impl Display) -> String {
    format!("/ovs/vpools/{}", vpool_id)
}

pub fn mds_config(vpool_id: impl Display) -> String {
    format!("/ovs/vpools/{}/mds_config", vpool_id)
}

pub fn storagedriver_root(vpool_id: impl Display, storagedriver_id: &str) -> String {
    format!("/ovs/vpools/{}/hosts/{}", vpool_id, storagedriver_id)
}

pub fn storagedriver_section(
    vpool_id: impl Display,
    storagedriver_id: &str,
    section: &str,
) -> String {
    format!(
        "/ovs/vpools/{}/hosts/{}/config/{}",
        vpool_id, storagedriver_id, section
    )
}

pub fn proxy_root(vpool_id: impl Display, proxy_id: impl Display) -> String {
    format!("/ovs/vpools/{}/proxies/{}", vpool_id, proxy_id)
}

pub fn proxy_main(vpool_id: impl Display, proxy_id: impl Display) -> String {
    format!("/ovs/vpools/{}/proxies/{}/config/main", vpool_id, proxy_id)
}

pub fn scrub_proxy(vpool_id: impl Display) -> String {
    format!("/ovs/vpools/{}/proxies/scrub/generic_scrub", vpool_id)
}

pub fn alba_backend_config(alba_id: &str) -> String {
    format!("/ovs/alba/backends/global/{}/config", alba_id)
}

pub fn alba_backend_config_ini(alba_id: &str) -> String {
    format!("/ovs/alba/backends/global/{}/config.ini", alba_id)
}

/// Arakoon config of a framework-managed cluster such as `voldrv`
pub fn arakoon_cluster_config(cluster_id: &str) -> String {
    format!("/ovs/arakoon/{}/config", cluster_id)
}

pub fn catchup(vdisk_id: impl Display) -> String {
    format!("/ovs/jobs/catchup/{}", vdisk_id)
}

pub fn lock(name: &str) -> String {
    format!("/ovs/locks/{}", name)
}
