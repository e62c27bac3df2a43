//! vPool installation: parameters, ports, partitions, proxy and
//! StorageDriver configs, and the add/extend/remove flows.

pub mod installer;
pub mod params;
pub mod partitions;
pub mod ports;
pub mod proxy;
pub mod sdconfig;

pub use installer::{
    add_vpool, compute_cluster_node_config, remove_storagedriver, AddVPoolReport, RemovalReport,
};
pub use params::VPoolParameters;
