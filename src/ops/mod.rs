//! Ops commands: periodic checkups and node bootstrap

pub mod checkup;
pub mod node;

pub use checkup::{catchup_checkup, mds_checkup, CatchUpCheckupReport, MdsCheckupReport};
pub use node::{add_domain, init_node, install_node, InitNodeOptions, InstallNodeOptions, PartitionSpec};
