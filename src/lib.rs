//! # ovs-control
//!
//! Volume-placement and metadata-safety control plane for Open vStorage
//! clusters:
//! - MDS safety: every vdisk keeps a master and enough slaves spread over
//!   recovery domains, with lagging slaves caught up first
//! - DTL placement: the write mirror of each vdisk lives on a nearby host
//! - vPool installation: StorageDrivers are added and removed with full
//!   rollback of partial deployments
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          ovs-controller (master)         │
//! │  admin API · periodic MDS/DTL checkups   │
//! │        DAL (RocksDB)  ·  CCS client      │
//! └───────────┬──────────────────────────────┘
//!             │ JSON over HTTP
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼──────────┐
//! │ host agent │   │ volume     │   │ MDS          │
//! │ (/agent)   │   │ router     │   │ services     │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a controller
//! ```bash
//! ovs-controller serve --config /etc/ovs/controller.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! ovs install-node --machine-id m1 --ip 10.100.1.1
//! ovs init-node --machine-id m1 --ip 10.100.1.1 --join-masters \
//!     --partition /mnt/ssd1:WRITE,DTL --partition /mnt/db:DB
//! ovs domain add 10.100.1.1 rack-a
//! ovs init-vpool --ip 10.100.1.1 --name pool1 --backend-id b1 ...
//! ovs checkup mds
//! ```

#![allow(clippy::result_large_err)]

pub mod ccs;
pub mod clients;
pub mod common;
pub mod context;
pub mod controller;
pub mod dal;
pub mod dtl;
pub mod locality;
pub mod mds;
pub mod ops;
pub mod vpool;

// Re-export commonly used types
pub use common::{ControllerConfig, Error, Result};
pub use context::{Context, Tunables};
pub use controller::Controller;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
