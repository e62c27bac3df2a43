//! Common utilities and types shared across the control plane

pub mod cancel;
pub mod config;
pub mod error;
pub mod identity;
pub mod storage;
pub mod utils;

pub use cancel::Cancellation;
pub use config::{CcsBackend, ControllerConfig};
pub use error::{Error, Result};
pub use identity::ProcessIdentity;
pub use storage::{KVStore, MemStore};
pub use utils::{format_bytes, round5, timestamp_now_millis, validate_ipv4, validate_vpool_name};
