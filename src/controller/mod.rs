//! Controller daemon: admin and host agent HTTP API, periodic checkups

pub mod agent;
pub mod http;
pub mod server;

pub use agent::LocalHostAgent;
pub use http::{create_router, AdminState};
pub use server::Controller;
