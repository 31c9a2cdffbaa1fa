//! HTTP and hub transports: configuration, connection tracking, middleware
//! and the server lifecycle.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod problem;

pub use config::*;
pub use connection::*;
pub use handlers::hub::{HubTransport, InboundFrame, OutboundFrame};
pub use handlers::AppState;
pub use module::{Endpoints, NetworkModule};
pub use problem::HttpTransport;
