//! Outcome server: the interception pipeline, idempotency stores and the
//! HTTP, hub and actor transports built on top of them.

pub mod actor;
pub mod network;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use actor::{Actor, ActorHost, ActorRef, ActorTransport};
pub use network::{Endpoints, HttpTransport, HubTransport, NetworkConfig, NetworkModule};
pub use service::{InvocationRouter, ServerConfig};
pub use storage::{open_store, StoreBackend, StoreHandle};
