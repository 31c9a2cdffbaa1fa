//! Invocation pipeline shared by every transport.
//!
//! 1. **Invocations** (`invocation`): context and payload for one call
//! 2. **Handlers** (`handler`, `router`): operation name to handler dispatch
//! 3. **Interception** (`intercept`): idempotency and error-to-outcome translation
//! 4. **Classification** (`classify`): per-transport classifier layers
//! 5. **Middleware** (`middleware`): tower layers (trace, load-shedding, intercept, timeout)
//! 6. **Background workers** (`worker`): periodic tasks such as the expiry sweep

pub mod classify;
pub mod config;
pub mod handler;
pub mod intercept;
pub mod invocation;
pub mod middleware;
pub mod router;
pub mod worker;

pub use classify::{actor_classifier, http_classifier, hub_classifier, pipeline_classifier};
pub use config::{InProgressPolicy, ServerConfig};
pub use handler::{handler_fn, typed_handler, CommandHandler, HandlerFuture};
pub use intercept::{Interceptor, TransportAdapter};
pub use invocation::{transport_names, Invocation, InvocationContext, InvocationError};
pub use middleware::{build_invocation_pipeline, dispatch, InvocationPipeline};
pub use router::InvocationRouter;
pub use worker::{BackgroundRunnable, BackgroundWorker};
