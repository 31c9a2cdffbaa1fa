//! Tower middleware layers for the invocation pipeline.
//!
//! - [`trace`]: Per-invocation `tracing` spans and completion events
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`intercept`]: Idempotency bookkeeping and error-to-outcome translation
//! - [`timeout`]: Per-invocation timeout enforcement
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod intercept;
pub mod load_shed;
pub mod pipeline;
pub mod timeout;
pub mod trace;

pub use intercept::InterceptLayer;
pub use load_shed::LoadShedLayer;
pub use pipeline::{build_invocation_pipeline, dispatch, InvocationPipeline};
pub use timeout::TimeoutLayer;
pub use trace::InvocationTraceLayer;
