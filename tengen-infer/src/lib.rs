//! Inference batching for the dual-head Go network.
//!
//! Search threads each produce a handful of positions per step; the
//! accelerator wants big fixed-size batches. This crate sits in between: a
//! batching service packs requests from many clients into full batches, a
//! worker pool drains them onto per-device sessions, and per-request slices
//! of each aggregate result flow back to the blocked callers.

pub mod backend;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod net;

pub use backend::{BatchTrace, FakeBackend, OrtBackend, Precision, RemoteBackend};
pub use coordinator::{BatchingService, BatchingStats, ClientMode, NetClient};
pub use dispatcher::{ExecutionContext, WorkerPool};
pub use error::{ConfigError, EvalError};
pub use factory::NetFactory;
pub use net::{Backend, EvalOutput};
