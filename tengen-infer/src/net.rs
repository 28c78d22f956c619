use crate::error::EvalError;
use tengen_core::{BoardFeatures, Policy};

/// Aggregate result of evaluating one batch. `policies.len() == values.len()`
/// equals the number of positions submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutput {
    pub policies: Vec<Policy>,
    pub values: Vec<f32>,
    pub model: String,
}

/// One inference engine, seen from the batching service.
///
/// `run` evaluates every position in `features` in a single backend
/// invocation and returns the aggregate output. Callers never submit more
/// positions than the engine's batch size; splitting the aggregate back into
/// per-request portions is the service's job.
pub trait Backend: Send + Sync {
    fn run(&self, features: Vec<BoardFeatures>) -> Result<EvalOutput, EvalError>;

    fn model(&self) -> &str;
}
