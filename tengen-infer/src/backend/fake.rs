use std::sync::{Arc, Mutex};

use crate::error::EvalError;
use crate::net::{Backend, EvalOutput};
use tengen_core::{BoardFeatures, BoardSpec, Policy};

/// Sizes of every batch the backend has run, in dispatch order.
pub type BatchTrace = Arc<Mutex<Vec<usize>>>;

/// Deterministic engine returning a configurable constant policy and value.
///
/// The reference oracle for the batching service: every position comes back
/// with exactly `priors` and `value`, and the recorded trace exposes how the
/// service packed requests into batches.
pub struct FakeBackend {
    priors: Policy,
    value: f32,
    batches: BatchTrace,
}

impl FakeBackend {
    /// Uniform priors over all moves.
    pub fn new(spec: BoardSpec, value: f32) -> Self {
        let num_moves = spec.num_moves();
        Self::with_priors(vec![1.0 / num_moves as f32; num_moves], value)
    }

    pub fn with_priors(priors: Policy, value: f32) -> Self {
        FakeBackend {
            priors,
            value,
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto the recorded batch sizes; clone before boxing the backend.
    pub fn batch_trace(&self) -> BatchTrace {
        self.batches.clone()
    }
}

impl Backend for FakeBackend {
    fn run(&self, features: Vec<BoardFeatures>) -> Result<EvalOutput, EvalError> {
        let count = features.len();
        self.batches.lock().unwrap().push(count);
        Ok(EvalOutput {
            policies: vec![self.priors.clone(); count],
            values: vec![self.value; count],
            model: "fake".to_string(),
        })
    }

    fn model(&self) -> &str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_constants_and_records_trace() {
        let spec = BoardSpec::new(9);
        let fake = FakeBackend::new(spec, 0.25);
        let trace = fake.batch_trace();

        let out = fake
            .run(vec![vec![0.0; spec.num_board_features()]; 3])
            .unwrap();

        assert_eq!(out.policies.len(), 3);
        assert_eq!(out.values, vec![0.25; 3]);
        for policy in &out.policies {
            assert_eq!(policy.len(), spec.num_moves());
            assert!((policy.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
        assert_eq!(*trace.lock().unwrap(), vec![3]);
    }
}
