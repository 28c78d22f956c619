//! ONNX Runtime engines: full precision on CUDA, reduced precision through
//! TensorRT, and the CPU fallback. One session per worker thread, two worker
//! threads per device.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use half::f16;
use once_cell::sync::Lazy;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use tracing::info;

use crate::dispatcher::{ExecutionContext, WorkerPool};
use crate::error::{ConfigError, EvalError};
use crate::net::{Backend, EvalOutput};
use tengen_core::{Batch, BoardFeatures, BoardSpec};

/// Session construction is not thread safe on every provider (TensorRT in
/// particular), so all builds in the process go through this lock.
static SESSION_BUILD_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const POLICY_OUTPUT: &str = "policy_output";
const VALUE_OUTPUT: &str = "value_output";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    Reduced,
}

/// Counts CUDA devices through the driver tooling.
pub fn detect_cuda() -> Result<usize, ConfigError> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .map_err(|e| ConfigError::NoDevice(format!("nvidia-smi not runnable: {}", e)))?;

    if !output.status.success() {
        return Err(ConfigError::NoDevice(
            "nvidia-smi command failed; are NVIDIA drivers installed?".to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let device_count = stdout.lines().count();

    if device_count == 0 {
        return Err(ConfigError::NoDevice(
            "nvidia-smi present but no CUDA device detected".to_string(),
        ));
    }

    Ok(device_count)
}

fn tensorrt_available() -> bool {
    let Ok(mut builder) = Session::builder() else {
        return false;
    };
    TensorRTExecutionProvider::default()
        .register(&mut builder)
        .is_ok()
}

/// One worker's session plus its preallocated input buffer. The buffer is
/// declared first so it is released before the session that it feeds.
pub struct OrtContext {
    batch: Batch,
    session: Session,
    spec: BoardSpec,
    model: String,
    reduced: bool,
}

impl OrtContext {
    fn build(
        model_path: &Path,
        spec: BoardSpec,
        batch_size: usize,
        provider: ExecutionProviderDispatch,
        reduced: bool,
        intra_threads: usize,
    ) -> Result<Self, ConfigError> {
        if !model_path.exists() {
            return Err(ConfigError::ModelNotFound(model_path.to_path_buf()));
        }

        let _guard = SESSION_BUILD_LOCK.lock().unwrap();
        let session = Session::builder()?
            .with_execution_providers([provider])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .with_inter_threads(1)?
            .commit_from_file(model_path)?;

        Ok(OrtContext {
            batch: Batch::new(batch_size, spec.num_board_features()),
            session,
            spec,
            model: model_path.display().to_string(),
            reduced,
        })
    }

    fn cuda(
        model_path: &Path,
        spec: BoardSpec,
        batch_size: usize,
        device_id: i32,
    ) -> Result<Self, ConfigError> {
        let provider = CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure();
        Self::build(model_path, spec, batch_size, provider, false, 1)
    }

    fn tensorrt(
        model_path: &Path,
        spec: BoardSpec,
        batch_size: usize,
        device_id: i32,
    ) -> Result<Self, ConfigError> {
        let provider = TensorRTExecutionProvider::default()
            .with_device_id(device_id)
            .with_fp16(true)
            .with_layer_norm_fp32_fallback(true)
            .build()
            .error_on_failure();
        Self::build(model_path, spec, batch_size, provider, true, 1)
    }

    fn cpu(model_path: &Path, spec: BoardSpec, batch_size: usize) -> Result<Self, ConfigError> {
        let provider = CPUExecutionProvider::default().build();
        Self::build(model_path, spec, batch_size, provider, false, num_cpus::get())
    }
}

impl ExecutionContext for OrtContext {
    fn run_batch(&mut self, features: &[BoardFeatures]) -> Result<EvalOutput, EvalError> {
        let count = features.len();
        if count > self.batch.batch_size() {
            return Err(EvalError::BackendFailed(format!(
                "batch of {} positions exceeds the session capacity {}",
                count,
                self.batch.batch_size()
            )));
        }

        // The graph always runs on the full batch; rows past `count` are
        // stale and their outputs are never read.
        for (i, item) in features.iter().enumerate() {
            self.batch.write_item(i, item);
        }

        let mut outputs = self
            .session
            .run(ort::inputs!["pos_tensor" => self.batch.tensor()])
            .map_err(|e| EvalError::BackendFailed(e.to_string()))?;

        let policy_output = outputs
            .remove(POLICY_OUTPUT)
            .ok_or_else(|| EvalError::BackendFailed("missing policy_output".to_string()))?;

        // Reduced-precision graphs emit fp16 logits; widen them on the host.
        let policy_flat: Vec<f32> = if self.reduced {
            let array = policy_output
                .try_extract_array::<f16>()
                .map_err(|e| EvalError::BackendFailed(e.to_string()))?;
            array.iter().map(|v| v.to_f32()).collect()
        } else {
            let array = policy_output
                .try_extract_array::<f32>()
                .map_err(|e| EvalError::BackendFailed(e.to_string()))?;
            array.iter().copied().collect()
        };

        let num_moves = self.spec.num_moves();
        if policy_flat.len() < count * num_moves {
            return Err(EvalError::BackendFailed(format!(
                "policy output too small: {} < {}",
                policy_flat.len(),
                count * num_moves
            )));
        }
        let policies = (0..count)
            .map(|i| policy_flat[i * num_moves..(i + 1) * num_moves].to_vec())
            .collect();

        let value_output = outputs
            .remove(VALUE_OUTPUT)
            .ok_or_else(|| EvalError::BackendFailed("missing value_output".to_string()))?;
        let value_array = value_output
            .try_extract_array::<f32>()
            .map_err(|e| EvalError::BackendFailed(e.to_string()))?;
        let values: Vec<f32> = value_array.iter().copied().take(count).collect();
        if values.len() < count {
            return Err(EvalError::BackendFailed(format!(
                "value output too small: {} < {}",
                values.len(),
                count
            )));
        }

        Ok(EvalOutput {
            policies,
            values,
            model: self.model.clone(),
        })
    }
}

/// Engine backed by a pool of ort sessions.
pub struct OrtBackend {
    pool: WorkerPool,
    model: String,
}

impl std::fmt::Debug for OrtBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtBackend").field("model", &self.model).finish()
    }
}

impl OrtBackend {
    /// CUDA engine, two worker sessions per device. `num_gpus == 0` means
    /// auto-detect. `Precision::Reduced` requires TensorRT.
    pub fn cuda(
        model_path: &Path,
        spec: BoardSpec,
        batch_size: usize,
        num_gpus: usize,
        precision: Precision,
    ) -> Result<Self, ConfigError> {
        let device_count = if num_gpus == 0 {
            detect_cuda()?
        } else {
            num_gpus
        };

        if precision == Precision::Reduced && !tensorrt_available() {
            return Err(ConfigError::NoDevice(
                "TensorRT execution provider unavailable".to_string(),
            ));
        }

        info!(
            "building {:?}-precision engine on {} device(s), model {}",
            precision,
            device_count,
            model_path.display()
        );

        let mut contexts = Vec::with_capacity(device_count * 2);
        for device_id in 0..device_count {
            // Two sessions per device keep the device busy while the other
            // session's batch is being filled.
            for _ in 0..2 {
                let ctx = match precision {
                    Precision::Full => {
                        OrtContext::cuda(model_path, spec, batch_size, device_id as i32)?
                    }
                    Precision::Reduced => {
                        OrtContext::tensorrt(model_path, spec, batch_size, device_id as i32)?
                    }
                };
                contexts.push(ctx);
            }
        }

        Ok(OrtBackend {
            pool: WorkerPool::spawn("ort-worker", contexts),
            model: model_path.display().to_string(),
        })
    }

    /// CPU engine; a single device with the usual two workers.
    pub fn lite(
        model_path: &Path,
        spec: BoardSpec,
        batch_size: usize,
    ) -> Result<Self, ConfigError> {
        let contexts = vec![
            OrtContext::cpu(model_path, spec, batch_size)?,
            OrtContext::cpu(model_path, spec, batch_size)?,
        ];
        Ok(OrtBackend {
            pool: WorkerPool::spawn("lite-worker", contexts),
            model: model_path.display().to_string(),
        })
    }

}

impl Backend for OrtBackend {
    fn run(&self, features: Vec<BoardFeatures>) -> Result<EvalOutput, EvalError> {
        self.pool
            .submit(features)
            .recv()
            .map_err(|_| EvalError::BackendFailed("worker exited before replying".to_string()))?
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_model_is_a_config_error() {
        let spec = BoardSpec::new(9);
        let path = PathBuf::from("/nonexistent/net.onnx");
        let err = OrtBackend::lite(&path, spec, 8).unwrap_err();
        assert!(matches!(err, ConfigError::ModelNotFound(_)));
    }
}
