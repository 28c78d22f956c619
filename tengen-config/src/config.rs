use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the full-precision CUDA engine.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct CudaEngineConfig {
    /// Path to the exported ONNX graph.
    pub model_path: PathBuf,

    /// Number of GPUs to run on. Zero means auto-detect.
    #[serde(default)]
    pub num_gpus: usize,
}

/// Configuration for the CPU engine.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct LiteEngineConfig {
    /// Path to the exported ONNX graph.
    pub model_path: PathBuf,
}

/// Configuration for the remote engine.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct RemoteEngineConfig {
    /// Address of the evaluation server, e.g. "10.0.0.2:50051".
    pub addr: String,
}

/// Configuration for the deterministic fake engine used in tests and
/// CPU-only smoke runs.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct FakeEngineConfig {
    /// Value returned for every position.
    #[serde(default)]
    pub value: f32,
}

/// Enum selecting which inference engine backs the evaluation service.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "PascalCase")]
pub enum EngineChoice {
    /// Full precision on CUDA devices.
    Cuda(CudaEngineConfig),
    /// Reduced precision through TensorRT, where the hardware supports it.
    TensorRt(CudaEngineConfig),
    /// CPU-only execution.
    Lite(LiteEngineConfig),
    /// Out-of-process evaluation over a socket.
    Remote(RemoteEngineConfig),
    /// Constant-output oracle.
    Fake(FakeEngineConfig),
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Board side, 9 or 19.
    #[serde(default = "default_board_size")]
    pub board_size: usize,

    /// Fixed inference batch size. Zero disables batching entirely and every
    /// request is forwarded to the engine unchanged.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    pub engine: EngineChoice,
}

fn default_board_size() -> usize {
    19
}

fn default_batch_size() -> usize {
    1024
}

impl EngineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cuda_engine() {
        let yaml = r#"
board_size: 9
batch_size: 256
engine:
  type: Cuda
  model_path: nets/000042-joseki.onnx
  num_gpus: 2
"#;
        let cfg = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.board_size, 9);
        assert_eq!(cfg.batch_size, 256);
        match cfg.engine {
            EngineChoice::Cuda(c) => assert_eq!(c.num_gpus, 2),
            other => panic!("expected Cuda engine, got {:?}", other),
        }
    }

    #[test]
    fn defaults_apply() {
        let yaml = r#"
engine:
  type: Fake
"#;
        let cfg = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.board_size, 19);
        assert_eq!(cfg.batch_size, 1024);
        match cfg.engine {
            EngineChoice::Fake(f) => assert_eq!(f.value, 0.0),
            other => panic!("expected Fake engine, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_engine() {
        let yaml = r#"
engine:
  type: Abacus
"#;
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = r#"
engine:
  type: Remote
  addr: "127.0.0.1:50051"
  use_tpu: true
"#;
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }
}
