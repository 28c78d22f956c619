use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to a waiting `evaluate` call.
///
/// Cloneable so that one backend failure can be fanned out to every request
/// that was packed into the failing batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("request of {got} positions exceeds the batch size {max}")]
    TooLarge { got: usize, max: usize },

    #[error("inference backend failed: {0}")]
    BackendFailed(String),

    #[error("evaluation service shut down before the request completed")]
    Shutdown,
}

/// Errors raised while constructing an engine. Fatal; nothing is retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Invalid(#[from] serde_yaml::Error),

    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("no usable inference device: {0}")]
    NoDevice(String),

    #[error("failed to build inference session: {0}")]
    Session(#[from] ort::Error),

    #[error("remote endpoint unreachable: {0}")]
    Remote(#[from] std::io::Error),

    #[error("remote handshake failed: {0}")]
    Handshake(String),
}
