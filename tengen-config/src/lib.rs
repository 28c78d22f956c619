pub mod config;

pub use config::{
    CudaEngineConfig, EngineChoice, EngineConfig, FakeEngineConfig, LiteEngineConfig,
    RemoteEngineConfig,
};
