//! Engine selection and service construction.
//!
//! The factory builds the configured backend once, wraps it in the batching
//! service (or a passthrough when batching is disabled) and vends client
//! handles. It jointly owns the service with every live handle and shuts the
//! service down when it is dropped.

use std::sync::Arc;

use tracing::info;

use crate::backend::fake::FakeBackend;
use crate::backend::ort::{OrtBackend, Precision};
use crate::backend::remote::RemoteBackend;
use crate::coordinator::{BatchingService, BatchingStats, ClientMode, NetClient};
use crate::error::ConfigError;
use crate::net::Backend;
use tengen_config::{EngineChoice, EngineConfig};
use tengen_core::BoardSpec;

enum FactoryInner {
    Batching(Arc<BatchingService>),
    /// `batch_size == 0`: no coordination, requests forward unchanged.
    Direct(Arc<dyn Backend>),
}

pub struct NetFactory {
    inner: FactoryInner,
}

impl std::fmt::Debug for NetFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetFactory").finish_non_exhaustive()
    }
}

impl NetFactory {
    /// Parses a YAML configuration and builds the engine it selects. An
    /// unrecognized or malformed engine section fails here with
    /// [`ConfigError::Invalid`], so selection errors surface at factory
    /// construction like every other configuration problem.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config = EngineConfig::from_yaml_str(yaml)?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let spec = BoardSpec::new(config.board_size);
        let batch_size = config.batch_size;

        let backend: Box<dyn Backend> = match &config.engine {
            EngineChoice::Cuda(c) => Box::new(OrtBackend::cuda(
                &c.model_path,
                spec,
                batch_size.max(1),
                c.num_gpus,
                Precision::Full,
            )?),
            EngineChoice::TensorRt(c) => Box::new(OrtBackend::cuda(
                &c.model_path,
                spec,
                batch_size.max(1),
                c.num_gpus,
                Precision::Reduced,
            )?),
            EngineChoice::Lite(c) => {
                Box::new(OrtBackend::lite(&c.model_path, spec, batch_size.max(1))?)
            }
            EngineChoice::Remote(c) => {
                Box::new(RemoteBackend::connect(c.addr.as_str(), spec, batch_size)?)
            }
            EngineChoice::Fake(c) => Box::new(FakeBackend::new(spec, c.value)),
        };

        info!(
            "engine ready: model {}, batch size {}",
            backend.model(),
            batch_size
        );
        Ok(Self::with_backend(backend, batch_size))
    }

    /// Wraps an already-built backend. Tests use this to keep a handle onto
    /// the fake backend's trace.
    pub fn with_backend(backend: Box<dyn Backend>, batch_size: usize) -> Self {
        let inner = if batch_size == 0 {
            FactoryInner::Direct(Arc::from(backend))
        } else {
            FactoryInner::Batching(Arc::new(BatchingService::new(backend, batch_size)))
        };
        NetFactory { inner }
    }

    pub fn new_client(&self, mode: ClientMode) -> NetClient {
        match &self.inner {
            FactoryInner::Batching(service) => NetClient::batching(service, mode),
            FactoryInner::Direct(backend) => NetClient::direct(backend.clone()),
        }
    }

    /// Batching statistics; `None` in passthrough mode.
    pub fn stats(&self) -> Option<BatchingStats> {
        match &self.inner {
            FactoryInner::Batching(service) => Some(service.stats()),
            FactoryInner::Direct(_) => None,
        }
    }
}

impl Drop for NetFactory {
    fn drop(&mut self) {
        if let FactoryInner::Batching(service) = &self.inner {
            service.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;
    use std::thread;
    use std::time::{Duration, Instant};
    use tengen_config::FakeEngineConfig;

    fn positions(n: usize) -> Vec<Vec<f32>> {
        vec![vec![0.0; 8]; n]
    }

    #[test]
    fn fake_engine_from_config() {
        let config = EngineConfig {
            board_size: 9,
            batch_size: 4,
            engine: EngineChoice::Fake(FakeEngineConfig { value: 0.25 }),
        };
        let factory = NetFactory::from_config(&config).unwrap();
        let client = factory.new_client(ClientMode::Counted);

        let out = client.evaluate(positions(2)).unwrap();
        assert_eq!(out.values, vec![0.25, 0.25]);
        assert_eq!(factory.stats().unwrap().num_runs, 1);
    }

    #[test]
    fn unknown_engine_is_a_config_error() {
        let yaml = r#"
engine:
  type: Abacus
"#;
        let err = NetFactory::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn fake_engine_from_yaml() {
        let yaml = r#"
board_size: 9
batch_size: 4
engine:
  type: Fake
  value: 0.25
"#;
        let factory = NetFactory::from_yaml_str(yaml).unwrap();
        let client = factory.new_client(ClientMode::Counted);
        let out = client.evaluate(positions(1)).unwrap();
        assert_eq!(out.values, vec![0.25]);
    }

    #[test]
    fn passthrough_forwards_unchanged() {
        let fake = FakeBackend::new(BoardSpec::new(9), 0.75);
        let trace = fake.batch_trace();
        let factory = NetFactory::with_backend(Box::new(fake), 0);
        let client = factory.new_client(ClientMode::Counted);

        // No coordination: one call, one backend invocation of the same size,
        // even though another registered client sits idle.
        let _idle = factory.new_client(ClientMode::Counted);
        let out = client.evaluate(positions(3)).unwrap();

        assert_eq!(out.policies.len(), 3);
        assert_eq!(out.values, vec![0.75; 3]);
        assert_eq!(*trace.lock().unwrap(), vec![3]);
        assert!(factory.stats().is_none());
    }

    #[test]
    fn dropping_the_factory_shuts_pending_requests_down() {
        let fake = FakeBackend::new(BoardSpec::new(9), 0.0);
        let factory = NetFactory::with_backend(Box::new(fake), 8);
        let client = factory.new_client(ClientMode::Counted);
        let _idle = factory.new_client(ClientMode::Counted);

        let handle = thread::spawn(move || client.evaluate(positions(2)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while factory.stats().unwrap().queue_counter < 2 {
            assert!(Instant::now() < deadline, "request never queued");
            thread::sleep(Duration::from_millis(1));
        }

        drop(factory);
        assert_eq!(handle.join().unwrap(), Err(EvalError::Shutdown));
    }
}
