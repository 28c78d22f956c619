//! The batching service: many client threads push small evaluation requests,
//! the service packs them into fixed-size batches and hands each waiter its
//! slice of the aggregate result.
//!
//! The filling policy holds a partial batch back only while some registered
//! client has no request in the queue yet. Once every counted client is
//! represented, no further request can arrive before one of the pending ones
//! is served, so waiting any longer would deadlock.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use crate::error::EvalError;
use crate::net::{Backend, EvalOutput};
use tengen_core::{BoardFeatures, Policy};
use tengen_util::math::RunningAverage;

type Completion = Sender<Result<EvalOutput, EvalError>>;

/// Whether a client participates in the fill-or-dispatch decision.
///
/// Counted clients delay a partial batch until they are represented in the
/// queue; weak clients submit requests but never hold a batch back. Ephemeral
/// callers (background evaluators, analysis probes) register weak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Counted,
    Weak,
}

struct PendingEval {
    features: Vec<BoardFeatures>,
    /// Registration id of the submitting counted client; `None` for weak.
    client: Option<u64>,
    completion: Completion,
}

struct ServiceState {
    queue: VecDeque<PendingEval>,
    /// Positions ever enqueued.
    queue_counter: usize,
    /// Positions ever handed to the backend. `queue_counter - run_counter`
    /// is the number of positions currently waiting.
    run_counter: usize,
    num_clients: usize,
    num_runs: u64,
    /// Mean positions per dispatched batch.
    fill: RunningAverage,
    shut: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchingStats {
    pub queue_counter: usize,
    pub run_counter: usize,
    pub num_clients: usize,
    pub num_runs: u64,
    pub avg_batch_size: f32,
}

pub struct BatchingService {
    backend: Box<dyn Backend>,
    batch_size: usize,
    next_client_id: AtomicU64,
    state: Mutex<ServiceState>,
}

impl BatchingService {
    pub fn new(backend: Box<dyn Backend>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        BatchingService {
            backend,
            batch_size,
            next_client_id: AtomicU64::new(1),
            state: Mutex::new(ServiceState {
                queue: VecDeque::new(),
                queue_counter: 0,
                run_counter: 0,
                num_clients: 0,
                num_runs: 0,
                fill: RunningAverage::new(),
                shut: false,
            }),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> BatchingStats {
        let s = self.state.lock().unwrap();
        BatchingStats {
            queue_counter: s.queue_counter,
            run_counter: s.run_counter,
            num_clients: s.num_clients,
            num_runs: s.num_runs,
            avg_batch_size: s.fill.get_average(),
        }
    }

    fn register(&self, mode: ClientMode) -> Option<u64> {
        match mode {
            ClientMode::Weak => None,
            ClientMode::Counted => {
                let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
                self.state.lock().unwrap().num_clients += 1;
                Some(id)
            }
        }
    }

    /// A departing client changes the will-more-requests-come calculus and
    /// may let a partial batch fire.
    fn deregister(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_clients -= 1;
        self.pump(state);
    }

    /// Blocks until this request's portion of a batch has been run.
    pub fn evaluate(
        &self,
        client: Option<u64>,
        features: Vec<BoardFeatures>,
    ) -> Result<EvalOutput, EvalError> {
        let num_positions = features.len();
        if num_positions > self.batch_size {
            return Err(EvalError::TooLarge {
                got: num_positions,
                max: self.batch_size,
            });
        }

        let (tx, rx) = bounded(1);
        {
            let mut state = self.state.lock().unwrap();
            if state.shut {
                return Err(EvalError::Shutdown);
            }
            state.queue_counter += num_positions;
            state.queue.push_back(PendingEval {
                features,
                client,
                completion: tx,
            });
            self.pump(state);
        }

        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(EvalError::Shutdown),
        }
    }

    /// Dispatches batches while the filling policy allows. Runs after every
    /// enqueue and every client-count change; the lock is released around
    /// each backend call so new requests can queue up during inference.
    fn pump<'a>(&'a self, mut state: MutexGuard<'a, ServiceState>) {
        loop {
            let available = state.queue_counter - state.run_counter;
            if available == 0 {
                break;
            }
            let capacity = available.min(self.batch_size);

            // Hold a partial batch while some counted client has nothing
            // queued yet: their next request is still to come.
            if capacity < self.batch_size
                && state.num_clients > distinct_counted_clients(&state.queue)
            {
                break;
            }

            // Pop whole requests from the head while they fit; a request is
            // never split across batches.
            let mut features = Vec::with_capacity(capacity);
            let mut waiters: Vec<(usize, Completion)> = Vec::new();
            let mut slack = capacity;
            while let Some(front) = state.queue.front() {
                let num_positions = front.features.len();
                if num_positions > slack {
                    break;
                }
                let pending = state.queue.pop_front().unwrap();
                features.extend(pending.features);
                waiters.push((num_positions, pending.completion));
                slack -= num_positions;
                state.run_counter += num_positions;
            }
            debug_assert!(!waiters.is_empty());
            debug_assert!(state.queue_counter >= state.run_counter);

            let batch_positions = features.len();
            drop(state);
            self.run_batch(features, waiters);
            state = self.state.lock().unwrap();
            state.num_runs += 1;
            state.fill.add_sample(batch_positions as f32);
        }
    }

    /// Runs one batch and hands every waiter its slice of the output. All
    /// delivery happens before the caller loops around to the next batch.
    fn run_batch(&self, features: Vec<BoardFeatures>, waiters: Vec<(usize, Completion)>) {
        let total: usize = waiters.iter().map(|(n, _)| n).sum();

        let output = match self.backend.run(features) {
            Ok(output) if output.policies.len() == total && output.values.len() == total => output,
            Ok(output) => {
                let err = EvalError::BackendFailed(format!(
                    "backend returned {} policies / {} values for {} positions",
                    output.policies.len(),
                    output.values.len(),
                    total
                ));
                warn!("{}", err);
                for (_, completion) in waiters {
                    let _ = completion.send(Err(err.clone()));
                }
                return;
            }
            Err(e) => {
                warn!("batch of {} requests failed: {}", waiters.len(), e);
                for (_, completion) in waiters {
                    let _ = completion.send(Err(e.clone()));
                }
                return;
            }
        };

        let EvalOutput {
            policies,
            values,
            model,
        } = output;
        let mut policy_it = policies.into_iter();
        let mut value_it = values.into_iter();
        for (count, completion) in waiters {
            let policies: Vec<Policy> = policy_it.by_ref().take(count).collect();
            let values: Vec<f32> = value_it.by_ref().take(count).collect();
            let _ = completion.send(Ok(EvalOutput {
                policies,
                values,
                model: model.clone(),
            }));
        }
    }

    /// Resolves every pending request with `Shutdown` and refuses new ones.
    /// Idempotent; also emits the batching statistics.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if state.shut {
            return;
        }
        state.shut = true;

        info!(
            "ran {} batches with an average size of {:.1}",
            state.num_runs,
            state.fill.get_average()
        );

        for pending in state.queue.drain(..) {
            let _ = pending.completion.send(Err(EvalError::Shutdown));
        }
        state.queue_counter = state.run_counter;
    }
}

impl Drop for BatchingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn distinct_counted_clients(queue: &VecDeque<PendingEval>) -> usize {
    let mut seen = HashSet::new();
    for pending in queue {
        if let Some(id) = pending.client {
            seen.insert(id);
        }
    }
    seen.len()
}

enum ClientInner {
    Batching {
        service: Arc<BatchingService>,
        id: Option<u64>,
    },
    Direct {
        backend: Arc<dyn Backend>,
    },
}

/// Per-caller handle onto the evaluation service.
///
/// Handles are vended by the factory; a counted handle keeps the service
/// waiting for its requests until it is dropped. Calls on one handle are
/// serialized by the caller.
pub struct NetClient {
    inner: ClientInner,
}

impl NetClient {
    pub(crate) fn batching(service: &Arc<BatchingService>, mode: ClientMode) -> Self {
        let id = service.register(mode);
        NetClient {
            inner: ClientInner::Batching {
                service: service.clone(),
                id,
            },
        }
    }

    pub(crate) fn direct(backend: Arc<dyn Backend>) -> Self {
        NetClient {
            inner: ClientInner::Direct { backend },
        }
    }

    pub fn evaluate(&self, features: Vec<BoardFeatures>) -> Result<EvalOutput, EvalError> {
        match &self.inner {
            ClientInner::Batching { service, id } => service.evaluate(*id, features),
            ClientInner::Direct { backend } => backend.run(features),
        }
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        if let ClientInner::Batching {
            service,
            id: Some(_),
        } = &self.inner
        {
            service.deregister();
        }
    }
}
