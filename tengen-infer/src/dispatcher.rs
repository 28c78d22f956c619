//! Worker pool draining a queue of batch jobs.
//!
//! Each worker thread owns one execution context (a session plus its input
//! buffer) and polls the shared queue with a bounded timeout so it can
//! observe the stop flag. Submissions are served FIFO; which worker picks a
//! job up is whichever is free first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, span, Level};

use crate::error::EvalError;
use crate::net::EvalOutput;
use tengen_core::BoardFeatures;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// One worker's execution state. Owns its device handles and host buffers
/// exclusively; no locking on the tensor path.
pub trait ExecutionContext: Send {
    fn run_batch(&mut self, features: &[BoardFeatures]) -> Result<EvalOutput, EvalError>;
}

struct Job {
    features: Vec<BoardFeatures>,
    completion: Sender<Result<EvalOutput, EvalError>>,
}

pub struct WorkerPool {
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    running: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns one thread per context. Callers decide the fan-out; the ort
    /// engines pass two contexts per device.
    pub fn spawn<C>(name: &str, contexts: Vec<C>) -> Self
    where
        C: ExecutionContext + 'static,
    {
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let running = Arc::new(AtomicBool::new(true));
        let live_workers = Arc::new(AtomicUsize::new(contexts.len()));

        let mut handles = Vec::with_capacity(contexts.len());
        for (i, mut ctx) in contexts.into_iter().enumerate() {
            let rx = jobs_rx.clone();
            let running = running.clone();
            let live_workers = live_workers.clone();
            let span = span!(Level::INFO, "NetWorker", worker = i);

            let builder = std::thread::Builder::new().name(format!("{}-{}", name, i));
            let handle = builder
                .spawn(move || {
                    let _enter = span.enter();
                    worker_loop(&mut ctx, rx, running, live_workers);
                })
                .expect("Failed to spawn inference worker thread");
            handles.push(handle);
        }

        WorkerPool {
            jobs_tx,
            jobs_rx,
            running,
            live_workers,
            handles,
        }
    }

    /// Enqueues a batch. Non-blocking; the returned channel resolves exactly
    /// once with the batch result.
    pub fn submit(
        &self,
        features: Vec<BoardFeatures>,
    ) -> Receiver<Result<EvalOutput, EvalError>> {
        let (tx, rx) = bounded(1);

        if self.live_workers.load(Ordering::SeqCst) == 0 {
            let _ = tx.send(Err(dead_pool_error()));
            return rx;
        }

        let job = Job {
            features,
            completion: tx,
        };
        if self.jobs_tx.send(job).is_err() {
            // Queue closed; the receiver reports the pool as gone.
            return rx;
        }

        // The last worker may have died between the check above and the
        // send. Its exit path drains the queue first, so seeing zero here
        // means our job might have slipped in after that drain.
        if self.live_workers.load(Ordering::SeqCst) == 0 {
            fail_queued(&self.jobs_rx, dead_pool_error());
        }

        rx
    }

    pub fn worker_count(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        fail_queued(&self.jobs_rx, EvalError::Shutdown);
    }
}

fn worker_loop<C: ExecutionContext>(
    ctx: &mut C,
    jobs_rx: Receiver<Job>,
    running: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
) {
    while running.load(Ordering::SeqCst) {
        let job = match jobs_rx.recv_timeout(POLL_TIMEOUT) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match ctx.run_batch(&job.features) {
            Ok(output) => {
                let _ = job.completion.send(Ok(output));
            }
            Err(e) => {
                // Inference failure is fatal for this worker.
                error!("inference worker leaving service: {}", e);
                let _ = job.completion.send(Err(e.clone()));
                if live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    fail_queued(&jobs_rx, e);
                }
                return;
            }
        }
    }

    live_workers.fetch_sub(1, Ordering::SeqCst);
    info!("inference worker stopped");
}

fn fail_queued(jobs_rx: &Receiver<Job>, err: EvalError) {
    while let Ok(job) = jobs_rx.try_recv() {
        let _ = job.completion.send(Err(err.clone()));
    }
}

fn dead_pool_error() -> EvalError {
    EvalError::BackendFailed("all inference workers have left service".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ConstContext {
        value: f32,
        batches: Arc<Mutex<Vec<usize>>>,
    }

    impl ExecutionContext for ConstContext {
        fn run_batch(&mut self, features: &[BoardFeatures]) -> Result<EvalOutput, EvalError> {
            self.batches.lock().unwrap().push(features.len());
            Ok(EvalOutput {
                policies: vec![vec![1.0]; features.len()],
                values: vec![self.value; features.len()],
                model: "const".to_string(),
            })
        }
    }

    struct FailingContext;

    impl ExecutionContext for FailingContext {
        fn run_batch(&mut self, _features: &[BoardFeatures]) -> Result<EvalOutput, EvalError> {
            Err(EvalError::BackendFailed("device lost".to_string()))
        }
    }

    struct GatedContext {
        started: Sender<()>,
        gate: Receiver<()>,
    }

    impl ExecutionContext for GatedContext {
        fn run_batch(&mut self, features: &[BoardFeatures]) -> Result<EvalOutput, EvalError> {
            self.started.send(()).unwrap();
            self.gate.recv().unwrap();
            Ok(EvalOutput {
                policies: vec![vec![0.0]; features.len()],
                values: vec![0.0; features.len()],
                model: "gated".to_string(),
            })
        }
    }

    #[test]
    fn jobs_resolve_with_their_own_results() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let ctx = ConstContext {
            value: 0.5,
            batches: batches.clone(),
        };
        let pool = WorkerPool::spawn("test", vec![ctx]);

        let rx1 = pool.submit(vec![vec![0.0]; 3]);
        let rx2 = pool.submit(vec![vec![0.0]; 1]);

        let out1 = rx1.recv().unwrap().unwrap();
        let out2 = rx2.recv().unwrap().unwrap();
        assert_eq!(out1.values, vec![0.5; 3]);
        assert_eq!(out2.values, vec![0.5; 1]);

        drop(pool);
        assert_eq!(*batches.lock().unwrap(), vec![3, 1]);
    }

    #[test]
    fn failed_worker_takes_pool_out_of_service() {
        let pool = WorkerPool::spawn("test", vec![FailingContext]);

        let rx = pool.submit(vec![vec![0.0]]);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(EvalError::BackendFailed(_))
        ));

        // The sole worker is gone; later submissions fail without hanging.
        let rx = pool.submit(vec![vec![0.0]]);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(EvalError::BackendFailed(_))
        ));
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn shutdown_fails_jobs_still_queued() {
        let (started_tx, started_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded(1);
        let ctx = GatedContext {
            started: started_tx,
            gate: gate_rx,
        };
        let pool = WorkerPool::spawn("test", vec![ctx]);

        let rx1 = pool.submit(vec![vec![0.0]]);
        started_rx.recv().unwrap();
        // The only worker is busy, so this one stays queued.
        let rx2 = pool.submit(vec![vec![0.0]]);

        let dropper = std::thread::spawn(move || drop(pool));
        std::thread::sleep(Duration::from_millis(20));
        gate_tx.send(()).unwrap();
        dropper.join().unwrap();

        assert!(rx1.recv().unwrap().is_ok());
        assert_eq!(rx2.recv().unwrap(), Err(EvalError::Shutdown));
    }
}
