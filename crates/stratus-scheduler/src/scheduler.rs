use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use stratus_core::{Completion, CoreError};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{SchedulerConfig, SyncTask};

/// Type-erased task body; resolves to whether the body succeeded
type Job = Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>;

struct Waiter {
    level: i32,
    seq: u64,
    name: String,
    // Jobs are only Send; the lock makes queued waiters shareable
    job: Mutex<Job>,
}

// Max-heap order: higher level first, then lower sequence number
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.level
            .cmp(&other.level)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.seq == other.seq
    }
}

impl Eq for Waiter {}

/// Waiters for one signature. The entry exists exactly while a task with
/// that signature is running.
#[derive(Default)]
struct SignatureQueue {
    waiters: BinaryHeap<Waiter>,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Signatures with a running task
    pub active_signatures: usize,
    /// Tasks waiting behind a running task with the same signature
    pub queued_tasks: usize,
    /// Tasks accepted and not yet finished
    pub in_flight: usize,
    /// Worker slots currently free
    pub available_workers: usize,
    /// Worker pool size
    pub max_workers: usize,
    /// Task bodies that returned `Ok`
    pub completed: u64,
    /// Task bodies that returned `Err` or panicked
    pub failed: u64,
    /// Submissions refused
    pub rejected: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    runtime: Handle,
    signatures: DashMap<String, SignatureQueue>,
    workers: Arc<Semaphore>,
    next_seq: AtomicU64,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Runs tasks so that at most one body per signature executes at a time.
///
/// A task whose signature is free starts on a worker immediately; otherwise
/// it waits in that signature's queue. When a body finishes, successfully or
/// not, the highest-level waiter (earliest first within a level) runs next.
/// Signatures without running tasks hold no memory.
#[derive(Clone)]
pub struct SyncTaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncTaskScheduler {
    /// Create a scheduler on the current tokio runtime
    pub fn new(config: SchedulerConfig) -> Result<Self, CoreError> {
        let runtime = Handle::try_current().map_err(|e| {
            CoreError::ConfigurationError(format!("scheduler requires a tokio runtime: {}", e))
        })?;
        Self::with_runtime(config, runtime)
    }

    /// Create a scheduler that spawns task bodies on `runtime`
    pub fn with_runtime(config: SchedulerConfig, runtime: Handle) -> Result<Self, CoreError> {
        config.validate()?;
        info!(
            max_workers = config.max_workers,
            min_level = config.min_level,
            max_level = config.max_level,
            "Creating synchronized task scheduler"
        );
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                workers: Arc::new(Semaphore::new(config.max_workers)),
                config,
                runtime,
                signatures: DashMap::new(),
                next_seq: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Submit a task and wait for its result
    pub async fn submit<T: SyncTask>(&self, task: T) -> Result<T::Output, CoreError> {
        let name = task.name().to_string();
        let rx = self.enqueue_with_channel(task)?;
        rx.await.map_err(|_| abandoned(&name))?
    }

    /// Submit a task from a thread that is not driving the runtime.
    ///
    /// Panics if called from within an async context, like
    /// `oneshot::Receiver::blocking_recv`.
    pub fn submit_blocking<T: SyncTask>(&self, task: T) -> Result<T::Output, CoreError> {
        let name = task.name().to_string();
        let rx = self.enqueue_with_channel(task)?;
        rx.blocking_recv().map_err(|_| abandoned(&name))?
    }

    /// Submit a task and resolve `completion` when it finishes.
    ///
    /// A rejected submission is returned here and also fails `completion`,
    /// so callers relying on either channel observe it.
    pub fn submit_async<T: SyncTask>(
        &self,
        task: T,
        completion: Completion<T::Output>,
    ) -> Result<(), CoreError> {
        let slot = Arc::new(Mutex::new(Some(completion)));
        let job_slot = slot.clone();
        let signature = task.sync_signature().to_string();
        let level = task.sync_level();
        let name = task.name().to_string();

        let job: Job = Box::new(move || {
            async move {
                let result = run_guarded(task).await;
                let ok = result.is_ok();
                if let Some(completion) = job_slot.lock().take() {
                    completion.resolve(result);
                }
                ok
            }
            .boxed()
        });

        self.inner.enqueue(signature, level, name, job).map_err(|err| {
            if let Some(completion) = slot.lock().take() {
                completion.fail(err.clone());
            }
            err
        })
    }

    /// Waiters queued behind the running task for `signature`
    pub fn queue_len(&self, signature: &str) -> usize {
        self.inner
            .signatures
            .get(signature)
            .map(|queue| queue.waiters.len())
            .unwrap_or(0)
    }

    /// Whether a task with `signature` is currently running
    pub fn is_running(&self, signature: &str) -> bool {
        self.inner.signatures.contains_key(signature)
    }

    /// Current statistics
    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        let queued_tasks = inner
            .signatures
            .iter()
            .map(|entry| entry.value().waiters.len())
            .sum();
        SchedulerStats {
            active_signatures: inner.signatures.len(),
            queued_tasks,
            in_flight: inner.in_flight.load(Ordering::SeqCst),
            available_workers: inner.workers.available_permits(),
            max_workers: inner.config.max_workers,
            completed: inner.completed.load(Ordering::SeqCst),
            failed: inner.failed.load(Ordering::SeqCst),
            rejected: inner.rejected.load(Ordering::SeqCst),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Reject new submissions and wait for accepted ones to finish.
    ///
    /// Tasks already queued still run.
    pub async fn shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutting down synchronized task scheduler");
        }
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        info!("Synchronized task scheduler drained");
    }

    fn enqueue_with_channel<T: SyncTask>(
        &self,
        task: T,
    ) -> Result<oneshot::Receiver<Result<T::Output, CoreError>>, CoreError> {
        let (tx, rx) = oneshot::channel();
        let signature = task.sync_signature().to_string();
        let level = task.sync_level();
        let name = task.name().to_string();

        let job: Job = Box::new(move || {
            async move {
                let result = run_guarded(task).await;
                let ok = result.is_ok();
                // The submitter may have stopped waiting
                let _ = tx.send(result);
                ok
            }
            .boxed()
        });

        self.inner.enqueue(signature, level, name, job)?;
        Ok(rx)
    }
}

impl SchedulerInner {
    fn enqueue(
        self: &Arc<Self>,
        signature: String,
        level: i32,
        name: String,
        job: Job,
    ) -> Result<(), CoreError> {
        // Counted before the shutdown check so a draining shutdown sees it
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.shutting_down.load(Ordering::SeqCst) {
            self.finish_one();
            return Err(self.reject(&signature, &name, "scheduler is shut down".to_string()));
        }
        if !self.config.accepts_level(level) {
            self.finish_one();
            return Err(CoreError::InvalidArgument(format!(
                "level {} for task '{}' is outside {}..={}",
                level, name, self.config.min_level, self.config.max_level
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let run_now = match self.signatures.entry(signature.clone()) {
            Entry::Occupied(mut entry) => {
                let queue = entry.get_mut();
                if let Some(max) = self.config.max_pending_per_signature {
                    if queue.waiters.len() >= max {
                        self.finish_one();
                        return Err(self.reject(
                            &signature,
                            &name,
                            format!("{} tasks already waiting", max),
                        ));
                    }
                }
                debug!(signature = %signature, task = %name, level, queued = queue.waiters.len() + 1, "Signature busy, queueing task");
                queue.waiters.push(Waiter {
                    level,
                    seq,
                    name,
                    job: Mutex::new(job),
                });
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(SignatureQueue::default());
                Some((name, job))
            }
        };

        if let Some((name, job)) = run_now {
            self.dispatch(signature, name, job);
        }
        Ok(())
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn reject(&self, signature: &str, name: &str, reason: String) -> CoreError {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        warn!(signature = %signature, task = %name, "Rejecting task: {}", reason);
        CoreError::SchedulerRejection(format!("task '{}' ({}): {}", name, signature, reason))
    }

    /// Run `job` on a worker while owning `signature`
    fn dispatch(self: &Arc<Self>, signature: String, name: String, job: Job) {
        let inner = self.clone();
        self.runtime.spawn(async move {
            let _permit = inner.workers.clone().acquire_owned().await.ok();
            let guard = SignatureGuard {
                inner: inner.clone(),
                signature,
            };
            debug!(signature = %guard.signature, task = %name, "Running task");
            if job().await {
                inner.completed.fetch_add(1, Ordering::SeqCst);
            } else {
                inner.failed.fetch_add(1, Ordering::SeqCst);
            }
            drop(guard);
        });
    }

    /// Hand the signature to its next waiter, or forget it
    fn release(self: &Arc<Self>, signature: &str) {
        let next = match self.signatures.entry(signature.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut().waiters.pop() {
                Some(waiter) => Some(waiter),
                None => {
                    entry.remove();
                    None
                }
            },
            Entry::Vacant(_) => {
                error!(signature = %signature, "Released a signature that was not held");
                None
            }
        };

        self.finish_one();

        if let Some(waiter) = next {
            debug!(signature = %signature, task = %waiter.name, level = waiter.level, "Dequeued task");
            self.dispatch(signature.to_string(), waiter.name, waiter.job.into_inner());
        }
    }
}

/// Releases its signature when dropped, including while unwinding
struct SignatureGuard {
    inner: Arc<SchedulerInner>,
    signature: String,
}

impl Drop for SignatureGuard {
    fn drop(&mut self) {
        self.inner.release(&self.signature);
    }
}

async fn run_guarded<T: SyncTask>(task: T) -> Result<T::Output, CoreError> {
    let name = task.name().to_string();
    match AssertUnwindSafe(task.call()).catch_unwind().await {
        Ok(result) => {
            if let Err(e) = &result {
                warn!(task = %name, error = %e, "Task body failed");
            }
            result
        }
        Err(payload) => {
            let err = CoreError::from_panic(payload);
            error!(task = %name, error = %err, "Task body panicked");
            Err(err)
        }
    }
}

fn abandoned(name: &str) -> CoreError {
    CoreError::SchedulerRejection(format!("task '{}' was dropped before it finished", name))
}
