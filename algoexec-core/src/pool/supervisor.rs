//! Worker pool supervisor: capacity gating, dispatch, and crash/timeout
//! recovery.
//!
//! Two independent bounds apply, per `spec.md` §4.5: `queue_size` (`Q`)
//! gates *admission* via a non-blocking `try_acquire` on a counting
//! semaphore - a full pool rejects immediately (`ErrorKind::Rejected`)
//! rather than queuing unboundedly - while `max_workers` (`N`) bounds how
//! many OS worker processes may exist at once. A dispatch that clears
//! admission but finds every one of the `N` workers busy waits for one to
//! free up, bounded by the dispatch's own effective timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore};

use crate::context::ExecutionContext;
use crate::envelope::{AlgoError, ResponseMeta};
use crate::observe::AlgorithmMetrics;

use super::worker::WorkerHandle;
use super::{WireRequest, WireResponse, WorkerPoolConfig};

/// How long a dispatch waits for an idle worker when no explicit timeout
/// was given. A spec with no `timeout_s` still shouldn't queue forever
/// behind a saturated pool.
const DEFAULT_WORKER_WAIT: Duration = Duration::from_secs(30);

struct Idle {
    workers: VecDeque<WorkerHandle>,
    /// Total OS worker processes currently spawned (idle + checked out),
    /// bounded by `config.max_workers`. Distinct from `workers.len()`,
    /// which only counts the ones sitting idle right now.
    spawned: usize,
}

/// A bounded pool of re-exec'd worker processes dispatching requests for
/// either the whole service (shared pool) or one isolated algorithm
/// (per-spec pool) - see [`crate::executor::Executor`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    capacity: Arc<Semaphore>,
    idle: Arc<Mutex<Idle>>,
    /// Signaled whenever a worker becomes idle or a spawn slot frees up,
    /// so a dispatch waiting in [`WorkerPool::take_or_spawn_worker`] can
    /// retry without polling.
    worker_slot: Arc<Notify>,
    next_task_id: AtomicU64,
    metrics: Arc<AlgorithmMetrics>,
    /// The `worker_id` (`spec.md` §3's `ExecutionResult.worker_id`) of the
    /// worker that most recently finished a task, success or failure -
    /// lets a caller confirm a post-kill replacement worker is a distinct
    /// process (`spec.md` §8 invariant 5, scenario S2).
    last_worker_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, metrics: Arc<AlgorithmMetrics>) -> Self {
        let capacity = Arc::new(Semaphore::new(config.queue_size));
        Self {
            config,
            capacity,
            idle: Arc::new(Mutex::new(Idle {
                workers: VecDeque::new(),
                spawned: 0,
            })),
            worker_slot: Arc::new(Notify::new()),
            next_task_id: AtomicU64::new(1),
            metrics,
            last_worker_id: AtomicU64::new(0),
        }
    }

    pub fn last_worker_id(&self) -> Option<u64> {
        match self.last_worker_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.capacity.available_permits()
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.workers.len()
    }

    /// Dispatches one task to a worker, enforcing `timeout` (if any) with
    /// a hard process-group kill on expiry. Returns `ErrorKind::Rejected`
    /// immediately, without blocking, if the admission queue is already
    /// full; if admission succeeds but every worker is busy, waits for
    /// one to free up (bounded by `timeout`, or [`DEFAULT_WORKER_WAIT`]
    /// when none was given) before rejecting.
    pub async fn dispatch(
        &self,
        name: &str,
        version: &str,
        input: Value,
        hyperparams: Option<Value>,
        timeout: Option<Duration>,
        request_id: &str,
        trace_id: Option<&str>,
    ) -> Result<Value, AlgoError> {
        let submitted_at = Instant::now();
        let permit = self
            .capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| AlgoError::rejected("worker pool admission queue is full"))?;

        let wait_deadline = submitted_at + timeout.unwrap_or(DEFAULT_WORKER_WAIT);
        let mut worker = self.take_or_spawn_worker(name, version, wait_deadline).await?;
        let worker_id = worker.worker_id();
        let queue_wait_ms = submitted_at.elapsed().as_secs_f64() * 1000.0;
        self.metrics.observe_queue_wait(name, version, queue_wait_ms);

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let request = WireRequest {
            task_id,
            name: name.to_string(),
            version: version.to_string(),
            input,
            hyperparams,
            request_id: request_id.to_string(),
            trace_id: trace_id.map(str::to_string),
        };

        // The wait for a worker already spent part of the caller's
        // budget; the run itself only gets what's left, so the overall
        // submission-to-response bound stays `timeout + kill_grace`
        // (`spec.md` §8 invariant 4) even after a queuing delay.
        let remaining_timeout = timeout.map(|t| t.saturating_sub(submitted_at.elapsed()));

        let outcome = self.run_one(&mut worker, request, remaining_timeout).await;
        self.last_worker_id.store(worker_id, Ordering::SeqCst);

        match outcome {
            Ok((result, meta)) => {
                merge_remote_meta(meta);
                worker.warm_instances.insert((name.to_string(), version.to_string()));
                self.return_worker_idle(worker).await;
                drop(permit);
                Ok(result)
            }
            Err(RunError::Timeout) => {
                worker.kill_group(self.config.kill_grace, self.config.kill_tree).await;
                self.release_spawn_slot().await;
                drop(permit);
                Err(AlgoError::timeout("worker did not respond within the effective timeout"))
            }
            Err(RunError::Crashed) => {
                self.release_spawn_slot().await;
                drop(permit);
                Err(AlgoError::system("worker process exited unexpectedly"))
            }
            Err(RunError::Protocol(message)) => {
                worker.kill_group(self.config.kill_grace, self.config.kill_tree).await;
                self.release_spawn_slot().await;
                drop(permit);
                Err(AlgoError::system(format!("worker protocol violation: {message}")))
            }
            Err(RunError::Algorithm(detail, meta)) => {
                merge_remote_meta(meta);
                worker.warm_instances.insert((name.to_string(), version.to_string()));
                self.return_worker_idle(worker).await;
                drop(permit);
                Err(detail)
            }
        }
    }

    async fn return_worker_idle(&self, worker: WorkerHandle) {
        self.idle.lock().await.workers.push_back(worker);
        self.worker_slot.notify_one();
    }

    /// Frees the spawn slot held by a worker that was killed or crashed
    /// rather than returned to idle, so a later dispatch may spawn its
    /// replacement (`spec.md` §8 invariant 5).
    async fn release_spawn_slot(&self) {
        let mut idle = self.idle.lock().await;
        idle.spawned = idle.spawned.saturating_sub(1);
        drop(idle);
        self.worker_slot.notify_one();
    }

    async fn take_or_spawn_worker(
        &self,
        name: &str,
        version: &str,
        deadline: Instant,
    ) -> Result<WorkerHandle, AlgoError> {
        loop {
            let mut idle = self.idle.lock().await;
            if let Some(pos) = idle
                .workers
                .iter()
                .position(|w| w.warm_instances.contains(&(name.to_string(), version.to_string())))
            {
                return Ok(idle.workers.remove(pos).unwrap());
            }
            if let Some(worker) = idle.workers.pop_front() {
                return Ok(worker);
            }
            if idle.spawned < self.config.max_workers {
                idle.spawned += 1;
                drop(idle);
                match WorkerHandle::spawn() {
                    Ok(worker) => return Ok(worker),
                    Err(e) => {
                        self.release_spawn_slot().await;
                        return Err(AlgoError::system(format!("failed to spawn worker: {e}")));
                    }
                }
            }
            drop(idle);

            let now = Instant::now();
            if now >= deadline {
                return Err(AlgoError::rejected("timed out waiting for an idle worker"));
            }
            let _ = tokio::time::timeout(deadline - now, self.worker_slot.notified()).await;
        }
    }

    async fn run_one(
        &self,
        worker: &mut WorkerHandle,
        request: WireRequest,
        timeout: Option<Duration>,
    ) -> Result<(Value, Option<ResponseMeta>), RunError> {
        let task_id = request.task_id;
        let body = async {
            worker
                .send(&request)
                .await
                .map_err(|e| RunError::Protocol(e.to_string()))?;
            let response = worker.recv().await.map_err(|e| RunError::Protocol(e.to_string()))?;
            decode_response(task_id, response)
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, body)
                .await
                .unwrap_or(Err(RunError::Timeout)),
            None => body.await,
        }
    }
}

/// Merges a worker's response-meta snapshot onto the dispatching call's
/// own ambient, if one is installed - a no-op outside a
/// [`ExecutionContext::scope`] (e.g. the pool's own unit tests).
fn merge_remote_meta(meta: Option<ResponseMeta>) {
    if let (Some(meta), Some(ctx)) = (meta, ExecutionContext::try_current()) {
        ctx.merge_remote_meta(meta);
    }
}

enum RunError {
    Timeout,
    Crashed,
    Protocol(String),
    Algorithm(AlgoError, Option<ResponseMeta>),
}

fn decode_response(
    task_id: u64,
    response: Option<WireResponse>,
) -> Result<(Value, Option<ResponseMeta>), RunError> {
    let response = response.ok_or(RunError::Crashed)?;
    if response.task_id != task_id {
        return Err(RunError::Protocol(format!(
            "expected task_id {task_id}, got {}",
            response.task_id
        )));
    }
    if response.ok {
        Ok((response.result.unwrap_or(Value::Null), response.response_meta))
    } else {
        let kind = response
            .error_kind
            .as_deref()
            .and_then(parse_error_kind)
            .unwrap_or(crate::envelope::ErrorKind::Runtime);
        Err(RunError::Algorithm(
            crate::envelope::AlgoError::new(
                kind,
                response.error_message.unwrap_or_else(|| "algorithm failed".into()),
            ),
            response.response_meta,
        ))
    }
}

fn parse_error_kind(raw: &str) -> Option<crate::envelope::ErrorKind> {
    use crate::envelope::ErrorKind::*;
    Some(match raw {
        "validation" => Validation,
        "timeout" => Timeout,
        "rejected" => Rejected,
        "runtime" => Runtime,
        "system" => System,
        _ => return None,
    })
}
