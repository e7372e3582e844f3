//! Supervised worker-process pool (C5).
//!
//! The hardest piece of the system: a bounded pool of OS child processes,
//! gated by a non-blocking semaphore (explicit backpressure instead of an
//! unbounded queue), each hard-killable by process group on timeout, with
//! crash detection and respawn. Grounded on the teacher's process-isolation
//! machinery (`enviro-core/src/engine/isolation.rs`'s `pre_exec` / signal
//! handling) for the OS mechanics, and on the Python original's
//! `ProcessPoolExecutor`-shaped semantics for everything else.

pub mod supervisor;
pub mod worker;

pub use supervisor::WorkerPool;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ResponseMeta;

/// One line of the worker line protocol, parent -> child.
///
/// Carries `request_id`/`trace_id` so the worker can establish the same
/// per-execution ambient (C3) the in-process runner would, rather than
/// running the algorithm context-free (`spec.md` §4.3: "the ambient is
/// established inside the worker at message dispatch time").
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireRequest {
    pub task_id: u64,
    pub name: String,
    pub version: String,
    pub input: Value,
    #[serde(default)]
    pub hyperparams: Option<Value>,
    pub request_id: String,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// One line of the worker line protocol, child -> parent.
///
/// `response_meta` is the worker-side ambient's final snapshot - empty
/// unless the algorithm actually set one of the three slots - carried
/// back so the supervisor can merge it onto the caller's own ambient
/// (`spec.md` §9: "the worker returns the final snapshot back to the
/// supervisor alongside the result").
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireResponse {
    pub task_id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_meta: Option<ResponseMeta>,
}

/// Sizing and kill semantics for one worker pool.
///
/// A process-pool algorithm spec with `isolated_pool = true` gets its own
/// `WorkerPoolConfig`-derived pool instead of sharing the service-wide one
/// (`spec.md` §4.5/§4.6).
///
/// `max_workers` (`N`) and `queue_size` (`Q`) are deliberately distinct:
/// `Q` gates *admission* (a non-blocking semaphore - a full queue rejects
/// immediately), while `N` bounds how many OS worker processes may exist
/// at once. A submission that clears admission but finds no idle worker
/// and the pool already at `N` processes waits for one to free up, up to
/// the dispatch's effective timeout (`spec.md` §4.5's "waits for an idle
/// worker up to the deadline") - it does not get rejected a second time.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub queue_size: usize,
    pub kill_grace: Duration,
    /// `true` to kill the whole process group on timeout (the default);
    /// `false` kills only the direct child, matching `spec.md`'s
    /// POSIX-only `kill_tree` flag. Non-POSIX targets are out of scope.
    pub kill_tree: bool,
}

impl From<&crate::config::ExecutorConfig> for WorkerPoolConfig {
    fn from(cfg: &crate::config::ExecutorConfig) -> Self {
        Self {
            max_workers: cfg.global_max_workers,
            queue_size: cfg.global_queue_size,
            kill_grace: cfg.kill_grace,
            kill_tree: cfg.kill_tree,
        }
    }
}
