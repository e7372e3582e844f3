//! Priority-ordered before/after transition hooks.
//!
//! Grounded on the Python original's `_eligible_hooks`: hooks are filtered
//! to the transition's target state, then sorted by `(-priority,
//! insertion_index)` so higher-priority hooks run first and ties break by
//! registration order. `spec.md` §4.8 describes one hook as a single unit
//! carrying both a `before` and an `after` callback; [`HookEntry`] mirrors
//! that - `before()`/`after()` are convenience constructors for the common
//! case of a hook that only needs one side, and [`HookRegistry::hook`]
//! registers both together for a hook that needs the full pairing (e.g. to
//! get correct unwind behavior on abort, `spec.md` §4.8/§8 invariant 6).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use super::ServiceState;

pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;
pub type HookFn = Box<dyn Fn(ServiceState, ServiceState) -> HookFuture + Send + Sync>;

/// One registered hook: a priority, its registration order, and up to one
/// `before` and one `after` callback, both optional.
pub(crate) struct HookEntry {
    pub priority: i32,
    pub insertion_index: usize,
    pub before: Option<HookFn>,
    pub after: Option<HookFn>,
}

struct Registered {
    target: ServiceState,
    entry: Arc<HookEntry>,
}

/// Registry of hooks attached to specific target-state transitions.
#[derive(Default)]
pub struct HookRegistry {
    entries: Mutex<Vec<Registered>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook that runs only before the transition into
    /// `target`. Since it has no `after`, it never participates in unwind
    /// or post-commit cleanup.
    pub fn before<F>(&self, target: ServiceState, priority: i32, f: F)
    where
        F: Fn(ServiceState, ServiceState) -> HookFuture + Send + Sync + 'static,
    {
        self.push(target, priority, Some(Box::new(f)), None);
    }

    /// Registers a hook that runs only after the transition into `target`
    /// has already committed. Never invoked if the transition aborts.
    pub fn after<F>(&self, target: ServiceState, priority: i32, f: F)
    where
        F: Fn(ServiceState, ServiceState) -> HookFuture + Send + Sync + 'static,
    {
        self.push(target, priority, None, Some(Box::new(f)));
    }

    /// Registers one hook with both a `before` and an `after` callback,
    /// as a single unit - `spec.md` §4.8's `(before, after, priority)`
    /// shape in full. If `before` fails, this hook's `after` still runs
    /// during unwind (it's the same hook whose `before` already executed).
    pub fn hook<B, A>(&self, target: ServiceState, priority: i32, before: B, after: A)
    where
        B: Fn(ServiceState, ServiceState) -> HookFuture + Send + Sync + 'static,
        A: Fn(ServiceState, ServiceState) -> HookFuture + Send + Sync + 'static,
    {
        self.push(target, priority, Some(Box::new(before)), Some(Box::new(after)));
    }

    fn push(
        &self,
        target: ServiceState,
        priority: i32,
        before: Option<HookFn>,
        after: Option<HookFn>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        let insertion_index = entries.len();
        entries.push(Registered {
            target,
            entry: Arc::new(HookEntry {
                priority,
                insertion_index,
                before,
                after,
            }),
        });
    }

    /// Returns the hooks registered for `target`, sorted by
    /// `(-priority, insertion_index)` - descending priority, ties broken
    /// by registration order.
    pub(crate) fn eligible_hooks(&self, target: ServiceState) -> Vec<Arc<HookEntry>> {
        let entries = self.entries.lock().unwrap();
        let mut eligible: Vec<Arc<HookEntry>> = entries
            .iter()
            .filter(|r| r.target == target)
            .map(|r| r.entry.clone())
            .collect();
        eligible.sort_by_key(|e| (-e.priority, e.insertion_index));
        eligible
    }
}
