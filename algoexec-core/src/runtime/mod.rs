//! Service runtime lifecycle state machine (C8).
//!
//! Grounded on the Python original's `ServiceRuntime`
//! (`service_runtime.py`): a single `tokio::sync::Mutex`-guarded writer,
//! explicit `allowed_from` transition tables, and priority-ordered hooks
//! run sequentially around each transition. The teacher's
//! `Arc<RwLock<ContainerState>>` (`enviro-core/src/runtime.rs`) grounds the
//! `Arc`-shared-handle shape, but the actual transition semantics below
//! follow the Python state machine, not the teacher's.

pub mod hooks;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::LifecycleError;
use hooks::HookRegistry;

/// The closed set of runtime states (`spec.md` §3/§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Provisioning,
    Ready,
    Running,
    Degraded,
    Draining,
    Shutdown,
}

impl ServiceState {
    fn allowed_from(self) -> &'static [ServiceState] {
        use ServiceState::*;
        match self {
            Created => &[],
            Provisioning => &[Created],
            Ready => &[Provisioning],
            Running => &[Ready, Degraded],
            Degraded => &[Running],
            Draining => &[Running, Degraded],
            // `spec.md` §4.8: "any-except-Shutdown -> Shutdown" - every
            // other state, including `Created`, can shut down directly.
            Shutdown => &[Created, Provisioning, Ready, Running, Degraded, Draining],
        }
    }
}

struct Inner {
    state: ServiceState,
}

/// Shared handle to one service's lifecycle state. Cloning shares the same
/// underlying state and hook registry - every clone observes the same
/// transitions.
#[derive(Clone)]
pub struct ServiceRuntime {
    inner: Arc<Mutex<Inner>>,
    hooks: Arc<HookRegistry>,
}

impl ServiceRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ServiceState::Created,
            })),
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.lock().await.state
    }

    pub async fn provisioning(&self) -> Result<(), LifecycleError> {
        self.transition(ServiceState::Provisioning).await
    }

    pub async fn ready(&self) -> Result<(), LifecycleError> {
        self.transition(ServiceState::Ready).await
    }

    pub async fn running(&self) -> Result<(), LifecycleError> {
        self.transition(ServiceState::Running).await
    }

    pub async fn degraded(&self) -> Result<(), LifecycleError> {
        self.transition(ServiceState::Degraded).await
    }

    pub async fn draining(&self) -> Result<(), LifecycleError> {
        self.transition(ServiceState::Draining).await
    }

    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.transition(ServiceState::Shutdown).await
    }

    /// Drives one transition: validates it's allowed, runs `before` hooks
    /// in priority-descending (then insertion) order, aborting on the
    /// first failure. On abort, unwinds by running `after` only for hooks
    /// whose `before` already executed successfully, in reverse order, and
    /// never advances the state (`spec.md` §4.8, §8 invariant 6). On
    /// success, commits the new state and runs every eligible hook's
    /// `after` in reverse order, logging (never propagating) any failure.
    async fn transition(&self, to: ServiceState) -> Result<(), LifecycleError> {
        let mut guard = self.inner.lock().await;
        let from = guard.state;

        if from == to {
            return Err(LifecycleError::AlreadyInState { state: from });
        }
        if !to.allowed_from().contains(&from) {
            return Err(LifecycleError::InvalidTransition {
                from,
                to,
                allowed: to.allowed_from().to_vec(),
            });
        }

        let eligible = self.hooks.eligible_hooks(to);
        let mut executed_before = Vec::with_capacity(eligible.len());

        for hook in &eligible {
            if let Some(before) = &hook.before {
                match before(from, to).await {
                    Ok(()) => executed_before.push(hook.clone()),
                    Err(source) => {
                        tracing::error!(?from, ?to, error = %source, "before-hook failed, aborting transition and unwinding");
                        for unwind_hook in executed_before.iter().rev() {
                            if let Some(after) = &unwind_hook.after {
                                if let Err(unwind_err) = after(from, to).await {
                                    tracing::error!(?from, ?to, error = %unwind_err, "after-hook failed during unwind, continuing");
                                }
                            }
                        }
                        return Err(LifecycleError::HookFailed { to, source });
                    }
                }
            }
        }

        guard.state = to;
        tracing::info!(?from, ?to, "service transitioned");

        for hook in eligible.iter().rev() {
            if let Some(after) = &hook.after {
                if let Err(source) = after(from, to).await {
                    tracing::error!(?from, ?to, error = %source, "after-hook failed, continuing");
                }
            }
        }

        Ok(())
    }
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self::new()
    }
}
