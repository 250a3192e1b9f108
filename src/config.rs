//! Configuration context.
//!
//! Two layers of configuration decide how kernels are selected:
//!
//! 1. **Process-wide defaults.** The kernel policy is stored in an `AtomicU8`
//!    and the default accelerated backend behind a lock. The policy is seeded
//!    from the `MLPCONV_KERNEL_POLICY` environment variable on first use.
//! 2. **Scoped overrides.** [`using_policy`], [`using_backend`] and
//!    [`using_config`] push an override onto a *thread-local* stack and return
//!    a [`ConfigScope`] guard that removes it on drop, including during
//!    unwinding. Overrides never leak to other threads.
//!
//! [`current`] resolves the effective [`Config`] for the calling thread. The
//! dispatch layer calls it on every kernel invocation.
//!
//! # Example
//!
//! ```rust
//! use mlpconv::backend::Policy;
//! use mlpconv::config;
//!
//! let outer = config::current().kernel_policy;
//! {
//!     let _scope = config::using_policy(Policy::Never);
//!     assert_eq!(config::current().kernel_policy, Policy::Never);
//! }
//! assert_eq!(config::current().kernel_policy, outer);
//! ```

use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::backend::{AcceleratedBackend, Policy};

/// Environment variable consulted for the default kernel policy.
pub const POLICY_ENV_VAR: &str = "MLPCONV_KERNEL_POLICY";

const POLICY_UNSET: u8 = u8::MAX;

/// Process-wide default policy; `POLICY_UNSET` until first read or write.
static GLOBAL_POLICY: AtomicU8 = AtomicU8::new(POLICY_UNSET);

lazy_static::lazy_static! {
    static ref GLOBAL_BACKEND: RwLock<Option<Arc<dyn AcceleratedBackend>>> = RwLock::new(None);
}

thread_local! {
    static OVERRIDES: RefCell<Vec<(u64, Override)>> = const { RefCell::new(Vec::new()) };
    static NEXT_SCOPE_ID: Cell<u64> = const { Cell::new(0) };
}

/// The effective configuration for one call.
#[derive(Clone, Default)]
pub struct Config {
    /// Kernel-selection policy.
    pub kernel_policy: Policy,
    /// Accelerated library available to the dispatcher, if any.
    pub backend: Option<Arc<dyn AcceleratedBackend>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("kernel_policy", &self.kernel_policy)
            .field(
                "backend",
                &self.backend.as_ref().map(|b| b.capabilities().name),
            )
            .finish()
    }
}

#[derive(Clone, Default)]
struct Override {
    policy: Option<Policy>,
    backend: Option<Option<Arc<dyn AcceleratedBackend>>>,
}

/// Interprets the value of [`POLICY_ENV_VAR`].
///
/// Missing values yield [`Policy::Auto`]; unparsable ones are logged and
/// also yield [`Policy::Auto`].
#[must_use]
pub fn policy_from_env_value(value: Option<&str>) -> Policy {
    match value {
        None => Policy::Auto,
        Some(raw) => raw.parse().unwrap_or_else(|err| {
            log::warn!("ignoring {POLICY_ENV_VAR}={raw:?}: {err}");
            Policy::Auto
        }),
    }
}

/// Returns the process-wide default policy.
pub fn global_policy() -> Policy {
    let raw = GLOBAL_POLICY.load(Ordering::Acquire);
    if let Ok(policy) = Policy::try_from(raw) {
        return policy;
    }

    let from_env = policy_from_env_value(std::env::var(POLICY_ENV_VAR).ok().as_deref());
    // a concurrent set_global_policy wins over the environment
    match GLOBAL_POLICY.compare_exchange(
        POLICY_UNSET,
        from_env as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => from_env,
        Err(current) => Policy::try_from(current).unwrap_or_default(),
    }
}

/// Sets the process-wide default policy.
///
/// # Example
/// ```
/// use mlpconv::{backend::Policy, config};
/// config::set_global_policy(Policy::Auto);
/// ```
pub fn set_global_policy(policy: Policy) {
    GLOBAL_POLICY.store(policy as u8, Ordering::Release);
}

/// Returns the process-wide default accelerated backend.
pub fn global_backend() -> Option<Arc<dyn AcceleratedBackend>> {
    GLOBAL_BACKEND
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Installs (or with `None`, removes) the process-wide accelerated backend.
pub fn set_global_backend(backend: Option<Arc<dyn AcceleratedBackend>>) {
    if let Some(b) = &backend {
        log::debug!("installing global accelerated backend {}", b.capabilities().name);
    }
    *GLOBAL_BACKEND
        .write()
        .unwrap_or_else(PoisonError::into_inner) = backend;
}

/// Resolves the configuration in effect on the calling thread.
pub fn current() -> Config {
    let (policy, backend) = OVERRIDES.with(|stack| {
        let stack = stack.borrow();
        let policy = stack.iter().rev().find_map(|(_, o)| o.policy);
        let backend = stack.iter().rev().find_map(|(_, o)| o.backend.clone());
        (policy, backend)
    });

    Config {
        kernel_policy: policy.unwrap_or_else(global_policy),
        backend: backend.unwrap_or_else(global_backend),
    }
}

/// Guard for a scoped configuration override.
///
/// Dropping the guard removes exactly its own override. Overrides pushed
/// later stay in effect even if an outer guard is dropped first. Guards are
/// tied to their thread.
#[must_use = "the override is undone as soon as the scope guard is dropped"]
pub struct ConfigScope {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ConfigScope {
    fn drop(&mut self) {
        OVERRIDES.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|(id, _)| *id == self.id) {
                stack.remove(pos);
            }
        });
    }
}

fn push(entry: Override) -> ConfigScope {
    let id = NEXT_SCOPE_ID.with(|next| {
        let id = next.get();
        next.set(id.wrapping_add(1));
        id
    });
    OVERRIDES.with(|stack| stack.borrow_mut().push((id, entry)));
    ConfigScope {
        id,
        _not_send: PhantomData,
    }
}

/// Overrides the kernel policy until the returned guard is dropped.
pub fn using_policy(policy: Policy) -> ConfigScope {
    log::trace!("entering kernel policy scope: {policy}");
    push(Override {
        policy: Some(policy),
        backend: None,
    })
}

/// Overrides the accelerated backend until the returned guard is dropped.
///
/// Passing `None` hides any globally installed backend inside the scope.
pub fn using_backend(backend: Option<Arc<dyn AcceleratedBackend>>) -> ConfigScope {
    push(Override {
        policy: None,
        backend: Some(backend),
    })
}

/// Overrides the whole configuration until the returned guard is dropped.
pub fn using_config(config: Config) -> ConfigScope {
    push(Override {
        policy: Some(config.kernel_policy),
        backend: Some(config.backend),
    })
}

/// Runs `f` with `policy` in effect and restores the previous policy afterwards.
pub fn with_policy<R>(policy: Policy, f: impl FnOnce() -> R) -> R {
    let _scope = using_policy(policy);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_values_fall_back_to_auto() {
        assert_eq!(policy_from_env_value(None), Policy::Auto);
        assert_eq!(policy_from_env_value(Some("never")), Policy::Never);
        assert_eq!(policy_from_env_value(Some("Always")), Policy::Always);
        assert_eq!(policy_from_env_value(Some("fast")), Policy::Auto);
    }

    #[test]
    fn out_of_order_drop_keeps_live_inner_overrides() {
        let depth = OVERRIDES.with(|s| s.borrow().len());
        let outer = using_backend(None);
        let inner = using_policy(Policy::Always);
        drop(outer);
        assert_eq!(current().kernel_policy, Policy::Always);
        assert_eq!(OVERRIDES.with(|s| s.borrow().len()), depth + 1);
        drop(inner);
        assert_eq!(OVERRIDES.with(|s| s.borrow().len()), depth);
    }
}
