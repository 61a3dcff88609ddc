//! Named boolean gates on job eligibility.
//!
//! A [`Constraint`] is evaluated fresh every time the controller looks for
//! work; it must not cache and must not mutate anything. State changes in the
//! outside world reach the engine through a [`ConstraintObserver`], which
//! pokes the registered [`ConstraintNotifier`] so the controller re-scans.

use crate::spec::JobSpec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

pub trait Constraint: Send + Sync {
    /// Key persisted in constraint specs to identify this constraint type.
    fn factory_key(&self) -> &str;

    /// Current state of the gate for `job`.
    ///
    /// Called with the controller lock held: keep it cheap and never call
    /// back into the engine from here.
    fn is_met(&self, job: &JobSpec) -> bool;

    /// Keys handed to the scheduler trigger while a job waits on this
    /// constraint, so the host can arrange a wake-up instead of polling.
    fn trigger_keys(&self) -> Vec<String> {
        vec![self.factory_key().to_string()]
    }
}

/// Entry point for "the world may have changed, look again".
///
/// Safe to call from any thread.
pub trait ConstraintNotifier: Send + Sync {
    fn on_constraints_may_have_changed(&self, reason: &str);
}

/// Watches some external state and notifies the engine when it changes.
pub trait ConstraintObserver: Send + Sync {
    fn register(&self, notifier: Weak<dyn ConstraintNotifier>);
}

/// Maps constraint factory keys to their implementations.
#[derive(Default, Clone)]
pub struct ConstraintRegistry {
    constraints: HashMap<String, Arc<dyn Constraint>>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, constraint: Arc<dyn Constraint>) {
        let key = constraint.factory_key().to_string();
        if self.constraints.insert(key.clone(), constraint).is_some() {
            warn!("Constraint {} registered twice, keeping the latest", key);
        }
    }

    pub fn with(mut self, constraint: Arc<dyn Constraint>) -> Self {
        self.register(constraint);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Constraint>> {
        self.constraints.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constraints.contains_key(key)
    }

    /// True only if every key is known and currently met. Unknown keys count as unmet.
    pub fn all_met(&self, keys: &[String], job: &JobSpec) -> bool {
        keys.iter().all(|key| match self.constraints.get(key) {
            Some(constraint) => constraint.is_met(job),
            None => {
                warn!(
                    "Job {} requires unknown constraint '{}', treating it as unmet",
                    job.id, key
                );
                false
            }
        })
    }

    /// Trigger keys of every constraint in `keys` that is currently unmet.
    pub fn unmet_trigger_keys(&self, keys: &[String], job: &JobSpec) -> Vec<String> {
        let mut out = Vec::new();
        for key in keys {
            match self.constraints.get(key) {
                Some(constraint) if !constraint.is_met(job) => {
                    for trigger_key in constraint.trigger_keys() {
                        if !out.contains(&trigger_key) {
                            out.push(trigger_key);
                        }
                    }
                }
                Some(_) => {}
                None => {
                    if !out.contains(key) {
                        out.push(key.clone());
                    }
                }
            }
        }
        out
    }
}

struct FlagState {
    key: String,
    value: AtomicBool,
    notifiers: Mutex<Vec<Weak<dyn ConstraintNotifier>>>,
}

/// A host-controlled boolean condition, such as "network available".
///
/// Cloning shares the underlying state. Hand [`ConstraintFlag::constraint`] to
/// the constraint registry and [`ConstraintFlag::observer`] to the engine's
/// observers, then flip the flag with [`ConstraintFlag::set`].
#[derive(Clone)]
pub struct ConstraintFlag {
    state: Arc<FlagState>,
}

impl ConstraintFlag {
    pub fn new(key: impl Into<String>, initial: bool) -> Self {
        Self {
            state: Arc::new(FlagState {
                key: key.into(),
                value: AtomicBool::new(initial),
                notifiers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn get(&self) -> bool {
        self.state.value.load(Ordering::SeqCst)
    }

    /// Updates the flag and notifies registered engines when the value changed.
    pub fn set(&self, value: bool) {
        let previous = self.state.value.swap(value, Ordering::SeqCst);
        if previous == value {
            return;
        }
        debug!("Constraint flag {} changed to {}", self.state.key, value);

        let notifiers: Vec<Arc<dyn ConstraintNotifier>> = {
            let mut notifiers = self
                .state
                .notifiers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            notifiers.retain(|n| n.strong_count() > 0);
            notifiers.iter().filter_map(Weak::upgrade).collect()
        };
        let reason = format!("{}={}", self.state.key, value);
        for notifier in notifiers {
            notifier.on_constraints_may_have_changed(&reason);
        }
    }

    pub fn constraint(&self) -> Arc<dyn Constraint> {
        Arc::new(FlagConstraint {
            state: Arc::clone(&self.state),
        })
    }

    pub fn observer(&self) -> Arc<dyn ConstraintObserver> {
        Arc::new(FlagObserver {
            state: Arc::clone(&self.state),
        })
    }
}

struct FlagConstraint {
    state: Arc<FlagState>,
}

impl Constraint for FlagConstraint {
    fn factory_key(&self) -> &str {
        &self.state.key
    }

    fn is_met(&self, _job: &JobSpec) -> bool {
        self.state.value.load(Ordering::SeqCst)
    }
}

struct FlagObserver {
    state: Arc<FlagState>,
}

impl ConstraintObserver for FlagObserver {
    fn register(&self, notifier: Weak<dyn ConstraintNotifier>) {
        self.state
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifier);
    }
}
