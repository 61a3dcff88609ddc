//! Outward "please look again later" signal.
//!
//! The controller calls a [`SchedulerTrigger`] whenever it holds work that is
//! not eligible yet, either because of a delay or because a constraint is
//! unmet. Hosts plug in whatever can wake the process up; the engine never
//! relies on the callback being precise and re-checks eligibility itself.

use crate::constraint::ConstraintNotifier;
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub trait SchedulerTrigger: Send + Sync {
    fn notify_work_may_be_eligible(&self, after_delay: Duration, required_constraint_keys: &[String]);
}

/// Does nothing. Suitable when the process stays alive and constraint
/// observers are wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

impl SchedulerTrigger for NoopTrigger {
    fn notify_work_may_be_eligible(&self, _after_delay: Duration, _keys: &[String]) {}
}

/// Fans the signal out to several triggers.
#[derive(Default, Clone)]
pub struct CompositeTrigger {
    triggers: Vec<Arc<dyn SchedulerTrigger>>,
}

impl CompositeTrigger {
    pub fn new(triggers: Vec<Arc<dyn SchedulerTrigger>>) -> Self {
        Self { triggers }
    }
}

impl SchedulerTrigger for CompositeTrigger {
    fn notify_work_may_be_eligible(&self, after_delay: Duration, keys: &[String]) {
        for trigger in &self.triggers {
            trigger.notify_work_may_be_eligible(after_delay, keys);
        }
    }
}

struct TimerState {
    deadlines: BTreeSet<Instant>,
    notifier: Option<Weak<dyn ConstraintNotifier>>,
    shutdown: bool,
}

/// In-process timer: pokes the attached notifier once each requested delay
/// has elapsed.
pub struct InAppTrigger {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InAppTrigger {
    pub fn new() -> Self {
        let shared = Arc::new((
            Mutex::new(TimerState {
                deadlines: BTreeSet::new(),
                notifier: None,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("job-trigger-timer".to_string())
            .spawn(move || timer_loop(thread_shared))
            .map_err(|e| warn!("Failed to start in-app trigger timer: {}", e))
            .ok();

        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Sets who gets woken up when a deadline passes.
    pub fn attach(&self, notifier: Weak<dyn ConstraintNotifier>) {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap_or_else(PoisonError::into_inner).notifier = Some(notifier);
    }

    pub fn pending_deadlines(&self) -> usize {
        let (lock, _) = &*self.shared;
        lock.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deadlines
            .len()
    }
}

impl Default for InAppTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerTrigger for InAppTrigger {
    fn notify_work_may_be_eligible(&self, after_delay: Duration, _keys: &[String]) {
        // Constraint changes arrive through observers; only delays need a timer.
        if after_delay.is_zero() {
            return;
        }
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.deadlines.insert(Instant::now() + after_delay);
        condvar.notify_one();
    }
}

impl Drop for InAppTrigger {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.shared;
            lock.lock().unwrap_or_else(PoisonError::into_inner).shutdown = true;
            condvar.notify_all();
        }
        let thread = self
            .thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

fn timer_loop(shared: Arc<(Mutex<TimerState>, Condvar)>) {
    let (lock, condvar) = &*shared;
    let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.deadlines.first().copied() {
            None => {
                state = condvar.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) if deadline <= now => {
                state.deadlines.remove(&deadline);
                let notifier = state.notifier.as_ref().and_then(Weak::upgrade);
                drop(state);
                match notifier {
                    Some(notifier) => notifier.on_constraints_may_have_changed("timer"),
                    None => debug!("Trigger timer fired with nothing attached"),
                }
                state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) => {
                state = condvar
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
}
