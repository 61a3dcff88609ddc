//! Scheduling core.
//!
//! [`JobController`] owns the in-memory view of every outstanding job. It is
//! rebuilt from the store on [`JobController::init`] and kept consistent with
//! every mutation afterwards. All state sits behind one mutex; workers park on
//! the paired condition variable inside
//! [`JobController::pull_next_eligible_job`] and are woken by submissions,
//! finished jobs, cancellations and constraint change notifications.

mod backoff;

pub use backoff::BackoffPolicy;

use crate::constraint::{ConstraintNotifier, ConstraintRegistry};
use crate::job::{to_full_spec, Job, JobContext, JobPredicate, JobRegistry};
use crate::job_data::JobDataError;
use crate::spec::{now_millis, ConstraintSpec, FullSpec, JobSpec};
use crate::store::JobStore;
use crate::tracker::{JobState, JobTracker};
use crate::trigger::SchedulerTrigger;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Job storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("Submission would create a dependency cycle through job {0}")]
    DependencyCycle(String),

    #[error("Job {0} already exists")]
    DuplicateJob(String),

    #[error("No job factory registered for '{0}'")]
    UnknownJobFactory(String),

    #[error("Job data could not be serialized: {0}")]
    InvalidJobData(#[from] JobDataError),

    #[error("Job engine is shut down")]
    ShutDown,
}

/// A job to submit, with the edges it should wait on.
pub struct Submission {
    pub job: Box<dyn Job>,
    /// Ids of jobs that must succeed first.
    pub depends_on: Vec<String>,
    /// Also wait for every job currently in this queue.
    pub depends_on_queue: Option<String>,
}

impl Submission {
    pub fn new(job: Box<dyn Job>) -> Self {
        Self {
            job,
            depends_on: Vec::new(),
            depends_on_queue: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn depends_on_queue(mut self, queue_key: impl Into<String>) -> Self {
        self.depends_on_queue = Some(queue_key.into());
        self
    }
}

/// A job handed to exactly one worker.
pub struct RunnableJob {
    pub job: Box<dyn Job>,
    /// Snapshot of the job spec at the time the job was pulled.
    pub spec: JobSpec,
    pub context: JobContext,
}

struct JobEntry {
    spec: JobSpec,
    constraint_keys: Vec<String>,
    unmet_dependencies: HashSet<String>,
    instance: Option<Box<dyn Job>>,
    /// Submission order, tie-breaker of last resort.
    seq: u64,
    cancellation_token: CancellationToken,
}

#[derive(Default)]
struct ControllerState {
    jobs: HashMap<String, JobEntry>,
    /// Per queue key, job ids in FIFO order. Only the head may run.
    queues: HashMap<String, VecDeque<String>>,
    /// Job id to the ids of jobs waiting for it.
    dependents: HashMap<String, HashSet<String>>,
    running: HashSet<String>,
    next_seq: u64,
    shutdown: bool,
}

impl ControllerState {
    fn insert_entry(&mut self, entry: JobEntry) {
        let id = entry.spec.id.clone();
        if let Some(queue_key) = &entry.spec.queue_key {
            self.queues
                .entry(queue_key.clone())
                .or_default()
                .push_back(id.clone());
        }
        for dependency in &entry.unmet_dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(id.clone());
        }
        self.jobs.insert(id, entry);
    }

    fn remove_entry(&mut self, id: &str) -> Option<JobEntry> {
        let entry = self.jobs.remove(id)?;
        if let Some(queue_key) = &entry.spec.queue_key {
            if let Some(queue) = self.queues.get_mut(queue_key) {
                queue.retain(|queued| queued != id);
                if queue.is_empty() {
                    self.queues.remove(queue_key);
                }
            }
        }
        for dependency in &entry.unmet_dependencies {
            if let Some(waiting) = self.dependents.get_mut(dependency) {
                waiting.remove(id);
                if waiting.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        Some(entry)
    }

    fn is_queue_head(&self, spec: &JobSpec) -> bool {
        match &spec.queue_key {
            Some(queue_key) => self
                .queues
                .get(queue_key)
                .and_then(VecDeque::front)
                .is_some_and(|head| head == &spec.id),
            None => true,
        }
    }

    /// Every job transitively waiting on `id`, breadth first.
    fn dependent_closure(&self, id: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut pending: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = pending.pop_front() {
            if let Some(waiting) = self.dependents.get(current) {
                let mut waiting: Vec<&String> = waiting.iter().collect();
                waiting.sort_by_key(|w| self.jobs.get(w.as_str()).map_or(u64::MAX, |e| e.seq));
                for dependent in waiting {
                    if seen.insert(dependent.as_str()) {
                        order.push(dependent.clone());
                        pending.push_back(dependent.as_str());
                    }
                }
            }
        }
        order
    }
}

/// How a job left the controller without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Failed,
    Expired,
    Canceled,
}

/// Jobs removed from the controller whose lifecycle hooks still have to run,
/// outside the lock.
#[derive(Default)]
struct PendingHooks {
    failed: Vec<JobEntry>,
    canceled: Vec<JobEntry>,
}

impl PendingHooks {
    fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.canceled.is_empty()
    }
}

enum PullStep {
    Run(RunnableJob),
    Hooks(PendingHooks),
    Wait(Option<Duration>),
    Stop,
}

pub struct JobController {
    store: Arc<dyn JobStore>,
    job_registry: JobRegistry,
    constraints: ConstraintRegistry,
    trigger: Arc<dyn SchedulerTrigger>,
    tracker: Arc<JobTracker>,
    backoff: BackoffPolicy,
    state: Mutex<ControllerState>,
    condvar: Condvar,
}

impl JobController {
    pub fn new(
        store: Arc<dyn JobStore>,
        job_registry: JobRegistry,
        constraints: ConstraintRegistry,
        trigger: Arc<dyn SchedulerTrigger>,
        tracker: Arc<JobTracker>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            job_registry,
            constraints,
            trigger,
            tracker,
            backoff,
            state: Mutex::new(ControllerState::default()),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Loads every persisted job into memory.
    ///
    /// Jobs left flagged as running by a previous process are reset without
    /// consuming an attempt. Jobs nobody can rebuild anymore are failed and
    /// their dependents canceled.
    pub fn init(&self) -> Result<usize, ControllerError> {
        let reset = self.store.update_all_jobs_to_not_running()?;
        if reset > 0 {
            warn!(
                "Recovered {} job(s) interrupted by an unclean shutdown, they will run again",
                reset
            );
        }

        let specs = self.store.get_all_job_specs()?;
        let mut constraints: HashMap<String, Vec<String>> = HashMap::new();
        for constraint in self.store.get_all_constraint_specs()? {
            constraints
                .entry(constraint.job_id)
                .or_default()
                .push(constraint.factory_key);
        }
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        for dependency in self.store.get_all_dependency_specs()? {
            dependencies
                .entry(dependency.job_id)
                .or_default()
                .push(dependency.depends_on_job_id);
        }

        let known: HashSet<String> = specs.iter().map(|s| s.id.clone()).collect();
        let mut unknown_factories = Vec::new();
        let hooks = {
            let mut state = self.lock();
            for spec in specs {
                if !self.job_registry.contains(&spec.factory_key) {
                    unknown_factories.push(spec.id.clone());
                }
                let unmet_dependencies: HashSet<String> = dependencies
                    .remove(&spec.id)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|d| known.contains(d))
                    .collect();
                self.tracker.on_state_changed(
                    &spec.id,
                    &spec.factory_key,
                    spec.queue_key.as_deref(),
                    JobState::Pending,
                );
                let seq = state.next_seq;
                state.next_seq += 1;
                state.insert_entry(JobEntry {
                    constraint_keys: constraints.remove(&spec.id).unwrap_or_default(),
                    spec,
                    unmet_dependencies,
                    instance: None,
                    seq,
                    cancellation_token: CancellationToken::new(),
                });
            }

            let mut hooks = PendingHooks::default();
            for id in unknown_factories {
                if state.jobs.contains_key(&id) {
                    error!("No job factory can rebuild job {}, failing it", id);
                    self.remove_failed_locked(&mut state, &id, Removal::Failed, &mut hooks)?;
                }
            }
            let loaded = state.jobs.len();
            info!("Job controller initialized with {} job(s)", loaded);
            hooks
        };
        self.run_hooks(hooks);
        self.condvar.notify_all();
        Ok(self.lock().jobs.len())
    }

    pub fn submit(&self, job: Box<dyn Job>, depends_on: &[String]) -> Result<(), ControllerError> {
        self.submit_all(vec![Submission::new(job).depends_on(depends_on.iter().cloned())])
    }

    /// Persists and schedules a batch of jobs atomically.
    ///
    /// Jobs in the batch may depend on each other. Never waits for execution.
    pub fn submit_all(&self, submissions: Vec<Submission>) -> Result<(), ControllerError> {
        if submissions.is_empty() {
            return Ok(());
        }
        let mut triggers: Vec<(Duration, Vec<String>)> = Vec::new();
        {
            let mut state = self.lock();
            if state.shutdown {
                return Err(ControllerError::ShutDown);
            }

            let mut batch_ids: HashSet<String> = HashSet::new();
            for submission in &submissions {
                let id = submission.job.id();
                if state.jobs.contains_key(id) || !batch_ids.insert(id.to_string()) {
                    return Err(ControllerError::DuplicateJob(id.to_string()));
                }
                if !self.job_registry.contains(submission.job.factory_key()) {
                    return Err(ControllerError::UnknownJobFactory(
                        submission.job.factory_key().to_string(),
                    ));
                }
            }

            let mut full_specs: Vec<FullSpec> = Vec::with_capacity(submissions.len());
            for submission in &submissions {
                let mut depends_on = submission.depends_on.clone();
                if let Some(queue_key) = &submission.depends_on_queue {
                    if let Some(queue) = state.queues.get(queue_key) {
                        depends_on.extend(queue.iter().cloned());
                    }
                }
                full_specs.push(to_full_spec(submission.job.as_ref(), &depends_on)?);
            }
            Self::check_for_cycles(&full_specs)?;

            let persisted: Vec<FullSpec> = full_specs
                .iter()
                .filter(|spec| !spec.job.is_memory_only)
                .cloned()
                .collect();
            if !persisted.is_empty() {
                self.store.insert_jobs(&persisted)?;
            }

            let now = now_millis();
            for (submission, full_spec) in submissions.into_iter().zip(full_specs) {
                let FullSpec {
                    job: spec,
                    constraints,
                    dependencies,
                } = full_spec;
                let constraint_keys: Vec<String> =
                    constraints.into_iter().map(|c| c.factory_key).collect();
                let unmet_dependencies: HashSet<String> = dependencies
                    .into_iter()
                    .map(|d| d.depends_on_job_id)
                    .filter(|d| state.jobs.contains_key(d) || batch_ids.contains(d))
                    .collect();

                let delay = Duration::from_millis((spec.next_run_attempt_time - now).max(0) as u64);
                let unmet_constraints = self.constraints.unmet_trigger_keys(&constraint_keys, &spec);
                if !delay.is_zero() || !unmet_constraints.is_empty() {
                    triggers.push((delay, unmet_constraints));
                }

                debug!(
                    "Submitted job {} ({}) queue={:?} dependencies={} constraints={:?}",
                    spec.id,
                    spec.factory_key,
                    spec.queue_key,
                    unmet_dependencies.len(),
                    constraint_keys
                );
                self.tracker.on_state_changed(
                    &spec.id,
                    &spec.factory_key,
                    spec.queue_key.as_deref(),
                    JobState::Pending,
                );
                let seq = state.next_seq;
                state.next_seq += 1;
                state.insert_entry(JobEntry {
                    spec,
                    constraint_keys,
                    unmet_dependencies,
                    instance: Some(submission.job),
                    seq,
                    cancellation_token: CancellationToken::new(),
                });
            }
        }

        for (delay, keys) in triggers {
            self.trigger.notify_work_may_be_eligible(delay, &keys);
        }
        self.condvar.notify_all();
        Ok(())
    }

    /// Rejects batches whose dependency edges loop. Existing jobs can never
    /// depend on new ones, so only edges inside the batch matter.
    ///
    /// A queued job also waits on the batch job queued right before it, since
    /// only the queue head may run.
    fn check_for_cycles(specs: &[FullSpec]) -> Result<(), ControllerError> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::with_capacity(specs.len());
        let mut queue_tails: HashMap<&str, &str> = HashMap::new();
        for spec in specs {
            let id = spec.job.id.as_str();
            let mut waits_on: Vec<&str> = spec
                .dependencies
                .iter()
                .map(|d| d.depends_on_job_id.as_str())
                .collect();
            if let Some(queue_key) = spec.job.queue_key.as_deref() {
                if let Some(previous) = queue_tails.insert(queue_key, id) {
                    waits_on.push(previous);
                }
            }
            edges.insert(id, waits_on);
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            id: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), ControllerError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(ControllerError::DependencyCycle(id.to_string())),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(next) = edges.get(id) {
                for dependency in next {
                    if edges.contains_key(dependency) {
                        visit(*dependency, edges, marks)?;
                    }
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for spec in specs {
            visit(spec.job.id.as_str(), &edges, &mut marks)?;
        }
        Ok(())
    }

    /// Blocks until a job is eligible and hands it to the caller, or returns
    /// `None` once the controller shuts down.
    ///
    /// With a predicate only matching jobs are considered.
    pub fn pull_next_eligible_job(&self, predicate: Option<&JobPredicate>) -> Option<RunnableJob> {
        let mut state = self.lock();
        loop {
            match self.next_pull_step(&mut state, predicate) {
                PullStep::Run(runnable) => return Some(runnable),
                PullStep::Stop => return None,
                PullStep::Hooks(hooks) => {
                    drop(state);
                    self.run_hooks(hooks);
                    state = self.lock();
                }
                PullStep::Wait(Some(timeout)) => {
                    state = self
                        .condvar
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                PullStep::Wait(None) => {
                    state = self
                        .condvar
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn next_pull_step(
        &self,
        state: &mut ControllerState,
        predicate: Option<&JobPredicate>,
    ) -> PullStep {
        if state.shutdown {
            return PullStep::Stop;
        }
        let now = now_millis();

        let mut expired: Vec<(u64, String)> = state
            .jobs
            .iter()
            .filter(|(id, entry)| !state.running.contains(*id) && entry.spec.is_expired(now))
            .map(|(id, entry)| (entry.seq, id.clone()))
            .collect();
        if !expired.is_empty() {
            expired.sort();
            let mut hooks = PendingHooks::default();
            for (_, id) in expired {
                if state.jobs.contains_key(&id) {
                    info!("Job {} outlived its lifespan, failing it", id);
                    if let Err(e) = self.remove_failed_locked(state, &id, Removal::Expired, &mut hooks) {
                        error!("Failed to delete expired job {}: {}", id, e);
                    }
                }
            }
            return PullStep::Hooks(hooks);
        }

        let candidate = state
            .jobs
            .iter()
            .filter(|(id, entry)| {
                !state.running.contains(*id)
                    && entry.unmet_dependencies.is_empty()
                    && entry.spec.next_run_attempt_time <= now
                    && state.is_queue_head(&entry.spec)
                    && predicate.map_or(true, |p| (**p)(&entry.spec))
                    && self.constraints.all_met(&entry.constraint_keys, &entry.spec)
            })
            .min_by_key(|(_, entry)| {
                (
                    entry.spec.next_run_attempt_time,
                    entry.spec.create_time,
                    entry.seq,
                )
            })
            .map(|(id, _)| id.clone());

        if let Some(id) = candidate {
            return match self.claim_locked(state, &id) {
                Ok(runnable) => PullStep::Run(runnable),
                Err(hooks) => PullStep::Hooks(hooks),
            };
        }

        let next_due = state
            .jobs
            .iter()
            .filter(|(id, _)| !state.running.contains(*id))
            .flat_map(|(_, entry)| {
                let due = Some(entry.spec.next_run_attempt_time).filter(|t| *t > now);
                [due, entry.spec.expiration_time()]
            })
            .flatten()
            .min();
        PullStep::Wait(next_due.map(|t| Duration::from_millis((t - now).max(1) as u64)))
    }

    /// Marks `id` running and builds its runnable form. A job that cannot be
    /// rebuilt is failed instead and its pending hooks returned.
    fn claim_locked(&self, state: &mut ControllerState, id: &str) -> Result<RunnableJob, PendingHooks> {
        let rebuilt = {
            let Some(entry) = state.jobs.get_mut(id) else {
                return Err(PendingHooks::default());
            };
            match entry.instance.take() {
                Some(job) => Ok(job),
                None => self
                    .job_registry
                    .instantiate(&entry.spec, &constraint_specs(&entry.spec.id, &entry.constraint_keys)),
            }
        };

        let job = match rebuilt {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to rebuild job {}: {:#}", id, e);
                let mut hooks = PendingHooks::default();
                if let Err(e) = self.remove_failed_locked(state, id, Removal::Failed, &mut hooks) {
                    error!("Failed to delete job {}: {}", id, e);
                }
                return Err(hooks);
            }
        };

        state.running.insert(id.to_string());
        let Some(entry) = state.jobs.get_mut(id) else {
            return Err(PendingHooks::default());
        };
        entry.spec.is_running = true;
        if !entry.spec.is_memory_only {
            if let Err(e) = self.store.mark_job_running(id, true) {
                error!("Failed to persist running flag of job {}: {:#}", id, e);
            }
        }
        self.tracker.on_state_changed(
            id,
            &entry.spec.factory_key,
            entry.spec.queue_key.as_deref(),
            JobState::Running,
        );

        Ok(RunnableJob {
            job,
            spec: entry.spec.clone(),
            context: JobContext {
                job_id: id.to_string(),
                attempt: entry.spec.run_attempt + 1,
                cancellation_token: entry.cancellation_token.clone(),
            },
        })
    }

    /// Records a successful run and unblocks the jobs waiting for it.
    pub fn on_success(&self, id: &str) {
        let mut state = self.lock();
        let Some(entry) = state.remove_entry(id) else {
            warn!("Success reported for unknown job {}", id);
            return;
        };
        if let Some(waiting) = state.dependents.remove(id) {
            for dependent in waiting {
                if let Some(dependent) = state.jobs.get_mut(&dependent) {
                    dependent.unmet_dependencies.remove(id);
                }
            }
        }
        if !entry.spec.is_memory_only {
            if let Err(e) = self.store.delete_job(id) {
                error!("Failed to delete finished job {}: {:#}", id, e);
            }
        }
        self.tracker.on_state_changed(
            id,
            &entry.spec.factory_key,
            entry.spec.queue_key.as_deref(),
            JobState::Success,
        );
    }

    /// Schedules another attempt. `backoff` overrides the computed backoff.
    ///
    /// The job's current payload replaces the stored one.
    pub fn on_retry(&self, id: &str, job: Box<dyn Job>, backoff: Option<Duration>) {
        let trigger = {
            let mut state = self.lock();
            let Some(entry) = state.jobs.get_mut(id) else {
                warn!("Retry reported for unknown job {}", id);
                return;
            };

            let run_attempt = entry.spec.run_attempt + 1;
            let backoff = backoff.unwrap_or_else(|| self.backoff.next_backoff(run_attempt));
            let next_run_attempt_time = now_millis()
                .saturating_add(backoff.as_millis().min(i64::MAX as u128) as i64);

            match job.serialize().serialize() {
                Ok(serialized_data) => entry.spec.serialized_data = serialized_data,
                Err(e) => warn!("Keeping previous data of job {}: {}", id, e),
            }
            entry.spec.run_attempt = run_attempt;
            entry.spec.next_run_attempt_time = next_run_attempt_time;
            entry.spec.is_running = false;
            entry.instance = Some(job);

            if !entry.spec.is_memory_only {
                if let Err(e) = self.store.update_job_after_retry(
                    id,
                    false,
                    run_attempt,
                    next_run_attempt_time,
                    &entry.spec.serialized_data,
                ) {
                    error!("Failed to persist retry of job {}: {:#}", id, e);
                }
            }
            info!(
                "Job {} will retry in {:?} (attempt {} of {:?})",
                id,
                backoff,
                run_attempt + 1,
                entry.spec.max_attempts
            );
            self.tracker.on_state_changed(
                id,
                &entry.spec.factory_key,
                entry.spec.queue_key.as_deref(),
                JobState::Pending,
            );
            (
                backoff,
                self.constraints
                    .unmet_trigger_keys(&entry.constraint_keys, &entry.spec),
            )
        };
        self.trigger.notify_work_may_be_eligible(trigger.0, &trigger.1);
    }

    /// Records a permanent failure and returns every job transitively
    /// depending on it, already removed. The caller runs their `on_canceled`.
    pub fn on_failure(&self, id: &str) -> Vec<Box<dyn Job>> {
        let mut hooks = PendingHooks::default();
        {
            let mut state = self.lock();
            if !state.jobs.contains_key(id) {
                warn!("Failure reported for unknown job {}", id);
                return Vec::new();
            }
            if let Err(e) = self.remove_failed_locked(&mut state, id, Removal::Failed, &mut hooks) {
                error!("Failed to delete failed job {}: {}", id, e);
            }
        }
        // The failed job itself is owned by the worker; only dependents are returned.
        hooks
            .canceled
            .into_iter()
            .filter_map(|entry| self.materialize(entry))
            .collect()
    }

    /// Releases the job's running slot and wakes waiting workers.
    pub fn on_job_finished(&self, id: &str) {
        let mut state = self.lock();
        state.running.remove(id);
        drop(state);
        self.condvar.notify_all();
    }

    /// Cancels a job. A pending job is removed at once and its dependents are
    /// canceled too; a running job is asked to stop through its cancellation
    /// token and its outcome will count as a failure.
    ///
    /// Returns `false` when the job is unknown.
    pub fn cancel(&self, id: &str) -> Result<bool, ControllerError> {
        let mut hooks = PendingHooks::default();
        let result = {
            let mut state = self.lock();
            if state.running.contains(id) {
                if let Some(entry) = state.jobs.get(id) {
                    info!("Requesting cancellation of running job {}", id);
                    entry.cancellation_token.cancel();
                }
                Ok(true)
            } else if state.jobs.contains_key(id) {
                self.remove_failed_locked(&mut state, id, Removal::Canceled, &mut hooks)
                    .map(|_| true)
                    .map_err(ControllerError::from)
            } else {
                Ok(false)
            }
        };
        self.run_hooks(hooks);
        self.condvar.notify_all();
        result
    }

    /// Cancels every job currently in `queue_key`. Returns how many were found.
    pub fn cancel_all_in_queue(&self, queue_key: &str) -> Result<usize, ControllerError> {
        let ids: Vec<String> = self
            .lock()
            .queues
            .get(queue_key)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default();
        let mut canceled = 0;
        for id in ids {
            if self.cancel(&id)? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    /// Removes `id` and its dependent closure, queuing their hooks and
    /// deleting their rows. In-memory state is updated even if the store fails.
    fn remove_failed_locked(
        &self,
        state: &mut ControllerState,
        id: &str,
        removal: Removal,
        hooks: &mut PendingHooks,
    ) -> anyhow::Result<()> {
        let closure = state.dependent_closure(id);
        let Some(root) = state.remove_entry(id) else {
            return Ok(());
        };
        state.dependents.remove(id);

        let mut deleted: Vec<String> = Vec::with_capacity(closure.len() + 1);
        if !root.spec.is_memory_only {
            deleted.push(root.spec.id.clone());
        }
        let (root_state, verb) = match removal {
            Removal::Canceled => (JobState::Canceled, "Canceled"),
            Removal::Failed | Removal::Expired => (JobState::Failure, "Failed"),
        };
        warn!("{} job {} ({})", verb, root.spec.id, root.spec.factory_key);
        self.tracker.on_state_changed(
            &root.spec.id,
            &root.spec.factory_key,
            root.spec.queue_key.as_deref(),
            root_state,
        );

        match removal {
            Removal::Canceled => hooks.canceled.push(root),
            Removal::Expired => hooks.failed.push(root),
            // The worker still owns the instance and runs its hook.
            Removal::Failed => {}
        }

        for dependent_id in closure {
            let Some(dependent) = state.remove_entry(&dependent_id) else {
                continue;
            };
            state.dependents.remove(&dependent_id);
            info!(
                "Canceling job {} because its dependency {} did not succeed",
                dependent_id, id
            );
            if !dependent.spec.is_memory_only {
                deleted.push(dependent_id.clone());
            }
            self.tracker.on_state_changed(
                &dependent_id,
                &dependent.spec.factory_key,
                dependent.spec.queue_key.as_deref(),
                JobState::Canceled,
            );
            hooks.canceled.push(dependent);
        }

        self.store.delete_jobs(&deleted)
    }

    fn materialize(&self, mut entry: JobEntry) -> Option<Box<dyn Job>> {
        if let Some(job) = entry.instance.take() {
            return Some(job);
        }
        match self
            .job_registry
            .instantiate(&entry.spec, &constraint_specs(&entry.spec.id, &entry.constraint_keys))
        {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Skipping lifecycle hook of job {}: {:#}", entry.spec.id, e);
                None
            }
        }
    }

    fn run_hooks(&self, hooks: PendingHooks) {
        if hooks.is_empty() {
            return;
        }
        for entry in hooks.failed {
            if let Some(mut job) = self.materialize(entry) {
                invoke_on_failure(job.as_mut());
            }
        }
        for entry in hooks.canceled {
            if let Some(mut job) = self.materialize(entry) {
                invoke_on_canceled(job.as_mut());
            }
        }
    }

    /// Re-scans for eligible work.
    ///
    /// Goes through the lock so a worker between its scan and its wait
    /// cannot miss the notification.
    pub fn wake_up(&self) {
        drop(self.lock());
        self.condvar.notify_all();
    }

    /// Stops handing out jobs. Running jobs are left to finish.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.condvar.notify_all();
    }

    /// Specs of outstanding jobs matching `predicate`, in submission order.
    pub fn find(&self, predicate: impl Fn(&JobSpec) -> bool) -> Vec<JobSpec> {
        let state = self.lock();
        let mut found: Vec<(u64, JobSpec)> = state
            .jobs
            .values()
            .filter(|entry| predicate(&entry.spec))
            .map(|entry| (entry.seq, entry.spec.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, spec)| spec).collect()
    }

    pub fn is_queue_empty(&self, queue_key: &str) -> bool {
        !self.lock().queues.contains_key(queue_key)
    }

    pub fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        let state = self.lock();
        queue_keys.iter().all(|key| !state.queues.contains_key(key))
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Human readable dump of the controller state.
    pub fn debug_info(&self) -> String {
        let state = self.lock();
        let mut entries: Vec<&JobEntry> = state.jobs.values().collect();
        entries.sort_by_key(|entry| entry.seq);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "jobs={} running={} queues={} shutdown={}",
            state.jobs.len(),
            state.running.len(),
            state.queues.len(),
            state.shutdown
        );
        for entry in entries {
            let spec = &entry.spec;
            let _ = writeln!(
                out,
                "  {} factory={} queue={} attempt={}/{:?} next_run={} running={} deps={} constraints=[{}]",
                spec.id,
                spec.factory_key,
                spec.queue_key.as_deref().unwrap_or("-"),
                spec.run_attempt,
                spec.max_attempts,
                spec.next_run_attempt_time,
                state.running.contains(&spec.id),
                entry.unmet_dependencies.len(),
                entry.constraint_keys.join(",")
            );
        }
        out
    }
}

impl ConstraintNotifier for JobController {
    fn on_constraints_may_have_changed(&self, reason: &str) {
        debug!("Re-evaluating jobs: {}", reason);
        self.wake_up();
    }
}

fn constraint_specs(job_id: &str, keys: &[String]) -> Vec<ConstraintSpec> {
    keys.iter()
        .map(|key| ConstraintSpec {
            job_id: job_id.to_string(),
            factory_key: key.clone(),
        })
        .collect()
}

/// Runs `on_canceled`, containing any panic to this job.
pub(crate) fn invoke_on_canceled(job: &mut dyn Job) {
    let id = job.id().to_string();
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job.on_canceled())) {
        error!("on_canceled of job {} panicked: {}", id, panic_message(&*panic));
    }
}

/// Runs `on_failure`, containing any panic to this job.
pub(crate) fn invoke_on_failure(job: &mut dyn Job) {
    let id = job.id().to_string();
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job.on_failure())) {
        error!("on_failure of job {} panicked: {}", id, panic_message(&*panic));
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
