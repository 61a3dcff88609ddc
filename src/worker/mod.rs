//! Execution threads.
//!
//! Every [`JobRunner`] loops on the controller: pull an eligible job, hold a
//! wake lock while it runs, classify the outcome and report it back. Nothing a
//! job does, panics included, can take a runner down.

use crate::controller::{
    invoke_on_canceled, invoke_on_failure, panic_message, JobController, RunnableJob,
};
use crate::job::{JobPredicate, JobResult};
use anyhow::{Context, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Keeps the host awake while a job runs.
pub trait WakeLock: Send + Sync {
    fn acquire(&self, tag: &str);
    fn release(&self, tag: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, _tag: &str) {}
    fn release(&self, _tag: &str) {}
}

/// Holds a wake lock until dropped.
pub struct WakeLockGuard<'a> {
    lock: &'a dyn WakeLock,
    tag: String,
}

impl<'a> WakeLockGuard<'a> {
    pub fn acquire(lock: &'a dyn WakeLock, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        lock.acquire(&tag);
        Self { lock, tag }
    }
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.tag);
    }
}

/// Final classification of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Retry,
    Failure,
    /// Canceled while running. Reported to the controller as a failure.
    Canceled,
}

pub struct JobRunner {
    name: String,
    controller: Arc<JobController>,
    predicate: Option<JobPredicate>,
    wake_lock: Arc<dyn WakeLock>,
}

impl JobRunner {
    pub fn new(
        name: impl Into<String>,
        controller: Arc<JobController>,
        predicate: Option<JobPredicate>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            name: name.into(),
            controller,
            predicate,
            wake_lock,
        }
    }

    /// Runs jobs until the controller shuts down.
    pub fn run_loop(&self) {
        debug!("Job runner {} started", self.name);
        while let Some(runnable) = self.controller.pull_next_eligible_job(self.predicate.as_ref()) {
            self.run_one(runnable);
        }
        debug!("Job runner {} stopped", self.name);
    }

    /// Executes one pulled job and reports its outcome.
    pub fn run_one(&self, runnable: RunnableJob) -> RunOutcome {
        let RunnableJob {
            mut job,
            spec,
            context,
        } = runnable;
        let id = spec.id.clone();

        let _wake_lock = WakeLockGuard::acquire(self.wake_lock.as_ref(), format!("job:{}", id));
        info!(
            "[{}] Running job {} ({}) attempt {}",
            self.name, id, spec.factory_key, context.attempt
        );
        let started = Instant::now();

        let result = match catch_unwind(AssertUnwindSafe(|| job.run(&context))) {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    "[{}] Job {} panicked: {}",
                    self.name,
                    id,
                    panic_message(&*panic)
                );
                JobResult::Failure
            }
        };
        let elapsed = started.elapsed();

        let outcome = if context.is_cancelled() {
            RunOutcome::Canceled
        } else {
            match result {
                JobResult::Success => RunOutcome::Success,
                JobResult::Retry(_) if spec.max_attempts.is_exceeded_by(context.attempt + 1) => {
                    warn!(
                        "Job {} asked to retry but used all {:?} attempts",
                        id, spec.max_attempts
                    );
                    RunOutcome::Failure
                }
                JobResult::Retry(_) => RunOutcome::Retry,
                JobResult::Failure => RunOutcome::Failure,
            }
        };

        match outcome {
            RunOutcome::Success => {
                info!("Job {} succeeded in {:?}", id, elapsed);
                self.controller.on_success(&id);
            }
            RunOutcome::Retry => {
                let backoff = match result {
                    JobResult::Retry(backoff) => backoff,
                    _ => None,
                };
                info!("Job {} finished in {:?}, retrying", id, elapsed);
                self.controller.on_retry(&id, job, backoff);
            }
            RunOutcome::Failure | RunOutcome::Canceled => {
                warn!(
                    "Job {} {} after {:?}",
                    id,
                    if outcome == RunOutcome::Canceled {
                        "was canceled"
                    } else {
                        "failed permanently"
                    },
                    elapsed
                );
                let dependents = self.controller.on_failure(&id);
                invoke_on_failure(job.as_mut());
                for mut dependent in dependents {
                    invoke_on_canceled(dependent.as_mut());
                }
            }
        }

        self.controller.on_job_finished(&id);
        outcome
    }
}

/// Fixed set of runner threads sharing one controller.
pub struct WorkerPool {
    controller: Arc<JobController>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `general_runners` unrestricted runners plus one reserved runner
    /// per predicate.
    pub fn start(
        controller: Arc<JobController>,
        general_runners: usize,
        reserved: Vec<JobPredicate>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Result<Self> {
        let mut runners: Vec<JobRunner> = Vec::with_capacity(general_runners + reserved.len());
        for i in 0..general_runners {
            runners.push(JobRunner::new(
                format!("job-runner-{}", i),
                controller.clone(),
                None,
                wake_lock.clone(),
            ));
        }
        for (i, predicate) in reserved.into_iter().enumerate() {
            runners.push(JobRunner::new(
                format!("job-runner-reserved-{}", i),
                controller.clone(),
                Some(predicate),
                wake_lock.clone(),
            ));
        }

        let mut threads = Vec::with_capacity(runners.len());
        for runner in runners {
            let name = runner.name.clone();
            let spawned = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || runner.run_loop());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // Runners already started would otherwise block forever.
                    Self {
                        controller,
                        threads,
                    }
                    .shutdown();
                    return Err(e).with_context(|| format!("Failed to spawn {}", name));
                }
            }
        }
        info!("Started {} job runner(s)", threads.len());

        Ok(Self {
            controller,
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Stops handing out jobs and waits for running ones to finish.
    pub fn shutdown(self) {
        self.controller.shutdown();
        for handle in self.threads {
            if handle.join().is_err() {
                error!("A job runner thread panicked");
            }
        }
        info!("Job runners stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConstraintRegistry;
    use crate::controller::BackoffPolicy;
    use crate::job::{Job, JobContext, JobFactory, JobParameters, JobRegistry};
    use crate::job_data::JobData;
    use crate::store::{JobStore, SqliteJobStore};
    use crate::tracker::{JobState, JobTracker};
    use crate::trigger::NoopTrigger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Retry,
        Fail,
        Panic,
        WaitForCancel,
    }

    struct ScriptedJob {
        parameters: JobParameters,
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
        hooks: Arc<Mutex<Vec<String>>>,
    }

    impl Job for ScriptedJob {
        fn factory_key(&self) -> &str {
            "scripted"
        }

        fn parameters(&self) -> &JobParameters {
            &self.parameters
        }

        fn serialize(&self) -> JobData {
            JobData::builder()
                .put_int("runs", self.runs.load(Ordering::SeqCst) as i32)
                .build()
        }

        fn run(&mut self, ctx: &JobContext) -> JobResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => JobResult::Success,
                Behavior::Retry => JobResult::retry_after(Duration::ZERO),
                Behavior::Fail => JobResult::Failure,
                Behavior::Panic => panic!("boom"),
                Behavior::WaitForCancel => {
                    while !ctx.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    JobResult::Success
                }
            }
        }

        fn on_canceled(&mut self) {
            self.hooks
                .lock()
                .unwrap()
                .push(format!("canceled:{}", self.parameters.id));
        }

        fn on_failure(&mut self) {
            self.hooks
                .lock()
                .unwrap()
                .push(format!("failed:{}", self.parameters.id));
        }
    }

    #[derive(Default)]
    struct CountingWakeLock {
        held: AtomicUsize,
        acquired: AtomicUsize,
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self, _tag: &str) {
            self.held.fetch_add(1, Ordering::SeqCst);
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self, _tag: &str) {
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        controller: Arc<JobController>,
        store: Arc<SqliteJobStore>,
        runs: Arc<AtomicUsize>,
        hooks: Arc<Mutex<Vec<String>>>,
        wake_lock: Arc<CountingWakeLock>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(SqliteJobStore::in_memory().unwrap());
            let factory: Arc<dyn JobFactory> = Arc::new(
                |_parameters: JobParameters, _data: JobData| -> anyhow::Result<Box<dyn Job>> {
                    anyhow::bail!("scripted jobs are never rebuilt in these tests")
                },
            );
            let controller = Arc::new(JobController::new(
                store.clone(),
                JobRegistry::new().with("scripted", factory),
                ConstraintRegistry::new(),
                Arc::new(NoopTrigger),
                Arc::new(JobTracker::new(100)),
                BackoffPolicy::default(),
            ));
            controller.init().unwrap();
            Self {
                controller,
                store,
                runs: Arc::new(AtomicUsize::new(0)),
                hooks: Arc::new(Mutex::new(Vec::new())),
                wake_lock: Arc::new(CountingWakeLock::default()),
            }
        }

        fn submit(&self, id: &str, behavior: Behavior, max_attempts: u32, depends_on: &[&str]) {
            let job = ScriptedJob {
                parameters: JobParameters::builder()
                    .id(id)
                    .max_attempts(max_attempts)
                    .build(),
                behavior,
                runs: self.runs.clone(),
                hooks: self.hooks.clone(),
            };
            let depends_on: Vec<String> = depends_on.iter().map(|s| s.to_string()).collect();
            self.controller.submit(Box::new(job), &depends_on).unwrap();
        }

        fn runner(&self) -> JobRunner {
            JobRunner::new(
                "test-runner",
                self.controller.clone(),
                None,
                self.wake_lock.clone(),
            )
        }

        fn run_next(&self) -> RunOutcome {
            let runnable = self.controller.pull_next_eligible_job(None).unwrap();
            self.runner().run_one(runnable)
        }
    }

    #[test]
    fn test_success_removes_job() {
        let f = Fixture::new();
        f.submit("a", Behavior::Succeed, 1, &[]);

        assert_eq!(f.run_next(), RunOutcome::Success);
        assert!(f.store.get_job_spec("a").unwrap().is_none());
        assert_eq!(f.controller.tracker().state("a"), Some(JobState::Success));
        assert_eq!(f.wake_lock.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(f.wake_lock.held.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_escalates_to_failure_on_last_attempt() {
        let f = Fixture::new();
        f.submit("a", Behavior::Retry, 2, &[]);

        assert_eq!(f.run_next(), RunOutcome::Retry);
        let stored = f.store.get_job_spec("a").unwrap().unwrap();
        assert_eq!(stored.run_attempt, 1);
        assert_eq!(
            JobData::deserialize(&stored.serialized_data)
                .unwrap()
                .get_int("runs")
                .unwrap(),
            1
        );

        assert_eq!(f.run_next(), RunOutcome::Failure);
        assert_eq!(f.runs.load(Ordering::SeqCst), 2);
        assert!(f.store.get_job_spec("a").unwrap().is_none());
        assert_eq!(*f.hooks.lock().unwrap(), vec!["failed:a".to_string()]);
    }

    #[test]
    fn test_panic_is_failure_and_cancels_dependents() {
        let f = Fixture::new();
        f.submit("a", Behavior::Panic, 1, &[]);
        f.submit("b", Behavior::Succeed, 1, &["a"]);

        assert_eq!(f.run_next(), RunOutcome::Failure);
        assert_eq!(f.wake_lock.held.load(Ordering::SeqCst), 0);

        let hooks = f.hooks.lock().unwrap().clone();
        assert!(hooks.contains(&"failed:a".to_string()));
        assert!(hooks.contains(&"canceled:b".to_string()));
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
        assert_eq!(f.controller.tracker().state("b"), Some(JobState::Canceled));
    }

    #[test]
    fn test_self_reported_failure() {
        let f = Fixture::new();
        f.submit("a", Behavior::Fail, 5, &[]);
        assert_eq!(f.run_next(), RunOutcome::Failure);
        assert_eq!(f.controller.tracker().state("a"), Some(JobState::Failure));
    }

    #[test]
    fn test_cancel_while_running() {
        let f = Fixture::new();
        f.submit("a", Behavior::WaitForCancel, 1, &[]);
        let runnable = f.controller.pull_next_eligible_job(None).unwrap();

        let runner = f.runner();
        let worker = std::thread::spawn(move || runner.run_one(runnable));
        assert!(f.controller.cancel("a").unwrap());

        assert_eq!(worker.join().unwrap(), RunOutcome::Canceled);
        assert_eq!(*f.hooks.lock().unwrap(), vec!["failed:a".to_string()]);
        assert_eq!(f.controller.tracker().state("a"), Some(JobState::Failure));
    }

    #[test]
    fn test_pool_drains_and_shuts_down() {
        let f = Fixture::new();
        for i in 0..10 {
            f.submit(&format!("job-{}", i), Behavior::Succeed, 1, &[]);
        }
        let pool = WorkerPool::start(f.controller.clone(), 3, vec![], f.wake_lock.clone()).unwrap();
        assert_eq!(pool.size(), 3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.controller.job_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();

        assert_eq!(f.runs.load(Ordering::SeqCst), 10);
        assert!(f.store.get_all_job_specs().unwrap().is_empty());
    }
}
