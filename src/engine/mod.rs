//! Entry point for hosts.
//!
//! [`JobEngineBuilder::start`] runs the startup sequence in a fixed order:
//! job data migrations, the optional legacy import, loading the controller
//! from the store, wiring constraint observers and finally starting the
//! worker pool. After that the store is only written through the controller.

use crate::constraint::{ConstraintNotifier, ConstraintObserver, ConstraintRegistry};
use crate::controller::{BackoffPolicy, ControllerError, JobController, Submission};
use crate::job::{Job, JobPredicate, JobRegistry};
use crate::legacy::{LegacyImportReport, LegacyJobImporter};
use crate::migration::JobMigrator;
use crate::spec::JobSpec;
use crate::store::JobStore;
use crate::tracker::{JobHandle, JobState, JobStateChange, JobTracker};
use crate::trigger::{CompositeTrigger, InAppTrigger, SchedulerTrigger};
use crate::worker::{NoopWakeLock, WakeLock, WorkerPool};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// `max(2, min(cpus - 1, 4))`.
pub fn default_worker_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(1).min(4).max(2)
}

pub struct JobEngineBuilder {
    store: Arc<dyn JobStore>,
    job_registry: JobRegistry,
    constraints: ConstraintRegistry,
    observers: Vec<Arc<dyn ConstraintObserver>>,
    triggers: Vec<Arc<dyn SchedulerTrigger>>,
    in_app_trigger: bool,
    migrator: Option<JobMigrator>,
    legacy_importer: Option<LegacyJobImporter>,
    worker_threads: usize,
    reserved_runners: Vec<JobPredicate>,
    wake_lock: Arc<dyn WakeLock>,
    backoff: BackoffPolicy,
    tracker_retention: usize,
}

impl JobEngineBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            job_registry: JobRegistry::new(),
            constraints: ConstraintRegistry::new(),
            observers: Vec::new(),
            triggers: Vec::new(),
            in_app_trigger: true,
            migrator: None,
            legacy_importer: None,
            worker_threads: default_worker_threads(),
            reserved_runners: Vec::new(),
            wake_lock: Arc::new(NoopWakeLock),
            backoff: BackoffPolicy::default(),
            tracker_retention: 1000,
        }
    }

    pub fn job_registry(mut self, job_registry: JobRegistry) -> Self {
        self.job_registry = job_registry;
        self
    }

    pub fn constraints(mut self, constraints: ConstraintRegistry) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConstraintObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn trigger(mut self, trigger: Arc<dyn SchedulerTrigger>) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Whether to run the built-in timer that wakes the engine after delays.
    /// On by default.
    pub fn in_app_trigger(mut self, enabled: bool) -> Self {
        self.in_app_trigger = enabled;
        self
    }

    pub fn migrator(mut self, migrator: JobMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn legacy_importer(mut self, importer: LegacyJobImporter) -> Self {
        self.legacy_importer = Some(importer);
        self
    }

    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Adds a runner that only takes jobs matching `predicate`.
    pub fn reserved_runner(mut self, predicate: JobPredicate) -> Self {
        self.reserved_runners.push(predicate);
        self
    }

    pub fn wake_lock(mut self, wake_lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn tracker_retention(mut self, retention: usize) -> Self {
        self.tracker_retention = retention;
        self
    }

    /// Runs the startup sequence and starts executing jobs.
    pub fn start(self) -> Result<JobEngine> {
        let data_version = match &self.migrator {
            Some(migrator) => Some(
                migrator
                    .migrate(self.store.as_ref())
                    .context("Job data migration failed")?,
            ),
            None => None,
        };

        let legacy_report = match &self.legacy_importer {
            Some(importer) => Some(
                importer
                    .import_into(self.store.as_ref())
                    .context("Legacy job import failed")?,
            ),
            None => None,
        };

        let in_app = self.in_app_trigger.then(|| Arc::new(InAppTrigger::new()));
        let mut triggers = self.triggers;
        if let Some(in_app) = &in_app {
            triggers.push(in_app.clone());
        }
        let trigger: Arc<dyn SchedulerTrigger> = Arc::new(CompositeTrigger::new(triggers));

        let tracker = Arc::new(JobTracker::new(self.tracker_retention));
        let controller = Arc::new(JobController::new(
            self.store,
            self.job_registry,
            self.constraints,
            trigger,
            tracker.clone(),
            self.backoff,
        ));
        let loaded = controller.init()?;

        let notifier: Arc<dyn ConstraintNotifier> = controller.clone();
        let weak_notifier = Arc::downgrade(&notifier);
        if let Some(in_app) = &in_app {
            in_app.attach(weak_notifier.clone());
        }
        for observer in &self.observers {
            observer.register(weak_notifier.clone());
        }

        let pool = WorkerPool::start(
            controller.clone(),
            self.worker_threads,
            self.reserved_runners,
            self.wake_lock,
        )?;
        info!(
            "Job engine started: {} job(s) loaded, {} runner(s), job data version {:?}",
            loaded,
            pool.size(),
            data_version
        );

        Ok(JobEngine {
            controller,
            tracker,
            pool: Mutex::new(Some(pool)),
            legacy_report,
            _in_app_trigger: in_app,
        })
    }
}

pub struct JobEngine {
    controller: Arc<JobController>,
    tracker: Arc<JobTracker>,
    pool: Mutex<Option<WorkerPool>>,
    legacy_report: Option<LegacyImportReport>,
    _in_app_trigger: Option<Arc<InAppTrigger>>,
}

impl JobEngine {
    pub fn builder(store: Arc<dyn JobStore>) -> JobEngineBuilder {
        JobEngineBuilder::new(store)
    }

    /// Submits a job. Returns its id.
    pub fn add(&self, job: Box<dyn Job>) -> Result<String, ControllerError> {
        self.add_submission(Submission::new(job))
    }

    pub fn add_with_dependencies(
        &self,
        job: Box<dyn Job>,
        depends_on: &[String],
    ) -> Result<String, ControllerError> {
        self.add_submission(Submission::new(job).depends_on(depends_on.iter().cloned()))
    }

    /// Submits a job that waits for everything currently in `queue_key`.
    pub fn add_depending_on_queue(
        &self,
        job: Box<dyn Job>,
        queue_key: &str,
    ) -> Result<String, ControllerError> {
        self.add_submission(Submission::new(job).depends_on_queue(queue_key))
    }

    pub fn add_submission(&self, submission: Submission) -> Result<String, ControllerError> {
        let id = submission.job.id().to_string();
        self.controller.submit_all(vec![submission])?;
        Ok(id)
    }

    /// Starts a chain whose later stages only run after every earlier job succeeded.
    pub fn start_chain(&self, jobs: Vec<Box<dyn Job>>) -> JobChain<'_> {
        JobChain {
            engine: self,
            stages: vec![jobs],
        }
    }

    /// Submits `job` and blocks until it completes or `timeout` elapses.
    ///
    /// `None` means the job did not complete in time; it keeps running.
    pub fn run_synchronously(
        &self,
        job: Box<dyn Job>,
        timeout: Duration,
    ) -> Result<Option<JobState>, ControllerError> {
        let handle = self.tracker.handle(job.id());
        if let Err(e) = self.add(job) {
            self.tracker.release(handle);
            return Err(e);
        }
        Ok(handle.wait(timeout))
    }

    /// Handle resolving once `job_id` completes.
    pub fn handle(&self, job_id: &str) -> JobHandle {
        self.tracker.handle(job_id)
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.tracker.state(job_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStateChange> {
        self.tracker.subscribe()
    }

    pub fn cancel(&self, job_id: &str) -> Result<bool, ControllerError> {
        self.controller.cancel(job_id)
    }

    pub fn cancel_all_in_queue(&self, queue_key: &str) -> Result<usize, ControllerError> {
        self.controller.cancel_all_in_queue(queue_key)
    }

    pub fn find(&self, predicate: impl Fn(&JobSpec) -> bool) -> Vec<JobSpec> {
        self.controller.find(predicate)
    }

    pub fn is_queue_empty(&self, queue_key: &str) -> bool {
        self.controller.is_queue_empty(queue_key)
    }

    pub fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        self.controller.are_queues_empty(queue_keys)
    }

    pub fn debug_info(&self) -> String {
        self.controller.debug_info()
    }

    /// Forces a re-evaluation of every pending job.
    pub fn wake_up(&self) {
        self.controller.wake_up();
    }

    /// Notifier to hand to constraint observers registered after startup.
    pub fn notifier(&self) -> Weak<dyn ConstraintNotifier> {
        let notifier: Arc<dyn ConstraintNotifier> = self.controller.clone();
        Arc::downgrade(&notifier)
    }

    pub fn legacy_import_report(&self) -> Option<&LegacyImportReport> {
        self.legacy_report.as_ref()
    }

    /// Stops the workers after their current jobs. Further submissions fail.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pool {
            Some(pool) => pool.shutdown(),
            None => self.controller.shutdown(),
        }
    }
}

impl Drop for JobEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Stages of jobs where each stage depends on all earlier ones.
pub struct JobChain<'a> {
    engine: &'a JobEngine,
    stages: Vec<Vec<Box<dyn Job>>>,
}

impl JobChain<'_> {
    pub fn then(mut self, jobs: Vec<Box<dyn Job>>) -> Self {
        self.stages.push(jobs);
        self
    }

    pub fn then_job(self, job: Box<dyn Job>) -> Self {
        self.then(vec![job])
    }

    /// Submits the whole chain atomically. Returns every job id, in stage order.
    pub fn enqueue(self) -> Result<Vec<String>, ControllerError> {
        let mut earlier: Vec<String> = Vec::new();
        let mut submissions = Vec::new();
        for stage in self.stages.into_iter().filter(|stage| !stage.is_empty()) {
            let stage_ids: Vec<String> = stage.iter().map(|job| job.id().to_string()).collect();
            for job in stage {
                submissions.push(Submission::new(job).depends_on(earlier.iter().cloned()));
            }
            earlier.extend(stage_ids);
        }
        self.engine.controller.submit_all(submissions)?;
        Ok(earlier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobFactory, JobParameters, JobResult};
    use crate::job_data::JobData;
    use crate::store::SqliteJobStore;

    struct EchoJob {
        parameters: JobParameters,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Job for EchoJob {
        fn factory_key(&self) -> &str {
            "echo"
        }

        fn parameters(&self) -> &JobParameters {
            &self.parameters
        }

        fn serialize(&self) -> JobData {
            JobData::empty()
        }

        fn run(&mut self, _ctx: &JobContext) -> JobResult {
            self.log.lock().unwrap().push(self.parameters.id.clone());
            JobResult::Success
        }
    }

    fn engine() -> JobEngine {
        let factory: Arc<dyn JobFactory> =
            Arc::new(|_p: JobParameters, _d: JobData| -> anyhow::Result<Box<dyn Job>> {
                anyhow::bail!("not rebuilt in this test")
            });
        JobEngine::builder(Arc::new(SqliteJobStore::in_memory().unwrap()))
            .job_registry(JobRegistry::new().with("echo", factory))
            .worker_threads(2)
            .start()
            .unwrap()
    }

    fn echo(id: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Job> {
        Box::new(EchoJob {
            parameters: JobParameters::builder().id(id).build(),
            log: log.clone(),
        })
    }

    #[test]
    fn test_default_worker_threads_bounds() {
        let threads = default_worker_threads();
        assert!((2..=4).contains(&threads));
    }

    #[test]
    fn test_run_synchronously() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = engine
            .run_synchronously(echo("a", &log), Duration::from_secs(5))
            .unwrap();
        assert_eq!(state, Some(JobState::Success));
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_rejected_run_synchronously_leaves_no_waiter() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let parked = || -> Box<dyn Job> {
            Box::new(EchoJob {
                parameters: JobParameters::builder().id("parked").constraint("never").build(),
                log: log.clone(),
            })
        };
        engine.add(parked()).unwrap();

        let result = engine.run_synchronously(parked(), Duration::from_secs(5));
        assert!(matches!(result, Err(ControllerError::DuplicateJob(_))));
        assert_eq!(engine.tracker.waiter_count("parked"), 0);

        engine.controller.shutdown();
        let result = engine.run_synchronously(echo("c", &log), Duration::from_secs(5));
        assert!(matches!(result, Err(ControllerError::ShutDown)));
        assert_eq!(engine.tracker.waiter_count("c"), 0);
    }

    #[test]
    fn test_chain_runs_in_stage_order() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ids = engine
            .start_chain(vec![echo("a", &log)])
            .then(vec![echo("b1", &log), echo("b2", &log)])
            .then_job(echo("c", &log))
            .enqueue()
            .unwrap();
        assert_eq!(ids, vec!["a", "b1", "b2", "c"]);

        assert_eq!(
            engine.handle("c").wait(Duration::from_secs(5)),
            Some(JobState::Success)
        );
        let log = log.lock().unwrap().clone();
        assert_eq!(log.first().map(String::as_str), Some("a"));
        assert_eq!(log.last().map(String::as_str), Some("c"));
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let engine = engine();
        engine.shutdown();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            engine.add(echo("late", &log)),
            Err(ControllerError::ShutDown)
        ));
    }
}
