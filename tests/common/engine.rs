//! Test engine lifecycle management
//!
//! Each test gets its own job database in a temp directory. Dropping a
//! [`TestEngine`] shuts the engine down before the directory goes away.

use super::jobs::{Recorder, ScriptedJob, SCRIPTED_FACTORY_KEY};
use pezzottify_job_engine::{
    BackoffPolicy, Job, JobData, JobEngine, JobEngineBuilder, JobFactory, JobParameters,
    JobRegistry, JobState, SqliteJobStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestEngine {
    pub engine: JobEngine,
    pub recorder: Arc<Recorder>,
    pub db_path: PathBuf,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    /// Starts an engine with two workers over a fresh database.
    pub fn start() -> Self {
        Self::start_with(|builder| builder)
    }

    pub fn start_with(configure: impl FnOnce(JobEngineBuilder) -> JobEngineBuilder) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        Self::open(temp_dir, db_path, Arc::new(Recorder::default()), configure)
    }

    /// Like [`TestEngine::start_with`], but lets the test prepare the
    /// database directory before the engine opens it.
    pub fn start_in(
        temp_dir: TempDir,
        configure: impl FnOnce(JobEngineBuilder) -> JobEngineBuilder,
    ) -> Self {
        let db_path = temp_dir.path().join("jobs.db");
        Self::open(temp_dir, db_path, Arc::new(Recorder::default()), configure)
    }

    /// Shuts the engine down and starts a new one over the same database.
    pub fn restart(self, configure: impl FnOnce(JobEngineBuilder) -> JobEngineBuilder) -> Self {
        let TestEngine {
            engine,
            recorder,
            db_path,
            temp_dir,
        } = self;
        engine.shutdown();
        drop(engine);
        Self::open(temp_dir, db_path, recorder, configure)
    }

    fn open(
        temp_dir: TempDir,
        db_path: PathBuf,
        recorder: Arc<Recorder>,
        configure: impl FnOnce(JobEngineBuilder) -> JobEngineBuilder,
    ) -> Self {
        let store = Arc::new(SqliteJobStore::new(&db_path).unwrap());
        let builder = JobEngine::builder(store)
            .job_registry(registry(&recorder))
            .worker_threads(2)
            .backoff(BackoffPolicy {
                initial_backoff: Duration::from_millis(10),
                multiplier: 1.0,
                max_backoff: Duration::from_millis(10),
                jitter: 0.0,
            });
        let engine = configure(builder).start().unwrap();
        Self {
            engine,
            recorder,
            db_path,
            temp_dir,
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    pub fn add(&self, job: Box<dyn Job>) -> String {
        self.engine.add(job).unwrap()
    }

    pub fn run_synchronously(&self, job: Box<dyn Job>) -> Option<JobState> {
        self.engine.run_synchronously(job, WAIT_TIMEOUT).unwrap()
    }

    /// Waits for `job_id` to reach a terminal state.
    pub fn wait(&self, job_id: &str) -> Option<JobState> {
        self.engine.handle(job_id).wait(WAIT_TIMEOUT)
    }

    /// Waits until no job is left in the engine.
    pub fn wait_until_idle(&self) -> bool {
        let deadline = std::time::Instant::now() + WAIT_TIMEOUT;
        while std::time::Instant::now() < deadline {
            if self.engine.find(|_| true).is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

pub fn registry(recorder: &Arc<Recorder>) -> JobRegistry {
    let recorder = recorder.clone();
    let factory: Arc<dyn JobFactory> = Arc::new(
        move |parameters: JobParameters, data: JobData| -> anyhow::Result<Box<dyn Job>> {
            Ok(Box::new(ScriptedJob::from_data(
                parameters,
                &data,
                recorder.clone(),
            )?))
        },
    );
    JobRegistry::new().with(SCRIPTED_FACTORY_KEY, factory)
}
