//! Contract implemented by concrete business jobs.
//!
//! The engine never knows what a job does. It only needs to persist it
//! (`factory_key` + `serialize`), rebuild it (`JobFactory`), run it and tell
//! it when it will never run again.

use crate::job_data::{JobData, JobDataError};
use crate::spec::{
    now_millis, ConstraintSpec, DependencySpec, FullSpec, JobSpec, Lifespan, MaxAttempts,
};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Transient failure. An explicit duration overrides the computed backoff.
    Retry(Option<Duration>),
    /// Permanent failure; dependents get canceled.
    Failure,
}

impl JobResult {
    pub fn retry() -> Self {
        JobResult::Retry(None)
    }

    pub fn retry_after(backoff: Duration) -> Self {
        JobResult::Retry(Some(backoff))
    }
}

/// Filter used by reserved runners to restrict which jobs they take.
pub type JobPredicate = Arc<dyn Fn(&JobSpec) -> bool + Send + Sync>;

/// Scheduling parameters a job declares when it is created.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParameters {
    pub id: String,
    pub create_time: i64,
    pub queue_key: Option<String>,
    pub max_attempts: MaxAttempts,
    pub lifespan: Lifespan,
    pub constraint_keys: Vec<String>,
    pub initial_delay: Duration,
    pub memory_only: bool,
}

impl JobParameters {
    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::default()
    }

    /// Rebuilds the parameters of a persisted job.
    pub fn from_spec(spec: &JobSpec, constraints: &[ConstraintSpec]) -> Self {
        Self {
            id: spec.id.clone(),
            create_time: spec.create_time,
            queue_key: spec.queue_key.clone(),
            max_attempts: spec.max_attempts,
            lifespan: spec.lifespan,
            constraint_keys: constraints.iter().map(|c| c.factory_key.clone()).collect(),
            initial_delay: Duration::ZERO,
            memory_only: spec.is_memory_only,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobParametersBuilder {
    id: Option<String>,
    create_time: Option<i64>,
    queue_key: Option<String>,
    max_attempts: MaxAttempts,
    lifespan: Lifespan,
    constraint_keys: Vec<String>,
    initial_delay: Duration,
    memory_only: bool,
}

impl Default for JobParametersBuilder {
    fn default() -> Self {
        Self {
            id: None,
            create_time: None,
            queue_key: None,
            max_attempts: MaxAttempts::Limited(1),
            lifespan: Lifespan::Immortal,
            constraint_keys: Vec::new(),
            initial_delay: Duration::ZERO,
            memory_only: false,
        }
    }
}

impl JobParametersBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn create_time(mut self, create_time: i64) -> Self {
        self.create_time = Some(create_time);
        self
    }

    pub fn queue(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = Some(queue_key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = MaxAttempts::Limited(max_attempts);
        self
    }

    pub fn unlimited_attempts(mut self) -> Self {
        self.max_attempts = MaxAttempts::Unlimited;
        self
    }

    pub fn lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Lifespan::Limited(lifespan);
        self
    }

    pub fn constraint(mut self, key: impl Into<String>) -> Self {
        self.constraint_keys.push(key.into());
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn memory_only(mut self, memory_only: bool) -> Self {
        self.memory_only = memory_only;
        self
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            create_time: self.create_time.unwrap_or_else(now_millis),
            queue_key: self.queue_key,
            max_attempts: self.max_attempts,
            lifespan: self.lifespan,
            constraint_keys: self.constraint_keys,
            initial_delay: self.initial_delay,
            memory_only: self.memory_only,
        }
    }
}

/// Context provided to a job while it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,

    /// 1-based number of the current attempt.
    pub attempt: u32,

    /// Cancelled when someone cancels this job while it is running.
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    /// Long-running jobs should check this periodically and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// A unit of business work.
pub trait Job: Send {
    /// Key of the [`JobFactory`] able to rebuild this job from its data.
    fn factory_key(&self) -> &str;

    fn parameters(&self) -> &JobParameters;

    /// Current payload. Persisted on submission and again after every retry.
    fn serialize(&self) -> JobData;

    fn run(&mut self, ctx: &JobContext) -> JobResult;

    /// Called when the job will never run because it was canceled or a
    /// dependency failed.
    fn on_canceled(&mut self) {}

    /// Called once the job failed permanently after having been scheduled.
    fn on_failure(&mut self) {}

    fn id(&self) -> &str {
        &self.parameters().id
    }
}

/// Rebuilds a job of one type from its persisted form.
pub trait JobFactory: Send + Sync {
    fn create(&self, parameters: JobParameters, data: JobData) -> Result<Box<dyn Job>>;
}

impl<F> JobFactory for F
where
    F: Fn(JobParameters, JobData) -> Result<Box<dyn Job>> + Send + Sync,
{
    fn create(&self, parameters: JobParameters, data: JobData) -> Result<Box<dyn Job>> {
        self(parameters, data)
    }
}

/// Factories keyed by `factory_key`.
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, Arc<dyn JobFactory>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory_key: impl Into<String>, factory: Arc<dyn JobFactory>) {
        self.factories.insert(factory_key.into(), factory);
    }

    pub fn with(mut self, factory_key: impl Into<String>, factory: Arc<dyn JobFactory>) -> Self {
        self.register(factory_key, factory);
        self
    }

    pub fn contains(&self, factory_key: &str) -> bool {
        self.factories.contains_key(factory_key)
    }

    /// Rebuilds a persisted job.
    pub fn instantiate(&self, spec: &JobSpec, constraints: &[ConstraintSpec]) -> Result<Box<dyn Job>> {
        let factory = self
            .factories
            .get(&spec.factory_key)
            .ok_or_else(|| anyhow!("No job factory registered for '{}'", spec.factory_key))?;
        let data = JobData::deserialize(&spec.serialized_data)
            .with_context(|| format!("Failed to decode data of job {}", spec.id))?;
        factory.create(JobParameters::from_spec(spec, constraints), data)
    }
}

/// Builds the records persisted for a newly submitted job.
pub fn to_full_spec(job: &dyn Job, depends_on: &[String]) -> Result<FullSpec, JobDataError> {
    let parameters = job.parameters();
    let serialized_data = job.serialize().serialize()?;
    let delay_ms = parameters.initial_delay.as_millis().min(i64::MAX as u128) as i64;

    let mut dependencies: Vec<DependencySpec> = Vec::with_capacity(depends_on.len());
    for dependency in depends_on {
        if dependencies.iter().any(|d| &d.depends_on_job_id == dependency) {
            continue;
        }
        dependencies.push(DependencySpec {
            job_id: parameters.id.clone(),
            depends_on_job_id: dependency.clone(),
        });
    }

    let mut constraints: Vec<ConstraintSpec> = Vec::new();
    for key in &parameters.constraint_keys {
        if constraints.iter().any(|c| &c.factory_key == key) {
            continue;
        }
        constraints.push(ConstraintSpec {
            job_id: parameters.id.clone(),
            factory_key: key.clone(),
        });
    }

    Ok(FullSpec {
        job: JobSpec {
            id: parameters.id.clone(),
            factory_key: job.factory_key().to_string(),
            queue_key: parameters.queue_key.clone(),
            create_time: parameters.create_time,
            next_run_attempt_time: parameters.create_time.saturating_add(delay_ms),
            run_attempt: 0,
            max_attempts: parameters.max_attempts,
            lifespan: parameters.lifespan,
            serialized_data,
            is_running: false,
            is_memory_only: parameters.memory_only,
        },
        constraints,
        dependencies,
    })
}
