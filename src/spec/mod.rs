//! Persisted job records.
//!
//! These are the rows the store keeps for every outstanding job: the job spec
//! itself plus its constraint and dependency edges.

use std::time::Duration;

/// Sentinel persisted for "no limit" in both `max_attempts` and `lifespan`.
pub const UNLIMITED: i64 = -1;

/// Current time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Upper bound on execution attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Limited(u32),
    Unlimited,
}

impl MaxAttempts {
    pub fn as_db_value(&self) -> i64 {
        match self {
            MaxAttempts::Limited(n) => *n as i64,
            MaxAttempts::Unlimited => UNLIMITED,
        }
    }

    pub fn from_db_value(value: i64) -> Self {
        if value < 0 {
            MaxAttempts::Unlimited
        } else {
            MaxAttempts::Limited(value.min(u32::MAX as i64) as u32)
        }
    }

    /// True when an attempt numbered `attempt` (1-based) would go past the limit.
    pub fn is_exceeded_by(&self, attempt: u32) -> bool {
        match self {
            MaxAttempts::Limited(max) => attempt > *max,
            MaxAttempts::Unlimited => false,
        }
    }
}

/// Maximum age of a job, measured from its creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    Limited(Duration),
    Immortal,
}

impl Lifespan {
    pub fn as_db_value(&self) -> i64 {
        match self {
            Lifespan::Limited(d) => d.as_millis().min(i64::MAX as u128) as i64,
            Lifespan::Immortal => UNLIMITED,
        }
    }

    pub fn from_db_value(value: i64) -> Self {
        if value < 0 {
            Lifespan::Immortal
        } else {
            Lifespan::Limited(Duration::from_millis(value as u64))
        }
    }
}

/// Identity and scheduling metadata of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub id: String,
    pub factory_key: String,
    pub queue_key: Option<String>,
    /// Milliseconds since epoch.
    pub create_time: i64,
    /// Milliseconds since epoch; the job is not eligible before this instant.
    pub next_run_attempt_time: i64,
    /// Number of attempts that ended in a retry.
    pub run_attempt: u32,
    pub max_attempts: MaxAttempts,
    pub lifespan: Lifespan,
    /// `JobData` in its serialized wire form.
    pub serialized_data: String,
    pub is_running: bool,
    pub is_memory_only: bool,
}

impl JobSpec {
    /// Instant past which the job is abandoned, or `None` when immortal.
    pub fn expiration_time(&self) -> Option<i64> {
        match self.lifespan {
            Lifespan::Limited(d) => Some(
                self.create_time
                    .saturating_add(d.as_millis().min(i64::MAX as u128) as i64),
            ),
            Lifespan::Immortal => None,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_time().is_some_and(|expires| now >= expires)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstraintSpec {
    pub job_id: String,
    pub factory_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencySpec {
    pub job_id: String,
    pub depends_on_job_id: String,
}

/// A job spec together with all of its edges, as inserted atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct FullSpec {
    pub job: JobSpec,
    pub constraints: Vec<ConstraintSpec>,
    pub dependencies: Vec<DependencySpec>,
}
