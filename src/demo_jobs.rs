//! Jobs the CLI knows how to run.

use anyhow::Result;
use pezzottify_job_engine::job::{Job, JobContext, JobFactory, JobParameters, JobRegistry, JobResult};
use pezzottify_job_engine::job_data::JobData;
use pezzottify_job_engine::migration::{migration_step, JobMigrator};
use std::sync::Arc;
use tracing::info;

pub const ECHO_FACTORY_KEY: &str = "echo";
pub const ECHO_QUEUE: &str = "echo";

/// Current job data version of the CLI's jobs.
pub const JOB_DATA_VERSION: u32 = 2;

const KEY_MESSAGE: &str = "message";
const KEY_FAIL_TIMES: &str = "fail_times";

/// Logs a message. Asks for a retry on its first `fail_times` attempts.
pub struct EchoJob {
    parameters: JobParameters,
    message: String,
    fail_times: i32,
}

impl EchoJob {
    pub fn new(message: impl Into<String>, fail_times: i32) -> Self {
        Self {
            parameters: JobParameters::builder()
                .queue(ECHO_QUEUE)
                .max_attempts(fail_times.max(0) as u32 + 1)
                .build(),
            message: message.into(),
            fail_times,
        }
    }
}

impl Job for EchoJob {
    fn factory_key(&self) -> &str {
        ECHO_FACTORY_KEY
    }

    fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    fn serialize(&self) -> JobData {
        JobData::builder()
            .put_string(KEY_MESSAGE, self.message.clone())
            .put_int(KEY_FAIL_TIMES, self.fail_times)
            .build()
    }

    fn run(&mut self, ctx: &JobContext) -> JobResult {
        if (ctx.attempt as i32) <= self.fail_times {
            info!("[{}] pretending to fail attempt {}", ctx.job_id, ctx.attempt);
            return JobResult::retry();
        }
        info!("[{}] {}", ctx.job_id, self.message);
        JobResult::Success
    }
}

pub fn job_registry() -> JobRegistry {
    let echo: Arc<dyn JobFactory> =
        Arc::new(|parameters: JobParameters, data: JobData| -> Result<Box<dyn Job>> {
            Ok(Box::new(EchoJob {
                parameters,
                message: data.get_string(KEY_MESSAGE)?,
                fail_times: data.get_int_or_default(KEY_FAIL_TIMES, 0)?,
            }))
        });
    JobRegistry::new().with(ECHO_FACTORY_KEY, echo)
}

/// Version 1 stored the echo text under `text`.
pub fn job_migrator() -> Result<JobMigrator> {
    let steps = vec![migration_step(2, |mut job| {
        if job.factory_key == ECHO_FACTORY_KEY {
            if let Ok(text) = job.data.get_string("text") {
                job.data = job
                    .data
                    .to_builder()
                    .remove("text")
                    .put_string(KEY_MESSAGE, text)
                    .build();
            }
        }
        job
    })];
    Ok(JobMigrator::new(1, JOB_DATA_VERSION, steps)?)
}
