//! Recording jobs for integration tests.
//!
//! Every run and lifecycle hook is appended to a shared [`Recorder`] as a
//! string event:
//!
//! - `run:<id>:<attempt>` when `run()` starts
//! - `done:<id>:<attempt>` when `run()` returns
//! - `failed:<id>` when `on_failure()` is called
//! - `canceled:<id>` when `on_canceled()` is called

use pezzottify_job_engine::{Job, JobContext, JobData, JobParameters, JobResult};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const SCRIPTED_FACTORY_KEY: &str = "scripted";

const KEY_SCRIPT: &str = "script";
const KEY_SLEEP_MS: &str = "sleep_ms";

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    changed: Condvar,
}

impl Recorder {
    pub fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Events starting with `prefix`, in order.
    pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    /// Ids of jobs in the order their first attempt started.
    pub fn run_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for event in self.events_with_prefix("run:") {
            let id = event.split(':').nth(1).unwrap_or_default().to_string();
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    /// Position of `event` in the event list.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn run_count(&self, job_id: &str) -> usize {
        self.events_with_prefix(&format!("run:{}:", job_id)).len()
    }

    /// Blocks until `condition` holds on the event list or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration, condition: impl Fn(&[String]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if condition(&events) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
    }

    pub fn wait_for_event(&self, timeout: Duration, event: &str) -> bool {
        self.wait_for(timeout, |events| events.iter().any(|e| e == event))
    }
}

/// Runs through a fixed list of outcomes, one per attempt. The last entry
/// repeats once the list runs out.
///
/// Outcomes: `success`, `retry`, `failure`, `panic`, and `block`, which
/// waits until the job is canceled and then reports success.
pub struct ScriptedJob {
    parameters: JobParameters,
    script: Vec<String>,
    sleep_ms: i64,
    recorder: Arc<Recorder>,
}

impl ScriptedJob {
    pub fn from_data(
        parameters: JobParameters,
        data: &JobData,
        recorder: Arc<Recorder>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            parameters,
            script: data.get_string_array(KEY_SCRIPT)?,
            sleep_ms: data.get_long_or_default(KEY_SLEEP_MS, 0)?,
            recorder,
        })
    }
}

impl Job for ScriptedJob {
    fn factory_key(&self) -> &str {
        SCRIPTED_FACTORY_KEY
    }

    fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    fn serialize(&self) -> JobData {
        JobData::builder()
            .put_string_array(KEY_SCRIPT, self.script.clone())
            .put_long(KEY_SLEEP_MS, self.sleep_ms)
            .build()
    }

    fn run(&mut self, ctx: &JobContext) -> JobResult {
        self.recorder
            .push(format!("run:{}:{}", ctx.job_id, ctx.attempt));
        if self.sleep_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.sleep_ms as u64));
        }

        let index = (ctx.attempt as usize).saturating_sub(1);
        let step = self
            .script
            .get(index)
            .or(self.script.last())
            .map(String::as_str)
            .unwrap_or("success");
        let result = match step {
            "retry" => JobResult::retry(),
            "failure" => JobResult::Failure,
            "panic" => panic!("scripted panic in {}", ctx.job_id),
            "block" => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !ctx.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                JobResult::Success
            }
            _ => JobResult::Success,
        };
        self.recorder
            .push(format!("done:{}:{}", ctx.job_id, ctx.attempt));
        result
    }

    fn on_canceled(&mut self) {
        self.recorder.push(format!("canceled:{}", self.parameters.id));
    }

    fn on_failure(&mut self) {
        self.recorder.push(format!("failed:{}", self.parameters.id));
    }
}

pub struct ScriptedJobBuilder {
    parameters: pezzottify_job_engine::job::JobParametersBuilder,
    script: Vec<String>,
    sleep_ms: i64,
}

/// Starts building a scripted job with the given id and outcomes.
pub fn scripted(id: &str, script: &[&str]) -> ScriptedJobBuilder {
    ScriptedJobBuilder {
        parameters: JobParameters::builder().id(id).max_attempts(10),
        script: script.iter().map(|s| s.to_string()).collect(),
        sleep_ms: 0,
    }
}

#[allow(dead_code)]
impl ScriptedJobBuilder {
    pub fn queue(mut self, queue_key: &str) -> Self {
        self.parameters = self.parameters.queue(queue_key);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.parameters = self.parameters.max_attempts(max_attempts);
        self
    }

    pub fn lifespan(mut self, lifespan: Duration) -> Self {
        self.parameters = self.parameters.lifespan(lifespan);
        self
    }

    pub fn constraint(mut self, key: &str) -> Self {
        self.parameters = self.parameters.constraint(key);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.parameters = self.parameters.initial_delay(delay);
        self
    }

    pub fn memory_only(mut self) -> Self {
        self.parameters = self.parameters.memory_only(true);
        self
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.sleep_ms = duration.as_millis() as i64;
        self
    }

    pub fn build(self, recorder: &Arc<Recorder>) -> Box<dyn Job> {
        Box::new(ScriptedJob {
            parameters: self.parameters.build(),
            script: self.script,
            sleep_ms: self.sleep_ms,
            recorder: recorder.clone(),
        })
    }
}
