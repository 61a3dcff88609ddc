//! Observable job outcomes.
//!
//! The owning application learns what happened to a job from here, never from
//! an error returned by the engine: either by subscribing to the stream of
//! state changes or by blocking on a [`JobHandle`] with a timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
    Canceled,
}

impl JobState {
    pub fn is_complete(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStateChange {
    pub job_id: String,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub state: JobState,
}

#[derive(Debug, Clone)]
struct TrackedJob {
    queue_key: Option<String>,
    state: JobState,
}

struct TrackerState {
    jobs: HashMap<String, TrackedJob>,
    /// Completed job ids, oldest first, pruned beyond `retention`.
    completed: VecDeque<String>,
    waiters: HashMap<String, Vec<Waiter>>,
    next_waiter: u64,
}

struct Waiter {
    token: u64,
    sender: mpsc::Sender<JobState>,
}

pub struct JobTracker {
    retention: usize,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<JobStateChange>,
}

impl JobTracker {
    /// `retention` bounds how many completed jobs are remembered.
    pub fn new(retention: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            retention,
            state: Mutex::new(TrackerState {
                jobs: HashMap::new(),
                completed: VecDeque::new(),
                waiters: HashMap::new(),
                next_waiter: 0,
            }),
            events,
        }
    }

    pub fn on_state_changed(
        &self,
        job_id: &str,
        factory_key: &str,
        queue_key: Option<&str>,
        new_state: JobState,
    ) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.jobs.insert(
                job_id.to_string(),
                TrackedJob {
                    queue_key: queue_key.map(str::to_string),
                    state: new_state,
                },
            );

            if new_state.is_complete() {
                state.completed.push_back(job_id.to_string());
                while state.completed.len() > self.retention {
                    if let Some(old) = state.completed.pop_front() {
                        let still_complete = state
                            .jobs
                            .get(&old)
                            .is_some_and(|job| job.state.is_complete());
                        if still_complete {
                            state.jobs.remove(&old);
                        }
                    }
                }
                if let Some(waiters) = state.waiters.remove(job_id) {
                    for waiter in waiters {
                        let _ = waiter.sender.send(new_state);
                    }
                }
            }
        }

        // No subscribers is fine.
        let _ = self.events.send(JobStateChange {
            job_id: job_id.to_string(),
            factory_key: factory_key.to_string(),
            queue_key: queue_key.map(str::to_string),
            state: new_state,
        });
    }

    /// Latest known state of a job, if it is still remembered.
    pub fn state(&self, job_id: &str) -> Option<JobState> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.jobs.get(job_id).map(|job| job.state)
    }

    /// Remembered jobs of a queue with their latest state.
    pub fn queue_states(&self, queue_key: &str) -> Vec<(String, JobState)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(String, JobState)> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.queue_key.as_deref() == Some(queue_key))
            .map(|(id, job)| (id.clone(), job.state))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStateChange> {
        self.events.subscribe()
    }

    /// Handle resolving once `job_id` completes. Take it before submitting the
    /// job to be sure not to miss a fast completion.
    pub fn handle(&self, job_id: &str) -> JobHandle {
        let (tx, rx) = mpsc::channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let token = match state.jobs.get(job_id) {
            Some(job) if job.state.is_complete() => {
                let _ = tx.send(job.state);
                None
            }
            _ => {
                let token = state.next_waiter;
                state.next_waiter += 1;
                state
                    .waiters
                    .entry(job_id.to_string())
                    .or_default()
                    .push(Waiter { token, sender: tx });
                Some(token)
            }
        };
        JobHandle {
            job_id: job_id.to_string(),
            token,
            receiver: rx,
        }
    }

    /// Gives up on a handle whose job will never be tracked, such as one
    /// whose submission was rejected.
    pub fn release(&self, handle: JobHandle) {
        let Some(token) = handle.token else {
            return;
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waiters) = state.waiters.get_mut(&handle.job_id) {
            waiters.retain(|w| w.token != token);
            if waiters.is_empty() {
                state.waiters.remove(&handle.job_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self, job_id: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.waiters.get(job_id).map_or(0, Vec::len)
    }
}

pub struct JobHandle {
    job_id: String,
    /// Set while registered with the tracker.
    token: Option<u64>,
    receiver: mpsc::Receiver<JobState>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Blocks until the job completes or `timeout` elapses. `None` means the
    /// job did not complete in time.
    pub fn wait(&self, timeout: Duration) -> Option<JobState> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_state_transitions() {
        let tracker = JobTracker::new(10);
        assert_eq!(tracker.state("a"), None);

        tracker.on_state_changed("a", "f", Some("q"), JobState::Pending);
        tracker.on_state_changed("a", "f", Some("q"), JobState::Running);
        assert_eq!(tracker.state("a"), Some(JobState::Running));
        assert_eq!(
            tracker.queue_states("q"),
            vec![("a".to_string(), JobState::Running)]
        );
    }

    #[test]
    fn test_handle_resolves_on_completion() {
        let tracker = Arc::new(JobTracker::new(10));
        let handle = tracker.handle("a");

        let t = tracker.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            t.on_state_changed("a", "f", None, JobState::Success);
        });

        assert_eq!(handle.wait(Duration::from_secs(5)), Some(JobState::Success));
        worker.join().unwrap();
    }

    #[test]
    fn test_handle_after_completion_and_timeout() {
        let tracker = JobTracker::new(10);
        tracker.on_state_changed("a", "f", None, JobState::Failure);
        assert_eq!(
            tracker.handle("a").wait(Duration::from_millis(10)),
            Some(JobState::Failure)
        );
        assert_eq!(tracker.handle("b").wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_release_forgets_waiter() {
        let tracker = JobTracker::new(10);
        let kept = tracker.handle("a");
        let released = tracker.handle("a");
        assert_eq!(tracker.waiter_count("a"), 2);

        tracker.release(released);
        assert_eq!(tracker.waiter_count("a"), 1);

        tracker.on_state_changed("a", "f", None, JobState::Success);
        assert_eq!(kept.wait(Duration::from_millis(10)), Some(JobState::Success));
        assert_eq!(tracker.waiter_count("a"), 0);
        tracker.release(tracker.handle("a"));
    }

    #[test]
    fn test_retention_prunes_oldest_completed() {
        let tracker = JobTracker::new(2);
        for id in ["a", "b", "c"] {
            tracker.on_state_changed(id, "f", None, JobState::Success);
        }
        assert_eq!(tracker.state("a"), None);
        assert_eq!(tracker.state("b"), Some(JobState::Success));
        assert_eq!(tracker.state("c"), Some(JobState::Success));
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes() {
        let tracker = JobTracker::new(10);
        let mut rx = tracker.subscribe();

        tracker.on_state_changed("a", "f", None, JobState::Running);
        tracker.on_state_changed("a", "f", None, JobState::Canceled);

        assert_eq!(rx.recv().await.unwrap().state, JobState::Running);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.job_id, "a");
        assert_eq!(last.state, JobState::Canceled);
    }
}
