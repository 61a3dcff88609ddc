//! Common test infrastructure
//!
//! Integration tests drive a real engine backed by a SQLite file in a temp
//! directory. Jobs are [`ScriptedJob`]s whose behavior per attempt lives in
//! their job data, so they survive restarts like real jobs do.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{scripted, TestEngine};
//!
//! #[test]
//! fn test_runs() {
//!     let t = TestEngine::start();
//!     let state = t.run_synchronously(scripted("a", &["success"]).build(&t.recorder));
//!     assert_eq!(state, Some(pezzottify_job_engine::JobState::Success));
//! }
//! ```

mod engine;
mod jobs;

#[allow(unused_imports)]
pub use engine::{TestEngine, WAIT_TIMEOUT};
#[allow(unused_imports)]
pub use jobs::{scripted, Recorder, ScriptedJobBuilder, SCRIPTED_FACTORY_KEY};
