//! Script execution engine.
//!
//! A [`ScriptTask`] owns one run of one script:
//! - **Materialize**: content is written to a temp file and made executable
//! - **Invoke**: `<interpreter> <flag> "<script> <params...>"` in its own process group
//! - **Capture**: stdout and stderr are read line by line and mirrored to spill files
//! - **Bound**: the request timeout or an explicit stop kills the whole process group
//!
//! # Execution Flow
//!
//! 1. [`ScriptTask::run`] moves the task to `running`
//! 2. Temp file failures end the run with a distinct error code
//! 3. Completion waits for process exit and both output readers
//! 4. The result code decides `completed` (success) or `failed` (anything else)
//!
//! A non-zero exit code is reported, not treated as a failure.

pub mod executor;

pub use executor::ScriptTask;
