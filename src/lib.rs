//! Imperative, resumable server setup over SSH.
//!
//! # Plan files
//!
//! A plan file describes one target host: connection details plus an ordered list of
//! commands. Commands run on the remote host under privilege elevation by default;
//! entries can also run on the local machine, upload a file into a remote workspace
//! first, or install an SSH key for a remote user.
//!
//! # Program flow
//!
//! 1. The operator invokes the `provis` binary with `--file`, naming either a plan
//!    file or (part of) a saved checkpoint name.
//!
//! 2. [run_plan] connects to the host (re-prompting for credentials on retryable
//!    authentication failures), then walks the plan one command at a time, recording
//!    each outcome with the plan.
//!
//! 3. If any command failed by the time the loop ends, the run state is written to a
//!    checkpoint under the operator's cache directory, and the exact command to
//!    resume the run is printed. A later invocation naming that checkpoint picks up
//!    from the first still-pending command.

pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod core;
pub mod dispatch;
pub mod net;
pub mod run_plan;
pub mod ui;

#[doc(inline)]
pub use self::run_plan::run_plan;
