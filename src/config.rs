//! The explicit run context threaded through every component.
//!
//! Everything process-wide lives here and is constructed exactly once, in `main`,
//! from the command-line flags. Components take a `&RunContext`; nothing reads
//! ambient global state.

use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// Directory name (under the operator's home) where checkpoints are cached.
const CACHE_DIR: &str = ".provis";

/// The temporary workspace on the remote host. Created on demand, owned by the
/// connecting user, and wiped before reboot-type commands.
const REMOTE_WORKSPACE: &str = "/tmp/provis";

/// How long a local command may run before it is killed.
const LOCAL_TIMEOUT: Duration = Duration::from_secs(600);

/// What to do when a command in the plan fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OnFail {
    /// Keep executing the rest of the plan; the run as a whole still counts as
    /// failed.
    #[default]
    Continue,

    /// Stop at the first failed command.
    Die,
}

/// Per-invocation settings shared by the connection manager, dispatcher, execution
/// loop, and checkpoint store.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Where checkpoints live. Created on first use.
    pub cache_dir: PathBuf,

    /// The remote temporary workspace that uploads land in and that the `$PATH$`
    /// token in command text expands to.
    pub workspace: String,

    /// Show remote command output even for housekeeping commands.
    pub verbose: bool,

    /// Dry-run mode: print every shell command instead of executing it, and never
    /// open a transport.
    pub debug: bool,

    /// Failure policy for the execution loop.
    pub on_fail: OnFail,

    /// Wall-clock limit on local command execution.
    pub local_timeout: Duration,
}

impl RunContext {
    /// Builds the context for this invocation.
    ///
    /// Fails only if the operator's home directory cannot be determined, since the
    /// checkpoint cache lives under it.
    pub fn new(verbose: bool, debug: bool, on_fail: OnFail) -> anyhow::Result<Self> {
        let home = home::home_dir().context("could not determine the home directory")?;
        Ok(RunContext {
            cache_dir: home.join(CACHE_DIR),
            workspace: REMOTE_WORKSPACE.to_string(),
            verbose,
            debug,
            on_fail,
            local_timeout: LOCAL_TIMEOUT,
        })
    }

    /// A context suitable for tests: checkpoints under `cache_dir`, default policy,
    /// and a short local timeout.
    #[cfg(test)]
    pub(crate) fn for_testing(cache_dir: impl Into<PathBuf>) -> Self {
        RunContext {
            cache_dir: cache_dir.into(),
            workspace: REMOTE_WORKSPACE.to_string(),
            verbose: false,
            debug: false,
            on_fail: OnFail::Continue,
            local_timeout: Duration::from_secs(5),
        }
    }
}
