//! The top-level execution loop: connect, walk the plan, checkpoint on failure.

use crate::checkpoint::{self, CheckpointError};
use crate::config::{OnFail, RunContext};
use crate::connection::{ConnectError, ConnectionManager};
use crate::core::{Distro, Location, Setup, Status};
use crate::dispatch::Dispatcher;
use crate::net::Connect;
use crate::ui::PromptSecrets;
use std::io::Write;
use thiserror::Error;
use tokio::task;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Runs `setup`'s plan against its host.
///
/// Returns the aggregate outcome: [Status::Failure] means at least one command
/// failed, in which case a checkpoint has been written and the command to resume
/// from it printed. Errors are reserved for problems that prevent the plan from
/// running at all, like an unreachable host or exhausted credential retries.
pub async fn run_plan<C, P, W>(
    setup: &mut Setup,
    ctx: &RunContext,
    connector: C,
    prompter: P,
    mut out: W,
) -> Result<Status, RunError>
where
    C: Connect,
    P: PromptSecrets,
    W: Write,
{
    // In debug mode no transport is ever opened; the dispatcher prints what it
    // would do instead.
    let session = if ctx.debug {
        None
    } else {
        let mut manager = ConnectionManager::new(connector, prompter);
        // libssh2 calls block, so keep them off the async worker threads.
        let session = task::block_in_place(|| manager.connect(&mut setup.connection))?;
        println!("Distro: {}", session.distro());
        Some(session)
    };

    let distro = session
        .as_ref()
        .map(|session| session.distro().clone())
        .unwrap_or_else(Distro::unknown);

    let mut dispatcher = Dispatcher::new(ctx, &setup.connection, session, &mut out);

    while let Some(info) = setup.plan.next_command_info(&distro) {
        let ok = match info.location {
            Location::Remote => task::block_in_place(|| dispatcher.run_remote(&info)),
            Location::Local => dispatcher.run_local(&info).await,
        };
        if ok {
            setup.plan.record_success();
        } else {
            setup.plan.record_failure();
            if ctx.on_fail == OnFail::Die {
                break;
            }
        }
    }
    drop(dispatcher);

    let status = setup.plan.status();
    if status == Status::Failure {
        let path = checkpoint::save(setup, &ctx.cache_dir)?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        match ctx.on_fail {
            OnFail::Continue => {
                let _ = writeln!(
                    out,
                    "Server setup completed with errors. Run `provis --file {stem}` to retry the failed commands."
                );
            }
            OnFail::Die => {
                let _ = writeln!(
                    out,
                    "Server setup failed. Run `provis --file {stem}` to resume."
                );
            }
        }
    }

    Ok(status)
}
