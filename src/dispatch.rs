//! Turning resolved commands into the shell steps that realize them.
//!
//! [Dispatcher] owns the open session (if any) and the output writer. In debug
//! mode it prints the exact step sequence it would otherwise execute and touches
//! neither the network nor the local shell.

use crate::config::RunContext;
use crate::connection::{ConnectionConfig, Session};
use crate::core::{CommandInfo, Extra, KeyRecipient};
use crate::net::Transport;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The token in command text that expands to the remote workspace path.
pub const WORKSPACE_TOKEN: &str = "$PATH$";

/// The word in a failed command's output that marks the failure as "the work was
/// already done".
///
/// Shells give no structured already-satisfied signal, so plan authors put this
/// marker in the failure text of commands they know to be idempotent.
pub const IDEMPOTENCY_MARKER: &str = "already";

fn is_idempotent(text: &str) -> bool {
    text.contains(IDEMPOTENCY_MARKER)
}

/// One shell-level action on the remote host.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    /// A command run under privilege elevation.
    Elevated(String),

    /// A local file uploaded into a remote directory.
    Upload { from: PathBuf, to: String },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Elevated(command) => f.write_str(command),
            Step::Upload { from, to } => write!(f, "Copying {} to {}", from.display(), to),
        }
    }
}

/// Executes resolved commands, remote or local.
pub struct Dispatcher<'ctx, T: Transport, W: Write> {
    ctx: &'ctx RunContext,

    /// [None] only in debug mode, where no transport is ever opened.
    session: Option<Session<T>>,

    user: String,
    elevation_secret: String,
    out: W,
}

impl<'ctx, T: Transport, W: Write> Dispatcher<'ctx, T, W> {
    pub fn new(
        ctx: &'ctx RunContext,
        config: &ConnectionConfig,
        session: Option<Session<T>>,
        out: W,
    ) -> Self {
        Dispatcher {
            ctx,
            session,
            user: config.ssh_user.clone(),
            elevation_secret: config.elevation_password.clone(),
            out,
        }
    }

    /// Runs a remote command, returning whether it counts as a success.
    pub fn run_remote(&mut self, info: &CommandInfo) -> bool {
        match &info.extra {
            Extra::None => {
                let mut steps = vec![];
                // Reboot-type commands lose the workspace's tmpfs contents anyway,
                // so wipe it first and force later uploads to recreate it.
                if info.command.contains("reboot") {
                    steps.push(Step::Elevated(format!("rm -rf {}", self.ctx.workspace)));
                }
                steps.push(Step::Elevated(info.command.clone()));
                self.run_steps(&steps)
            }
            Extra::Copy(file) => {
                let workspace = self.ctx.workspace.clone();
                let user = self.user.clone();
                let steps = vec![
                    Step::Elevated(format!("mkdir -p {workspace}")),
                    Step::Elevated(format!("chown {user}:{user} {workspace}")),
                    Step::Upload {
                        from: file.clone(),
                        to: workspace.clone(),
                    },
                    Step::Elevated(info.command.replace(WORKSPACE_TOKEN, &workspace)),
                ];
                self.run_steps(&steps)
            }
            Extra::CopySshKey(recipient) => self.install_ssh_key(recipient),
        }
    }

    /// Installs `recipient.key` as the recipient's `authorized_keys`.
    ///
    /// The key is staged under a directory the connecting user owns, then moved
    /// into place and re-owned with elevation.
    fn install_ssh_key(&mut self, recipient: &KeyRecipient) -> bool {
        let username = &recipient.username;
        let Some(key_name) = recipient.key.file_name().map(|n| n.to_string_lossy().to_string())
        else {
            let _ = writeln!(
                self.out,
                "Unable to copy {} over to {username}",
                recipient.key.display()
            );
            return false;
        };

        let Some(home) = self.resolve_home(username) else {
            let _ = writeln!(
                self.out,
                "Unable to copy {} over to {username}",
                recipient.key.display()
            );
            return false;
        };

        let staging = format!("/tmp/{username}");
        let conn_user = self.user.clone();
        let steps = vec![
            Step::Elevated(format!("mkdir -p {staging}")),
            Step::Elevated(format!("chown {conn_user}:{conn_user} {staging}")),
            Step::Elevated(format!("mkdir -p {home}/.ssh")),
            Step::Upload {
                from: recipient.key.clone(),
                to: staging.clone(),
            },
            Step::Elevated(format!("cp {staging}/{key_name} {home}/.ssh/authorized_keys")),
            Step::Elevated(format!("chmod 700 {home}/.ssh")),
            Step::Elevated(format!("chmod 600 {home}/.ssh/authorized_keys")),
            Step::Elevated(format!("chown {username}:{username} {home}/.ssh")),
            Step::Elevated(format!("chown {username}:{username} -R {home}/.ssh")),
            Step::Elevated(format!("rm -rf {staging}")),
        ];

        let ok = self.run_steps(&steps);
        if !ok {
            let _ = writeln!(
                self.out,
                "Unable to copy {} over to {username}",
                recipient.key.display()
            );
        }
        ok
    }

    /// Looks up a user's home directory on the host. In debug mode this prints
    /// the probe it would run and assumes the conventional location.
    fn resolve_home(&mut self, username: &str) -> Option<String> {
        let probe = format!("getent passwd {username} | cut -d: -f6");
        if self.ctx.debug {
            let _ = writeln!(self.out, "{probe}");
            return Some(format!("/home/{username}"));
        }

        let Some(session) = self.session.as_mut() else {
            log::error!("no session open; cannot probe {username}'s home directory");
            return None;
        };
        match session.run_elevated(&probe) {
            Ok(output) if output.success() => {
                let home = output.stdout.trim().to_string();
                if home.is_empty() {
                    None
                } else {
                    Some(home)
                }
            }
            Ok(_) => None,
            Err(error) => {
                log::error!("home directory probe for {username} failed: {error}");
                None
            }
        }
    }

    fn run_steps(&mut self, steps: &[Step]) -> bool {
        if self.ctx.debug {
            for step in steps {
                let _ = writeln!(self.out, "{step}");
            }
            return true;
        }

        for step in steps {
            if !self.execute(step) {
                return false;
            }
        }
        true
    }

    fn execute(&mut self, step: &Step) -> bool {
        let Some(session) = self.session.as_mut() else {
            log::error!("no session open; cannot run: {step}");
            return false;
        };

        match step {
            Step::Elevated(command) => match session.run_elevated(command) {
                Ok(output) if output.success() => {
                    if self.ctx.verbose && !output.stdout.is_empty() {
                        let _ = write!(self.out, "{}", output.stdout);
                    }
                    true
                }
                Ok(output)
                    if is_idempotent(&output.stdout) || is_idempotent(&output.stderr) =>
                {
                    // The failure text says the state is already in place.
                    log::debug!("treating failed command as satisfied: {command}");
                    true
                }
                Ok(output) => {
                    let _ = writeln!(self.out, "Command failed: {command}");
                    let _ = write!(self.out, "{}", output.stderr);
                    false
                }
                Err(error) => {
                    let _ = writeln!(self.out, "Command failed: {command} ({error})");
                    false
                }
            },
            Step::Upload { from, to } => {
                if self.ctx.verbose {
                    let _ = writeln!(self.out, "{step}");
                }
                match session.upload(from, to) {
                    Ok(()) => true,
                    Err(error) => {
                        let _ = writeln!(
                            self.out,
                            "Unable to copy {} to {to} ({error})",
                            from.display()
                        );
                        false
                    }
                }
            }
        }
    }

    /// Runs a command on the local machine, returning whether it counts as a
    /// success.
    ///
    /// The elevation secret is fed to the child's stdin so commands that invoke
    /// `sudo -S` do not hang on a prompt. A command that outlives the wall-clock
    /// limit is killed, and whatever output it produced so far is shown.
    pub async fn run_local(&mut self, info: &CommandInfo) -> bool {
        if self.ctx.debug {
            let _ = writeln!(self.out, "{}", info.command);
            return true;
        }

        let argv = match shlex::split(&info.command) {
            Some(argv) if !argv.is_empty() => argv,
            _ => {
                let _ = writeln!(self.out, "Could not parse local command: {}", info.command);
                return false;
            }
        };

        let mut child = match tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                let _ = writeln!(self.out, "Could not start local command: {error}");
                return false;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // The child may not read stdin at all; a broken pipe here is fine.
            let _ = stdin
                .write_all(format!("{}\n", self.elevation_secret).as_bytes())
                .await;
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let waited = {
            let work = async {
                let read_out = async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stdout).await;
                    }
                };
                let read_err = async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stderr).await;
                    }
                };
                let (_, _, status) = tokio::join!(read_out, read_err, child.wait());
                status
            };
            tokio::time::timeout(self.ctx.local_timeout, work).await
        };

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);

        match waited {
            Err(_) => {
                let _ = child.kill().await;
                let _ = writeln!(
                    self.out,
                    "Local command timed out after {:?}: {}",
                    self.ctx.local_timeout, info.command
                );
                let _ = write!(self.out, "{stdout}{stderr}");
                false
            }
            Ok(Err(error)) => {
                let _ = writeln!(self.out, "Local command failed to run: {error}");
                false
            }
            Ok(Ok(status)) => {
                if self.ctx.verbose && !stdout.is_empty() {
                    let _ = write!(self.out, "{stdout}");
                }
                if status.success() {
                    true
                } else if is_idempotent(&stdout) || is_idempotent(&stderr) {
                    log::debug!("treating failed local command as satisfied: {}", info.command);
                    true
                } else {
                    let _ = writeln!(self.out, "Local command failed: {}", info.command);
                    let _ = write!(self.out, "{stderr}");
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod test;
