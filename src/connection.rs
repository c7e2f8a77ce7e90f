//! Establishing an authenticated, elevated session with the target host.
//!
//! [ConnectionManager] wraps the transport's connect step in a bounded retry loop:
//! failures that the operator can fix by re-entering a credential prompt for the
//! corrected value and try again, everything else aborts immediately.

use crate::core::Distro;
use crate::net::{CmdOutput, Connect, Transport, TransportError};
use crate::ui::PromptSecrets;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How many connection attempts to make before giving up.
pub const DEFAULT_RETRY_LIMIT: u32 = 4;

fn default_port() -> u16 {
    22
}

/// How to reach and authenticate with the target host.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub ssh_user: String,

    /// Password for SSH authentication. Prompted for during connection if key
    /// authentication is not configured and this is absent or rejected.
    #[serde(default)]
    pub ssh_user_password: Option<String>,

    /// Path to a private key for SSH authentication. Takes precedence over the
    /// password when present.
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    #[serde(default)]
    pub ssh_key_passphrase: Option<String>,

    /// The sudo password on the target host.
    pub elevation_password: String,
}

// Secrets must never reach logs, so Debug is written by hand.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_user_password", &self.ssh_user_password.as_ref().map(|_| "<redacted>"))
            .field("ssh_key", &self.ssh_key)
            .field("ssh_key_passphrase", &self.ssh_key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("elevation_password", &"<redacted>")
            .finish()
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The host could not be reached at all. Not retryable; no credential fixes
    /// an unplugged cable.
    #[error("could not reach {host}: {reason}")]
    Unreachable { host: String, reason: String },

    /// The configured key could not be decrypted with the configured passphrase.
    #[error("the SSH key could not be read with the configured passphrase")]
    KeyPassphrase,

    /// Neither a key nor a password is configured.
    #[error("no authentication methods configured")]
    NoAuthMethods,

    /// The server rejected the presented credentials.
    #[error("authentication as {user} was rejected")]
    AuthRejected { user: String },

    /// The transport failed after the connection was up.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The host accepted the SSH credentials but refused the sudo password.
    #[error("privilege elevation was rejected")]
    ElevationRejected,

    /// The operator could not be prompted for a replacement credential.
    #[error("could not prompt for a credential: {0}")]
    Prompt(io::Error),
}

/// The config change that may fix a failed connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Correction {
    ClearKeyPassphrase,
    PromptUserPassword,
    PromptSshPassword,
    PromptElevationPassword,
}

impl ConnectError {
    /// The correction to apply before retrying, or [None] if this failure is
    /// fatal.
    pub fn correction(&self) -> Option<Correction> {
        match self {
            ConnectError::Unreachable { .. }
            | ConnectError::NoAuthMethods
            | ConnectError::Prompt(_) => None,
            ConnectError::KeyPassphrase => Some(Correction::ClearKeyPassphrase),
            ConnectError::AuthRejected { .. } => Some(Correction::PromptUserPassword),
            ConnectError::Transport(_) => Some(Correction::PromptSshPassword),
            ConnectError::ElevationRejected => Some(Correction::PromptElevationPassword),
        }
    }
}

/// An authenticated connection with working privilege elevation.
///
/// Only [ConnectionManager] constructs these, so holding one means the handshake,
/// authentication, and sudo check have all already passed.
#[derive(Debug)]
pub struct Session<T: Transport> {
    transport: T,
    user: String,
    elevation_secret: String,
    distro: Distro,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(transport: T, config: &ConnectionConfig, distro: Distro) -> Self {
        Session {
            transport,
            user: config.ssh_user.clone(),
            elevation_secret: config.elevation_password.clone(),
            distro,
        }
    }

    /// The user this session is authenticated as.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn distro(&self) -> &Distro {
        &self.distro
    }

    /// Runs a command on the host under privilege elevation.
    pub fn run_elevated(&mut self, command: &str) -> Result<CmdOutput, TransportError> {
        self.transport.run_elevated(command, &self.elevation_secret)
    }

    /// Uploads a local file into a remote directory, keeping its file name.
    pub fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<(), TransportError> {
        self.transport.upload(local, remote_dir)
    }
}

/// Connects to the target host, re-prompting for credentials on retryable
/// failures up to a fixed number of attempts.
pub struct ConnectionManager<C, P> {
    connector: C,
    prompter: P,
    retry_limit: u32,
}

impl<C: Connect, P: PromptSecrets> ConnectionManager<C, P> {
    pub fn new(connector: C, prompter: P) -> Self {
        ConnectionManager {
            connector,
            prompter,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Establishes a [Session], correcting `config` between attempts.
    ///
    /// Each retryable failure applies its correction (clearing a bad passphrase
    /// or prompting the operator for a replacement secret) and tries again, up to
    /// the retry limit. Fatal failures and exhausted retries return the last
    /// error.
    pub fn connect(
        &mut self,
        config: &mut ConnectionConfig,
    ) -> Result<Session<C::Transport>, ConnectError> {
        let mut attempt = 1;
        loop {
            if attempt == 1 {
                println!("Attempting to connect to {}", config.hostname);
            } else {
                println!("Attempting to connect to {}. Attempt #{attempt}", config.hostname);
            }

            let error = match self.try_connect(config) {
                Ok(session) => return Ok(session),
                Err(error) => error,
            };
            log::debug!("connection attempt {attempt} failed: {error}");

            let Some(correction) = error.correction() else {
                return Err(error);
            };
            if attempt >= self.retry_limit {
                return Err(error);
            }

            self.apply(correction, config)?;
            attempt += 1;
        }
    }

    fn try_connect(
        &mut self,
        config: &ConnectionConfig,
    ) -> Result<Session<C::Transport>, ConnectError> {
        let mut transport = self.connector.open(config)?;

        // A no-op proves the channel works end to end before anything that
        // matters runs over it.
        transport.run("cat /dev/null")?;

        println!("Obtaining sudo privileges");
        let output = transport.run_elevated("cat /dev/null", &config.elevation_password)?;
        if !output.success() {
            return Err(ConnectError::ElevationRejected);
        }

        println!("Establishing OS type");
        let distro = detect_distro(&mut transport)?;

        Ok(Session::new(transport, config, distro))
    }

    fn apply(
        &mut self,
        correction: Correction,
        config: &mut ConnectionConfig,
    ) -> Result<(), ConnectError> {
        match correction {
            Correction::ClearKeyPassphrase => {
                println!("The SSH key could not be unlocked. Retrying without a passphrase");
                config.ssh_key_passphrase = None;
            }
            Correction::PromptUserPassword => {
                println!("Missing user password");
                let prompt = format!("Please enter {}'s password", config.ssh_user);
                config.ssh_user_password = Some(self.prompt(&prompt)?);
            }
            Correction::PromptSshPassword => {
                if config.ssh_user_password.is_some() {
                    println!("Invalid SSH user password");
                } else {
                    println!("No SSH user password provided");
                }
                let prompt = format!("Please enter the SSH password for {}", config.ssh_user);
                config.ssh_user_password = Some(self.prompt(&prompt)?);
            }
            Correction::PromptElevationPassword => {
                println!("Incorrect sudo password");
                config.elevation_password = self.prompt("Please re-enter sudo password")?;
            }
        }
        Ok(())
    }

    fn prompt(&mut self, prompt: &str) -> Result<String, ConnectError> {
        self.prompter.secret(prompt).map_err(ConnectError::Prompt)
    }
}

/// Asks the host what it is running. Falls back to an opaque placeholder rather
/// than failing; an unrecognized distro only disables distro-keyed command text.
fn detect_distro<T: Transport>(transport: &mut T) -> Result<Distro, ConnectError> {
    let output = transport.run(r#". /etc/os-release && echo "$ID""#)?;
    let id = output.stdout.trim();
    if output.success() && !id.is_empty() {
        Ok(Distro::new(id))
    } else {
        Ok(Distro::unknown())
    }
}
