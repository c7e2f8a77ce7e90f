//! The SSH transport layer.
//!
//! [Transport] and [Connect] are the seams between the connection logic and the
//! network. Production code uses [Ssh2Connector] and [Ssh2Transport]; tests
//! substitute scripted implementations and never touch the network.

use crate::connection::{ConnectError, ConnectionConfig};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use thiserror::Error;

// libssh2 session error codes that distinguish retryable authentication failures.
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

/// The captured result of one remote command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a path to a file: {0}")]
    BadPath(PathBuf),

    #[error("command text contains a NUL byte")]
    NulInCommand,
}

/// An established, authenticated channel to the remote host.
pub trait Transport {
    /// Runs a command as the connecting user and captures its output. A non-zero
    /// exit code is not an error here; callers inspect [CmdOutput::exit_code].
    fn run(&mut self, command: &str) -> Result<CmdOutput, TransportError>;

    /// Runs a command under privilege elevation, feeding `secret` to the
    /// elevation program on stdin.
    fn run_elevated(&mut self, command: &str, secret: &str) -> Result<CmdOutput, TransportError>;

    /// Uploads a local file into `remote_dir`, keeping its file name.
    fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<(), TransportError>;
}

/// Opens transports. The single production implementation is [Ssh2Connector];
/// connection tests script this seam to exercise the retry logic.
pub trait Connect {
    type Transport: Transport;

    fn open(&mut self, config: &ConnectionConfig) -> Result<Self::Transport, ConnectError>;
}

/// Production [Connect] implementation over libssh2.
pub struct Ssh2Connector;

impl Connect for Ssh2Connector {
    type Transport = Ssh2Transport;

    fn open(&mut self, config: &ConnectionConfig) -> Result<Ssh2Transport, ConnectError> {
        let stream = TcpStream::connect((config.hostname.as_str(), config.port)).map_err(
            |error| ConnectError::Unreachable {
                host: config.hostname.clone(),
                reason: error.to_string(),
            },
        )?;

        let mut session = ssh2::Session::new().map_err(TransportError::from)?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|error| ConnectError::Unreachable {
            host: config.hostname.clone(),
            reason: error.to_string(),
        })?;

        authenticate(&session, config)?;

        Ok(Ssh2Transport { session })
    }
}

/// Authenticates `session`, preferring the key pair when one is configured.
fn authenticate(session: &ssh2::Session, config: &ConnectionConfig) -> Result<(), ConnectError> {
    if let Some(key) = &config.ssh_key {
        session
            .userauth_pubkey_file(
                &config.ssh_user,
                None,
                key,
                config.ssh_key_passphrase.as_deref(),
            )
            .map_err(|error| classify_auth_error(error, config))
    } else if let Some(password) = &config.ssh_user_password {
        session
            .userauth_password(&config.ssh_user, password)
            .map_err(|error| classify_auth_error(error, config))
    } else {
        Err(ConnectError::NoAuthMethods)
    }
}

/// Maps libssh2 authentication failures onto the retryable error classes.
fn classify_auth_error(error: ssh2::Error, config: &ConnectionConfig) -> ConnectError {
    match error.code() {
        // An unreadable key file almost always means a wrong or missing
        // passphrase.
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_FILE) => ConnectError::KeyPassphrase,
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ssh2::ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => {
            ConnectError::AuthRejected {
                user: config.ssh_user.clone(),
            }
        }
        _ => ConnectError::Transport(error.into()),
    }
}

/// Production [Transport] over an authenticated libssh2 session.
pub struct Ssh2Transport {
    session: ssh2::Session,
}

impl Ssh2Transport {
    fn exec(&mut self, command: &str, stdin: Option<&str>) -> Result<CmdOutput, TransportError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        if let Some(input) = stdin {
            channel.write_all(input.as_bytes())?;
            channel.send_eof()?;
        }

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        Ok(CmdOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

impl Transport for Ssh2Transport {
    fn run(&mut self, command: &str) -> Result<CmdOutput, TransportError> {
        self.exec(command, None)
    }

    fn run_elevated(&mut self, command: &str, secret: &str) -> Result<CmdOutput, TransportError> {
        let quoted = shlex::try_quote(command).map_err(|_| TransportError::NulInCommand)?;
        // -S reads the password from stdin; -p '' silences the prompt so it does
        // not pollute stderr.
        let elevated = format!("sudo -S -p '' -- sh -c {quoted}");
        self.exec(&elevated, Some(&format!("{secret}\n")))
    }

    fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<(), TransportError> {
        let name = local
            .file_name()
            .ok_or_else(|| TransportError::BadPath(local.to_path_buf()))?;
        let bytes = std::fs::read(local)?;

        let remote = Path::new(remote_dir).join(name);
        let sftp = self.session.sftp()?;
        let mut file = sftp.create(&remote)?;
        file.write_all(&bytes)?;
        Ok(())
    }
}
