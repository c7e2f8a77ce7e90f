//! Types for representing a single resolved command.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a command executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// On the target host, under privilege elevation.
    #[default]
    Remote,

    /// On the machine running this program.
    Local,
}

/// A remote user who should receive an SSH key as `~/.ssh/authorized_keys`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyRecipient {
    /// The account on the target host.
    pub username: String,

    /// Path to the public key on the local machine.
    pub key: PathBuf,
}

/// Extra work attached to a command beyond running its text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extra {
    /// Just run the command.
    None,

    /// Upload the named local file into the remote workspace first; the command
    /// text may reference the workspace via the `$PATH$` token.
    Copy(PathBuf),

    /// Install an SSH key for a remote user. The command text is unused.
    CopySshKey(KeyRecipient),
}

/// One fully resolved plan entry, ready to dispatch.
///
/// Produced by the plan (which resolves any distro-specific command text) and
/// immutable from then on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    /// The shell command text, with distro-specific variants already resolved.
    pub command: String,

    /// Where the command runs.
    pub location: Location,

    /// Any attached upload or key-installation work.
    pub extra: Extra,
}

/// An opaque identifier for the remote host's OS/package ecosystem.
///
/// The core never branches on this; it is only handed back to the plan so
/// distro-keyed command text can be resolved.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Distro(String);

impl Distro {
    pub fn new(name: impl Into<String>) -> Self {
        Distro(name.into())
    }

    /// The descriptor used when detection is unavailable, e.g. in debug mode.
    pub fn unknown() -> Self {
        Distro("unknown".to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
