//! The ordered plan of commands and its per-run bookkeeping.
//!
//! This struct constitutes the interface the execution loop uses to pull commands
//! and report outcomes. It is also what a checkpoint persists, so every field that
//! matters for resuming a run lives here and serializes.

use crate::core::command::{CommandInfo, Distro, Extra, KeyRecipient, Location};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command text, either uniform or keyed by distro descriptor.
///
/// The keyed form resolves in order: exact descriptor match, then the `default`
/// key, then the first entry. Plan loading rejects empty maps, so resolution always
/// finds something.
///
/// Serialization is the plain tagged form, which survives the binary checkpoint
/// codec; the untagged convenience shape plan files use lives in the file-loading
/// layer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum CommandText {
    Uniform(String),
    PerDistro(IndexMap<String, String>),
}

impl CommandText {
    /// The key that supplies command text when no distro-specific entry matches.
    pub const DEFAULT_KEY: &'static str = "default";

    pub fn resolve(&self, distro: &Distro) -> &str {
        match self {
            CommandText::Uniform(text) => text,
            CommandText::PerDistro(map) => map
                .get(distro.name())
                .or_else(|| map.get(Self::DEFAULT_KEY))
                .or_else(|| map.values().next())
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

/// One entry in a plan file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlanEntry {
    /// The command text. May be omitted for `ssh_key` entries, which have no
    /// command of their own.
    #[serde(default)]
    pub run: Option<CommandText>,

    /// Where the command runs. Defaults to the remote host.
    #[serde(default)]
    pub location: Location,

    /// A local file to upload into the remote workspace before running.
    #[serde(default)]
    pub copy: Option<PathBuf>,

    /// A remote user who should receive the named SSH key.
    #[serde(default)]
    pub ssh_key: Option<KeyRecipient>,
}

impl PlanEntry {
    /// Resolves this entry against a distro descriptor.
    pub fn command_info(&self, distro: &Distro) -> CommandInfo {
        let command = self
            .run
            .as_ref()
            .map(|text| text.resolve(distro).to_string())
            .unwrap_or_default();

        let extra = if let Some(recipient) = &self.ssh_key {
            Extra::CopySshKey(recipient.clone())
        } else if let Some(file) = &self.copy {
            Extra::Copy(file.clone())
        } else {
            Extra::None
        };

        CommandInfo {
            command,
            location: self.location,
            extra,
        }
    }

    /// Checks the structural rules a plan entry must satisfy.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ssh_key.is_some() && self.copy.is_some() {
            anyhow::bail!("a plan entry cannot specify both `copy` and `ssh_key`");
        }
        match &self.run {
            None if self.ssh_key.is_none() => {
                anyhow::bail!("a plan entry without `ssh_key` must specify `run`")
            }
            Some(CommandText::PerDistro(map)) if map.is_empty() => {
                anyhow::bail!("a per-distro `run` map must not be empty")
            }
            _ => Ok(()),
        }
    }
}

/// Outcome states, used both per entry and for the run as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Status {
    #[default]
    Pending,
    Success,
    Failure,
}

/// The ordered list of commands for one run, plus the cursor and outcome records
/// that make the run resumable.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Plan {
    entries: Vec<PlanEntry>,

    /// Per-entry outcomes, parallel to `entries`.
    statuses: Vec<Status>,

    /// The next index [Self::next_command_info] will consider. Ensures no plan
    /// position is handed out twice within one run.
    cursor: usize,

    /// The index most recently handed out, i.e. the entry the next
    /// [Self::record_success] / [Self::record_failure] applies to.
    current: Option<usize>,

    /// Aggregate outcome. Failure is sticky for the remainder of the run, even if
    /// later commands succeed; only [Self::reset_failures] clears it.
    status: Status,
}

impl Plan {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        let statuses = vec![Status::Pending; entries.len()];
        Plan {
            entries,
            statuses,
            cursor: 0,
            current: None,
            status: Status::Pending,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the next still-pending command, resolved against `distro`, or [None]
    /// when the plan is exhausted.
    ///
    /// Entries already recorded as successes (e.g. on a resumed run) are skipped,
    /// never replayed.
    pub fn next_command_info(&mut self, distro: &Distro) -> Option<CommandInfo> {
        while self.cursor < self.entries.len() {
            let index = self.cursor;
            self.cursor += 1;

            if self.statuses[index] != Status::Pending {
                continue;
            }

            self.current = Some(index);
            return Some(self.entries[index].command_info(distro));
        }

        self.current = None;
        None
    }

    /// Records that the most recently handed-out command succeeded.
    pub fn record_success(&mut self) {
        let Some(index) = self.current.take() else {
            log::debug!("record_success called with no command outstanding");
            return;
        };
        self.statuses[index] = Status::Success;
        if self.status != Status::Failure {
            self.status = Status::Success;
        }
    }

    /// Records that the most recently handed-out command failed. The aggregate
    /// status becomes (and stays) [Status::Failure].
    pub fn record_failure(&mut self) {
        let Some(index) = self.current.take() else {
            log::debug!("record_failure called with no command outstanding");
            return;
        };
        self.statuses[index] = Status::Failure;
        self.status = Status::Failure;
    }

    /// The aggregate outcome of the run so far.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Gives every failed entry a fresh chance: failure markers become pending, the
    /// cursor rewinds, and the aggregate status is cleared. Called when resuming
    /// from a checkpoint.
    pub fn reset_failures(&mut self) {
        for status in &mut self.statuses {
            if *status == Status::Failure {
                *status = Status::Pending;
            }
        }
        self.cursor = 0;
        self.current = None;
        self.status = Status::Pending;
    }
}
