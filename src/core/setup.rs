//! Loading and validating plan files.

use crate::connection::ConnectionConfig;
use crate::core::command::{KeyRecipient, Location};
use crate::core::plan::{CommandText, Plan, PlanEntry};
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything a run needs: how to reach the host and what to do there.
///
/// This is also the unit a checkpoint persists, so a resumed run carries both the
/// connection details and the partially executed plan.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Setup {
    pub connection: ConnectionConfig,
    pub plan: Plan,
}

/// The on-disk YAML shape. The plan is a bare list of entries there; run
/// bookkeeping only exists in memory and in checkpoints.
#[derive(Deserialize)]
struct SetupFile {
    connection: ConnectionConfig,
    plan: Vec<RawPlanEntry>,
}

#[derive(Deserialize)]
struct RawPlanEntry {
    #[serde(default)]
    run: Option<RawCommandText>,

    #[serde(default)]
    location: Location,

    #[serde(default)]
    copy: Option<PathBuf>,

    #[serde(default)]
    ssh_key: Option<KeyRecipient>,
}

/// `run` in a plan file is either a bare string or a distro-keyed map. The
/// untagged shape only works in self-describing formats, so it stays here and is
/// converted on load.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCommandText {
    Uniform(String),
    PerDistro(IndexMap<String, String>),
}

impl From<RawPlanEntry> for PlanEntry {
    fn from(raw: RawPlanEntry) -> Self {
        PlanEntry {
            run: raw.run.map(|text| match text {
                RawCommandText::Uniform(text) => CommandText::Uniform(text),
                RawCommandText::PerDistro(map) => CommandText::PerDistro(map),
            }),
            location: raw.location,
            copy: raw.copy,
            ssh_key: raw.ssh_key,
        }
    }
}

impl Setup {
    /// Reads and validates a plan file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read plan file: {}", path.display()))?;
        let file: SetupFile = serde_yaml::from_str(&text)
            .with_context(|| format!("could not parse plan file: {}", path.display()))?;

        let entries: Vec<PlanEntry> = file.plan.into_iter().map(PlanEntry::from).collect();
        for (i, entry) in entries.iter().enumerate() {
            entry
                .validate()
                .with_context(|| format!("invalid plan entry #{} in {}", i + 1, path.display()))?;
        }

        Ok(Setup {
            connection: file.connection,
            plan: Plan::new(entries),
        })
    }
}
