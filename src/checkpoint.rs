//! Saving and resuming partially failed runs.
//!
//! When a run ends with failures, the whole [Setup] (connection details plus the
//! plan and its per-entry outcomes) is serialized into the operator's cache
//! directory. A later invocation can name that checkpoint (any substring of its
//! file name will do) to retry just the commands that did not succeed. A
//! checkpoint is deleted as soon as it is loaded, so it is consumed exactly once.

use crate::core::Setup;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension checkpoint files carry in the cache directory.
pub const FILE_EXT: &str = "ckpt";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("{} names neither a plan file nor a checkpoint under {}", .0, .1.display())]
    NotFound(String, PathBuf),

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint could not be decoded: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// What the `--file` argument turned out to name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanSource {
    /// A plan file to parse and run from the top.
    PlanFile(PathBuf),

    /// A saved checkpoint to resume.
    Checkpoint(PathBuf),
}

/// Resolves the `--file` argument.
///
/// A checkpoint whose file name contains `arg` wins over a plan file of the same
/// name; resuming is the rarer, more deliberate act. When several checkpoints
/// match, the newest (by name, which embeds the timestamp) is chosen.
pub fn resolve(arg: &str, cache_dir: &Path) -> Result<PlanSource, CheckpointError> {
    let mut matches = vec![];
    if cache_dir.is_dir() {
        for entry in fs::read_dir(cache_dir)? {
            let path = entry?.path();
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if name.ends_with(&format!(".{FILE_EXT}")) && name.contains(arg) {
                matches.push(path);
            }
        }
    }

    if let Some(newest) = matches.into_iter().max() {
        return Ok(PlanSource::Checkpoint(newest));
    }

    let path = PathBuf::from(arg);
    if path.is_file() {
        Ok(PlanSource::PlanFile(path))
    } else {
        Err(CheckpointError::NotFound(
            arg.to_string(),
            cache_dir.to_path_buf(),
        ))
    }
}

/// Writes `setup` to a fresh checkpoint under `cache_dir` and returns its path.
pub fn save(setup: &Setup, cache_dir: &Path) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(cache_dir)?;
    let name = format!(
        "{}-{}.{}",
        setup.connection.hostname,
        Local::now().format("%Y%m%d-%H%M%S"),
        FILE_EXT,
    );
    let path = cache_dir.join(name);
    fs::write(&path, bincode::serialize(setup)?)?;
    Ok(path)
}

/// Loads a checkpoint, deletes it, and clears its failure markers so the failed
/// commands run again.
pub fn resume(path: &Path) -> Result<Setup, CheckpointError> {
    let bytes = fs::read(path)?;
    let mut setup: Setup = bincode::deserialize(&bytes)?;
    fs::remove_file(path)?;
    setup.plan.reset_failures();
    Ok(setup)
}
