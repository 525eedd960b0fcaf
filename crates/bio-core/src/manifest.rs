//! Run manifest written next to a run's directories once it finishes.
//!
//! `run.json` makes a run directory self-describing without the database:
//! it records the inputs (with SHA256 checksums of the copies in `input/`),
//! the tool, and the terminal status.

use crate::types::{Id, Run, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// File name of the manifest inside the run directory.
pub const MANIFEST_FILE: &str = "run.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// An input file as copied into the run's `input/` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCopy {
    /// Original path as submitted.
    pub source: String,
    /// Path of the copy under `input/`; absent when the source was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<String>,
    /// Checksum of the copy; absent when the source was skipped.
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Id,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub inputs: Vec<InputCopy>,
    pub output_dir: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub written_at: DateTime<Utc>,
}

impl RunManifest {
    /// Build a manifest for `run`, hashing the copies found in `input_dir`.
    pub fn for_run(run: &Run, input_dir: &Path) -> Result<Self> {
        let names = input_copy_names(&run.input_files);
        let mut inputs = Vec::with_capacity(run.input_files.len());
        for (source, name) in run.input_files.iter().zip(names) {
            let (copy, sha256) = match name.map(|name| input_dir.join(name)) {
                Some(path) if path.is_file() => {
                    let sha256 = compute_checksum(&path)?;
                    (Some(path.display().to_string()), Some(sha256))
                }
                _ => (None, None),
            };
            inputs.push(InputCopy {
                source: source.clone(),
                copy,
                sha256,
            });
        }

        Ok(Self {
            run_id: run.id.clone(),
            timestamp: run.timestamp,
            tool: run.tool.clone(),
            inputs,
            output_dir: run.output_path.clone(),
            status: run.status,
            failed_step: run.failed_step.clone(),
            error: run.error.clone(),
            written_at: Utc::now(),
        })
    }

    /// Write as pretty JSON, replacing any previous manifest.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// File names the inputs are copied under inside `input/`, in input order.
///
/// An input keeps its base name unless an earlier input already took it, in
/// which case it becomes `<n>_<name>` with `n` starting at its 1-based
/// position. The result depends only on the list, so the copy step and the
/// manifest always agree. `None` marks a path with no file name.
pub fn input_copy_names<P: AsRef<Path>>(inputs: &[P]) -> Vec<Option<OsString>> {
    let mut taken: HashSet<OsString> = HashSet::new();
    inputs
        .iter()
        .enumerate()
        .map(|(idx, input)| {
            let name = input.as_ref().file_name()?;
            let mut candidate = name.to_os_string();
            let mut n = idx + 1;
            while taken.contains(&candidate) {
                candidate = OsString::from(format!("{n}_"));
                candidate.push(name);
                n += 1;
            }
            taken.insert(candidate.clone());
            Some(candidate)
        })
        .collect()
}

/// Compute SHA256 checksum of file contents.
pub fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
