//! On-disk layout of runs.
//!
//! ```text
//! <base_path>/runs/<run_id>/input/              copies of input files
//! <base_path>/runs/<run_id>/output/             tool output
//! <base_path>/runs/<run_id>/logs/execution.log  stdout + stderr of every step
//! <base_path>/runs/<run_id>/run.json            manifest, written when the run ends
//! ```
//!
//! The base path is always passed in explicitly; nothing here has a default.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bio_core::manifest::{input_copy_names, MANIFEST_FILE};
use bio_core::Id;
use thiserror::Error;
use tracing::{debug, warn};

/// Directory under the base path that holds one directory per run.
pub const RUNS_DIR: &str = "runs";
/// Name of the per-run execution log.
pub const EXECUTION_LOG: &str = "execution.log";

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("input path has no file name: {}", .0.display())]
    InvalidInput(PathBuf),
}

pub type Result<T> = std::result::Result<T, LayoutError>;

fn io_err<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> LayoutError + 'a {
    move |source| LayoutError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Paths of a single run's directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    /// Compute the layout for `run_id` under `base_path`. Touches nothing on disk.
    pub fn new(base_path: &Path, run_id: &Id) -> Self {
        Self {
            run_dir: base_path.join(RUNS_DIR).join(run_id.as_ref()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn input_dir(&self) -> PathBuf {
        self.run_dir.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.run_dir.join("output")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.run_dir.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(EXECUTION_LOG)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join(MANIFEST_FILE)
    }
}

/// Create `base_path/runs/<run_id>/{input,output,logs}` and return the run directory.
///
/// Idempotent: existing directories are left as they are.
pub fn setup_run_directory(base_path: &Path, run_id: &Id) -> Result<PathBuf> {
    let layout = RunLayout::new(base_path, run_id);
    for dir in [layout.input_dir(), layout.output_dir(), layout.log_dir()] {
        fs::create_dir_all(&dir).map_err(io_err("create directory", &dir))?;
    }
    debug!(run_id = %run_id, run_dir = %layout.run_dir().display(), "run directory ready");
    Ok(layout.run_dir)
}

/// Outcome of copying inputs into a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub destination: PathBuf,
    /// Destination paths of copied files, in input order.
    pub copied: Vec<PathBuf>,
    /// Source paths that did not exist.
    pub skipped: Vec<PathBuf>,
}

/// Copy each existing input into `destination_dir`.
///
/// Copies keep their base name; a name already used by an earlier input gets
/// a numeric prefix (see [`input_copy_names`]), so no copy overwrites
/// another. Sources are never moved or modified. Inputs that do not exist are skipped
/// and listed in the report rather than treated as errors; callers that need
/// every input must check the report (or validate beforehand).
pub fn move_input_files<P: AsRef<Path>>(
    input_files: &[P],
    destination_dir: &Path,
) -> Result<CopyReport> {
    fs::create_dir_all(destination_dir).map_err(io_err("create directory", destination_dir))?;

    let mut report = CopyReport {
        destination: destination_dir.to_path_buf(),
        ..CopyReport::default()
    };

    let names = input_copy_names(input_files);
    for (source, name) in input_files.iter().zip(names) {
        let source = source.as_ref();
        if !source.exists() {
            warn!(path = %source.display(), "input file missing, skipping copy");
            report.skipped.push(source.to_path_buf());
            continue;
        }

        let name = name.ok_or_else(|| LayoutError::InvalidInput(source.to_path_buf()))?;
        if source.file_name() != Some(name.as_os_str()) {
            debug!(
                path = %source.display(),
                copy = ?name,
                "base name already used, renaming copy"
            );
        }
        let target = destination_dir.join(&name);
        fs::copy(source, &target).map_err(io_err("copy input", source))?;
        report.copied.push(target);
    }

    Ok(report)
}

/// Remove a run's directory tree. Missing directories are not an error.
pub fn remove_run_directory(base_path: &Path, run_id: &Id) -> Result<()> {
    let layout = RunLayout::new(base_path, run_id);
    match fs::remove_dir_all(layout.run_dir()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("remove directory", layout.run_dir())(e)),
    }
}

/// Run ids that have a directory under `base_path/runs`, sorted.
pub fn list_run_directories(base_path: &Path) -> Result<Vec<Id>> {
    let runs_dir = base_path.join(RUNS_DIR);
    let entries = match fs::read_dir(&runs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err("read directory", &runs_dir)(e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err("read directory", &runs_dir))?;
        let is_dir = entry
            .file_type()
            .map_err(io_err("stat", &entry.path()))?
            .is_dir();
        if is_dir {
            ids.push(Id::from_string(entry.file_name().to_string_lossy()));
        }
    }
    ids.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(ids)
}
