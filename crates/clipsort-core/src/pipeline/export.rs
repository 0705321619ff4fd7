//! Copying classified files into the export tree.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};
use crate::types::CategoryKey;

/// Value split directory for photos judged worth keeping.
pub const VALUABLE_DIR: &str = "valuable";

/// Value split directory for the rest.
pub const NOT_VALUABLE_DIR: &str = "not_valuable";

/// Highest `_{n}` suffix tried before giving up on a name collision.
const MAX_DUPLICATES: u32 = 9999;

/// Where one file lands inside the export root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRoute {
    pub category: CategoryKey,
    /// `Some` splits by value first; `None` is the flat category layout
    pub valuable: Option<bool>,
}

impl ExportRoute {
    /// Directory relative to the export root.
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::new();
        match self.valuable {
            Some(true) => dir.push(VALUABLE_DIR),
            Some(false) => dir.push(NOT_VALUABLE_DIR),
            None => {}
        }
        dir.push(self.category.as_str());
        dir
    }
}

/// Places a source file into the export tree.
pub trait Exporter: Send + Sync {
    /// Copy `source` under `export_root` and return the final path.
    fn export(
        &self,
        export_root: &Path,
        route: ExportRoute,
        file_name: &str,
        source: &Path,
    ) -> PipelineResult<PathBuf>;
}

/// Copies files on the local filesystem, de-duplicating names.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsExporter;

impl Exporter for FsExporter {
    fn export(
        &self,
        export_root: &Path,
        route: ExportRoute,
        file_name: &str,
        source: &Path,
    ) -> PipelineResult<PathBuf> {
        let target_dir = export_root.join(route.relative_dir());
        let export_err = |message: String| PipelineError::Export {
            path: source.to_path_buf(),
            message,
        };

        std::fs::create_dir_all(&target_dir)
            .map_err(|e| export_err(format!("create {}: {e}", target_dir.display())))?;
        let mut input = File::open(source)
            .map_err(|e| export_err(format!("open {}: {e}", source.display())))?;
        let (target, mut output) = claim_target(&target_dir, file_name).map_err(export_err)?;

        if let Err(e) = io::copy(&mut input, &mut output).and_then(|_| output.sync_all()) {
            drop(output);
            let _ = std::fs::remove_file(&target);
            return Err(export_err(format!("copy to {}: {e}", target.display())));
        }

        tracing::trace!(from = %source.display(), to = %target.display(), "Exported");
        Ok(target)
    }
}

/// Create `dir/file_name`, or `dir/{stem}_{n}.{ext}` with the first free `n`.
///
/// Each name is claimed with `create_new`, so concurrent exports of the same
/// name never share a target.
fn claim_target(dir: &Path, file_name: &str) -> Result<(PathBuf, File), String> {
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let ext = name.extension().and_then(|s| s.to_str());

    for n in 0..=MAX_DUPLICATES {
        let candidate = match (n, ext) {
            (0, _) => dir.join(file_name),
            (_, Some(ext)) => dir.join(format!("{stem}_{n}.{ext}")),
            (_, None) => dir.join(format!("{stem}_{n}")),
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(format!("create {}: {e}", candidate.display())),
        }
    }
    Err(format!("too many duplicates for {file_name}"))
}

/// Count files per category in an export tree.
///
/// Sums the flat layout and both value-split layouts. Missing directories
/// count as zero.
pub fn count_exported(export_root: &Path) -> [usize; CategoryKey::COUNT] {
    let mut counts = [0usize; CategoryKey::COUNT];
    let bases = [
        export_root.to_path_buf(),
        export_root.join(VALUABLE_DIR),
        export_root.join(NOT_VALUABLE_DIR),
    ];
    for base in &bases {
        for key in CategoryKey::ALL {
            counts[key.index()] += count_files(&base.join(key.as_str()));
        }
    }
    counts
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}
