//! Source image discovery.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use super::decode::RawFormat;

/// Finds supported images under a source root.
pub struct FileDiscovery {
    formats: Vec<String>,
    exclude: Option<PathBuf>,
}

/// Information about a discovered file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Full path to the file
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
}

impl DiscoveredFile {
    /// Final path component, lossily converted.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

impl FileDiscovery {
    /// Create a discovery for the given extensions (case-insensitive).
    ///
    /// Formats this platform cannot read are dropped so their files are
    /// never queued.
    pub fn new(formats: &[String]) -> Self {
        let formats = formats
            .iter()
            .map(|f| f.to_lowercase())
            .filter(|f| match RawFormat::from_extension(f) {
                Some(raw) if !raw.readable_here() => {
                    tracing::debug!(format = %f, "Skipping format without a converter");
                    false
                }
                _ => true,
            })
            .collect();
        Self {
            formats,
            exclude: None,
        }
    }

    /// Skip everything under `dir`, typically an export root nested in the source.
    pub fn excluding(mut self, dir: &Path) -> Self {
        self.exclude = Some(canonical(dir));
        self
    }

    /// Discover all supported image files at a path.
    ///
    /// If path is a file, returns it if supported.
    /// If path is a directory, recursively finds all supported files.
    pub fn discover(&self, path: &Path) -> Vec<DiscoveredFile> {
        if path.is_file() {
            if self.is_supported(path) {
                if let Ok(meta) = std::fs::metadata(path) {
                    return vec![DiscoveredFile {
                        path: path.to_path_buf(),
                        size: meta.len(),
                    }];
                }
            }
            return vec![];
        }

        // Exclusion in the walk's own spelling of paths, so plain entries
        // need no syscall.
        let exclusion = self.exclude.as_ref().map(|canonical_dir| Exclusion {
            under_root: canonical_dir
                .strip_prefix(canonical(path))
                .ok()
                .map(|rel| path.join(rel)),
            canonical: canonical_dir.clone(),
        });

        let mut files = Vec::new();

        let walker = WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !exclusion.as_ref().is_some_and(|x| x.covers(e)));
        for entry in walker.filter_map(|e| e.ok()) {
            let entry_path = entry.path();
            if entry.file_type().is_file() && self.is_supported(entry_path) {
                if let Ok(meta) = entry.metadata() {
                    files.push(DiscoveredFile {
                        path: entry_path.to_path_buf(),
                        size: meta.len(),
                    });
                }
            }
        }

        // Sort by path for deterministic ordering
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Check if a file has a supported extension.
    fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = ext.to_lowercase();
                self.formats.iter().any(|fmt| *fmt == ext_lower)
            })
            .unwrap_or(false)
    }

    /// Get total size of all discovered files.
    pub fn total_size(files: &[DiscoveredFile]) -> u64 {
        files.iter().map(|f| f.size).sum()
    }
}

struct Exclusion {
    /// The excluded dir spelled under the walk root, if it lies inside it
    under_root: Option<PathBuf>,
    canonical: PathBuf,
}

impl Exclusion {
    fn covers(&self, entry: &DirEntry) -> bool {
        if self
            .under_root
            .as_deref()
            .is_some_and(|dir| entry.path().starts_with(dir))
        {
            return true;
        }
        entry.path_is_symlink()
            && std::fs::canonicalize(entry.path()).is_ok_and(|p| p.starts_with(&self.canonical))
    }
}

/// Resolved absolute form of `path`; falls back to joining the working
/// directory when the path does not exist yet.
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}
