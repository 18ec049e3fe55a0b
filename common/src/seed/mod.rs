// Startup file seeders.
//
// Each loader walks one directory of `.toml` files (definitions also accept
// `.json`), parses every file into sections, validates, and upserts.
// A missing directory is not an error. A parse, validation, or store
// failure for one section logs a warning and skips that section only.
// Duplicate section names across files are detected under trim+lowercase
// comparison; the later file wins and the collision is logged with both
// file names.

pub mod connectors;
pub mod credentials;
pub mod defaults;
pub mod definitions;
pub mod variables;

use crate::errors::SeedError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Per-directory outcome counters, logged once at the end of a pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub loaded: usize,
    pub skipped: usize,
    pub duplicates: usize,
}

impl SeedSummary {
    pub fn log(&self, kind: &str) {
        info!(
            kind = kind,
            loaded = self.loaded,
            skipped = self.skipped,
            duplicates = self.duplicates,
            "Seed pass finished"
        );
    }
}

/// Tracks section names across the files of one pass, detecting collisions
/// under normalized comparison.
#[derive(Debug, Default)]
pub(crate) struct DuplicateTracker {
    seen: HashMap<String, (String, String)>,
}

impl DuplicateTracker {
    /// Record `name` from `file`. Returns true when an earlier file already
    /// used the same normalized name; the caller proceeds (later wins) after
    /// the warning.
    pub(crate) fn check(&mut self, normalized: &str, original: &str, file: &str) -> bool {
        match self.seen.get(normalized) {
            Some((first_file, first_original)) => {
                warn!(
                    name = original,
                    first_name = first_original.as_str(),
                    first_file = first_file.as_str(),
                    file = file,
                    "Duplicate section name; later file overrides"
                );
                true
            }
            None => {
                self.seen.insert(
                    normalized.to_string(),
                    (file.to_string(), original.to_string()),
                );
                false
            }
        }
    }
}

/// Files with one of `extensions` in `dir`, sorted by file name so later
/// files override earlier ones deterministically. A missing directory yields
/// an empty list.
pub(crate) fn seed_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, SeedError> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "Seed directory absent; skipping");
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| SeedError::DirectoryUnreadable {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SeedError::DirectoryUnreadable {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.contains(&e))
            .unwrap_or(false);
        if matches {
            files.push(path);
        } else {
            debug!(file = %path.display(), "Skipping non-seed file");
        }
    }

    files.sort();
    Ok(files)
}

pub(crate) fn read_seed_file(path: &Path) -> Result<String, SeedError> {
    std::fs::read_to_string(path).map_err(|e| SeedError::FileUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let files = seed_files(&dir.path().join("absent"), &["toml"]).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_non_toml_files_skipped_and_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.toml"), "").unwrap();
        fs::write(dir.path().join("a.toml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = seed_files(dir.path(), &["toml"]).unwrap();
        let names: Vec<String> = files.iter().map(|p| file_label(p)).collect();
        assert_eq!(names, vec!["a.toml", "b.toml"]);
    }

    #[test]
    fn test_duplicate_tracker_normalizes() {
        let mut tracker = DuplicateTracker::default();
        assert!(!tracker.check("google-api-key", "Google-API-Key", "a.toml"));
        assert!(tracker.check("google-api-key", "google-api-key", "b.toml"));
    }
}
