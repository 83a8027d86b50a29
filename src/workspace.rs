//! The devtool workspace: appends pointing recipes at source trees, recipes
//! created in place, and the checksum ledger guarding files the tool wrote.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::append::{append_name, AppendFile, APPEND_SUFFIX};
use crate::error::{DevtoolError, IoContext, Result};
use crate::recipe::{split_stem, Recipe};

/// Ledger of files written into the workspace: `pn|relpath|sha256`.
pub const SUMS_FILE: &str = ".devtool_sums";

/// A recipe currently being worked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceEntry {
    pub name: String,
    pub srctree: PathBuf,
    pub append: PathBuf,
}

/// Scans the workspace directory and manages its bookkeeping.
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_dir(&self) -> PathBuf {
        self.path.join("appends")
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.path.join("recipes")
    }

    pub fn attic_dir(&self) -> PathBuf {
        self.path.join("attic")
    }

    fn sums_path(&self) -> PathBuf {
        self.path.join(SUMS_FILE)
    }

    /// Create the workspace layout if missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.appends_dir(), self.recipes_dir()] {
            std::fs::create_dir_all(&dir).at(&dir)?;
        }
        Ok(())
    }

    /// Recipes with an external source tree, keyed by name.
    pub fn entries(&self) -> Result<BTreeMap<String, WorkspaceEntry>> {
        let mut entries = BTreeMap::new();
        let dir = self.appends_dir();
        if !dir.exists() {
            return Ok(entries);
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .at(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(APPEND_SUFFIX))
            .collect();
        paths.sort();

        for path in paths {
            let append = AppendFile::load(&path)?;
            let Some(srctree) = append.externalsrc.clone() else {
                continue;
            };
            let (name, _) = split_stem(&append.stem());
            entries.insert(
                name.clone(),
                WorkspaceEntry {
                    name,
                    srctree,
                    append: path,
                },
            );
        }
        Ok(entries)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.entries()?.contains_key(name))
    }

    pub fn entry(&self, name: &str) -> Result<WorkspaceEntry> {
        self.entries()?
            .remove(name)
            .ok_or_else(|| DevtoolError::NotInWorkspace(name.to_string()))
    }

    /// Path of the workspace append for a recipe.
    pub fn append_path(&self, recipe: &Recipe, wildcard_version: bool) -> PathBuf {
        self.appends_dir()
            .join(append_name(&recipe.stem(), wildcard_version))
    }

    /// Record checksums of `path` (recursively for directories) against `pn`.
    pub fn add_checksum(&self, pn: &str, path: &Path) -> Result<()> {
        let files: Vec<PathBuf> = if path.is_dir() {
            WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect()
        } else {
            vec![path.to_path_buf()]
        };

        let sums = self.sums_path();
        let mut ledger = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sums)
            .at(&sums)?;
        for file in files {
            let digest = file_digest(&file)?;
            let rel = file.strip_prefix(&self.path).unwrap_or(&file);
            debug!("Recording checksum for {}", rel.display());
            writeln!(ledger, "{}|{}|{}", pn, rel.display(), digest).at(&sums)?;
        }
        Ok(())
    }

    /// Remove the files recorded for `pn`. Files changed since they were
    /// recorded are moved into the attic instead.
    pub fn check_preserve(&self, pn: &str) -> Result<()> {
        let sums = self.sums_path();
        if !sums.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&sums).at(&sums)?;
        let attic = self.attic_dir();
        let mut kept = String::new();

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.splitn(3, '|').collect();
            let &[owner, rel, recorded] = fields.as_slice() else {
                kept.push_str(line);
                kept.push('\n');
                continue;
            };
            if owner != pn {
                kept.push_str(line);
                kept.push('\n');
                continue;
            }

            let file = self.path.join(rel);
            if !file.is_file() {
                continue;
            }
            if file_digest(&file)? != recorded {
                std::fs::create_dir_all(&attic).at(&attic)?;
                let name = file.file_name().unwrap_or_default();
                warn!(
                    "File {} modified since it was written, preserving in {}",
                    name.to_string_lossy(),
                    attic.display()
                );
                move_file(&file, &attic.join(name))?;
            } else {
                std::fs::remove_file(&file).at(&file)?;
            }
        }

        let staged = self.path.join(format!("{}.new", SUMS_FILE));
        std::fs::write(&staged, kept).at(&staged)?;
        std::fs::rename(&staged, &sums).at(&sums)?;
        Ok(())
    }

    /// Move whatever is left in `dir` into `attic/<pn>` and remove `dir`.
    pub fn preserve_dir(&self, pn: &str, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        let preserve = self.attic_dir().join(pn);
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            warn!("Preserving {} in {}", rel.display(), preserve.display());
            move_file(entry.path(), &preserve.join(rel))?;
        }
        std::fs::remove_dir_all(dir).at(dir)?;
        Ok(())
    }
}

/// Hex-encoded SHA-256 of a file.
pub fn file_digest(path: &Path) -> Result<String> {
    let content = std::fs::read(path).at(path)?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// Move a file, creating the destination's parent directories.
pub(crate) fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to).at(from)?;
        std::fs::remove_file(from).at(from)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
