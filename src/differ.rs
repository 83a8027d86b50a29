//! Reconciling a source tree's local files and patches with what a recipe
//! declares.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DevtoolError, IoContext, Result};
use crate::git::GitRepo;
use crate::recipe::Recipe;
use crate::tasks::{copy_tree, ORIGINAL_PATCH_MARKER};

/// Directory of a source tree holding the recipe's local files.
pub const LOCAL_FILES_DIR: &str = "oe-local-files";

/// Ignore marker written into the local files directory.
pub const LOCAL_FILES_GITIGNORE: &str = ".gitignore";

static SEQPATCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{4}-)?(.+)").expect("valid patch name regex"));

/// Outcome of comparing declared artifacts with the current ones.
///
/// `updated` and `removed` map an artifact to its recipe-space path;
/// `added` holds artifacts the recipe does not declare yet. The three are
/// disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub updated: BTreeMap<String, PathBuf>,
    pub added: BTreeSet<String>,
    pub removed: BTreeMap<String, PathBuf>,
}

impl Reconciliation {
    /// Nothing was updated, added or removed.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Sort `current` against `declared`: present in both is updated,
    /// only current is added, only declared is removed.
    fn classify<I>(mut declared: BTreeMap<String, PathBuf>, current: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut result = Self::default();
        for name in current {
            if let Some(path) = declared.remove(&name) {
                result.updated.insert(name, path);
            } else if name != LOCAL_FILES_GITIGNORE {
                result.added.insert(name);
            }
        }
        result.removed = declared;
        result
    }
}

/// Sequence-insensitive identity of a patch file name: `0003-fix.patch`
/// and `fix.patch` are the same patch.
pub fn patch_identity(name: &str) -> &str {
    SEQPATCH_RE
        .captures(name)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str())
        .unwrap_or(name)
}

/// Copy the tree's local files into `dest` and compare them with the
/// recipe's declared local files.
///
/// A tracked local files directory is taken from the tip commit rather than
/// the working copy.
pub fn export_local_files(srctree: &Path, recipe: &Recipe, dest: &Path) -> Result<Reconciliation> {
    let declared = recipe.local_files();
    let repo = GitRepo::new(srctree);

    let tracked = if GitRepo::is_repo(srctree) {
        repo.ls_tree("HEAD", false)
            .ok()
            .and_then(|mut entries| entries.remove(LOCAL_FILES_DIR))
    } else {
        None
    };

    let local_dir = srctree.join(LOCAL_FILES_DIR);
    let current = if let Some(entry) = tracked {
        debug!("Exporting tracked {} from HEAD", LOCAL_FILES_DIR);
        repo.export_tree(entry.oid, dest)?
    } else if local_dir.is_dir() {
        copy_tree(&local_dir, dest)?;
        list_files(&local_dir)?
    } else {
        return Ok(Reconciliation::default());
    };

    Ok(Reconciliation::classify(declared, current))
}

/// Relative paths of all files below `dir`.
fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            DevtoolError::io(path, e.into())
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(dir) {
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(files)
}

/// Regenerate patches for the commits after `start_rev` into `dest` and
/// compare them with the recipe's declared patches.
///
/// Regenerated patches that match a declared patch are renamed to the
/// declared name.
pub fn export_patches(
    srctree: &Path,
    recipe: &Recipe,
    start_rev: &str,
    dest: &Path,
) -> Result<Reconciliation> {
    let mut declared: Vec<(String, PathBuf)> = recipe
        .patches()
        .into_iter()
        .map(|(uri, path)| (uri.basename().to_string(), path))
        .collect();

    std::fs::create_dir_all(dest).at(dest)?;
    GitRepo::new(srctree).format_patch(start_rev, dest, LOCAL_FILES_DIR)?;
    let new_patches = restore_patch_names(dest)?;

    // Pair each regenerated patch with its final name before touching any
    // file, so a rename never lands on a patch still to be handled.
    let mut result = Reconciliation::default();
    let mut moves: Vec<(String, String)> = Vec::new();
    let mut unmatched = Vec::new();
    for new_patch in &new_patches {
        let identity = patch_identity(new_patch);
        let matched = declared
            .iter()
            .position(|(old, _)| patch_identity(old) == identity);
        match matched {
            Some(pos) => {
                let (old_patch, path) = declared.remove(pos);
                moves.push((new_patch.clone(), old_patch.clone()));
                result.updated.insert(old_patch, path);
            }
            None => unmatched.push(new_patch.clone()),
        }
    }

    let mut taken: BTreeSet<String> = result.updated.keys().cloned().collect();
    for new_patch in unmatched {
        let name = if taken.contains(&new_patch) {
            free_patch_name(&new_patch, &taken)
        } else {
            new_patch.clone()
        };
        taken.insert(name.clone());
        moves.push((new_patch, name.clone()));
        result.added.insert(name);
    }

    apply_renames(dest, &moves)?;
    result.removed = declared.into_iter().collect();
    Ok(result)
}

/// First `NNNN-<identity>` name not in `taken`.
fn free_patch_name(name: &str, taken: &BTreeSet<String>) -> String {
    let identity = patch_identity(name);
    (1..)
        .map(|n| format!("{:04}-{}", n, identity))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Rename files in `dir` from the first name of each pair to the second.
/// Sources are staged under scratch names first so the pairs may overlap.
fn apply_renames(dir: &Path, moves: &[(String, String)]) -> Result<()> {
    let mut staged = Vec::new();
    for (i, (from, to)) in moves.iter().filter(|(from, to)| from != to).enumerate() {
        let from = dir.join(from);
        let scratch = dir.join(format!(".devtool-rename.{}", i));
        std::fs::rename(&from, &scratch).at(&from)?;
        staged.push((scratch, dir.join(to)));
    }
    for (scratch, to) in staged {
        std::fs::rename(&scratch, &to).at(&scratch)?;
    }
    Ok(())
}

/// Rename patches carrying an original-name marker back to that name and
/// drop the marker. Returns the final file names, sorted.
fn restore_patch_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .at(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut result = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let content = std::fs::read(&path).at(&path)?;
        let Some((original, stripped)) = strip_marker(&content) else {
            result.push(name);
            continue;
        };
        let target = dir.join(&original);
        std::fs::write(&target, stripped).at(&target)?;
        if original != name {
            std::fs::remove_file(&path).at(&path)?;
        }
        debug!("Restored patch name {} for {}", original, name);
        result.push(original);
    }
    result.sort();
    Ok(result)
}

/// Remove the original-name marker from a formatted patch's message.
fn strip_marker(content: &[u8]) -> Option<(String, Vec<u8>)> {
    let marker = ORIGINAL_PATCH_MARKER.as_bytes();
    let lines: Vec<&[u8]> = content.split_inclusive(|b| *b == b'\n').collect();
    let end_of_message = lines
        .iter()
        .position(|line| line.starts_with(b"---\n") || line.starts_with(b"diff --git "))
        .unwrap_or(lines.len());

    let idx = lines[..end_of_message]
        .iter()
        .position(|line| line.starts_with(marker))?;
    let name = String::from_utf8_lossy(&lines[idx][marker.len()..])
        .trim()
        .to_string();
    if name.is_empty() || name.contains('/') {
        return None;
    }

    let mut out = Vec::with_capacity(content.len());
    for (i, line) in lines.iter().enumerate() {
        if i == idx {
            continue;
        }
        // The blank line that separated the marker from the message body.
        if i + 1 == idx && is_blank(line) && lines.get(idx + 1).is_some_and(|l| l.starts_with(b"---")) {
            continue;
        }
        out.extend_from_slice(line);
    }
    Some((name, out))
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

#[cfg(test)]
#[path = "differ_tests.rs"]
mod tests;
