//! Writing a source tree's changes back into recipe metadata.
//!
//! Two strategies exist. `srcrev` pins the recipe to the tree's tip commit
//! and drops patches that are now part of history; `patch` regenerates the
//! recipe's patches from the tree's commits. `auto` picks `srcrev` when the
//! tip has been pushed upstream.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::append::{append_recipe, AppendEntry, AppendOptions};
use crate::differ::{export_local_files, export_patches, Reconciliation};
use crate::error::{DevtoolError, IoContext, Result};
use crate::git::{is_full_hash, GitRepo, FULL_HASH_LEN};
use crate::recipe::{Recipe, RecipeEdit};
use crate::revisions::get_patchset_revs;
use crate::workspace::move_file;

/// How `update-recipe` writes changes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    #[default]
    Auto,
    Srcrev,
    Patch,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Srcrev => "srcrev",
            Self::Patch => "patch",
        })
    }
}

impl FromStr for UpdateMode {
    type Err = DevtoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "srcrev" => Ok(Self::Srcrev),
            "patch" => Ok(Self::Patch),
            other => Err(DevtoolError::InvalidArgument(format!(
                "update_recipe: invalid mode {}",
                other
            ))),
        }
    }
}

/// Arguments of `update-recipe`.
#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub recipe: String,
    pub initial_rev: Option<String>,
    /// Layer to write an append into instead of editing the recipe.
    pub append: Option<PathBuf>,
    pub no_remove: bool,
    pub wildcard_version: bool,
    pub mode: UpdateMode,
}

/// What an update changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub recipe: String,
    pub mode: UpdateMode,
    pub updated: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub srcrev: Option<String>,
    /// Append written in `--append` mode.
    pub append_file: Option<PathBuf>,
}

impl UpdateReport {
    fn new(recipe: &Recipe, mode: UpdateMode) -> Self {
        Self {
            recipe: recipe.name.clone(),
            mode,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.srcrev.is_none()
    }

    pub fn print(&self) {
        if self.is_empty() {
            println!(
                "{} Nothing to update for {}",
                "Info:".blue().bold(),
                self.recipe.bright_white()
            );
            return;
        }

        println!(
            "\n{} Updated {} ({} mode)",
            "✓".green().bold(),
            self.recipe.bright_white(),
            self.mode
        );
        if let Some(rev) = &self.srcrev {
            println!("  srcrev → {}", rev.cyan());
        }
        for name in &self.updated {
            println!("  {} {}", "M".yellow().bold(), name);
        }
        for name in &self.added {
            println!("  {} {}", "A".green().bold(), name);
        }
        for name in &self.removed {
            println!("  {} {}", "D".red().bold(), name);
        }
        if let Some(append) = &self.append_file {
            println!("  written to {}", append.display().to_string().dimmed());
        }
    }
}

/// Choose between `srcrev` and `patch` for a recipe.
pub fn guess_update_mode(srctree: &Path, recipe: &Recipe) -> Result<UpdateMode> {
    let Some(uri) = recipe.src_uri.iter().find(|uri| uri.is_git()) else {
        return Ok(UpdateMode::Patch);
    };
    let branch = uri.param("branch").unwrap_or("master");

    let repo = GitRepo::new(srctree);
    let head = repo.head_rev()?;
    let remote = format!("origin/{}", branch);
    if repo.remote_branches_containing(&head)?.contains(&remote) {
        debug!("{} contains {}, using srcrev mode", remote, head);
        Ok(UpdateMode::Srcrev)
    } else {
        Ok(UpdateMode::Patch)
    }
}

/// Update `recipe` from `srctree`. `record` holds the tree's provenance.
pub fn update_recipe(
    recipe: &mut Recipe,
    srctree: &Path,
    record: &Path,
    args: &UpdateArgs,
) -> Result<UpdateReport> {
    let mode = match args.mode {
        UpdateMode::Auto => guess_update_mode(srctree, recipe)?,
        mode => mode,
    };
    match mode {
        UpdateMode::Srcrev => update_recipe_srcrev(recipe, srctree, record, args),
        _ => update_recipe_patch(recipe, srctree, record, args),
    }
}

/// Accept only a full commit hash as the new pin.
pub fn validate_srcrev(rev: &str) -> Result<String> {
    let rev = rev.trim();
    if rev.len() != FULL_HASH_LEN || !is_full_hash(rev) {
        return Err(DevtoolError::InvalidRevision(rev.to_string()));
    }
    Ok(rev.to_string())
}

fn scratch_dir(tempdir: &Path, name: &str) -> Result<PathBuf> {
    let dir = tempdir.join(name);
    std::fs::create_dir_all(&dir).at(&dir)?;
    Ok(dir)
}

/// Pin the recipe to the tree's tip.
pub fn update_recipe_srcrev(
    recipe: &mut Recipe,
    srctree: &Path,
    record: &Path,
    args: &UpdateArgs,
) -> Result<UpdateReport> {
    info!("Updating srcrev in recipe {}", file_name(&recipe.path));
    let srcrev = validate_srcrev(&GitRepo::new(srctree).head_rev()?)?;
    let mut report = UpdateReport::new(recipe, UpdateMode::Srcrev);

    let mut srcuri: Vec<String> = recipe.src_uri.iter().map(|u| u.to_string()).collect();
    let has_git = recipe.src_uri.iter().any(|u| u.is_git());

    let tempdir = tempfile::Builder::new()
        .prefix("devtool")
        .tempdir()
        .at(std::env::temp_dir())?;
    let local_dir = scratch_dir(tempdir.path(), "local")?;
    let files = export_local_files(srctree, recipe, &local_dir)?;

    let mut remove_files: Vec<PathBuf> = Vec::new();
    let mut removed_entries = Vec::new();
    if !args.no_remove {
        let start = get_patchset_revs(srctree, args.initial_rev.as_deref(), record)?
            .initial_rev
            .or_else(|| recipe.srcrev.clone());
        if let Some(start) = start {
            let patches_dir = scratch_dir(tempdir.path(), "patches")?;
            let patches = export_patches(srctree, recipe, &start, &patches_dir)?;
            // Patches now contained in history are no longer needed.
            remove_files.extend(files.removed.values().cloned());
            remove_files.extend(patches.updated.values().cloned());
        } else {
            debug!("No start revision for {}, keeping its patches", recipe.name);
            remove_files.extend(files.removed.values().cloned());
        }
        if !remove_files.is_empty() {
            removed_entries = remove_file_entries(&mut srcuri, &remove_files).0;
        }
    }
    report.removed = removed_entries.clone();
    report.srcrev = Some(srcrev.clone());

    let destpath = if let Some(layer) = &args.append {
        let entries = append_entries(&local_dir, &files);
        let options = AppendOptions {
            wildcard_version: args.wildcard_version,
            srcrev: Some(srcrev.clone()),
            src_uri_remove: removed_entries,
        };
        let (append_file, destpath) = append_recipe(recipe, layer, &entries, &options)?;
        report.updated = files.updated.keys().cloned().collect();
        report.added = files.added.iter().cloned().collect();
        report.append_file = Some(append_file);
        Some(destpath)
    } else {
        let mut update_srcuri = !report.removed.is_empty();
        for (name, path) in &files.updated {
            info!("Updating file {}", name);
            move_file(&local_dir.join(name), path)?;
            report.updated.push(name.clone());
        }
        let files_dir = recipe.files_dir();
        for name in &files.added {
            info!("Adding new file {}", name);
            move_file(&local_dir.join(name), &files_dir.join(name))?;
            srcuri.push(format!("file://{}", name));
            report.added.push(name.clone());
            update_srcuri = true;
        }
        recipe.patch_recipe(&RecipeEdit {
            src_uri: update_srcuri.then_some(srcuri),
            srcrev: Some(srcrev),
        })?;
        None
    };

    if !has_git {
        info!(
            "You will need to update src_uri within the recipe to point to a git repository \
             where you have pushed your changes"
        );
    }

    remove_source_files(&remove_files, destpath.as_deref())?;
    Ok(report)
}

/// Regenerate the recipe's patches from the tree's commits.
pub fn update_recipe_patch(
    recipe: &mut Recipe,
    srctree: &Path,
    record: &Path,
    args: &UpdateArgs,
) -> Result<UpdateReport> {
    let revs = get_patchset_revs(srctree, args.initial_rev.as_deref(), record)?;
    let Some(initial_rev) = revs.initial_rev else {
        return Err(DevtoolError::NoInitialRevision(recipe.name.clone()));
    };
    let update_rev = revs.update_rev.unwrap_or_else(|| initial_rev.clone());
    let mut report = UpdateReport::new(recipe, UpdateMode::Patch);

    let tempdir = tempfile::Builder::new()
        .prefix("devtool")
        .tempdir()
        .at(std::env::temp_dir())?;
    let local_dir = scratch_dir(tempdir.path(), "local")?;
    let files = export_local_files(srctree, recipe, &local_dir)?;

    let mut remove_files: Vec<PathBuf> = Vec::new();
    if !args.no_remove {
        let all_dir = scratch_dir(tempdir.path(), "all-patches")?;
        let all = export_patches(srctree, recipe, &initial_rev, &all_dir)?;
        remove_files.extend(files.removed.values().cloned());
        remove_files.extend(all.removed.values().cloned());
    }

    let patches_dir = scratch_dir(tempdir.path(), "patches")?;
    let patches = export_patches(srctree, recipe, &update_rev, &patches_dir)?;
    let mut srcuri: Vec<String> = recipe.src_uri.iter().map(|u| u.to_string()).collect();

    let destpath = if let Some(layer) = &args.append {
        let mut entries = append_entries(&local_dir, &files);
        entries.extend(append_entries(&patches_dir, &patches));
        if entries.is_empty() && remove_files.is_empty() {
            info!("No patches or local source files needed updating");
            None
        } else {
            let mut remove_values = Vec::new();
            if !remove_files.is_empty() {
                let (removed, remaining) = remove_file_entries(&mut srcuri, &remove_files);
                remove_values.extend(removed);
                remove_values.extend(
                    remaining
                        .iter()
                        .map(|path| format!("file://{}", file_name(path))),
                );
            }
            report.removed = remove_values.clone();
            report.updated = files
                .updated
                .keys()
                .chain(patches.updated.keys())
                .cloned()
                .collect();
            report.added = files.added.iter().chain(&patches.added).cloned().collect();
            let options = AppendOptions {
                wildcard_version: args.wildcard_version,
                srcrev: None,
                src_uri_remove: remove_values,
            };
            let (append_file, destpath) = append_recipe(recipe, layer, &entries, &options)?;
            report.append_file = Some(append_file);
            Some(destpath)
        }
    } else {
        let mut update_files = false;
        let mut update_recipe = false;

        for (name, path) in &files.updated {
            info!("Updating file {}", name);
            move_file(&local_dir.join(name), path)?;
            report.updated.push(name.clone());
            update_files = true;
        }
        for (name, path) in &patches.updated {
            let patch = patches_dir.join(name);
            if let Some(changed) = &revs.changed_revs {
                if let Some(rev) = patch_commit(&patch)? {
                    if !changed.contains(&rev) {
                        debug!("Patch {} is unchanged", name);
                        continue;
                    }
                }
            }
            info!("Updating patch {}", name);
            move_file(&patch, path)?;
            report.updated.push(name.clone());
            update_files = true;
        }

        let files_dir = recipe.files_dir();
        for name in &files.added {
            info!("Adding new file {}", name);
            move_file(&local_dir.join(name), &files_dir.join(name))?;
            srcuri.push(format!("file://{}", name));
            report.added.push(name.clone());
            update_recipe = true;
        }
        for name in &patches.added {
            info!("Adding new patch {}", name);
            move_file(&patches_dir.join(name), &files_dir.join(name))?;
            srcuri.push(format!("file://{}", name));
            report.added.push(name.clone());
            update_recipe = true;
        }

        let (removed, _) = remove_file_entries(&mut srcuri, &remove_files);
        if !removed.is_empty() {
            update_recipe = true;
        }
        report.removed = removed;

        if update_recipe {
            info!("Updating recipe {}", file_name(&recipe.path));
            recipe.patch_recipe(&RecipeEdit {
                src_uri: Some(srcuri),
                srcrev: None,
            })?;
        } else if !update_files {
            info!("No patches or files need updating");
        }
        None
    };

    remove_source_files(&remove_files, destpath.as_deref())?;
    Ok(report)
}

/// Files of a reconciliation to install through an append.
fn append_entries(dir: &Path, result: &Reconciliation) -> Vec<AppendEntry> {
    let updated = result.updated.iter().map(|(name, path)| AppendEntry {
        source: dir.join(name),
        name: name.clone(),
        existing: Some(path.clone()),
    });
    let added = result.added.iter().map(|name| AppendEntry {
        source: dir.join(name),
        name: name.clone(),
        existing: None,
    });
    updated.chain(added).collect()
}

/// Commit hash from the `From <hash> <date>` line of a formatted patch.
fn patch_commit(patch: &Path) -> Result<Option<String>> {
    let file = std::fs::File::open(patch).at(patch)?;
    let mut first = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut first).at(patch)?;
    let first = String::from_utf8_lossy(&first);
    Ok(first
        .split_whitespace()
        .nth(1)
        .filter(|word| is_full_hash(word))
        .map(str::to_string))
}

/// Drop `file://` entries matching the basenames of `files` from `srcuri`.
///
/// Returns the removed entries and the files that matched nothing.
pub fn remove_file_entries(srcuri: &mut Vec<String>, files: &[PathBuf]) -> (Vec<String>, Vec<PathBuf>) {
    let mut removed = Vec::new();
    let mut remaining = Vec::new();
    for file in files {
        let basename = file_name(file);
        let pos = srcuri.iter().position(|entry| {
            entry.starts_with("file://")
                && entry
                    .split(';')
                    .next()
                    .and_then(|location| location.rsplit('/').next())
                    == Some(basename.as_str())
        });
        match pos {
            Some(pos) => removed.push(srcuri.remove(pos)),
            None => remaining.push(file.clone()),
        }
    }
    (removed, remaining)
}

/// Delete files no longer referenced, pruning directories left empty. In
/// append mode the files live in the append's directory instead.
pub fn remove_source_files(files: &[PathBuf], destpath: Option<&Path>) -> Result<()> {
    for file in files {
        let path = match destpath {
            Some(dest) => dest.join(file_name(file)),
            None => file.clone(),
        };
        if !path.exists() {
            continue;
        }
        info!("Removing file {}", path.display());
        std::fs::remove_file(&path).at(&path)?;
        if let Some(parent) = path.parent() {
            let empty = std::fs::read_dir(parent)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                std::fs::remove_dir(parent).at(parent)?;
            }
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "update_tests.rs"]
mod tests;
