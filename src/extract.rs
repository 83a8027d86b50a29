//! Extracting a recipe's source into a git working tree.
//!
//! The tree gets an upstream baseline commit tagged [`BASE_TAG`], one
//! commit per recipe patch, and [`PATCHED_TAG`] on the result. Local files
//! the recipe installs verbatim are kept out of history in
//! `oe-local-files/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DevtoolConfig;
use crate::differ::{LOCAL_FILES_DIR, LOCAL_FILES_GITIGNORE};
use crate::error::{DevtoolError, IoContext, Result};
use crate::git::GitRepo;
use crate::recipe::Recipe;
use crate::revisions::{BASE_TAG, PATCHED_TAG};
use crate::tasks::{copy_tree, BuildSystem, TaskEnv, TaskExecutor, TaskGraph};
use crate::workspace::move_file;

const GITIGNORE_CONTENT: &str =
    "# Ignore local files, by default. Remove this file if you want to commit the directory to Git\n*\n";

/// How [`extract_source`] treats its target.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub devbranch: String,
    pub keep_temp: bool,
    /// Update an existing tree instead of creating a new one.
    pub sync: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            devbranch: "devtool".to_string(),
            keep_temp: false,
            sync: false,
        }
    }
}

/// Extract the patched source of `recipe` into `srctree`.
///
/// Returns the baseline commit the recipe's patches were applied on.
pub fn extract_source(
    recipe: &Recipe,
    srctree: &Path,
    build: &dyn BuildSystem,
    config: &DevtoolConfig,
    options: &ExtractOptions,
) -> Result<String> {
    recipe.check_compatible()?;

    if options.sync {
        if !srctree.exists() {
            return Err(DevtoolError::TargetMissing(srctree.to_path_buf()));
        }
    } else {
        check_target(srctree)?;
        if TaskGraph::for_recipe(recipe).is_noexec("do_unpack") {
            return Err(DevtoolError::UnpackDisabled(recipe.name.clone()));
        }
        std::fs::create_dir_all(srctree).at(srctree)?;
        std::fs::remove_dir(srctree).at(srctree)?;
    }

    let tempdir = tempfile::Builder::new()
        .prefix("devtool")
        .tempdir()
        .at(std::env::temp_dir())?;
    let result = extract_in(recipe, srctree, build, config, options, tempdir.path());
    if options.keep_temp {
        let kept = tempdir.keep();
        info!("Preserving temporary directory {}", kept.display());
    }
    result
}

/// A fresh target must be absent or an empty directory.
fn check_target(srctree: &Path) -> Result<()> {
    if !srctree.exists() {
        return Ok(());
    }
    if !srctree.is_dir() {
        return Err(DevtoolError::TargetNotDirectory(srctree.to_path_buf()));
    }
    if std::fs::read_dir(srctree).at(srctree)?.next().is_some() {
        return Err(DevtoolError::TargetNotEmpty(srctree.to_path_buf()));
    }
    Ok(())
}

fn extract_in(
    recipe: &Recipe,
    srctree: &Path,
    build: &dyn BuildSystem,
    config: &DevtoolConfig,
    options: &ExtractOptions,
    tempdir: &Path,
) -> Result<String> {
    let workdir = tempdir.join("workdir");
    let mut source_dir = recipe.source_dir(&workdir);
    if !source_dir.starts_with(&workdir) {
        // Shared work directories (kernel, toolchain) live elsewhere.
        source_dir = if recipe.inherits("kernel") {
            workdir.join("source")
        } else {
            workdir.join(source_dir.file_name().unwrap_or_default())
        };
    }

    let mut env = TaskEnv {
        workdir: workdir.clone(),
        tempdir: tempdir.join("temp"),
        dl_dir: config.dl_dir.clone(),
        source_dir: source_dir.clone(),
        vars: BTreeMap::new(),
        identity: config.git_identity(),
    };

    let mut executor = TaskExecutor::new(build, recipe);
    info!("Fetching {}...", recipe.name);
    executor.exec("do_fetch", &env)?;
    info!("Unpacking...");
    executor.exec("do_unpack", &env)?;
    if recipe.inherits("kernel-yocto") {
        info!("Doing kernel checkout...");
        executor.exec("do_kernel_checkout", &env)?;
    }

    let local_dir = tempdir.join(LOCAL_FILES_DIR);
    let local_files: Vec<String> = recipe
        .local_files()
        .into_keys()
        .filter(|name| workdir.join(name).exists())
        .collect();
    if !local_files.is_empty() {
        for name in &local_files {
            move_path(&workdir.join(name), &local_dir.join(name))?;
        }
        let ignore = local_dir.join(LOCAL_FILES_GITIGNORE);
        std::fs::write(&ignore, GITIGNORE_CONTENT).at(&ignore)?;
    }

    let srcsubdir = if source_dir == workdir {
        isolate_sources(recipe, &workdir)?
    } else {
        match source_dir.strip_prefix(&workdir).ok().and_then(|rel| rel.iter().next()) {
            Some(first) if source_dir.parent() != Some(workdir.as_path()) => workdir.join(first),
            _ => source_dir,
        }
    };
    debug!("Source subdirectory is {}", srcsubdir.display());

    let repo = GitRepo::new(&srcsubdir).with_identity(config.git_identity());
    if GitRepo::is_repo(&srcsubdir) {
        repo.convert_standalone_clone()?;
    }

    let patchdir = srcsubdir.join("patches");
    let mut haspatches = false;
    if patchdir.exists() {
        if std::fs::read_dir(&patchdir).at(&patchdir)?.next().is_some() {
            haspatches = true;
        } else {
            std::fs::remove_dir(&patchdir).at(&patchdir)?;
        }
    }
    std::fs::create_dir_all(&srcsubdir).at(&srcsubdir)?;
    if std::fs::read_dir(&srcsubdir).at(&srcsubdir)?.next().is_none() {
        warn!(
            "no source unpacked to S, either the {} recipe doesn't use any source or the correct \
             source directory could not be determined",
            recipe.name
        );
    }

    setup_git_repo(&repo, &recipe.version, &options.devbranch)?;
    let initial_rev = repo.head_rev()?;

    env.source_dir = srcsubdir.clone();
    env.vars.insert("PATCHTOOL".to_string(), "git".to_string());
    info!("Patching...");
    executor.exec("do_patch", &env)?;
    repo.run(&["tag", "-f", PATCHED_TAG])?;

    if patchdir.exists() {
        std::fs::remove_dir_all(&patchdir).at(&patchdir)?;
        if haspatches {
            repo.run(&["checkout", "patches"])?;
        }
    }

    let srctree_localdir = srctree.join(LOCAL_FILES_DIR);
    if options.sync {
        let source = format!("file://{}", srcsubdir.display());
        let refspec = format!("{0}:{0}", options.devbranch);
        GitRepo::new(srctree).run(&["fetch", source.as_str(), refspec.as_str()])?;

        let backup = PathBuf::from(format!("{}.bak", srctree_localdir.display()));
        if backup.exists() {
            std::fs::remove_dir_all(&backup).at(&backup)?;
        }
        if srctree_localdir.exists() {
            info!("Backing up current local file directory {}", srctree_localdir.display());
            std::fs::rename(&srctree_localdir, &backup).at(&srctree_localdir)?;
        }
        if local_dir.exists() {
            info!("Syncing local source files to srctree...");
            copy_tree(&local_dir, &srctree_localdir)?;
        }
    } else {
        if local_dir.exists() {
            info!("Adding local source files to srctree...");
            move_path(&local_dir, &srcsubdir.join(LOCAL_FILES_DIR))?;
        }
        move_path(&srcsubdir, srctree)?;
    }

    Ok(initial_rev)
}

/// Move unpacked sources that are not patches out of the work directory
/// into a subdirectory of their own, returning it.
fn isolate_sources(recipe: &Recipe, workdir: &Path) -> Result<PathBuf> {
    let patch_names: Vec<String> = recipe
        .patches()
        .iter()
        .map(|(uri, _)| uri.basename().to_string())
        .collect();

    let mut srcsubdir = workdir.join("devtool-source");
    let mut n = 1;
    while srcsubdir.exists() {
        srcsubdir = workdir.join(format!("devtool-source.{}", n));
        n += 1;
    }

    let entries = sorted_entries(workdir)?;
    std::fs::create_dir_all(&srcsubdir).at(&srcsubdir)?;
    move_sources(&entries, &srcsubdir, &patch_names)?;
    Ok(srcsubdir)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .at(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries)
}

/// Move `entries` into `dest`, leaving behind any file named like a patch.
/// Directories holding such a file are descended into.
fn move_sources(entries: &[PathBuf], dest: &Path, patch_names: &[String]) -> Result<()> {
    for path in entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = dest.join(name);
        if path.is_dir() && !path.is_symlink() {
            if contains_patch(path, patch_names) {
                std::fs::create_dir_all(&target).at(&target)?;
                move_sources(&sorted_entries(path)?, &target, patch_names)?;
            } else {
                move_path(path, &target)?;
            }
        } else if !patch_names.iter().any(|p| name == p.as_str()) {
            move_path(path, &target)?;
        }
    }
    Ok(())
}

fn contains_patch(dir: &Path, patch_names: &[String]) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .any(|e| patch_names.iter().any(|p| e.file_name() == p.as_str()))
}

/// Put `repodir` under git with an upstream baseline commit, check out the
/// development branch and tag the baseline.
pub(crate) fn setup_git_repo(repo: &GitRepo, version: &str, devbranch: &str) -> Result<()> {
    if !GitRepo::is_repo(repo.path()) {
        repo.run(&["init", "-q"])?;
        repo.run(&["add", "."])?;
        let status = repo.run(&["status", "--porcelain"])?;
        let mut args = vec!["commit", "-q"];
        let message = if status.trim().is_empty() {
            args.push("--allow-empty");
            "Initial empty commit with no upstream sources".to_string()
        } else if !version.is_empty() {
            format!("Initial commit from upstream at version {}", version)
        } else {
            "Initial commit from upstream".to_string()
        };
        args.extend(["-m", message.as_str()]);
        repo.run(&args)?;
    }

    repo.run(&["checkout", "-q", "-b", devbranch])?;
    repo.run(&["tag", "-f", BASE_TAG])?;
    Ok(())
}

/// Rename a file or directory, copying across filesystems.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if from.is_dir() {
        copy_tree(from, to)?;
        std::fs::remove_dir_all(from).at(from)
    } else {
        move_file(from, to)
    }
}

#[cfg(test)]
#[path = "extract_tests.rs"]
pub(crate) mod tests;
