//! Git operations on working trees.
//!
//! Reads go through libgit2; anything that mutates a repository, applies
//! patches or formats them shells out to the `git` CLI so behaviour matches
//! what a developer would get by hand.

use git2::{BranchType, ObjectType, Oid, Repository, Sort, TreeWalkMode, TreeWalkResult};
use semver::Version;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{DevtoolError, IoContext, Result};

/// Identity used for commits when the repository has none configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// One entry of a tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: i32,
    pub kind: Option<ObjectType>,
    pub oid: Oid,
}

/// Length of a full SHA-1 object name.
pub const FULL_HASH_LEN: usize = 40;

/// Whether `rev` is a full-length hexadecimal commit hash.
pub fn is_full_hash(rev: &str) -> bool {
    rev.len() == FULL_HASH_LEN && rev.chars().all(|c| c.is_ascii_hexdigit())
}

pub(crate) fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("LC_ALL", "C");
    command
}

/// Run a prepared command, returning stdout or a command failure carrying
/// the captured output.
pub(crate) fn run_command(command: Command) -> Result<String> {
    let stdout = run_command_bytes(command)?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Run a command and return its raw standard output.
pub(crate) fn run_command_bytes(mut command: Command) -> Result<Vec<u8>> {
    let rendered = render_command(&command);
    debug!("Running {}", rendered);
    let output = command.output().map_err(|e| DevtoolError::Command {
        command: rendered.clone(),
        output: e.to_string(),
    })?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DevtoolError::Command {
            command: rendered,
            output: format!("{}{}", stdout, stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn render_command(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Installed git version.
pub fn git_version() -> Result<Version> {
    let mut command = Command::new("git");
    command.arg("--version");
    let out = run_command(command)?;
    parse_git_version(&out)
        .ok_or_else(|| DevtoolError::Config(format!("unrecognised git version '{}'", out.trim())))
}

/// Parse `git version 2.39.2.windows.1` style output.
pub fn parse_git_version(output: &str) -> Option<Version> {
    let word = output.split_whitespace().find(|w| w.starts_with(|c: char| c.is_ascii_digit()))?;
    let mut nums = word.split('.').map(|n| n.parse::<u64>().ok());
    let major = nums.next().flatten()?;
    let minor = nums.next().flatten().unwrap_or(0);
    let patch = nums.next().flatten().unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// A git working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
    identity: Option<GitIdentity>,
}

impl GitRepo {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            identity: None,
        }
    }

    /// Fall back to `identity` for commits when none is configured.
    pub fn with_identity(mut self, identity: GitIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `path` is the top of a git working tree.
    pub fn is_repo(path: &Path) -> bool {
        path.join(".git").exists()
    }

    fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }

    fn configured_identity(&self) -> bool {
        let config = match Repository::open(&self.path) {
            Ok(repo) => repo.config(),
            Err(_) => git2::Config::open_default(),
        };
        match config {
            Ok(config) => {
                config.get_string("user.name").is_ok() && config.get_string("user.email").is_ok()
            }
            Err(_) => false,
        }
    }

    /// A `git` command running in this tree.
    pub fn command(&self) -> Command {
        let mut command = base_git_command();
        if let Some(identity) = &self.identity {
            if !self.configured_identity() {
                command
                    .arg("-c")
                    .arg(format!("user.name={}", identity.name))
                    .arg("-c")
                    .arg(format!("user.email={}", identity.email));
            }
        }
        command.current_dir(&self.path);
        command
    }

    /// Run `git <args>` and return stdout.
    pub fn run<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<String> {
        let mut command = self.command();
        command.args(args);
        run_command(command)
    }

    /// Run `git <args>` where failure is an expected outcome.
    pub fn probe<S: AsRef<OsStr>>(&self, args: &[S]) -> Option<String> {
        self.run(args).ok()
    }

    /// Full hash of the tip commit.
    pub fn head_rev(&self) -> Result<String> {
        let repo = self.open()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Resolve a revision to a full commit hash.
    pub fn rev_parse(&self, spec: &str) -> Result<String> {
        let repo = self.open()?;
        let commit = repo.revparse_single(spec)?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn tag_exists(&self, tag: &str) -> bool {
        self.open()
            .map(|repo| repo.find_reference(&format!("refs/tags/{}", tag)).is_ok())
            .unwrap_or(false)
    }

    /// Commits in `from..HEAD`, oldest first.
    pub fn rev_list(&self, from: &str) -> Result<Vec<String>> {
        let repo = self.open()?;
        let from = repo.revparse_single(from)?.peel_to_commit()?.id();
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        walk.hide(from)?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        let revs = walk
            .map(|oid| oid.map(|o| o.to_string()).map_err(DevtoolError::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(revs)
    }

    /// Whether the tip commit descends from (or is) `rev`.
    pub fn head_contains(&self, rev: &str) -> Result<bool> {
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?.id();
        let target = repo.revparse_single(rev)?.peel_to_commit()?.id();
        Ok(head == target || repo.graph_descendant_of(head, target)?)
    }

    /// Remote-tracking branches (`origin/master`) containing `rev`.
    pub fn remote_branches_containing(&self, rev: &str) -> Result<Vec<String>> {
        let repo = self.open()?;
        let target = repo.revparse_single(rev)?.peel_to_commit()?.id();
        let mut names = Vec::new();
        for branch in repo.branches(Some(BranchType::Remote))? {
            let (branch, _) = branch?;
            let Some(tip) = branch.get().target() else {
                continue;
            };
            if tip == target || repo.graph_descendant_of(tip, target)? {
                if let Some(name) = branch.name()? {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// List a tree-ish, keyed by path.
    pub fn ls_tree(&self, treeish: &str, recursive: bool) -> Result<BTreeMap<String, TreeEntry>> {
        let repo = self.open()?;
        let tree = repo.revparse_single(treeish)?.peel_to_tree()?;
        let mut entries = BTreeMap::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            let name = format!("{}{}", root, entry.name().unwrap_or_default());
            let is_tree = entry.kind() == Some(ObjectType::Tree);
            if recursive && is_tree {
                return TreeWalkResult::Ok;
            }
            entries.insert(
                name,
                TreeEntry {
                    mode: entry.filemode(),
                    kind: entry.kind(),
                    oid: entry.id(),
                },
            );
            if is_tree {
                TreeWalkResult::Skip
            } else {
                TreeWalkResult::Ok
            }
        })?;
        Ok(entries)
    }

    /// Write the blobs of tree `oid` below `dest`, returning their relative
    /// paths. The working copy is not consulted.
    pub fn export_tree(&self, oid: Oid, dest: &Path) -> Result<Vec<String>> {
        let repo = self.open()?;
        let tree = repo.find_tree(oid)?;
        let mut blobs = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                let name = format!("{}{}", root, entry.name().unwrap_or_default());
                blobs.push((name, entry.id(), entry.filemode()));
            }
            TreeWalkResult::Ok
        })?;

        let mut files = Vec::with_capacity(blobs.len());
        for (name, blob_oid, mode) in blobs {
            let blob = repo.find_blob(blob_oid)?;
            let target = dest.join(&name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            std::fs::write(&target, blob.content()).at(&target)?;
            #[cfg(unix)]
            if mode == 0o100755 {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                    .at(&target)?;
            }
            #[cfg(not(unix))]
            let _ = mode;
            files.push(name);
        }
        Ok(files)
    }

    /// Commits on HEAD not yet upstream of `upstream`, per `git cherry`.
    /// `None` when the comparison cannot be made.
    pub fn cherry(&self, upstream: &str) -> Option<Vec<String>> {
        let out = self.probe(&["cherry", upstream])?;
        Some(
            out.lines()
                .filter_map(|line| line.strip_prefix("+ "))
                .map(|rev| rev.trim().to_string())
                .collect(),
        )
    }

    /// Format patches for `start..HEAD` into `dest`, leaving out `exclude`.
    pub fn format_patch(&self, start: &str, dest: &Path, exclude: &str) -> Result<()> {
        let mut args: Vec<String> = vec![
            "format-patch".into(),
            "--no-signature".into(),
            "--no-numbered".into(),
            start.into(),
            "-o".into(),
            dest.display().to_string(),
            "--".into(),
        ];
        args.extend(self.exclude_pathspec(exclude)?);
        self.run(args.as_slice())?;
        Ok(())
    }

    /// Pathspec covering the tree except `path`.
    fn exclude_pathspec(&self, path: &str) -> Result<Vec<String>> {
        let supports_magic = git_version()
            .map(|v| v >= Version::new(1, 9, 0))
            .unwrap_or(false);
        if supports_magic {
            return Ok(vec![".".to_string(), format!(":(exclude){}", path)]);
        }

        // Older git: enumerate the other top-level entries instead.
        let recursive = path.contains('/');
        let mut files: Vec<String> = self.ls_tree("HEAD", recursive)?.into_keys().collect();
        if let Some(pos) = files.iter().position(|f| f == path) {
            files.remove(pos);
            Ok(files)
        } else {
            Ok(vec![".".to_string()])
        }
    }

    /// Turn a clone borrowing objects through alternates into a standalone
    /// repository.
    pub fn convert_standalone_clone(&self) -> Result<()> {
        let alternates = self.path.join(".git/objects/info/alternates");
        if alternates.exists() {
            debug!("Repacking {} into a standalone repository", self.path.display());
            self.run(&["repack", "-a", "-d"])?;
            std::fs::remove_file(&alternates).at(&alternates)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "git_tests.rs"]
pub(crate) mod tests;
