//! Task graph and the shell-based build system.
//!
//! Built-in tasks cover what source extraction needs (fetch, unpack,
//! patch, clean). A recipe may override any of them, or declare new ones,
//! through its `[tasks]` table.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{DevtoolError, IoContext, Result};
use crate::git::{base_git_command, run_command, run_command_bytes, GitIdentity, GitRepo};
use crate::recipe::{Recipe, SrcUri};

/// Line added to commit messages of applied patches, followed by the
/// patch file name.
pub const ORIGINAL_PATCH_MARKER: &str = "%% original patch: ";

/// Built-in tasks and their dependencies.
const BUILTIN_TASKS: &[(&str, &[&str])] = &[
    ("do_fetch", &[]),
    ("do_unpack", &["do_fetch"]),
    ("do_patch", &["do_unpack"]),
    ("do_kernel_checkout", &["do_unpack"]),
    ("do_clean", &[]),
];

/// Environment a task runs in.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    /// `WORKDIR`: where sources are unpacked.
    pub workdir: PathBuf,
    /// `T`: scratch directory for logs and temporary files.
    pub tempdir: PathBuf,
    /// `DL_DIR`: download and mirror cache.
    pub dl_dir: PathBuf,
    /// `S`: source directory patches are applied in.
    pub source_dir: PathBuf,
    /// Extra variables, e.g. `PATCHTOOL`.
    pub vars: BTreeMap<String, String>,
    pub identity: GitIdentity,
}

impl TaskEnv {
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Something that can execute a single task of a recipe.
pub trait BuildSystem {
    fn run_task(&self, recipe: &Recipe, task: &str, env: &TaskEnv) -> Result<()>;
}

/// Dependency graph of a recipe's tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    recipe: String,
    deps: BTreeMap<String, Vec<String>>,
    noexec: BTreeSet<String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in tasks merged with the recipe's own declarations. Declared
    /// dependencies replace built-in ones when given.
    pub fn for_recipe(recipe: &Recipe) -> Self {
        let mut graph = Self {
            recipe: recipe.name.clone(),
            ..Self::default()
        };
        for (task, deps) in BUILTIN_TASKS {
            graph.add_task(task, deps);
        }
        for (task, def) in &recipe.tasks {
            if !def.deps.is_empty() || !graph.contains(task) {
                let deps: Vec<&str> = def.deps.iter().map(String::as_str).collect();
                graph.add_task(task, &deps);
            }
            if def.noexec {
                graph.noexec.insert(task.clone());
            }
        }
        graph
    }

    /// Add a task, replacing any previous dependency list.
    pub fn add_task(&mut self, name: &str, deps: &[&str]) {
        self.deps.insert(
            name.to_string(),
            deps.iter().map(|d| d.to_string()).collect(),
        );
    }

    pub fn set_noexec(&mut self, name: &str) {
        self.noexec.insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    pub fn is_noexec(&self, name: &str) -> bool {
        self.noexec.contains(name)
    }

    /// Dependency closure of `task`, dependencies first.
    pub fn order_for(&self, task: &str) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut stack = Vec::new();
        self.visit(task, &mut stack, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        task: &str,
        stack: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(task) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|t| t == task) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(task.to_string());
            return Err(DevtoolError::TaskCycle(cycle.join(" -> ")));
        }
        let deps = self.deps.get(task).ok_or_else(|| DevtoolError::UnknownTask {
            recipe: self.recipe.clone(),
            task: task.to_string(),
        })?;

        stack.push(task.to_string());
        for dep in deps {
            self.visit(dep, stack, done, order)?;
        }
        stack.pop();

        done.insert(task.to_string());
        order.push(task.to_string());
        Ok(())
    }
}

/// Runs tasks of one recipe, each at most once.
pub struct TaskExecutor<'a> {
    build: &'a dyn BuildSystem,
    recipe: &'a Recipe,
    graph: TaskGraph,
    executed: HashSet<String>,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(build: &'a dyn BuildSystem, recipe: &'a Recipe) -> Self {
        Self {
            build,
            recipe,
            graph: TaskGraph::for_recipe(recipe),
            executed: HashSet::new(),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Run `task` after any of its dependencies not yet run.
    pub fn exec(&mut self, task: &str, env: &TaskEnv) -> Result<()> {
        if !self.graph.contains(task) {
            return Err(DevtoolError::UnknownTask {
                recipe: self.recipe.name.clone(),
                task: task.to_string(),
            });
        }
        for name in self.graph.order_for(task)? {
            if self.executed.contains(&name) {
                continue;
            }
            if self.graph.is_noexec(&name) {
                debug!("Skipping {} (noexec)", name);
            } else {
                info!("Executing {}...", name);
                self.build.run_task(self.recipe, &name, env)?;
            }
            self.executed.insert(name);
        }
        Ok(())
    }
}

/// Build system that runs built-in tasks with local tools (`git`, `tar`,
/// `curl`) and recipe-declared tasks with `sh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellBuildSystem;

impl BuildSystem for ShellBuildSystem {
    fn run_task(&self, recipe: &Recipe, task: &str, env: &TaskEnv) -> Result<()> {
        if let Some(script) = recipe.tasks.get(task).and_then(|t| t.run.as_deref()) {
            return run_script(recipe, script, env);
        }
        match task {
            "do_fetch" => fetch(recipe, env),
            "do_unpack" => unpack(recipe, env),
            "do_patch" => patch(recipe, env),
            "do_clean" => clean(env),
            "do_kernel_checkout" => {
                debug!("{} has no kernel metadata to check out", recipe.name);
                Ok(())
            }
            _ => Err(DevtoolError::UnknownTask {
                recipe: recipe.name.clone(),
                task: task.to_string(),
            }),
        }
    }
}

fn run_script(recipe: &Recipe, script: &str, env: &TaskEnv) -> Result<()> {
    let cwd = if env.source_dir.is_dir() {
        &env.source_dir
    } else {
        &env.workdir
    };
    std::fs::create_dir_all(cwd).at(cwd)?;
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .env("WORKDIR", &env.workdir)
        .env("S", &env.source_dir)
        .env("T", &env.tempdir)
        .env("DL_DIR", &env.dl_dir)
        .env("PN", &recipe.name)
        .env("PV", &recipe.version)
        .env("BPN", recipe.bpn())
        .envs(&env.vars);
    run_command(command)?;
    Ok(())
}

/// Mirror directory name for a git reference.
fn mirror_name(uri: &SrcUri) -> String {
    uri.path.trim_start_matches('/').replace('/', ".")
}

/// URL git should talk to for a `git://` reference.
pub(crate) fn git_url(uri: &SrcUri) -> String {
    match uri.param("protocol") {
        Some("file") => uri.path.clone(),
        None if uri.path.starts_with('/') => uri.path.clone(),
        Some(protocol) => format!("{}://{}", protocol, uri.path),
        None => format!("git://{}", uri.path),
    }
}

fn is_remote_download(uri: &SrcUri) -> bool {
    matches!(uri.scheme.as_str(), "http" | "https" | "ftp")
}

fn fetch(recipe: &Recipe, env: &TaskEnv) -> Result<()> {
    std::fs::create_dir_all(&env.dl_dir).at(&env.dl_dir)?;
    for uri in &recipe.src_uri {
        if uri.is_git() {
            let mirror = env.dl_dir.join("git2").join(mirror_name(uri));
            let url = git_url(uri);
            if mirror.exists() {
                debug!("Updating mirror {}", mirror.display());
                let mut command = base_git_command();
                command
                    .current_dir(&mirror)
                    .args(["fetch", "--prune", "--tags", url.as_str()])
                    .arg("+refs/heads/*:refs/heads/*");
                run_command(command)?;
            } else {
                info!("Cloning {} into {}", url, mirror.display());
                let mut command = base_git_command();
                command
                    .args(["clone", "--bare", "--mirror", url.as_str()])
                    .arg(&mirror);
                run_command(command)?;
            }
        } else if uri.is_local() {
            if recipe.resolve_local(uri).is_none() {
                let searched: Vec<String> = recipe
                    .files_search_path()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                return Err(DevtoolError::Fetch(format!(
                    "Unable to find file {} anywhere. The paths that were searched were:\n    {}",
                    uri,
                    searched.join("\n    ")
                )));
            }
        } else if is_remote_download(uri) {
            let dest = env.dl_dir.join(uri.basename());
            if dest.exists() {
                continue;
            }
            let partial = env.dl_dir.join(format!("{}.part", uri.basename()));
            let url = uri.as_str().split(';').next().unwrap_or_default();
            info!("Downloading {}", url);
            let mut command = Command::new("curl");
            command.args(["-fsSL", "-o"]).arg(&partial).arg(url);
            run_command(command)?;
            std::fs::rename(&partial, &dest).at(&dest)?;
        } else {
            return Err(DevtoolError::Fetch(format!(
                "unsupported source reference {}",
                uri
            )));
        }
    }
    Ok(())
}

fn unpack(recipe: &Recipe, env: &TaskEnv) -> Result<()> {
    std::fs::create_dir_all(&env.workdir).at(&env.workdir)?;
    for uri in &recipe.src_uri {
        let dest_root = match uri.param("subdir") {
            Some(subdir) => env.workdir.join(subdir),
            None => env.workdir.clone(),
        };
        std::fs::create_dir_all(&dest_root).at(&dest_root)?;

        if uri.is_git() {
            unpack_git(recipe, uri, env)?;
        } else if uri.is_local() {
            let Some(path) = recipe.resolve_local(uri) else {
                return Err(DevtoolError::Fetch(format!("{} was not fetched", uri)));
            };
            if uri.is_archive() {
                extract_archive(&path, &dest_root)?;
            } else {
                let name = if uri.path.starts_with('/') {
                    uri.basename()
                } else {
                    uri.path.as_str()
                };
                copy_tree(&path, &dest_root.join(name))?;
            }
        } else if is_remote_download(uri) {
            let path = env.dl_dir.join(uri.basename());
            if uri.is_archive() {
                extract_archive(&path, &dest_root)?;
            } else {
                copy_tree(&path, &dest_root.join(uri.basename()))?;
            }
        }
    }
    Ok(())
}

fn unpack_git(recipe: &Recipe, uri: &SrcUri, env: &TaskEnv) -> Result<()> {
    let mirror = env.dl_dir.join("git2").join(mirror_name(uri));
    let dest = env.workdir.join(uri.param("destsuffix").unwrap_or("git"));
    let branch = uri.param("branch").unwrap_or("master");

    let mut command = base_git_command();
    command
        .args(["clone", "-q", "-s", "-n"])
        .arg(&mirror)
        .arg(&dest);
    run_command(command)?;

    let repo = GitRepo::new(&dest).with_identity(env.identity.clone());
    repo.run(&["remote", "set-url", "origin", git_url(uri).as_str()])?;

    let rev = match recipe.srcrev.as_deref() {
        Some(rev) if !rev.is_empty() && rev != "${AUTOREV}" && rev != "AUTOINC" => rev.to_string(),
        _ => format!("origin/{}", branch),
    };
    repo.run(&["checkout", "-q", "-B", branch, rev.as_str()])?;
    Ok(())
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive.to_string_lossy();
    let mut command = if name.ends_with(".zip") {
        let mut command = Command::new("unzip");
        command.args(["-q", "-o"]).arg(archive).arg("-d").arg(dest);
        command
    } else {
        let mut command = Command::new("tar");
        command.arg("-xf").arg(archive).arg("-C").arg(dest);
        command
    };
    command.env("LC_ALL", "C");
    debug!("Extracting {} into {}", archive.display(), dest.display());
    run_command(command)?;
    Ok(())
}

/// Copy a file or directory tree.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        for entry in WalkDir::new(src).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(src).to_path_buf();
                DevtoolError::io(path, e.into())
            })?;
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).at(&target)?;
            } else {
                std::fs::copy(entry.path(), &target).at(entry.path())?;
            }
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        std::fs::copy(src, dest).at(src)?;
    }
    Ok(())
}

fn patch(recipe: &Recipe, env: &TaskEnv) -> Result<()> {
    let use_git = env.var("PATCHTOOL") == Some("git") || GitRepo::is_repo(&env.source_dir);
    for (uri, path) in recipe.patches() {
        let name = uri.basename().to_string();
        let file = plain_patch(&path, &name, env)?;
        info!("Applying patch {}", name);
        if use_git {
            let repo = GitRepo::new(&env.source_dir).with_identity(env.identity.clone());
            apply_patch_git(&repo, &file, &name, uri.striplevel())?;
        } else {
            let mut command = Command::new("patch");
            command
                .arg(format!("-p{}", uri.striplevel()))
                .args(["--forward", "-i"])
                .arg(&file)
                .current_dir(&env.source_dir);
            run_command(command)?;
        }
    }
    Ok(())
}

/// Decompress a compressed patch into `T`; plain patches are used in place.
fn plain_patch(path: &Path, name: &str, env: &TaskEnv) -> Result<PathBuf> {
    let tool = match path.extension().and_then(|e| e.to_str()) {
        Some("gz") | Some("Z") => "gzip",
        Some("bz2") => "bzip2",
        Some("xz") => "xz",
        _ => return Ok(path.to_path_buf()),
    };
    std::fs::create_dir_all(&env.tempdir).at(&env.tempdir)?;
    let mut command = Command::new(tool);
    command.arg("-dc").arg(path);
    let content = run_command_bytes(command)?;
    let dest = env.tempdir.join(format!("{}.plain", name));
    std::fs::write(&dest, content).at(&dest)?;
    Ok(dest)
}

/// Apply a patch as one commit, recording its name in the message.
pub(crate) fn apply_patch_git(repo: &GitRepo, file: &Path, name: &str, striplevel: u32) -> Result<()> {
    let strip = format!("-p{}", striplevel);
    let file_arg = file.display().to_string();

    if repo.run(&["am", "-3", "--keep-cr", strip.as_str(), file_arg.as_str()]).is_ok() {
        let message = repo.run(&["log", "-1", "--format=%B"])?;
        let amended = format!("{}\n\n{}{}", message.trim_end(), ORIGINAL_PATCH_MARKER, name);
        repo.run(&["commit", "-q", "--amend", "-m", amended.as_str()])?;
        return Ok(());
    }

    debug!("git am failed for {}, falling back to git apply", name);
    let _ = repo.probe(&["am", "--abort"]);
    repo.run(&["apply", "--index", "--whitespace=nowarn", strip.as_str(), file_arg.as_str()])?;

    let content = std::fs::read_to_string(file).unwrap_or_default();
    let (subject, author) = patch_header(&content);
    let subject = subject.unwrap_or_else(|| format!("Apply patch {}", name));
    let message = format!("{}\n\n{}{}", subject, ORIGINAL_PATCH_MARKER, name);
    let mut args = vec!["commit".to_string(), "-q".to_string(), "-m".to_string(), message];
    if let Some(author) = author {
        args.push(format!("--author={}", author));
    }
    repo.run(args.as_slice())?;
    Ok(())
}

/// Subject and author from a patch's mail-style header, if it has one.
fn patch_header(content: &str) -> (Option<String>, Option<String>) {
    let mut subject = None;
    let mut author = None;
    for line in content.lines() {
        if line.starts_with("diff ") || line.starts_with("--- ") || line == "---" {
            break;
        }
        if let Some(rest) = line.strip_prefix("Subject: ") {
            let rest = match rest.strip_prefix('[') {
                Some(tail) => tail.split_once("] ").map(|(_, s)| s).unwrap_or(rest),
                None => rest,
            };
            subject = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("From: ") {
            if rest.contains('<') && rest.contains('>') {
                author = Some(rest.trim().to_string());
            }
        }
    }
    (subject, author)
}

fn clean(env: &TaskEnv) -> Result<()> {
    if env.workdir.exists() {
        info!("Removing {}", env.workdir.display());
        std::fs::remove_dir_all(&env.workdir).at(&env.workdir)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tasks_tests.rs"]
mod tests;
