//! Command entry points.
//!
//! Each command takes a [`Context`] and its arguments and returns the exit
//! status. Failures propagate as [`DevtoolError`] for the caller to report.

use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use toml_edit::{value, DocumentMut};
use tracing::{info, info_span, warn};

use crate::append::check_append_layer;
use crate::config::DevtoolConfig;
use crate::differ::LOCAL_FILES_DIR;
use crate::error::{DevtoolError, IoContext, Result};
use crate::extract::{extract_source, setup_git_repo, ExtractOptions};
use crate::git::GitRepo;
use crate::layers::RecipeStore;
use crate::recipe::{multiline_array, Recipe, SrcUri, RECIPE_SUFFIX};
use crate::revisions::{Provenance, BASE_TAG};
use crate::tasks::{git_url, BuildSystem, ShellBuildSystem, TaskEnv, TaskExecutor};
use crate::update::{self, UpdateArgs};
use crate::workspace::Workspace;

/// Everything a command needs.
pub struct Context {
    pub config: DevtoolConfig,
    pub store: RecipeStore,
    pub workspace: Workspace,
    pub build: Box<dyn BuildSystem>,
}

impl Context {
    /// Context using the shell build system.
    pub fn new(config: DevtoolConfig) -> Self {
        Self::with_build(config, Box::new(ShellBuildSystem))
    }

    pub fn with_build(config: DevtoolConfig, build: Box<dyn BuildSystem>) -> Self {
        let store = RecipeStore::new(&config.workspace_path, &config.layers);
        let workspace = Workspace::new(&config.workspace_path);
        Self {
            config,
            store,
            workspace,
            build,
        }
    }

    fn task_env(&self, recipe: &Recipe) -> TaskEnv {
        let workdir = self.config.tmp_dir.join("work").join(&recipe.name);
        TaskEnv {
            tempdir: workdir.join("temp"),
            source_dir: recipe.source_dir(&workdir),
            workdir,
            dl_dir: self.config.dl_dir.clone(),
            vars: BTreeMap::new(),
            identity: self.config.git_identity(),
        }
    }
}

/// Arguments of `add`.
#[derive(Debug, Clone, Default)]
pub struct AddArgs {
    pub name: String,
    pub srctree: PathBuf,
    pub fetch: Option<String>,
    pub version: Option<String>,
    pub no_git: bool,
    pub same_dir: bool,
    pub no_same_dir: bool,
}

/// Arguments of `modify`.
#[derive(Debug, Clone)]
pub struct ModifyArgs {
    pub name: String,
    pub srctree: PathBuf,
    pub extract: bool,
    pub branch: String,
    pub wildcard: bool,
    pub same_dir: bool,
    pub no_same_dir: bool,
}

/// Arguments of `extract` and `sync`.
#[derive(Debug, Clone)]
pub struct ExtractArgs {
    pub name: String,
    pub srctree: PathBuf,
    pub branch: String,
    pub keep_temp: bool,
}

/// Arguments of `reset`.
#[derive(Debug, Clone, Default)]
pub struct ResetArgs {
    pub name: Option<String>,
    pub all: bool,
    pub no_clean: bool,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).at(path)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(path).at(path)?.next().is_none())
}

/// Whether the recipe should build inside its source tree.
pub fn use_external_build(same_dir: bool, no_same_dir: bool, recipe: &Recipe) -> bool {
    if no_same_dir {
        info!("Using separate build directory since --no-same-dir specified");
        return false;
    }
    if same_dir {
        info!("Using source tree as build directory since --same-dir specified");
        return true;
    }
    if recipe.inherits("autotools-brokensep") {
        info!("Using source tree as build directory since recipe inherits autotools-brokensep");
        return true;
    }
    let workdir = Path::new("/WORKDIR");
    let s = recipe.source_dir(workdir);
    let b_is_s = match &recipe.b {
        None => true,
        Some(b) => {
            let b = recipe
                .expand(b, workdir)
                .replace("${S}", &s.display().to_string());
            PathBuf::from(b) == s
        }
    };
    if b_is_s {
        info!("Using source tree as build directory since that would be the default for this recipe");
    }
    b_is_s
}

/// Contents of a workspace append pointing `pn` at `srctree`.
fn render_workspace_append(
    pn: &str,
    srctree: &Path,
    build_in_tree: bool,
    local_files_dir: Option<&Path>,
    provenance: &Provenance,
) -> String {
    let mut doc = DocumentMut::new();
    if local_files_dir.is_some() {
        doc["files_extra_paths"] = value(multiline_array(&[pn.to_string()]));
    }
    if let Some(dir) = local_files_dir {
        doc["local_files_dir"] = value(dir.display().to_string());
    }
    doc["externalsrc"] = value(srctree.display().to_string());
    if build_in_tree {
        doc["externalsrc_build"] = value(srctree.display().to_string());
    }

    let mut content = doc.to_string();
    let record = provenance.render();
    if !record.is_empty() {
        content.push('\n');
        content.push_str(&record);
    }
    content
}

/// Create a new recipe in the workspace for an existing or fetched tree.
pub fn add(ctx: &Context, args: &AddArgs) -> Result<i32> {
    let _span = info_span!("add", recipe = %args.name).entered();

    if ctx.workspace.contains(&args.name)? {
        return Err(DevtoolError::AlreadyInWorkspace(args.name.clone()));
    }
    if args.name.contains('/') {
        return Err(DevtoolError::InvalidArgument(
            "\"/\" is not a valid character in recipe names".to_string(),
        ));
    }

    let srctree = absolute(&args.srctree)?;
    if srctree.exists() {
        if args.fetch.is_some() {
            if !srctree.is_dir() {
                return Err(DevtoolError::InvalidArgument(format!(
                    "Cannot fetch into source tree path {} as it exists and is not a directory",
                    srctree.display()
                )));
            }
            if !is_empty_dir(&srctree)? {
                return Err(DevtoolError::InvalidArgument(format!(
                    "Cannot fetch into source tree path {} as it already exists and is non-empty",
                    srctree.display()
                )));
            }
        }
    } else if args.fetch.is_none() {
        return Err(DevtoolError::InvalidArgument(format!(
            "Specified source tree {} could not be found",
            srctree.display()
        )));
    }

    let mut file_version = None;
    if let Some(version) = &args.version {
        if version.contains('_') || version.contains(' ') {
            return Err(DevtoolError::InvalidArgument(format!(
                "Invalid version string \"{}\"",
                version
            )));
        }
        file_version = Some(version.clone());
    }

    let mut src_uri = Vec::new();
    let mut srcrev = None;
    if let Some(fetch) = &args.fetch {
        let uri: SrcUri = fetch.parse().map_err(DevtoolError::InvalidArgument)?;
        if !uri.is_git() {
            return Err(DevtoolError::InvalidArgument(format!(
                "Only git sources can be fetched, not {}",
                fetch
            )));
        }
        file_version = Some("git".to_string());
        srcrev = Some(clone_source(&uri, &srctree)?);
        src_uri.push(fetch.clone());
    }

    let stem = match &file_version {
        Some(version) => format!("{}_{}", args.name, version),
        None => args.name.clone(),
    };
    let recipedir = ctx.workspace.recipes_dir().join(&args.name);
    std::fs::create_dir_all(&recipedir).at(&recipedir)?;
    ctx.workspace.ensure()?;

    let recipefile = recipedir.join(format!("{}{}", stem, RECIPE_SUFFIX));
    let version = match (&args.version, args.fetch.is_some()) {
        (Some(version), _) => version.clone(),
        (None, true) => "1.0+git".to_string(),
        (None, false) => "1.0".to_string(),
    };
    let content = Recipe::render_new(&args.name, &version, &src_uri, srcrev.as_deref());
    std::fs::write(&recipefile, content).at(&recipefile)?;
    info!(
        "Recipe {} has been automatically created; further editing may be required to make it fully functional",
        recipefile.display()
    );
    ctx.workspace.add_checksum(&args.name, &recipefile)?;

    if args.fetch.is_some() && !args.no_git {
        let repo = GitRepo::new(&srctree).with_identity(ctx.config.git_identity());
        setup_git_repo(&repo, args.version.as_deref().unwrap_or_default(), "devtool")?;
    }

    let mut provenance = Provenance::default();
    if GitRepo::is_repo(&srctree) {
        provenance.initial_rev = Some(GitRepo::new(&srctree).head_rev()?);
    }

    let recipe = Recipe::load(&recipefile)?;
    let build_in_tree = use_external_build(args.same_dir, args.no_same_dir, &recipe);
    let appendfile = ctx.workspace.append_path(&recipe, false);
    let content = render_workspace_append(&args.name, &srctree, build_in_tree, None, &provenance);
    std::fs::write(&appendfile, content).at(&appendfile)?;
    ctx.workspace.add_checksum(&args.name, &appendfile)?;

    println!(
        "{} Added {} building from {}",
        "✓".green().bold(),
        args.name.bright_white(),
        srctree.display()
    );
    Ok(0)
}

/// Clone a git reference into `dest`, returning the checked-out commit.
fn clone_source(uri: &SrcUri, dest: &Path) -> Result<String> {
    let url = git_url(uri);
    info!("Fetching {}...", url);
    let mut args = vec!["clone".to_string(), "-q".to_string()];
    if let Some(branch) = uri.param("branch") {
        args.extend(["-b".to_string(), branch.to_string()]);
    }
    args.extend([url, dest.display().to_string()]);

    let parent = dest.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).at(parent)?;
    GitRepo::new(parent).run(args.as_slice())?;
    GitRepo::new(dest).head_rev()
}

/// Set a recipe up to build from an external source tree.
pub fn modify(ctx: &Context, args: &ModifyArgs) -> Result<i32> {
    let _span = info_span!("modify", recipe = %args.name).entered();

    if ctx.workspace.contains(&args.name)? {
        return Err(DevtoolError::AlreadyInWorkspace(args.name.clone()));
    }
    if !args.extract && !args.srctree.is_dir() {
        return Err(DevtoolError::InvalidArgument(format!(
            "directory {} does not exist or not a directory (specify -x to extract source from recipe)",
            args.srctree.display()
        )));
    }

    let recipe = ctx.store.parse_recipe(&args.name)?;
    let pn = recipe.name.clone();
    if pn != args.name {
        info!("Mapping {} to {}", args.name, pn);
        if ctx.workspace.contains(&pn)? {
            return Err(DevtoolError::AlreadyInWorkspace(pn));
        }
    }

    let appendfile = ctx.workspace.append_path(&recipe, args.wildcard);
    if appendfile.exists() {
        return Err(DevtoolError::InvalidArgument(format!(
            "Another variant of recipe {} is already in your workspace (only one variant of a \
             recipe can currently be worked on at once)",
            pn
        )));
    }
    recipe.check_compatible()?;

    let mut srctree = absolute(&args.srctree)?;
    let mut provenance = Provenance::default();
    if args.extract {
        let options = ExtractOptions {
            devbranch: args.branch.clone(),
            keep_temp: false,
            sync: false,
        };
        let initial_rev = extract_source(&recipe, &srctree, ctx.build.as_ref(), &ctx.config, &options)?;
        provenance.commits = GitRepo::new(&srctree).rev_list(&initial_rev)?;
        provenance.initial_rev = Some(initial_rev);
    } else if GitRepo::is_repo(&srctree) {
        let repo = GitRepo::new(&srctree);
        // A tree we extracted earlier still carries its baseline tag.
        let initial_rev = if repo.tag_exists(BASE_TAG) && repo.head_contains(BASE_TAG)? {
            repo.rev_parse(BASE_TAG)?
        } else {
            repo.head_rev()?
        };
        provenance.initial_rev = Some(initial_rev);
    }

    let workdir = ctx.config.tmp_dir.join("work").join(&pn);
    let s = recipe.source_dir(&workdir);
    if let Ok(rel) = s.strip_prefix(&workdir) {
        let mut parts = rel.iter();
        parts.next();
        let subdir: PathBuf = parts.collect();
        if !subdir.as_os_str().is_empty() {
            srctree = srctree.join(subdir);
        }
    }

    ctx.workspace.ensure()?;
    let build_in_tree = use_external_build(args.same_dir, args.no_same_dir, &recipe);
    let local_files_dir = srctree.join(LOCAL_FILES_DIR);
    let content = render_workspace_append(
        &pn,
        &srctree,
        build_in_tree,
        Some(&local_files_dir),
        &provenance,
    );
    std::fs::write(&appendfile, content).at(&appendfile)?;
    ctx.workspace.add_checksum(&pn, &appendfile)?;

    info!("Recipe {} now set up to build from {}", pn, srctree.display());
    println!(
        "{} {} now set up to build from {}",
        "✓".green().bold(),
        pn.bright_white(),
        srctree.display()
    );
    Ok(0)
}

/// Extract a recipe's source into a new tree.
pub fn extract(ctx: &Context, args: &ExtractArgs) -> Result<i32> {
    let _span = info_span!("extract", recipe = %args.name).entered();
    let recipe = ctx.store.parse_recipe(&args.name)?;
    let srctree = absolute(&args.srctree)?;
    let options = ExtractOptions {
        devbranch: args.branch.clone(),
        keep_temp: args.keep_temp,
        sync: false,
    };
    extract_source(&recipe, &srctree, ctx.build.as_ref(), &ctx.config, &options)?;
    info!("Source tree extracted to {}", srctree.display());
    println!(
        "{} Source tree extracted to {}",
        "✓".green().bold(),
        srctree.display()
    );
    Ok(0)
}

/// Refresh an existing tree from the recipe.
pub fn sync(ctx: &Context, args: &ExtractArgs) -> Result<i32> {
    let _span = info_span!("sync", recipe = %args.name).entered();
    let recipe = ctx.store.parse_recipe(&args.name)?;
    let srctree = absolute(&args.srctree)?;
    let options = ExtractOptions {
        devbranch: args.branch.clone(),
        keep_temp: args.keep_temp,
        sync: true,
    };
    extract_source(&recipe, &srctree, ctx.build.as_ref(), &ctx.config, &options)?;
    info!("Source tree {} synchronized", srctree.display());
    println!(
        "{} Source tree {} synchronized",
        "✓".green().bold(),
        srctree.display()
    );
    Ok(0)
}

/// Write a workspace recipe's source changes back into its metadata.
pub fn update_recipe(ctx: &Context, args: &UpdateArgs) -> Result<i32> {
    let _span = info_span!("update_recipe", recipe = %args.recipe).entered();

    let entry = ctx.workspace.entry(&args.recipe)?;
    if let Some(layer) = &args.append {
        check_append_layer(layer)?;
    }

    let mut recipe = ctx.store.parse_recipe(&args.recipe)?;
    let report = update::update_recipe(&mut recipe, &entry.srctree, &entry.append, args)?;

    if recipe.path.starts_with(ctx.workspace.path()) {
        warn!(
            "Recipe file {} has been updated but is inside the workspace - you will need to move \
             it (and any associated files next to it) out to the desired layer before using \
             \"devtool reset\" in order to keep any changes",
            recipe.path.display()
        );
    }
    report.print();
    Ok(0)
}

/// List the recipes in the workspace.
pub fn status(ctx: &Context, json: bool) -> Result<i32> {
    let entries = ctx.workspace.entries()?;
    if json {
        let list: Vec<_> = entries.values().collect();
        let out = serde_json::to_string_pretty(&list)
            .map_err(|e| DevtoolError::InvalidArgument(e.to_string()))?;
        println!("{}", out);
        return Ok(0);
    }

    if entries.is_empty() {
        info!(
            "No recipes currently in your workspace - you can use \"devtool modify\" to work on \
             an existing recipe or \"devtool add\" to add a new one"
        );
    }
    for (name, entry) in &entries {
        println!("{}: {}", name.bright_white(), entry.srctree.display());
    }
    Ok(0)
}

/// Remove recipes from the workspace.
pub fn reset(ctx: &Context, args: &ResetArgs) -> Result<i32> {
    let entries = ctx.workspace.entries()?;
    let recipes: Vec<String> = match (&args.name, args.all) {
        (Some(_), true) => {
            return Err(DevtoolError::InvalidArgument(
                "Recipe cannot be specified if -a/--all is used".to_string(),
            ))
        }
        (Some(name), false) => {
            if !entries.contains_key(name) {
                return Err(DevtoolError::NotInWorkspace(name.clone()));
            }
            vec![name.clone()]
        }
        (None, true) => entries.keys().cloned().collect(),
        (None, false) => {
            return Err(DevtoolError::InvalidArgument(
                "Recipe must be specified, or specify -a/--all to reset all recipes".to_string(),
            ))
        }
    };

    if !recipes.is_empty() && !args.no_clean {
        info!("Cleaning sysroot for recipes {}...", recipes.join(", "));
        for pn in &recipes {
            clean_recipe(ctx, pn).map_err(|e| DevtoolError::Command {
                command: format!("do_clean {}", pn),
                output: format!(
                    "{}\nIf you wish, you may specify -n/--no-clean to skip running this \
                     command when resetting",
                    e
                ),
            })?;
        }
    }

    for pn in &recipes {
        let _span = info_span!("reset", recipe = %pn).entered();
        ctx.workspace.check_preserve(pn)?;
        ctx.workspace
            .preserve_dir(pn, &ctx.workspace.recipes_dir().join(pn))?;
        ctx.workspace
            .preserve_dir(pn, &ctx.workspace.appends_dir().join(pn))?;
        println!("{} {} reset", "✓".green().bold(), pn.bright_white());
    }
    Ok(0)
}

fn clean_recipe(ctx: &Context, pn: &str) -> Result<()> {
    let recipe = ctx.store.parse_recipe(pn)?;
    let env = ctx.task_env(&recipe);
    TaskExecutor::new(ctx.build.as_ref(), &recipe).exec("do_clean", &env)
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
