use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use recipe_devtool::commands::{self, AddArgs, Context, ExtractArgs, ModifyArgs, ResetArgs};
use recipe_devtool::{DevtoolConfig, UpdateArgs, UpdateMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};

#[derive(Parser)]
#[command(name = "devtool")]
#[command(author, version, about = "Work on recipe source trees and write changes back as patches", long_about = None)]
struct Cli {
    /// Base directory holding conf/devtool.toml
    #[arg(long, env = "DEVTOOL_BASEPATH", default_value = ".", global = true)]
    basepath: PathBuf,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new recipe building from a source tree
    Add {
        recipename: String,
        srctree: PathBuf,
        /// Fetch this git URI into the source tree
        #[arg(short, long)]
        fetch: Option<String>,
        /// Version to use within the recipe
        #[arg(short = 'V', long)]
        version: Option<String>,
        /// Do not set up the fetched tree as a git repository
        #[arg(long)]
        no_git: bool,
        /// Build in the source tree
        #[arg(short, long, conflicts_with = "no_same_dir")]
        same_dir: bool,
        /// Force a build directory separate from the source tree
        #[arg(long)]
        no_same_dir: bool,
    },
    /// Set an existing recipe up to build from a source tree
    Modify {
        recipename: String,
        srctree: PathBuf,
        /// Extract the recipe's source into the source tree
        #[arg(short = 'x', long)]
        extract: bool,
        /// Development branch name
        #[arg(short, long)]
        branch: Option<String>,
        /// Name the workspace append with a wildcard version
        #[arg(short, long)]
        wildcard: bool,
        /// Build in the source tree
        #[arg(short, long, conflicts_with = "no_same_dir")]
        same_dir: bool,
        /// Force a build directory separate from the source tree
        #[arg(long)]
        no_same_dir: bool,
    },
    /// Extract the source of a recipe into a new tree
    Extract {
        recipename: String,
        srctree: PathBuf,
        /// Development branch name
        #[arg(short, long)]
        branch: Option<String>,
        /// Keep the temporary extraction directory
        #[arg(long)]
        keep_temp: bool,
    },
    /// Refresh an extracted tree from its recipe
    Sync {
        recipename: String,
        srctree: PathBuf,
        /// Branch to fetch the refreshed history into
        #[arg(short, long)]
        branch: Option<String>,
        /// Keep the temporary extraction directory
        #[arg(long)]
        keep_temp: bool,
    },
    /// Write source tree changes back into the recipe
    UpdateRecipe {
        recipename: String,
        /// How to record the changes
        #[arg(short, long, value_enum, default_value_t = UpdateMode::Auto)]
        mode: UpdateMode,
        /// Revision the changes start from
        #[arg(long)]
        initial_rev: Option<String>,
        /// Write an append into this layer instead of editing the recipe
        #[arg(short, long)]
        append: Option<PathBuf>,
        /// Use a wildcard version for the append
        #[arg(short, long, requires = "append")]
        wildcard_version: bool,
        /// Keep patches that no longer apply
        #[arg(short, long)]
        no_remove: bool,
    },
    /// List recipes in the workspace
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove recipes from the workspace
    Reset {
        recipename: Option<String>,
        /// Reset every recipe in the workspace
        #[arg(short, long)]
        all: bool,
        /// Skip cleaning the recipe's build output
        #[arg(short, long)]
        no_clean: bool,
    },
}

fn run(cli: Cli) -> Result<i32> {
    let config = DevtoolConfig::load(&cli.basepath)
        .with_context(|| format!("loading configuration from {}", cli.basepath.display()))?;
    debug!("Workspace is {}", config.workspace_path.display());
    let branch = |b: Option<String>| b.unwrap_or_else(|| config.default_branch.clone());

    let ctx = Context::new(config.clone());
    let code = match cli.command {
        Commands::Add {
            recipename,
            srctree,
            fetch,
            version,
            no_git,
            same_dir,
            no_same_dir,
        } => commands::add(
            &ctx,
            &AddArgs {
                name: recipename,
                srctree,
                fetch,
                version,
                no_git,
                same_dir,
                no_same_dir,
            },
        )?,
        Commands::Modify {
            recipename,
            srctree,
            extract,
            branch: b,
            wildcard,
            same_dir,
            no_same_dir,
        } => commands::modify(
            &ctx,
            &ModifyArgs {
                name: recipename,
                srctree,
                extract,
                branch: branch(b),
                wildcard,
                same_dir,
                no_same_dir,
            },
        )?,
        Commands::Extract {
            recipename,
            srctree,
            branch: b,
            keep_temp,
        } => commands::extract(
            &ctx,
            &ExtractArgs {
                name: recipename,
                srctree,
                branch: branch(b),
                keep_temp,
            },
        )?,
        Commands::Sync {
            recipename,
            srctree,
            branch: b,
            keep_temp,
        } => commands::sync(
            &ctx,
            &ExtractArgs {
                name: recipename,
                srctree,
                branch: branch(b),
                keep_temp,
            },
        )?,
        Commands::UpdateRecipe {
            recipename,
            mode,
            initial_rev,
            append,
            wildcard_version,
            no_remove,
        } => commands::update_recipe(
            &ctx,
            &UpdateArgs {
                recipe: recipename,
                initial_rev,
                append,
                no_remove,
                wildcard_version,
                mode,
            },
        )?,
        Commands::Status { json } => commands::status(&ctx, json)?,
        Commands::Reset {
            recipename,
            all,
            no_clean,
        } => commands::reset(
            &ctx,
            &ResetArgs {
                name: recipename,
                all,
                no_clean,
            },
        )?,
    };
    Ok(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}
