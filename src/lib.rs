//! Source tree and patch management for recipe-based package builds.
//!
//! A recipe describes where a package's source comes from, which patches
//! apply on top and which local files it installs. This crate extracts that
//! source into a git working tree with one commit per patch, tracks trees
//! under development in a workspace, and writes the tree's history back
//! into the recipe as patches or as a new pinned revision.

pub mod append;
pub mod commands;
pub mod config;
pub mod differ;
pub mod error;
pub mod extract;
pub mod git;
pub mod layers;
pub mod recipe;
pub mod revisions;
pub mod tasks;
pub mod update;
pub mod workspace;

pub use commands::{AddArgs, Context, ExtractArgs, ModifyArgs, ResetArgs};
pub use config::DevtoolConfig;
pub use error::{DevtoolError, Result};
pub use extract::{extract_source, ExtractOptions};
pub use layers::RecipeStore;
pub use recipe::{Recipe, SrcUri};
pub use tasks::{BuildSystem, ShellBuildSystem};
pub use update::{UpdateArgs, UpdateMode, UpdateReport};
pub use workspace::{Workspace, WorkspaceEntry};
