//! Devtool configuration loaded from `conf/devtool.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{DevtoolError, IoContext, Result};
use crate::git::GitIdentity;

/// Location of the configuration file, relative to the base path.
pub const CONFIG_FILE: &str = "conf/devtool.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    workspace_path: PathBuf,
    layers: Vec<PathBuf>,
    dl_dir: PathBuf,
    tmp_dir: PathBuf,
    default_branch: String,
    git_user_name: String,
    git_user_email: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            workspace_path: PathBuf::from("workspace"),
            layers: Vec::new(),
            dl_dir: PathBuf::from("downloads"),
            tmp_dir: PathBuf::from("tmp"),
            default_branch: "devtool".to_string(),
            git_user_name: "OpenEmbedded".to_string(),
            git_user_email: "oe.patch@oe".to_string(),
        }
    }
}

/// Resolved configuration; every path is absolute.
#[derive(Debug, Clone)]
pub struct DevtoolConfig {
    pub basepath: PathBuf,
    pub workspace_path: PathBuf,
    pub layers: Vec<PathBuf>,
    pub dl_dir: PathBuf,
    /// Root of per-recipe build directories (`<tmp_dir>/work/<pn>`).
    pub tmp_dir: PathBuf,
    pub default_branch: String,
    pub git_user_name: String,
    pub git_user_email: String,
}

impl DevtoolConfig {
    /// Commit identity used when git has none configured.
    pub fn git_identity(&self) -> GitIdentity {
        GitIdentity {
            name: self.git_user_name.clone(),
            email: self.git_user_email.clone(),
        }
    }

    /// Load the configuration for a base path. A missing file yields defaults.
    pub fn load(basepath: impl AsRef<Path>) -> Result<Self> {
        let basepath = std::path::absolute(basepath.as_ref()).at(basepath.as_ref())?;
        let path = basepath.join(CONFIG_FILE);

        let raw = if path.exists() {
            let content = std::fs::read_to_string(&path).at(&path)?;
            toml_edit::de::from_str::<RawConfig>(&content)
                .map_err(|e| DevtoolError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            RawConfig::default()
        };

        Ok(Self::resolve(basepath, raw))
    }

    fn resolve(basepath: PathBuf, raw: RawConfig) -> Self {
        let abs = |p: PathBuf| {
            if p.is_absolute() {
                p
            } else {
                basepath.join(p)
            }
        };

        Self {
            workspace_path: abs(raw.workspace_path),
            layers: raw.layers.into_iter().map(abs).collect(),
            dl_dir: abs(raw.dl_dir),
            tmp_dir: abs(raw.tmp_dir),
            default_branch: raw.default_branch,
            git_user_name: raw.git_user_name,
            git_user_email: raw.git_user_email,
            basepath,
        }
    }
}
