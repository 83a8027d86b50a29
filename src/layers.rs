//! Layer scanning and recipe lookup.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::append::{AppendFile, APPEND_SUFFIX};
use crate::error::{DevtoolError, Result};
use crate::recipe::{recipe_stem, split_stem, Recipe, RECIPE_SUFFIX};

/// Finds recipes and appends across the workspace and configured layers.
#[derive(Debug, Clone)]
pub struct RecipeStore {
    workspace: PathBuf,
    layers: Vec<PathBuf>,
}

impl RecipeStore {
    /// Create a store. The workspace is searched before the layers.
    pub fn new(workspace: impl AsRef<Path>, layers: &[PathBuf]) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            layers: layers.to_vec(),
        }
    }

    fn roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.workspace.join("recipes")];
        roots.extend(self.layers.iter().cloned());
        roots
    }

    /// Find all files with the given suffix under `root`, skipping VCS and
    /// download directories.
    fn find_files(root: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !root.exists() {
            return Ok(files);
        }

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !matches!(name.as_ref(), ".git" | "downloads" | "attic")
            })
        {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                DevtoolError::io(path, e.into())
            })?;
            if entry.file_type().is_file() && entry.file_name().to_string_lossy().ends_with(suffix)
            {
                files.push(entry.into_path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// All recipe files, workspace first.
    pub fn find_recipe_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for root in self.roots() {
            files.extend(Self::find_files(&root, RECIPE_SUFFIX)?);
        }
        Ok(files)
    }

    /// All append files; layer appends come before workspace appends.
    pub fn find_append_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for layer in &self.layers {
            files.extend(Self::find_files(layer, APPEND_SUFFIX)?);
        }
        files.extend(Self::find_files(&self.workspace.join("appends"), APPEND_SUFFIX)?);
        Ok(files)
    }

    /// Path of the recipe file providing `name`. Within the first root that
    /// provides it, the highest version wins.
    pub fn recipe_path(&self, name: &str) -> Result<Option<PathBuf>> {
        for root in self.roots() {
            let mut candidates: Vec<(String, PathBuf)> = Self::find_files(&root, RECIPE_SUFFIX)?
                .into_iter()
                .filter_map(|path| {
                    let (pn, pv) = split_stem(&recipe_stem(&path));
                    (pn == name).then(|| (pv.unwrap_or_default(), path))
                })
                .collect();
            candidates.sort_by(|a, b| compare_versions(&a.0, &b.0));
            if let Some((_, path)) = candidates.pop() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Parse a recipe by name with every matching append applied.
    pub fn parse_recipe(&self, name: &str) -> Result<Recipe> {
        let path = self
            .recipe_path(name)?
            .ok_or_else(|| DevtoolError::RecipeNotFound(name.to_string()))?;
        debug!("Parsing recipe {}", path.display());
        let mut recipe = Recipe::load(&path)?;

        let stem = recipe.stem();
        for append_path in self.find_append_files()? {
            match AppendFile::load(&append_path) {
                Ok(append) if append.applies_to(&stem) => {
                    debug!("Applying {}", append_path.display());
                    recipe.apply_append(&append);
                }
                Ok(_) => {}
                Err(e) => warn!("Ignoring unreadable append {}: {}", append_path.display(), e),
            }
        }

        Ok(recipe)
    }
}

/// Compare dotted versions numerically where possible.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-', '+']);
    let mut right = b.split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "layers_tests.rs"]
mod tests;
