//! Append (overlay) files layered on top of recipes.
//!
//! An append file is `<stem>.append.toml` where the stem matches a recipe
//! file stem, or uses `%` as a version wildcard (`zlib_%.append.toml`). It
//! can pin `srcrev`, add and remove `src_uri` entries, prepend file search
//! directories, and point a recipe at an external source tree.

use std::path::{Path, PathBuf};
use toml_edit::{value, Array, DocumentMut, Item};
use tracing::{debug, info};

use crate::error::{DevtoolError, IoContext, Result};
use crate::recipe::{multiline_array, Recipe};

/// File suffix identifying append files.
pub const APPEND_SUFFIX: &str = ".append.toml";

/// Marker that a layer directory must contain.
pub const LAYER_CONF: &str = "conf/layer.toml";

/// A parsed append file.
#[derive(Debug, Clone, Default)]
pub struct AppendFile {
    pub path: PathBuf,
    pub srcrev: Option<String>,
    pub src_uri_append: Vec<String>,
    pub src_uri_remove: Vec<String>,
    pub files_extra_paths: Vec<String>,
    pub externalsrc: Option<PathBuf>,
    pub externalsrc_build: Option<PathBuf>,
    pub local_files_dir: Option<PathBuf>,
}

impl AppendFile {
    /// Load an append file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).at(path)?;
        let doc: DocumentMut = content.parse().map_err(|e: toml_edit::TomlError| {
            DevtoolError::Recipe {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        let string = |key: &str| doc.get(key).and_then(Item::as_str).map(str::to_string);
        let list = |key: &str| {
            doc.get(key)
                .and_then(Item::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            srcrev: string("srcrev"),
            src_uri_append: list("src_uri_append"),
            src_uri_remove: list("src_uri_remove"),
            files_extra_paths: list("files_extra_paths"),
            externalsrc: string("externalsrc").map(PathBuf::from),
            externalsrc_build: string("externalsrc_build").map(PathBuf::from),
            local_files_dir: string("local_files_dir").map(PathBuf::from),
        })
    }

    /// Stem of the append file, e.g. `zlib_%`.
    pub fn stem(&self) -> String {
        append_stem(&self.path)
    }

    /// Whether this append applies to a recipe with the given stem.
    pub fn applies_to(&self, recipe_stem: &str) -> bool {
        stem_matches(&self.stem(), recipe_stem)
    }
}

/// Strip the append suffix from a file name.
pub fn append_stem(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .strip_suffix(APPEND_SUFFIX)
        .unwrap_or(&file_name)
        .to_string()
}

/// `%` in an append stem matches any remainder of the recipe stem.
pub fn stem_matches(append_stem: &str, recipe_stem: &str) -> bool {
    match append_stem.split_once('%') {
        Some((prefix, _)) => recipe_stem.starts_with(prefix),
        None => append_stem == recipe_stem,
    }
}

/// Append name for a recipe stem, optionally with the version wildcarded.
pub fn append_name(recipe_stem: &str, wildcard_version: bool) -> String {
    let stem = match (wildcard_version, recipe_stem.split_once('_')) {
        (true, Some((pn, _))) => format!("{}_%", pn),
        _ => recipe_stem.to_string(),
    };
    format!("{}{}", stem, APPEND_SUFFIX)
}

/// Fail unless `layer` looks like a layer directory.
pub fn check_append_layer(layer: &Path) -> Result<()> {
    if !layer.exists() {
        return Err(DevtoolError::InvalidArgument(format!(
            "append destination layer directory \"{}\" does not exist",
            layer.display()
        )));
    }
    if !layer.join(LAYER_CONF).exists() {
        return Err(DevtoolError::InvalidArgument(format!(
            "{} not found in append destination layer \"{}\"",
            LAYER_CONF,
            layer.display()
        )));
    }
    Ok(())
}

/// A file to install through an append.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    /// Where the new content currently lives.
    pub source: PathBuf,
    /// Name relative to the file search path.
    pub name: String,
    /// Existing recipe-space path, if the recipe already declares it.
    pub existing: Option<PathBuf>,
}

/// Options for [`append_recipe`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    pub wildcard_version: bool,
    pub srcrev: Option<String>,
    pub src_uri_remove: Vec<String>,
}

/// Write or extend an append for `recipe` in `layer`.
///
/// Returns the path of the append file and the directory files were
/// installed into.
pub fn append_recipe(
    recipe: &Recipe,
    layer: &Path,
    files: &[AppendEntry],
    options: &AppendOptions,
) -> Result<(PathBuf, PathBuf)> {
    let append_dir = layer.join("recipes").join(&recipe.name);
    let append_path = append_dir.join(append_name(&recipe.stem(), options.wildcard_version));
    let files_dir = append_dir.join(&recipe.name);

    std::fs::create_dir_all(&append_dir).at(&append_dir)?;

    let mut doc: DocumentMut = if append_path.exists() {
        let content = std::fs::read_to_string(&append_path).at(&append_path)?;
        content.parse().map_err(|e: toml_edit::TomlError| DevtoolError::Recipe {
            path: append_path.clone(),
            message: e.to_string(),
        })?
    } else {
        DocumentMut::new()
    };

    if !files.is_empty() {
        std::fs::create_dir_all(&files_dir).at(&files_dir)?;
        push_unique(&mut doc, "files_extra_paths", &[recipe.name.clone()]);

        let mut new_entries = Vec::new();
        for entry in files {
            let dest = files_dir.join(&entry.name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            debug!("Installing {} into {}", entry.name, files_dir.display());
            std::fs::copy(&entry.source, &dest).at(&entry.source)?;
            if entry.existing.is_none() {
                new_entries.push(format!("file://{}", entry.name));
            }
        }
        push_unique(&mut doc, "src_uri_append", &new_entries);
    }

    if let Some(srcrev) = &options.srcrev {
        doc["srcrev"] = value(srcrev.as_str());
    }

    if !options.src_uri_remove.is_empty() {
        push_unique(&mut doc, "src_uri_remove", &options.src_uri_remove);
    }

    std::fs::write(&append_path, doc.to_string()).at(&append_path)?;
    info!("Writing append file {}", append_path.display());

    Ok((append_path, files_dir))
}

fn push_unique(doc: &mut DocumentMut, key: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    let mut current: Vec<String> = doc
        .get(key)
        .and_then(Item::as_array)
        .map(|arr: &Array| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    for entry in entries {
        if !current.contains(entry) {
            current.push(entry.clone());
        }
    }
    doc[key] = value(multiline_array(&current));
}

#[cfg(test)]
#[path = "append_tests.rs"]
mod tests;
