//! Recipe file parsing and manipulation utilities.
//!
//! A recipe is a TOML file named `<pn>_<pv>.recipe.toml` (or
//! `<pn>.recipe.toml`) with a `[recipe]` table and an optional `[tasks]`
//! table. Edits go through `toml_edit` so comments and layout survive.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use toml_edit::{value, Array, DocumentMut, Item, Table, Value};

use crate::append::AppendFile;
use crate::error::{DevtoolError, IoContext, Result};

/// File suffix identifying recipe files.
pub const RECIPE_SUFFIX: &str = ".recipe.toml";

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid variable regex"));

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar.zst", ".zip",
];

const PATCH_SUFFIXES: &[&str] = &[".patch", ".diff"];
const COMPRESSION_SUFFIXES: &[&str] = &["", ".gz", ".bz2", ".xz", ".Z"];

/// One entry of a recipe's `src_uri` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcUri {
    raw: String,
    pub scheme: String,
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl FromStr for SrcUri {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.trim();
        let (location, params) = match raw.split_once(';') {
            Some((location, rest)) => (location, rest),
            None => (raw, ""),
        };
        let (scheme, path) = location
            .split_once("://")
            .ok_or_else(|| format!("Malformed source reference '{}'", raw))?;
        if scheme.is_empty() || path.is_empty() {
            return Err(format!("Malformed source reference '{}'", raw));
        }

        let params = params
            .split(';')
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (p.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            raw: raw.to_string(),
            scheme: scheme.to_string(),
            path: path.to_string(),
            params,
        })
    }
}

impl fmt::Display for SrcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl SrcUri {
    /// Reference to a local file by its path relative to the file search path.
    pub fn local(path: &str) -> Self {
        Self {
            raw: format!("file://{}", path),
            scheme: "file".to_string(),
            path: path.to_string(),
            params: Vec::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Identity key of the reference: the last path component.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_local(&self) -> bool {
        self.scheme == "file"
    }

    pub fn is_git(&self) -> bool {
        self.scheme == "git"
    }

    pub fn is_archive(&self) -> bool {
        ARCHIVE_SUFFIXES.iter().any(|s| self.path.ends_with(s))
    }

    /// Whether the reference is applied as a patch rather than unpacked.
    pub fn is_patch(&self) -> bool {
        if !self.is_local() {
            return false;
        }
        match self.param("apply") {
            Some("no") => false,
            Some("yes") => true,
            _ => PATCH_SUFFIXES.iter().any(|p| {
                COMPRESSION_SUFFIXES
                    .iter()
                    .any(|c| self.path.ends_with(&format!("{}{}", p, c)))
            }),
        }
    }

    /// Local reference installed verbatim into the source tree.
    pub fn is_local_file(&self) -> bool {
        self.is_local() && !self.is_patch() && !self.is_archive() && !self.path.starts_with('/')
    }

    /// Strip level for patch application (`striplevel` parameter, default 1).
    pub fn striplevel(&self) -> u32 {
        self.param("striplevel")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }
}

/// A task declared in a recipe's `[tasks]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDef {
    pub run: Option<String>,
    pub deps: Vec<String>,
    pub noexec: bool,
}

/// A parsed recipe with its appends applied.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub inherit: Vec<String>,
    pub src_uri: Vec<SrcUri>,
    pub srcrev: Option<String>,
    pub s: Option<String>,
    pub b: Option<String>,
    pub tasks: BTreeMap<String, TaskDef>,
    /// Fields of `[recipe]` that have no dedicated meaning, in file order.
    pub extra: Vec<(String, String)>,
    /// Directories searched before the recipe's own file directories.
    pub files_extra_paths: Vec<PathBuf>,
    pub externalsrc: Option<PathBuf>,
    pub externalsrc_build: Option<PathBuf>,
    pub appends: Vec<PathBuf>,
    document: DocumentMut,
}

/// Fields rewritten by [`Recipe::patch_recipe`].
#[derive(Debug, Clone, Default)]
pub struct RecipeEdit {
    pub src_uri: Option<Vec<String>>,
    pub srcrev: Option<String>,
}

impl Recipe {
    /// Load a recipe file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).at(path)?;
        let document: DocumentMut = content.parse().map_err(|e: toml_edit::TomlError| {
            DevtoolError::Recipe {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        let bad = |message: String| DevtoolError::Recipe {
            path: path.to_path_buf(),
            message,
        };

        let table = document
            .get("recipe")
            .and_then(Item::as_table)
            .ok_or_else(|| bad("missing [recipe] table".to_string()))?;

        let (stem_name, stem_version) = split_stem(&recipe_stem(path));
        let name = match table.get("name") {
            Some(item) => item
                .as_str()
                .ok_or_else(|| bad("recipe.name must be a string".to_string()))?
                .to_string(),
            None => stem_name,
        };
        let version = table
            .get("version")
            .and_then(Item::as_str)
            .map(str::to_string)
            .or(stem_version)
            .unwrap_or_else(|| "1.0".to_string());

        let src_uri = match table.get("src_uri") {
            None => Vec::new(),
            Some(item) => string_list(item)
                .ok_or_else(|| bad("recipe.src_uri must be a list of strings".to_string()))?
                .iter()
                .map(|s| s.parse::<SrcUri>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(bad)?,
        };

        let inherit = table.get("inherit").and_then(string_list).unwrap_or_default();

        let mut extra = Vec::new();
        for (key, item) in table.iter() {
            if matches!(
                key,
                "name" | "version" | "inherit" | "src_uri" | "srcrev" | "s" | "b"
            ) {
                continue;
            }
            let rendered = match item.as_str() {
                Some(s) => s.to_string(),
                None => item.to_string().trim().to_string(),
            };
            extra.push((key.to_string(), rendered));
        }

        let srcrev = table.get("srcrev").and_then(Item::as_str).map(str::to_string);
        let s = table.get("s").and_then(Item::as_str).map(str::to_string);
        let b = table.get("b").and_then(Item::as_str).map(str::to_string);

        let mut tasks = BTreeMap::new();
        if let Some(Item::Table(task_table)) = document.get("tasks") {
            for (task, item) in task_table.iter() {
                tasks.insert(task.to_string(), Self::parse_task(item));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            name,
            version,
            inherit,
            src_uri,
            srcrev,
            s,
            b,
            tasks,
            extra,
            files_extra_paths: Vec::new(),
            externalsrc: None,
            externalsrc_build: None,
            appends: Vec::new(),
            document,
        })
    }

    fn parse_task(item: &Item) -> TaskDef {
        TaskDef {
            run: item.get("run").and_then(Item::as_str).map(str::to_string),
            deps: item.get("deps").and_then(string_list).unwrap_or_default(),
            noexec: item.get("noexec").and_then(Item::as_bool).unwrap_or(false),
        }
    }

    /// Apply an append file on top of the recipe.
    pub fn apply_append(&mut self, append: &AppendFile) {
        let append_dir = append.path.parent().unwrap_or(Path::new("."));
        for extra in append.files_extra_paths.iter().rev() {
            self.files_extra_paths.insert(0, append_dir.join(extra));
        }
        if let Some(srcrev) = &append.srcrev {
            self.srcrev = Some(srcrev.clone());
        }
        self.src_uri.retain(|uri| {
            !append
                .src_uri_remove
                .iter()
                .any(|r| r == uri.as_str() || r == &format!("file://{}", uri.path))
        });
        for entry in &append.src_uri_append {
            if let Ok(uri) = entry.parse::<SrcUri>() {
                if !self.src_uri.contains(&uri) {
                    self.src_uri.push(uri);
                }
            }
        }
        if append.externalsrc.is_some() {
            self.externalsrc = append.externalsrc.clone();
            self.externalsrc_build = append.externalsrc_build.clone();
            if !self.inherits("externalsrc") {
                self.inherit.push("externalsrc".to_string());
            }
        }
        self.appends.push(append.path.clone());
    }

    /// File name without the recipe suffix, e.g. `zlib_1.2.8`.
    pub fn stem(&self) -> String {
        recipe_stem(&self.path)
    }

    /// Base package name with variant prefixes and suffixes removed.
    pub fn bpn(&self) -> String {
        let mut bpn = self.name.as_str();
        for suffix in ["-native", "-cross", "-crosssdk"] {
            bpn = bpn.strip_suffix(suffix).unwrap_or(bpn);
        }
        for prefix in ["nativesdk-"] {
            bpn = bpn.strip_prefix(prefix).unwrap_or(bpn);
        }
        bpn.to_string()
    }

    pub fn bp(&self) -> String {
        format!("{}-{}", self.bpn(), self.version)
    }

    pub fn recipe_dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Directory new recipe-space files are written to.
    pub fn files_dir(&self) -> PathBuf {
        self.recipe_dir().join(self.bpn())
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.inherit.iter().any(|c| c == class)
    }

    /// Expand `${VAR}` references. Unknown variables are left untouched.
    pub fn expand(&self, template: &str, workdir: &Path) -> String {
        VAR_RE
            .replace_all(template, |caps: &Captures| {
                let var = &caps[1];
                match var {
                    "WORKDIR" => workdir.display().to_string(),
                    "PN" => self.name.clone(),
                    "PV" => self.version.clone(),
                    "BPN" => self.bpn(),
                    "BP" => self.bp(),
                    _ => self
                        .extra
                        .iter()
                        .find(|(k, _)| k == var)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_else(|| caps[0].to_string()),
                }
            })
            .into_owned()
    }

    /// Source directory (`S`) for a given work directory.
    pub fn source_dir(&self, workdir: &Path) -> PathBuf {
        match &self.s {
            Some(s) => PathBuf::from(self.expand(s, workdir)),
            None if self.inherits("kernel") => workdir.join("source"),
            None => workdir.join(self.bp()),
        }
    }

    /// Directories searched for `file://` references, most specific first.
    pub fn files_search_path(&self) -> Vec<PathBuf> {
        let dir = self.recipe_dir();
        let mut paths = self.files_extra_paths.clone();
        paths.push(dir.join(format!("{}-{}", self.bpn(), self.version)));
        paths.push(dir.join(self.bpn()));
        paths.push(dir.join("files"));
        paths
    }

    /// Resolve a local reference to its recipe-space path.
    pub fn resolve_local(&self, uri: &SrcUri) -> Option<PathBuf> {
        if uri.path.starts_with('/') {
            let path = PathBuf::from(&uri.path);
            return path.exists().then_some(path);
        }
        self.files_search_path()
            .into_iter()
            .map(|dir| dir.join(&uri.path))
            .find(|p| p.exists())
    }

    /// Declared local files keyed by their path relative to the search path.
    pub fn local_files(&self) -> BTreeMap<String, PathBuf> {
        self.src_uri
            .iter()
            .filter(|uri| uri.is_local_file())
            .map(|uri| {
                let path = self
                    .resolve_local(uri)
                    .unwrap_or_else(|| self.files_dir().join(&uri.path));
                (uri.path.clone(), path)
            })
            .collect()
    }

    /// Declared patches in application order, with their recipe-space paths.
    pub fn patches(&self) -> Vec<(SrcUri, PathBuf)> {
        self.src_uri
            .iter()
            .filter(|uri| uri.is_patch())
            .map(|uri| {
                let path = self
                    .resolve_local(uri)
                    .unwrap_or_else(|| self.files_dir().join(&uri.path));
                (uri.clone(), path)
            })
            .collect()
    }

    /// Fail for recipes whose source cannot be extracted by devtool.
    pub fn check_compatible(&self) -> Result<()> {
        let pn = self.name.as_str();
        let reject = |msg: String| Err(DevtoolError::UnsupportedRecipe(msg));

        if pn == "perf" {
            return reject(
                "The perf recipe does not actually check out source and thus cannot be \
                 supported by this tool"
                    .to_string(),
            );
        }
        if pn == "kernel-devsrc" || pn == "package-index" || pn.starts_with("gcc-source") {
            return reject(format!("The {} recipe is not supported by this tool", pn));
        }
        for (class, what) in [
            ("image", "an image"),
            ("populate_sdk", "an SDK"),
            ("packagegroup", "a packagegroup"),
            ("meta", "a meta-recipe"),
        ] {
            if self.inherits(class) {
                return reject(format!(
                    "The {} recipe is {}, and therefore is not supported by this tool",
                    pn, what
                ));
            }
        }
        if self.inherits("externalsrc") && self.externalsrc.is_some() {
            return reject(format!(
                "externalsrc is currently enabled for the {} recipe. This prevents the \
                 normal do_patch task from working. You will need to disable this first.",
                pn
            ));
        }
        Ok(())
    }

    /// Rewrite fields in the recipe file on disk.
    pub fn patch_recipe(&mut self, edit: &RecipeEdit) -> Result<()> {
        let table = self
            .document
            .get_mut("recipe")
            .and_then(Item::as_table_mut)
            .ok_or_else(|| DevtoolError::Recipe {
                path: self.path.clone(),
                message: "missing [recipe] table".to_string(),
            })?;

        if let Some(srcrev) = &edit.srcrev {
            table["srcrev"] = value(srcrev.as_str());
            self.srcrev = Some(srcrev.clone());
        }
        if let Some(entries) = &edit.src_uri {
            table["src_uri"] = value(multiline_array(entries));
            self.src_uri = entries.iter().filter_map(|e| e.parse().ok()).collect();
        }

        self.save()
    }

    /// Save the recipe back to disk.
    pub fn save(&self) -> Result<()> {
        std::fs::write(&self.path, self.document.to_string()).at(&self.path)
    }

    /// Render a new minimal recipe document.
    pub fn render_new(name: &str, version: &str, src_uri: &[String], srcrev: Option<&str>) -> String {
        let mut doc = DocumentMut::new();
        let mut table = Table::new();
        table.insert("name", value(name));
        table.insert("version", value(version));
        table.insert("src_uri", value(multiline_array(src_uri)));
        if let Some(rev) = srcrev {
            table.insert("srcrev", value(rev));
        }
        doc.insert("recipe", Item::Table(table));
        doc.to_string()
    }
}

/// Strip the recipe suffix from a file name.
pub fn recipe_stem(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .strip_suffix(RECIPE_SUFFIX)
        .unwrap_or(&file_name)
        .to_string()
}

/// Split `pn_pv` into name and optional version.
pub fn split_stem(stem: &str) -> (String, Option<String>) {
    match stem.split_once('_') {
        Some((pn, pv)) => (pn.to_string(), Some(pv.to_string())),
        None => (stem.to_string(), None),
    }
}

fn string_list(item: &Item) -> Option<Vec<String>> {
    if let Some(s) = item.as_str() {
        return Some(s.split_whitespace().map(str::to_string).collect());
    }
    item.as_array().map(|arr| {
        arr.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

/// Build an array with one entry per line.
pub(crate) fn multiline_array(entries: &[String]) -> Array {
    let mut array = Array::new();
    for entry in entries {
        let mut v = Value::from(entry.as_str());
        v.decor_mut().set_prefix("\n    ");
        array.push_formatted(v);
    }
    array.set_trailing_comma(!entries.is_empty());
    array.set_trailing(if entries.is_empty() { "" } else { "\n" });
    array
}

#[cfg(test)]
#[path = "recipe_tests.rs"]
mod tests;
