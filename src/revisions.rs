//! Provenance records and revision-range resolution.
//!
//! When a recipe is checked out into the workspace, the base revision and
//! the commits present at that time are written into its workspace append
//! as comments:
//!
//! ```text
//! # initial_rev: 2c1d5d7a...
//! # commit: 8e2a3b44...
//! # commit: 41f0c9d1...
//! ```
//!
//! Comparing those commits against the current history of the source tree
//! tells `update-recipe` which patches actually need regenerating.

use std::path::Path;
use tracing::debug;

use crate::error::{IoContext, Result};
use crate::git::GitRepo;

const INITIAL_REV_PREFIX: &str = "# initial_rev:";
const COMMIT_PREFIX: &str = "# commit:";

/// Tag marking the tree state right after all recipe patches were applied.
pub const PATCHED_TAG: &str = "devtool-patched";

/// Tag marking the pristine upstream baseline commit.
pub const BASE_TAG: &str = "devtool-base";

/// Initial revision and commits recorded when a tree was set up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub initial_rev: Option<String>,
    pub commits: Vec<String>,
}

impl Provenance {
    pub fn parse(text: &str) -> Self {
        let mut provenance = Self::default();
        for line in text.lines() {
            if let Some(rev) = line.strip_prefix(INITIAL_REV_PREFIX) {
                provenance.initial_rev = Some(rev.trim().to_string());
            } else if let Some(rev) = line.strip_prefix(COMMIT_PREFIX) {
                provenance.commits.push(rev.trim().to_string());
            }
        }
        provenance
    }

    /// Read the record from a file. A missing file has no record.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).at(path)?;
        Ok(Self::parse(&text))
    }

    /// Comment lines for the record, one per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(rev) = &self.initial_rev {
            out.push_str(&format!("{} {}\n", INITIAL_REV_PREFIX, rev));
        }
        for commit in &self.commits {
            out.push_str(&format!("{} {}\n", COMMIT_PREFIX, commit));
        }
        out
    }
}

/// Where the patch set starts and which commits changed since checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchsetRevs {
    /// Start of the whole patch set.
    pub initial_rev: Option<String>,
    /// Start of the patches that need regenerating.
    pub update_rev: Option<String>,
    /// Commits not yet present when the tree was tagged. `None` when this
    /// could not be determined, in which case every patch is regenerated.
    pub changed_revs: Option<Vec<String>>,
}

/// Resolve the revision range for `srctree`, using `explicit` when given or
/// else the provenance recorded in `record_path`.
pub fn get_patchset_revs(
    srctree: &Path,
    explicit: Option<&str>,
    record_path: &Path,
) -> Result<PatchsetRevs> {
    if let Some(rev) = explicit {
        return Ok(PatchsetRevs {
            initial_rev: Some(rev.to_string()),
            update_rev: Some(rev.to_string()),
            changed_revs: None,
        });
    }

    let provenance = Provenance::read(record_path)?;
    let Some(initial_rev) = provenance.initial_rev else {
        return Ok(PatchsetRevs::default());
    };

    let repo = GitRepo::new(srctree);
    let new_commits = repo.rev_list(&initial_rev)?;

    let agreed = provenance
        .commits
        .iter()
        .zip(&new_commits)
        .take_while(|(old, new)| old == new)
        .last()
        .map(|(old, _)| old.clone());
    let update_rev = agreed.unwrap_or_else(|| initial_rev.clone());
    debug!("initial revision {}, updating from {}", initial_rev, update_rev);

    let changed_revs = repo.cherry(PATCHED_TAG).map(|revs| {
        revs.into_iter()
            .filter(|rev| new_commits.contains(rev))
            .collect::<Vec<_>>()
    });

    Ok(PatchsetRevs {
        initial_rev: Some(initial_rev),
        update_rev: Some(update_rev),
        changed_revs,
    })
}

#[cfg(test)]
#[path = "revisions_tests.rs"]
mod tests;
