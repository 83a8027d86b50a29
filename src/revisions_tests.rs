//! Tests for provenance parsing and revision-range resolution.

use super::*;
use crate::git::tests::{commit_files, init_repo, run_git};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_parse_and_render_provenance() {
    let text = "# initial_rev: aaaa\n# commit: bbbb\nsrcrev = \"x\"\n# commit: cccc\n";
    let provenance = Provenance::parse(text);
    assert_eq!(provenance.initial_rev.as_deref(), Some("aaaa"));
    assert_eq!(provenance.commits, vec!["bbbb", "cccc"]);
    assert_eq!(
        provenance.render(),
        "# initial_rev: aaaa\n# commit: bbbb\n# commit: cccc\n"
    );
    assert_eq!(Provenance::parse(&provenance.render()), provenance);
}

#[test]
fn test_read_missing_record() {
    let temp = TempDir::new().unwrap();
    let provenance = Provenance::read(&temp.path().join("none.append.toml")).unwrap();
    assert_eq!(provenance, Provenance::default());
}

#[test]
fn test_explicit_revision() {
    let temp = TempDir::new().unwrap();
    let revs = get_patchset_revs(temp.path(), Some("abc"), &temp.path().join("x")).unwrap();
    assert_eq!(
        revs,
        PatchsetRevs {
            initial_rev: Some("abc".to_string()),
            update_rev: Some("abc".to_string()),
            changed_revs: None,
        }
    );
}

#[test]
fn test_no_record_yields_nothing() {
    let temp = TempDir::new().unwrap();
    let record = temp.path().join("app.append.toml");
    fs::write(&record, "externalsrc = \"/src\"\n").unwrap();
    let revs = get_patchset_revs(temp.path(), None, &record).unwrap();
    assert_eq!(revs, PatchsetRevs::default());
}

struct Tree {
    _temp: TempDir,
    src: PathBuf,
    record: PathBuf,
    initial: String,
    patched: Vec<String>,
}

/// A tree with two recipe patches applied and tagged, and its record.
fn patched_tree() -> Tree {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    init_repo(&src);
    let initial = commit_files(&src, &[("main.c", "0\n")], "Initial commit");
    let p1 = commit_files(&src, &[("main.c", "1\n")], "patch one");
    let p2 = commit_files(&src, &[("other.c", "2\n")], "patch two");
    run_git(&src, &["tag", PATCHED_TAG]);

    let record = temp.path().join("app.append.toml");
    let provenance = Provenance {
        initial_rev: Some(initial.clone()),
        commits: vec![p1.clone(), p2.clone()],
    };
    fs::write(&record, provenance.render()).unwrap();

    Tree {
        src,
        record,
        initial,
        patched: vec![p1, p2],
        _temp: temp,
    }
}

#[test]
fn test_unchanged_history() {
    let tree = patched_tree();
    let revs = get_patchset_revs(&tree.src, None, &tree.record).unwrap();
    assert_eq!(revs.initial_rev, Some(tree.initial.clone()));
    assert_eq!(revs.update_rev, Some(tree.patched[1].clone()));
    assert_eq!(revs.changed_revs, Some(Vec::new()));

    // Resolving again gives the same answer.
    assert_eq!(get_patchset_revs(&tree.src, None, &tree.record).unwrap(), revs);
}

#[test]
fn test_new_commit_is_changed() {
    let tree = patched_tree();
    let new = commit_files(&tree.src, &[("new.c", "3\n")], "new work");

    let revs = get_patchset_revs(&tree.src, None, &tree.record).unwrap();
    assert_eq!(revs.update_rev, Some(tree.patched[1].clone()));
    assert_eq!(revs.changed_revs, Some(vec![new]));
}

#[test]
fn test_rewritten_history_stops_lockstep() {
    let tree = patched_tree();
    // Rewrite the second patch.
    run_git(&tree.src, &["reset", "-q", "--hard", "HEAD~1"]);
    let rewritten = commit_files(&tree.src, &[("other.c", "two\n")], "patch two, fixed");

    let revs = get_patchset_revs(&tree.src, None, &tree.record).unwrap();
    assert_eq!(revs.update_rev, Some(tree.patched[0].clone()));
    assert_eq!(revs.changed_revs, Some(vec![rewritten]));
}

#[test]
fn test_missing_tag_leaves_changes_unknown() {
    let tree = patched_tree();
    run_git(&tree.src, &["tag", "-d", PATCHED_TAG]);

    let revs = get_patchset_revs(&tree.src, None, &tree.record).unwrap();
    assert_eq!(revs.initial_rev, Some(tree.initial.clone()));
    assert_eq!(revs.changed_revs, None);
}
