//! Tests for local file and patch reconciliation.

use super::*;
use crate::git::tests::{commit_files, init_repo, run_git};
use std::fs;
use tempfile::TempDir;

/// Recipe declaring `entries` in `src_uri`, with matching files created in
/// its files directory.
fn recipe_with(root: &Path, entries: &[&str]) -> Recipe {
    let dir = root.join("meta/recipes/app");
    let files = dir.join("app");
    fs::create_dir_all(&files).unwrap();
    for entry in entries {
        let path = files.join(entry);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "old\n").unwrap();
    }
    let src_uri: Vec<String> = entries.iter().map(|e| format!("\"file://{}\"", e)).collect();
    let path = dir.join("app_1.0.recipe.toml");
    fs::write(&path, format!("[recipe]\nsrc_uri = [{}]\n", src_uri.join(", "))).unwrap();
    Recipe::load(&path).unwrap()
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_patch_identity() {
    assert_eq!(patch_identity("0001-fix.patch"), "fix.patch");
    assert_eq!(patch_identity("fix.patch"), "fix.patch");
    assert_eq!(patch_identity("123-fix.patch"), "123-fix.patch");
    assert_eq!(patch_identity("0005-0001-odd.patch"), "0001-odd.patch");
}

#[test]
fn test_classify_is_disjoint() {
    let declared: BTreeMap<String, PathBuf> = [
        ("a.conf".to_string(), PathBuf::from("/r/a.conf")),
        ("b.conf".to_string(), PathBuf::from("/r/b.conf")),
    ]
    .into_iter()
    .collect();
    let current = vec!["a.conf".to_string(), "c.conf".to_string(), ".gitignore".to_string()];

    let result = Reconciliation::classify(declared, current.clone());
    assert_eq!(result.updated.keys().collect::<Vec<_>>(), vec!["a.conf"]);
    assert_eq!(result.added.iter().collect::<Vec<_>>(), vec!["c.conf"]);
    assert_eq!(result.removed.keys().collect::<Vec<_>>(), vec!["b.conf"]);

    for key in result.updated.keys() {
        assert!(!result.added.contains(key));
        assert!(!result.removed.contains_key(key));
    }
    for name in current.iter().filter(|n| *n != ".gitignore") {
        assert!(result.updated.contains_key(name) || result.added.contains(name));
    }
}

#[test]
fn test_export_patches_matches_by_identity() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["0005-fix.patch", "0007-other.patch"]);

    let src = temp.path().join("src");
    init_repo(&src);
    let base = commit_files(&src, &[("main.c", "int main;\n")], "Initial commit");
    commit_files(&src, &[("main.c", "int main(void);\n")], "fix");
    commit_files(&src, &[("feature.c", "void f(void);\n")], "feature");

    let dest = temp.path().join("patches");
    let result = export_patches(&src, &recipe, &base, &dest).unwrap();

    assert_eq!(
        result.updated,
        [(
            "0005-fix.patch".to_string(),
            recipe.recipe_dir().join("app/0005-fix.patch")
        )]
        .into_iter()
        .collect::<BTreeMap<_, _>>()
    );
    assert_eq!(
        result.added.iter().cloned().collect::<Vec<_>>(),
        vec!["0002-feature.patch"]
    );
    assert_eq!(
        result.removed.keys().cloned().collect::<Vec<_>>(),
        vec!["0007-other.patch"]
    );
    assert_eq!(dir_names(&dest), vec!["0002-feature.patch", "0005-fix.patch"]);
}

#[test]
fn test_export_patches_ignores_renumbering() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["0001-first.patch", "0002-second.patch"]);

    let src = temp.path().join("src");
    init_repo(&src);
    commit_files(&src, &[("main.c", "0\n")], "Initial commit");
    let start = commit_files(&src, &[("main.c", "1\n")], "first");
    commit_files(&src, &[("main.c", "2\n")], "second");

    // Starting one commit later numbers "second" as 0001.
    let dest = temp.path().join("patches");
    let result = export_patches(&src, &recipe, &start, &dest).unwrap();
    assert_eq!(
        result.updated.keys().cloned().collect::<Vec<_>>(),
        vec!["0002-second.patch"]
    );
    assert!(result.added.is_empty());
    assert_eq!(
        result.removed.keys().cloned().collect::<Vec<_>>(),
        vec!["0001-first.patch"]
    );
}

#[test]
fn test_export_patches_same_subject_keeps_both() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["0002-fix.patch"]);

    let src = temp.path().join("src");
    init_repo(&src);
    let base = commit_files(&src, &[("main.c", "0\n")], "Initial commit");
    commit_files(&src, &[("a.c", "a\n")], "fix");
    commit_files(&src, &[("b.c", "b\n")], "fix");

    let dest = temp.path().join("patches");
    let result = export_patches(&src, &recipe, &base, &dest).unwrap();

    assert_eq!(
        result.updated.keys().cloned().collect::<Vec<_>>(),
        vec!["0002-fix.patch"]
    );
    assert_eq!(result.added.iter().cloned().collect::<Vec<_>>(), vec!["0001-fix.patch"]);
    for key in result.updated.keys() {
        assert!(!result.added.contains(key));
    }
    assert_eq!(dir_names(&dest), vec!["0001-fix.patch", "0002-fix.patch"]);

    let bodies: Vec<String> = dir_names(&dest)
        .iter()
        .map(|name| fs::read_to_string(dest.join(name)).unwrap())
        .collect();
    assert!(bodies.iter().any(|b| b.contains("+++ b/a.c")));
    assert!(bodies.iter().any(|b| b.contains("+++ b/b.c")));
}

#[test]
fn test_export_patches_restores_original_names() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["fix-build.patch"]);

    let src = temp.path().join("src");
    init_repo(&src);
    let base = commit_files(&src, &[("main.c", "0\n")], "Initial commit");
    fs::write(src.join("main.c"), "1\n").unwrap();
    run_git(&src, &["add", "-A"]);
    run_git(
        &src,
        &[
            "commit",
            "-q",
            "-m",
            "Make the build work\n\n%% original patch: fix-build.patch",
        ],
    );

    let dest = temp.path().join("patches");
    let result = export_patches(&src, &recipe, &base, &dest).unwrap();
    assert_eq!(
        result.updated.keys().cloned().collect::<Vec<_>>(),
        vec!["fix-build.patch"]
    );
    assert!(result.added.is_empty() && result.removed.is_empty());
    assert_eq!(dir_names(&dest), vec!["fix-build.patch"]);

    let content = fs::read_to_string(dest.join("fix-build.patch")).unwrap();
    assert!(!content.contains("%% original patch"));
    assert!(content.contains("Subject: [PATCH] Make the build work"));
}

#[test]
fn test_strip_marker() {
    let patch = b"From abc\nSubject: [PATCH] x\n\nbody\n\n%% original patch: a.patch\n---\n a | 1 +\n";
    let (name, out) = strip_marker(patch).unwrap();
    assert_eq!(name, "a.patch");
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "From abc\nSubject: [PATCH] x\n\nbody\n---\n a | 1 +\n"
    );

    // Marker text inside the diff is content, not metadata.
    let patch = b"Subject: x\n---\n+%% original patch: b.patch\n";
    assert!(strip_marker(patch).is_none());
}

#[test]
fn test_export_local_files_untracked() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["app.conf", "init/app.init", "gone.conf"]);

    let src = temp.path().join("src");
    init_repo(&src);
    commit_files(&src, &[("main.c", "0\n")], "Initial commit");
    let local = src.join(LOCAL_FILES_DIR);
    fs::create_dir_all(local.join("init")).unwrap();
    fs::write(local.join(".gitignore"), "*\n").unwrap();
    fs::write(local.join("app.conf"), "new\n").unwrap();
    fs::write(local.join("init/app.init"), "init\n").unwrap();
    fs::write(local.join("extra.conf"), "extra\n").unwrap();

    let dest = temp.path().join("local");
    fs::create_dir_all(&dest).unwrap();
    let result = export_local_files(&src, &recipe, &dest).unwrap();

    assert_eq!(
        result.updated.keys().cloned().collect::<Vec<_>>(),
        vec!["app.conf", "init/app.init"]
    );
    assert_eq!(
        result.added.iter().cloned().collect::<Vec<_>>(),
        vec!["extra.conf"]
    );
    assert_eq!(
        result.removed.keys().cloned().collect::<Vec<_>>(),
        vec!["gone.conf"]
    );
    assert_eq!(fs::read_to_string(dest.join("app.conf")).unwrap(), "new\n");
    assert!(dest.join("init/app.init").exists());
}

#[test]
fn test_export_local_files_only_gitignore() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &[]);

    let src = temp.path().join("src");
    init_repo(&src);
    commit_files(&src, &[("main.c", "0\n")], "Initial commit");
    fs::create_dir_all(src.join(LOCAL_FILES_DIR)).unwrap();
    fs::write(src.join(LOCAL_FILES_DIR).join(".gitignore"), "*\n").unwrap();

    let dest = temp.path().join("local");
    fs::create_dir_all(&dest).unwrap();
    let result = export_local_files(&src, &recipe, &dest).unwrap();
    assert!(result.is_empty());
}

#[test]
fn test_export_local_files_tracked_uses_head() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["app.conf"]);

    let src = temp.path().join("src");
    init_repo(&src);
    commit_files(
        &src,
        &[("main.c", "0\n"), ("oe-local-files/app.conf", "committed\n")],
        "Initial commit",
    );
    fs::write(src.join("oe-local-files/app.conf"), "uncommitted\n").unwrap();

    let dest = temp.path().join("local");
    fs::create_dir_all(&dest).unwrap();
    let result = export_local_files(&src, &recipe, &dest).unwrap();
    assert_eq!(
        result.updated.keys().cloned().collect::<Vec<_>>(),
        vec!["app.conf"]
    );
    assert_eq!(
        fs::read_to_string(dest.join("app.conf")).unwrap(),
        "committed\n"
    );
}

#[test]
fn test_export_local_files_without_directory() {
    let temp = TempDir::new().unwrap();
    let recipe = recipe_with(temp.path(), &["app.conf"]);
    let src = temp.path().join("src");
    init_repo(&src);
    commit_files(&src, &[("main.c", "0\n")], "Initial commit");

    let result = export_local_files(&src, &recipe, &temp.path().join("local")).unwrap();
    assert!(result.is_empty());
}
