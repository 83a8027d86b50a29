use super::*;
use crate::extract::tests::{git_fixture, write_config, Fixture, FIXTURE_PATCH};
use crate::git::tests::{commit_files, init_repo, run_git};
use crate::update::UpdateMode;
use crate::workspace::SUMS_FILE;
use std::fs;
use tempfile::TempDir;

fn modify_args(name: &str, srctree: PathBuf) -> ModifyArgs {
    ModifyArgs {
        name: name.to_string(),
        srctree,
        extract: true,
        branch: "devtool".to_string(),
        wildcard: false,
        same_dir: false,
        no_same_dir: false,
    }
}

fn modified(fx: &Fixture) -> (Context, PathBuf) {
    let ctx = Context::new(fx.config.clone());
    let srctree = fx.base().join("src/app");
    assert_eq!(modify(&ctx, &modify_args("app", srctree.clone())).unwrap(), 0);
    (ctx, srctree)
}

fn recipe_with(dir: &Path, body: &str) -> Recipe {
    let path = dir.join("lib_1.0.recipe.toml");
    fs::write(&path, format!("[recipe]\n{}", body)).unwrap();
    Recipe::load(&path).unwrap()
}

#[test]
fn test_use_external_build() {
    let temp = TempDir::new().unwrap();

    let plain = recipe_with(temp.path(), "");
    assert!(use_external_build(false, false, &plain));
    assert!(!use_external_build(true, true, &plain));

    let separate = recipe_with(temp.path(), "b = \"${WORKDIR}/build\"\n");
    assert!(!use_external_build(false, false, &separate));
    assert!(use_external_build(true, false, &separate));

    let same = recipe_with(temp.path(), "b = \"${S}\"\n");
    assert!(use_external_build(false, false, &same));

    let brokensep = recipe_with(
        temp.path(),
        "b = \"${WORKDIR}/build\"\ninherit = [\"autotools-brokensep\"]\n",
    );
    assert!(use_external_build(false, false, &brokensep));
}

#[test]
fn test_modify_extract_sets_up_workspace() {
    let fx = git_fixture();
    let (ctx, srctree) = modified(&fx);

    let entries = ctx.workspace.entries().unwrap();
    let entry = &entries["app"];
    assert_eq!(entry.srctree, srctree);
    assert_eq!(
        entry.append,
        fx.config.workspace_path.join("appends/app_1.0.append.toml")
    );

    let provenance = Provenance::read(&entry.append).unwrap();
    let repo = GitRepo::new(&srctree);
    assert_eq!(provenance.initial_rev.as_deref(), Some(fx.upstream_rev.as_str()));
    assert_eq!(provenance.commits, vec![repo.head_rev().unwrap()]);

    let append = fs::read_to_string(&entry.append).unwrap();
    assert!(append.contains("local_files_dir"));
    assert!(append.contains("externalsrc_build"));

    let sums = fs::read_to_string(fx.config.workspace_path.join(SUMS_FILE)).unwrap();
    assert!(sums.starts_with("app|appends/app_1.0.append.toml|"));

    // The recipe now builds from the tree.
    let recipe = fx.recipe();
    assert_eq!(recipe.externalsrc.as_deref(), Some(srctree.as_path()));
    assert!(recipe.check_compatible().is_err());
}

#[test]
fn test_modify_rejects_recipe_already_in_workspace() {
    let fx = git_fixture();
    let (ctx, _) = modified(&fx);
    let err = modify(&ctx, &modify_args("app", fx.base().join("other"))).unwrap_err();
    assert!(matches!(err, DevtoolError::AlreadyInWorkspace(name) if name == "app"));
}

#[test]
fn test_modify_requires_existing_tree_without_extract() {
    let fx = git_fixture();
    let ctx = Context::new(fx.config.clone());
    let mut args = modify_args("app", fx.base().join("missing"));
    args.extract = false;
    let err = modify(&ctx, &args).unwrap_err();
    assert!(err.to_string().contains("specify -x to extract source from recipe"));
}

#[test]
fn test_modify_existing_tree_uses_base_tag() {
    let fx = git_fixture();
    let srctree = fx.base().join("src/app");
    extract_source(
        &fx.recipe(),
        &srctree,
        &ShellBuildSystem,
        &fx.config,
        &ExtractOptions::default(),
    )
    .unwrap();

    let ctx = Context::new(fx.config.clone());
    let mut args = modify_args("app", srctree.clone());
    args.extract = false;
    args.no_same_dir = true;
    modify(&ctx, &args).unwrap();

    let entry = ctx.workspace.entry("app").unwrap();
    let provenance = Provenance::read(&entry.append).unwrap();
    assert_eq!(provenance.initial_rev.as_deref(), Some(fx.upstream_rev.as_str()));
    assert!(provenance.commits.is_empty());
    assert!(!fs::read_to_string(&entry.append)
        .unwrap()
        .contains("externalsrc_build"));
}

#[test]
fn test_modify_plain_directory_has_no_revision() {
    let fx = git_fixture();
    let srctree = fx.base().join("plain");
    fs::create_dir_all(&srctree).unwrap();

    let ctx = Context::new(fx.config.clone());
    let mut args = modify_args("app", srctree);
    args.extract = false;
    modify(&ctx, &args).unwrap();

    let entry = ctx.workspace.entry("app").unwrap();
    assert_eq!(Provenance::read(&entry.append).unwrap(), Provenance::default());
}

#[test]
fn test_update_recipe_after_modify_is_a_no_op() {
    let fx = git_fixture();
    let (ctx, _) = modified(&fx);
    let before = fs::read_to_string(&fx.recipe_path).unwrap();

    let args = UpdateArgs {
        recipe: "app".to_string(),
        ..UpdateArgs::default()
    };
    assert_eq!(update_recipe(&ctx, &args).unwrap(), 0);
    assert_eq!(fs::read_to_string(&fx.recipe_path).unwrap(), before);
    assert!(fx.files_dir().join(FIXTURE_PATCH).exists());
}

#[test]
fn test_update_recipe_records_new_commit() {
    let fx = git_fixture();
    let (ctx, srctree) = modified(&fx);
    commit_files(&srctree, &[("util.c", "int util;\n")], "Add util");

    let args = UpdateArgs {
        recipe: "app".to_string(),
        mode: UpdateMode::Patch,
        ..UpdateArgs::default()
    };
    update_recipe(&ctx, &args).unwrap();
    assert!(fx.files_dir().join("0001-Add-util.patch").exists());
    assert!(fs::read_to_string(&fx.recipe_path)
        .unwrap()
        .contains("file://0001-Add-util.patch"));
}

#[test]
fn test_update_recipe_requires_workspace_entry() {
    let fx = git_fixture();
    let ctx = Context::new(fx.config.clone());
    let args = UpdateArgs {
        recipe: "app".to_string(),
        ..UpdateArgs::default()
    };
    let err = update_recipe(&ctx, &args).unwrap_err();
    assert!(matches!(err, DevtoolError::NotInWorkspace(_)));
}

#[test]
fn test_add_existing_tree() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());
    let srctree = temp.path().join("src/hello");
    fs::create_dir_all(&srctree).unwrap();
    fs::write(srctree.join("hello.c"), "int main;\n").unwrap();

    let ctx = Context::new(config.clone());
    let args = AddArgs {
        name: "hello".to_string(),
        srctree: srctree.clone(),
        version: Some("2.1".to_string()),
        ..AddArgs::default()
    };
    assert_eq!(add(&ctx, &args).unwrap(), 0);

    let recipefile = config
        .workspace_path
        .join("recipes/hello/hello_2.1.recipe.toml");
    let recipe = Recipe::load(&recipefile).unwrap();
    assert_eq!(recipe.version, "2.1");
    assert!(recipe.src_uri.is_empty());

    let entry = ctx.workspace.entry("hello").unwrap();
    assert_eq!(entry.srctree, srctree);
    assert_eq!(Provenance::read(&entry.append).unwrap().initial_rev, None);

    let sums = fs::read_to_string(config.workspace_path.join(SUMS_FILE)).unwrap();
    assert_eq!(sums.lines().count(), 2);
}

#[test]
fn test_add_rejects_bad_arguments() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());
    let ctx = Context::new(config);
    let srctree = temp.path().join("src");
    fs::create_dir_all(&srctree).unwrap();

    let mut args = AddArgs {
        name: "a/b".to_string(),
        srctree: srctree.clone(),
        ..AddArgs::default()
    };
    let err = add(&ctx, &args).unwrap_err();
    assert!(err.to_string().contains("is not a valid character"));

    args.name = "hello".to_string();
    args.version = Some("1.0_rc1".to_string());
    let err = add(&ctx, &args).unwrap_err();
    assert_eq!(err.to_string(), "Invalid version string \"1.0_rc1\"");

    args.version = None;
    args.srctree = temp.path().join("missing");
    let err = add(&ctx, &args).unwrap_err();
    assert!(err.to_string().contains("could not be found"));

    fs::write(srctree.join("file"), "x").unwrap();
    args.srctree = srctree;
    args.fetch = Some("git:///somewhere;protocol=file".to_string());
    let err = add(&ctx, &args).unwrap_err();
    assert!(err.to_string().contains("already exists and is non-empty"));
}

#[test]
fn test_add_fetches_git_source() {
    let fx = git_fixture();
    let ctx = Context::new(fx.config.clone());
    let srctree = fx.base().join("src/fetched");
    let fetch = format!("git://{};protocol=file;branch=master", fx.upstream.display());
    let args = AddArgs {
        name: "fetched".to_string(),
        srctree: srctree.clone(),
        fetch: Some(fetch.clone()),
        ..AddArgs::default()
    };
    add(&ctx, &args).unwrap();

    let recipe = Recipe::load(
        fx.config
            .workspace_path
            .join("recipes/fetched/fetched_git.recipe.toml"),
    )
    .unwrap();
    assert_eq!(recipe.src_uri[0].to_string(), fetch);
    assert_eq!(recipe.srcrev.as_deref(), Some(fx.upstream_rev.as_str()));

    let repo = GitRepo::new(&srctree);
    assert!(repo.tag_exists(BASE_TAG));
    assert_eq!(
        run_git(&srctree, &["symbolic-ref", "--short", "HEAD"]).trim(),
        "devtool"
    );
    let entry = ctx.workspace.entry("fetched").unwrap();
    assert_eq!(
        Provenance::read(&entry.append).unwrap().initial_rev.as_deref(),
        Some(fx.upstream_rev.as_str())
    );
}

#[test]
fn test_status_lists_entries() {
    let fx = git_fixture();
    let ctx = Context::new(fx.config.clone());
    assert_eq!(status(&ctx, false).unwrap(), 0);
    let (ctx, _) = modified(&fx);
    assert_eq!(status(&ctx, true).unwrap(), 0);
}

#[test]
fn test_reset_argument_checks() {
    let fx = git_fixture();
    let ctx = Context::new(fx.config.clone());

    let err = reset(&ctx, &ResetArgs::default()).unwrap_err();
    assert!(err.to_string().starts_with("Recipe must be specified"));

    let args = ResetArgs {
        name: Some("app".to_string()),
        all: true,
        no_clean: false,
    };
    let err = reset(&ctx, &args).unwrap_err();
    assert!(err.to_string().contains("-a/--all is used"));

    let args = ResetArgs {
        name: Some("app".to_string()),
        ..ResetArgs::default()
    };
    assert!(matches!(
        reset(&ctx, &args).unwrap_err(),
        DevtoolError::NotInWorkspace(_)
    ));
}

#[test]
fn test_reset_removes_unmodified_files() {
    let fx = git_fixture();
    let (ctx, srctree) = modified(&fx);
    let workdir = fx.config.tmp_dir.join("work/app");
    fs::create_dir_all(&workdir).unwrap();

    let args = ResetArgs {
        name: Some("app".to_string()),
        ..ResetArgs::default()
    };
    reset(&ctx, &args).unwrap();

    assert!(ctx.workspace.entries().unwrap().is_empty());
    assert!(!workdir.exists());
    assert!(!ctx.workspace.attic_dir().exists());
    assert!(srctree.join("main.c").exists());
    assert!(fx.recipe().externalsrc.is_none());
}

#[test]
fn test_reset_all_preserves_edited_recipe() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());
    let srctree = temp.path().join("src/hello");
    init_repo(&srctree);
    commit_files(&srctree, &[("hello.c", "int main;\n")], "Initial");

    let ctx = Context::new(config.clone());
    let args = AddArgs {
        name: "hello".to_string(),
        srctree,
        ..AddArgs::default()
    };
    add(&ctx, &args).unwrap();
    let recipefile = config.workspace_path.join("recipes/hello/hello.recipe.toml");
    let mut content = fs::read_to_string(&recipefile).unwrap();
    content.push_str("license = \"MIT\"\n");
    fs::write(&recipefile, content).unwrap();

    let args = ResetArgs {
        all: true,
        no_clean: true,
        ..ResetArgs::default()
    };
    reset(&ctx, &args).unwrap();

    assert!(!recipefile.exists());
    assert!(ctx.workspace.attic_dir().join("hello.recipe.toml").exists());
    assert!(!config.workspace_path.join("recipes/hello").exists());
    assert!(ctx.workspace.entries().unwrap().is_empty());
}

#[test]
fn test_reset_clean_failure_suggests_no_clean() {
    let fx = git_fixture();
    let (ctx, _) = modified(&fx);
    let mut content = fs::read_to_string(&fx.recipe_path).unwrap();
    content.push_str("\n[tasks.do_clean]\nrun = \"exit 1\"\n");
    fs::write(&fx.recipe_path, content).unwrap();

    let args = ResetArgs {
        name: Some("app".to_string()),
        ..ResetArgs::default()
    };
    let err = reset(&ctx, &args).unwrap_err();
    assert!(err.to_string().contains("-n/--no-clean"));
    assert!(ctx.workspace.contains("app").unwrap());
}
