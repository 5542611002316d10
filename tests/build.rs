//! Drives the full pipeline (`discover` -> `check_acyclic` -> `build_all`) against a small
//! recipe tree written to a temporary overlay, the way `buildsys` itself is invoked from the
//! command line, instead of exercising any one module in isolation.
//!
//! `discover` names the base package's own name as the namespace every reachable package is
//! registered under, so a run started at `top` puts both `top` and its dependency `leaf` in the
//! `top` namespace (`output/top/install/*.tar`, not `output/leaf/...`).

use buildsys::{
    config::Config,
    context::{Context, Forced},
    namespace::Overlay,
    run,
};
use std::{fs, path::Path, sync::Arc};
use tempdir::TempDir;

fn write_recipe(root: &Path, name: &str, body: &str) {
    let dir = root.join("package").join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{}.lua", name)), body).unwrap();
}

fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// Two packages: `leaf` writes a file and installs it, `top` depends on `leaf` and installs one
/// of its own, so the test covers recipe discovery, dependency-graph construction, staging
/// composition, and install-tar publishing all at once.
#[test]
fn builds_a_dependency_chain_and_publishes_install_tars() {
    let tmp = TempDir::new("buildsys-build").unwrap();
    let root = tmp.path();

    write_recipe(
        root,
        "leaf",
        r#"
        local bd = builddir()
        bd:shell(".", "echo leaf > ../new/install/leaf.txt")
        bd:installfile("leaf.txt")
        "#,
    );
    write_recipe(
        root,
        "top",
        r#"
        depend("leaf")
        local bd = builddir()
        bd:shell(".", "echo top > ../new/install/top.txt")
        bd:installfile("top.txt")
        "#,
    );

    let overlay = Overlay::new(vec![root.to_path_buf()]);
    let ctx = Arc::new(
        Context::new(root.to_path_buf(), Config::new(), overlay, Forced::none(), discard_logger()).unwrap(),
    );

    let graph = run::discover(&ctx, "top").unwrap();
    run::check_acyclic(&ctx, &graph).unwrap();
    run::build_all(&ctx, graph).unwrap();

    assert!(root.join("output/top/install/top.tar").exists());
    assert!(root.join("output/top/install/leaf.tar").exists());
    assert!(root.join("output/top/staging/top.tar").exists());

    assert!(root.join("dependencies.dot").exists());
    let dot = fs::read_to_string(root.join("dependencies.dot")).unwrap();
    assert!(dot.contains("\"top:top\" -> \"top:leaf\""));
}

/// A two-package cycle (`a` depending on `b` depending back on `a`) must be rejected before any
/// package is scheduled to build.
#[test]
fn rejects_a_cyclic_dependency_graph() {
    let tmp = TempDir::new("buildsys-cycle").unwrap();
    let root = tmp.path();

    write_recipe(root, "a", "depend(\"b\")");
    write_recipe(root, "b", "depend(\"a\")");

    let overlay = Overlay::new(vec![root.to_path_buf()]);
    let ctx = Arc::new(
        Context::new(root.to_path_buf(), Config::new(), overlay, Forced::none(), discard_logger()).unwrap(),
    );

    let graph = run::discover(&ctx, "a").unwrap();
    assert!(run::check_acyclic(&ctx, &graph).is_err());
}

/// `--parallel-packages 1` (`extract_in_parallel() == false`) still has to drive the same
/// dependency chain through to a published install tree; this is the only place that exercises
/// the scheduler's single-worker, sequential-composition path end to end.
#[test]
fn single_worker_build_still_publishes_every_package() {
    let tmp = TempDir::new("buildsys-serial").unwrap();
    let root = tmp.path();

    write_recipe(
        root,
        "leaf",
        r#"
        local bd = builddir()
        bd:shell(".", "echo leaf > ../new/install/leaf.txt")
        bd:installfile("leaf.txt")
        "#,
    );
    write_recipe(
        root,
        "top",
        r#"
        depend("leaf")
        local bd = builddir()
        bd:shell(".", "echo top > ../new/install/top.txt")
        bd:installfile("top.txt")
        "#,
    );

    let mut config = Config::new();
    config.set_parallel_packages(1);
    assert!(!config.extract_in_parallel());

    let overlay = Overlay::new(vec![root.to_path_buf()]);
    let ctx = Arc::new(
        Context::new(root.to_path_buf(), config, overlay, Forced::none(), discard_logger()).unwrap(),
    );

    let graph = run::discover(&ctx, "top").unwrap();
    run::check_acyclic(&ctx, &graph).unwrap();
    run::build_all(&ctx, graph).unwrap();

    assert!(root.join("output/top/install/top.tar").exists());
    assert!(root.join("output/top/install/leaf.tar").exists());
}
