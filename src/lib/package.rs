//! A single package: its identity, recipe-declared fetch/extraction/build plan, dependency
//! edges, and the lifecycle flags the scheduler and rebuild engine read and flip as it moves
//! through the pipeline.

use crate::{
    buildinfo::BuildInfo,
    builddir::BuildDir,
    cmd::CommandRunner,
    extract::ExtractionUnit,
    fetch::{Digest, FetchUnit},
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Per-package behavioral switches set by recipe-level calls (`intercept`, `hashoutput`, ...).
#[derive(Debug, Default)]
pub struct PackageFlags {
    pub intercept_install: AtomicBool,
    pub intercept_staging: AtomicBool,
    pub suppress_remove_staging: AtomicBool,
    pub hash_output: AtomicBool,
    pub clean_before_build: AtomicBool,
    /// `buildlocally()` — disables fetch-from-cache for this package specifically.
    pub disable_fetch_from: AtomicBool,
}

/// Flags describing where a package sits in the current build run. Read with `Relaxed`
/// ordering outside the build mutex; writes only ever happen while the per-package build lock
/// or the scheduler's coordinator lock is held, so plain atomics are enough — there's no
/// compound invariant across two of these that a reader needs to observe atomically.
#[derive(Debug, Default)]
pub struct Lifecycle {
    pub processing_queued: AtomicBool,
    pub building: AtomicBool,
    pub built: AtomicBool,
    pub was_built: AtomicBool,
    pub code_updated: AtomicBool,
}

impl Lifecycle {
    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Relaxed)
    }
    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::Relaxed)
    }
    pub fn mark_queued(&self) {
        self.processing_queued.store(true, Ordering::Relaxed);
    }
    /// Atomically mark this package as queued for recipe processing, returning `true` only to
    /// the first caller to do so. Lets the recipe interpreter's `depend()` enqueue a freshly
    /// discovered dependency exactly once even when several packages declare it concurrently.
    pub fn try_mark_queued(&self) -> bool {
        self.processing_queued
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
    pub fn mark_building(&self) {
        self.building.store(true, Ordering::Relaxed);
    }
    pub fn mark_built(&self, was_built: bool) {
        self.building.store(false, Ordering::Relaxed);
        self.built.store(true, Ordering::Relaxed);
        if was_built {
            self.was_built.store(true, Ordering::Relaxed);
        }
    }
    pub fn mark_code_updated(&self) {
        self.code_updated.store(true, Ordering::Relaxed);
    }
    pub fn code_updated(&self) -> bool {
        self.code_updated.load(Ordering::Relaxed)
    }
}

/// A file the recipe declares should move from `new/install` (or `new/staging`) into the final
/// install tree; `to` is relative to the destination root.
#[derive(Debug, Clone)]
pub struct InstallFile {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// `fetch(path, "deps"[, directonly])` — an extra extraction step that unpacks a dependency's
/// install tree (or, with `direct_only`, just the directly-depended-on package's own install
/// tree rather than its transitive closure) into the builddir prior to the build commands.
#[derive(Debug, Clone)]
pub struct DepsExtract {
    pub path: PathBuf,
    pub direct_only: bool,
}

/// A dependency edge plus its `locally` flag (`depend(name, locally=true)` forces that
/// dependency to rebuild with `build(locally=true)` regardless of cache state — see rebuild
/// engine step 8).
#[derive(Clone)]
pub struct Dependency {
    pub package: Arc<Package>,
    pub locally: bool,
}

#[derive(Default)]
struct PackagePlan {
    dependencies: Vec<Dependency>,
    fetches: Vec<FetchUnit>,
    extractions: Vec<ExtractionUnit>,
    commands: Vec<CommandRunner>,
    install_files: Vec<InstallFile>,
    digest: Digest,
    build_info: BuildInfo,
    deps_extract: Option<DepsExtract>,
}

pub struct Package {
    pub namespace: String,
    pub name: String,
    pub builddir: BuildDir,
    /// Path to the recipe source file this package was parsed from; hashed into a
    /// `PackageFile` build unit so a recipe edit alone forces a rebuild.
    pub recipe_path: PathBuf,
    pub flags: PackageFlags,
    pub lifecycle: Lifecycle,
    plan: Mutex<PackagePlan>,
    /// Held for the full duration of a build; serializes concurrent attempts to build the same
    /// package (the scheduler should never schedule a package twice, but recipes shared across
    /// namespaces by intercept rules can still cause two call paths to converge on it).
    build_lock: Mutex<()>,
    /// This package's finalized buildinfo hash, set once its own build step completes. Read by
    /// dependents while assembling their own `BuildInfoFile` lines.
    output_hash: Mutex<Option<String>>,
    /// Set only for `hashoutput()` packages: the directory-hash of the composed install tree,
    /// computed in `publish_output`. Dependents of a hash-output package reference this (via an
    /// `OutputInfoFile` line) instead of the recipe-based `output_hash`, so that changes to this
    /// package's build recipe that don't change its output content don't ripple into rebuilds.
    content_hash: Mutex<Option<String>>,
}

impl Package {
    pub fn new(namespace: &str, name: &str, builddir: BuildDir, recipe_path: PathBuf) -> Self {
        Package {
            namespace: namespace.to_string(),
            name: name.to_string(),
            builddir,
            recipe_path,
            flags: PackageFlags::default(),
            lifecycle: Lifecycle::default(),
            plan: Mutex::new(PackagePlan::default()),
            build_lock: Mutex::new(()),
            output_hash: Mutex::new(None),
            content_hash: Mutex::new(None),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }

    pub fn add_dependency(&self, dep: Arc<Package>, locally: bool) {
        self.plan.lock().unwrap().dependencies.push(Dependency {
            package: dep,
            locally,
        });
    }

    /// Just the dependency packages, in declaration order, dropping the `locally` flag.
    pub fn dependencies(&self) -> Vec<Arc<Package>> {
        self.plan
            .lock()
            .unwrap()
            .dependencies
            .iter()
            .map(|d| d.package.clone())
            .collect()
    }

    /// Dependency edges with their `locally` flag, for the rebuild engine's step 8.
    pub fn dependency_edges(&self) -> Vec<Dependency> {
        self.plan.lock().unwrap().dependencies.clone()
    }

    pub fn add_fetch(&self, unit: FetchUnit) {
        self.plan.lock().unwrap().fetches.push(unit);
    }

    pub fn add_extraction(&self, unit: ExtractionUnit) {
        self.plan.lock().unwrap().extractions.push(unit);
    }

    pub fn add_command(&self, cmd: CommandRunner) {
        self.plan.lock().unwrap().commands.push(cmd);
    }

    pub fn add_install_file(&self, from: PathBuf, to: PathBuf) {
        self.plan
            .lock()
            .unwrap()
            .install_files
            .push(InstallFile { from, to });
    }

    pub fn set_digest(&self, digest: Digest) {
        self.plan.lock().unwrap().digest = digest;
    }

    pub fn push_build_unit(&self, unit: crate::buildinfo::BuildUnit) {
        self.plan.lock().unwrap().build_info.push(unit);
    }

    pub fn set_deps_extract(&self, path: PathBuf, direct_only: bool) {
        self.plan.lock().unwrap().deps_extract = Some(DepsExtract { path, direct_only });
    }

    pub fn deps_extract(&self) -> Option<DepsExtract> {
        self.plan.lock().unwrap().deps_extract.clone()
    }

    pub fn with_plan<R>(&self, f: impl FnOnce(&PackagePlanView) -> R) -> R {
        let plan = self.plan.lock().unwrap();
        f(&PackagePlanView {
            fetches: &plan.fetches,
            extractions: &plan.extractions,
            commands: &plan.commands,
            install_files: &plan.install_files,
            digest: &plan.digest,
            build_info: &plan.build_info,
            deps_extract: &plan.deps_extract,
        })
    }

    /// Acquire the per-package build lock for the duration of a rebuild pass.
    pub fn lock_build(&self) -> std::sync::MutexGuard<'_, ()> {
        self.build_lock.lock().unwrap()
    }

    pub fn set_output_hash(&self, hash: String) {
        *self.output_hash.lock().unwrap() = Some(hash);
    }

    pub fn output_hash(&self) -> Option<String> {
        self.output_hash.lock().unwrap().clone()
    }

    pub fn set_content_hash(&self, hash: String) {
        *self.content_hash.lock().unwrap() = Some(hash);
    }

    pub fn content_hash(&self) -> Option<String> {
        self.content_hash.lock().unwrap().clone()
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}
impl Eq for Package {}

/// Read-only borrowed view of a package's plan, handed to callers inside the plan lock's scope.
pub struct PackagePlanView<'a> {
    pub fetches: &'a [FetchUnit],
    pub extractions: &'a [ExtractionUnit],
    pub commands: &'a [CommandRunner],
    pub install_files: &'a [InstallFile],
    pub digest: &'a Digest,
    pub build_info: &'a BuildInfo,
    pub deps_extract: &'a Option<DepsExtract>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn make(tmp: &TempDir, name: &str) -> Package {
        let builddir = BuildDir::new(tmp.path(), "ns", name).unwrap();
        Package::new("ns", name, builddir, PathBuf::new())
    }

    #[test]
    fn lifecycle_transitions() {
        let tmp = TempDir::new("pkg").unwrap();
        let pkg = make(&tmp, "a");
        assert!(!pkg.lifecycle.is_built());
        pkg.lifecycle.mark_queued();
        pkg.lifecycle.mark_building();
        assert!(pkg.lifecycle.is_building());
        pkg.lifecycle.mark_built(true);
        assert!(pkg.lifecycle.is_built());
        assert!(!pkg.lifecycle.is_building());
    }

    #[test]
    fn dependencies_accumulate() {
        let tmp = TempDir::new("pkg").unwrap();
        let a = Arc::new(make(&tmp, "a"));
        let b = Arc::new(make(&tmp, "b"));
        b.add_dependency(a.clone(), false);
        assert_eq!(b.dependencies().len(), 1);
        assert_eq!(b.dependencies()[0].name, "a");
    }
}
