//! Builds a package's `staging` sysroot by merging its dependencies' own staged output, and
//! (separately) merges install trees the same way at the end of a run.
//!
//! Composition walks the transitive dependency closure but does not recurse past a dependency
//! that declared itself `intercept`-ing: such a package has already absorbed its own
//! dependencies into its staged output, so pulling them in again would just duplicate files (and
//! risk disagreeing ones). Within the closure, files are merged `tar -k` style: the first
//! dependency to contribute a given relative path wins; later ones are silently skipped rather
//! than overwriting it.

use crate::{package::Package, util::error::Result};
use std::{
    collections::HashSet,
    path::Path,
    sync::{atomic::Ordering, Arc},
};
use walkdir::WalkDir;

pub struct Composer;

impl Composer {
    /// Transitive closure of `pkg`'s direct dependencies, stopping recursion at any dependency
    /// with `intercept-staging` set. Used to decide which dependencies contribute to the
    /// composed `staging` sysroot (step 11 of the rebuild pipeline).
    pub fn staging_closure(pkg: &Package) -> Vec<Arc<Package>> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        Self::collect(pkg, &mut visited, &mut out, |dep| {
            dep.flags.intercept_staging.load(Ordering::Relaxed)
        });
        out
    }

    /// Transitive closure of `pkg`'s direct dependencies, stopping recursion at any dependency
    /// with `intercept-install` set, unless `ignore_intercept` is true (in which case the whole
    /// transitive closure is returned regardless of intercept flags). Used for the install-set
    /// projection (step 12).
    pub fn install_closure(pkg: &Package, ignore_intercept: bool) -> Vec<Arc<Package>> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        Self::collect(pkg, &mut visited, &mut out, |dep| {
            !ignore_intercept && dep.flags.intercept_install.load(Ordering::Relaxed)
        });
        out
    }

    fn collect(
        pkg: &Package,
        visited: &mut HashSet<String>,
        out: &mut Vec<Arc<Package>>,
        stops_here: impl Fn(&Package) -> bool + Copy,
    ) {
        for dep in pkg.dependencies() {
            let key = dep.qualified_name();
            if visited.contains(&key) {
                continue;
            }
            visited.insert(key);
            let stop = stops_here(&dep);
            out.push(dep.clone());
            if !stop {
                Self::collect(&dep, visited, out, stops_here);
            }
        }
    }

    /// Compose `pkg`'s `staging` directory from the staging closure's `new_staging` output,
    /// first-writer-wins. Per spec.md §4.12, each dependency's contribution may be merged on its
    /// own thread when `parallel` is set (`--parallel-packages` unset or > 1); since ordering
    /// between dependencies is not materially meaningful here (§4.13), running them concurrently
    /// changes nothing but wall-clock time.
    pub fn compose_staging(pkg: &Package, parallel: bool) -> Result<()> {
        pkg.builddir.clean_staging()?;
        std::fs::create_dir_all(&pkg.builddir.staging)?;
        let deps = Self::staging_closure(pkg);
        merge_closure(&deps, |d| &d.builddir.new_staging, &pkg.builddir.staging, parallel)
    }

    /// Compose a final install tree at `dest` from `pkg`'s own `new_install` output plus the
    /// install closure, first-writer-wins (`pkg` itself always wins: its own files are merged
    /// first, sequentially, before any dependency is considered).
    pub fn compose_install(pkg: &Package, dest: &Path, ignore_intercept: bool, parallel: bool) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        merge_first_writer_wins(&pkg.builddir.new_install, dest)?;
        let deps = Self::install_closure(pkg, ignore_intercept);
        merge_closure(&deps, |d| &d.builddir.new_install, dest, parallel)
    }
}

/// Merge every dependency's contribution into `dest`, one thread per dependency when `parallel`
/// is set, otherwise declaration order. A thread panicking mid-copy (I/O error) is surfaced as a
/// build failure rather than silently dropped.
fn merge_closure(
    deps: &[Arc<Package>],
    source_of: impl Fn(&Package) -> &Path + Sync,
    dest: &Path,
    parallel: bool,
) -> Result<()> {
    if !parallel || deps.len() <= 1 {
        for dep in deps {
            merge_first_writer_wins(source_of(dep), dest)?;
        }
        return Ok(());
    }

    let results: Vec<Result<()>> = crossbeam::scope(|scope| {
        let handles: Vec<_> = deps
            .iter()
            .map(|dep| scope.spawn(move || merge_first_writer_wins(source_of(dep), dest)))
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    results.into_iter().collect()
}

fn merge_first_writer_wins(source: &Path, dest: &Path) -> Result<()> {
    if !source.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).expect("within source");
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if target.exists() {
            continue;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if entry.file_type().is_symlink() {
                let link_target = std::fs::read_link(entry.path())?;
                symlink::symlink_auto(&link_target, &target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builddir::BuildDir;
    use tempdir::TempDir;

    fn make(tmp: &TempDir, name: &str) -> Arc<Package> {
        Arc::new(Package::new(
            "ns",
            name,
            BuildDir::new(tmp.path(), "ns", name).unwrap(),
            std::path::PathBuf::new(),
        ))
    }

    #[test]
    fn closure_stops_at_intercepted_dependency() {
        let tmp = TempDir::new("compose").unwrap();
        let a = make(&tmp, "a");
        let b = make(&tmp, "b");
        let c = make(&tmp, "c");
        b.flags.intercept_staging.store(true, Ordering::Relaxed);
        b.add_dependency(c.clone(), false);
        a.add_dependency(b.clone(), false);

        let closure = Composer::staging_closure(&a);
        let names: Vec<&str> = closure.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn first_writer_wins_on_conflicting_paths() {
        let tmp = TempDir::new("compose").unwrap();
        let a = make(&tmp, "a");
        let b = make(&tmp, "b");
        a.add_dependency(b.clone(), false);

        std::fs::write(a.builddir.new_staging.join("shared.txt"), b"from-a-self").unwrap();
        std::fs::write(b.builddir.new_staging.join("shared.txt"), b"from-b").unwrap();

        Composer::compose_staging(&a, false).unwrap();
        merge_first_writer_wins(&a.builddir.new_staging, &a.builddir.staging).unwrap();

        let contents = std::fs::read_to_string(a.builddir.staging.join("shared.txt")).unwrap();
        assert_eq!(contents, "from-a-self");
    }

    #[test]
    fn parallel_composition_merges_every_dependency() {
        let tmp = TempDir::new("compose").unwrap();
        let a = make(&tmp, "a");
        let b = make(&tmp, "b");
        let c = make(&tmp, "c");
        a.add_dependency(b.clone(), false);
        a.add_dependency(c.clone(), false);

        std::fs::write(b.builddir.new_staging.join("from-b.txt"), b"b").unwrap();
        std::fs::write(c.builddir.new_staging.join("from-c.txt"), b"c").unwrap();

        Composer::compose_staging(&a, true).unwrap();

        assert!(a.builddir.staging.join("from-b.txt").exists());
        assert!(a.builddir.staging.join("from-c.txt").exists());
    }
}
