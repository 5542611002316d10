//! Overlay-based recipe resolution and the per-namespace package registry.
//!
//! An overlay is an ordered list of filesystem roots searched for a package's recipe; `"."`
//! (the invocation directory) is always first. A namespace owns the find-or-create registry
//! that guarantees each `(namespace, package)` pair maps to exactly one `Package`, however many
//! times it's reached as a dependency.

use crate::{builddir::BuildDir, package::Package, util::error::Result};
use failure::format_err;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Ordered search path for recipe and data files. `"."` is always the first entry; additional
/// roots come from `--overlay` flags, searched in the order given after it.
#[derive(Debug, Clone)]
pub struct Overlay {
    roots: Vec<PathBuf>,
}

impl Overlay {
    pub fn new(extra_roots: Vec<PathBuf>) -> Self {
        let mut roots = vec![PathBuf::from(".")];
        roots.extend(extra_roots);
        Overlay { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// First existing `<root>/<relative>` wins.
    pub fn resolve(&self, relative: &Path) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.exists())
    }

    /// `<overlay>/package/<name>/<leaf>.lua`, where `<leaf>` is the last path component of
    /// `name` (packages whose name contains `/`, e.g. `group/leaf`, still resolve a single
    /// recipe file named after the leaf).
    pub fn recipe_path(&self, name: &str) -> Option<PathBuf> {
        let leaf = Path::new(name)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string());
        let relative = Path::new("package").join(name).join(format!("{}.lua", leaf));
        self.resolve(&relative)
    }
}

/// One namespace's package registry: find-or-create by name, backed by an overlay.
pub struct NameSpace {
    pub name: String,
    pub overlay: Overlay,
    pwd: PathBuf,
    packages: Mutex<HashMap<String, Arc<Package>>>,
}

impl NameSpace {
    pub fn new(name: &str, overlay: Overlay, pwd: PathBuf) -> Self {
        NameSpace {
            name: name.to_string(),
            overlay,
            pwd,
            packages: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an already-registered package by name.
    pub fn get(&self, name: &str) -> Option<Arc<Package>> {
        self.packages.lock().unwrap().get(name).cloned()
    }

    /// Return the existing package if registered, otherwise create, register, and return a
    /// fresh one. The recipe itself is not interpreted here; the caller (the recipe engine)
    /// does that once it has the `Package` handle, so that re-entrant lookups triggered mid-
    /// interpretation see a registered-but-not-yet-populated package instead of recursing.
    pub fn find_or_create(&self, name: &str) -> Result<Arc<Package>> {
        let mut packages = self.packages.lock().unwrap();
        if let Some(existing) = packages.get(name) {
            return Ok(existing.clone());
        }
        let builddir = BuildDir::new(&self.pwd, &self.name, name)?;
        let recipe_path = self.overlay.recipe_path(name).ok_or_else(|| {
            format_err!("no recipe found for package {} in namespace {}", name, self.name)
        })?;
        let pkg = Arc::new(Package::new(&self.name, name, builddir, recipe_path));
        packages.insert(name.to_string(), pkg.clone());
        Ok(pkg)
    }

    pub fn recipe_path(&self, name: &str) -> Result<PathBuf> {
        self.overlay
            .recipe_path(name)
            .ok_or_else(|| format_err!("no recipe found for package {} in namespace {}", name, self.name))
    }

    pub fn all(&self) -> Vec<Arc<Package>> {
        self.packages.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn overlay_resolves_dot_first() {
        let tmp = TempDir::new("overlay").unwrap();
        let extra = tmp.path().join("extra");
        std::fs::create_dir_all(&extra).unwrap();
        std::fs::write(extra.join("marker"), b"x").unwrap();

        let overlay = Overlay::new(vec![extra.clone()]);
        assert_eq!(overlay.roots()[0], PathBuf::from("."));
        let found = overlay.resolve(Path::new("marker")).unwrap();
        assert_eq!(found, extra.join("marker"));
    }

    #[test]
    fn recipe_path_uses_leaf_name() {
        let tmp = TempDir::new("overlay").unwrap();
        let dir = tmp.path().join("package").join("group").join("leaf");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("leaf.lua"), b"").unwrap();

        let overlay = Overlay::new(vec![tmp.path().to_path_buf()]);
        let found = overlay.recipe_path("group/leaf").unwrap();
        assert_eq!(found, dir.join("leaf.lua"));
    }

    #[test]
    fn find_or_create_registers_once() {
        let tmp = TempDir::new("ns").unwrap();
        let ns = NameSpace::new("ns", Overlay::new(vec![]), tmp.path().to_path_buf());
        let a = ns.find_or_create("pkg").unwrap();
        let b = ns.find_or_create("pkg").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
