//! Per-package working-area layout: `work`, the composed dependency `staging`, and the
//! transient `new/{staging,install}` directories a build writes into.

use crate::util::{clear_dir, error::Result};
use std::{fs, path::PathBuf};

/// `output/<ns>/<pkg>/{work,staging,new/staging,new/install}`.
///
/// Creation is idempotent. If `pkg` contains `/`, the intermediate staging/install directories
/// are pre-created so that `tar -x` can target them directly.
#[derive(Debug, Clone)]
pub struct BuildDir {
    pub root: PathBuf,
    pub work: PathBuf,
    pub staging: PathBuf,
    pub new_staging: PathBuf,
    pub new_install: PathBuf,
}

impl BuildDir {
    pub fn new(pwd: &std::path::Path, ns: &str, pkg: &str) -> Result<Self> {
        let root = pwd.join("output").join(ns).join(pkg);
        let dir = BuildDir {
            work: root.join("work"),
            staging: root.join("staging"),
            new_staging: root.join("new").join("staging"),
            new_install: root.join("new").join("install"),
            root,
        };

        fs::create_dir_all(&dir.work)?;
        fs::create_dir_all(&dir.staging)?;
        fs::create_dir_all(&dir.new_staging)?;
        fs::create_dir_all(&dir.new_install)?;

        // Packages whose name contains `/` produce tarball entries with intermediate
        // directories; pre-create them here so `tar -x` can target the leaf directly without
        // failing on a missing parent.
        if pkg.contains('/') {
            if let Some(parent) = PathBuf::from(pkg).parent() {
                fs::create_dir_all(dir.new_staging.join(parent))?;
                fs::create_dir_all(dir.new_install.join(parent))?;
            }
        }

        Ok(dir)
    }

    /// Remove and re-create `work`.
    pub fn clean(&self) -> Result<()> {
        clear_dir(&self.work)
    }

    /// Remove `staging` (the composed dependency sysroot). Left absent until the next
    /// composition pass recreates it.
    pub fn clean_staging(&self) -> Result<()> {
        if self.staging.exists() {
            remove_dir_all::remove_dir_all(&self.staging)?;
        }
        Ok(())
    }

    /// Remove and re-create `new/staging` and `new/install`, so a rebuild's commands never
    /// package artifacts a prior run left behind.
    pub fn clean_new_output(&self) -> Result<()> {
        clear_dir(&self.new_staging)?;
        clear_dir(&self.new_install)?;
        Ok(())
    }

    pub fn extraction_info(&self) -> PathBuf {
        self.root.join(".extraction.info")
    }

    pub fn extraction_info_new(&self) -> PathBuf {
        self.root.join(".extraction.info.new")
    }

    pub fn build_info(&self) -> PathBuf {
        self.root.join(".build.info")
    }

    pub fn output_info(&self) -> PathBuf {
        self.root.join(".output.info")
    }

    pub fn build_log(&self) -> PathBuf {
        self.root.join("build.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn creates_expected_tree() {
        let tmp = TempDir::new("builddir").unwrap();
        let dir = BuildDir::new(tmp.path(), "ns", "pkg").unwrap();
        assert!(dir.work.is_dir());
        assert!(dir.staging.is_dir());
        assert!(dir.new_staging.is_dir());
        assert!(dir.new_install.is_dir());
    }

    #[test]
    fn precreates_nested_package_dirs() {
        let tmp = TempDir::new("builddir").unwrap();
        let dir = BuildDir::new(tmp.path(), "ns", "group/leaf").unwrap();
        assert!(dir.new_staging.join("group").is_dir());
        assert!(dir.new_install.join("group").is_dir());
    }
}
