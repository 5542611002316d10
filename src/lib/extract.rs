//! Turning a fetched file or git checkout into working-directory content: tarball/zip
//! unpacking, patch application, plain file copies, and the three ways a git source directory
//! can be projected into a work dir (linked, copied, or directly fetched-into).

use crate::{cmd::CommandRunner, util::error::Result};
use failure::{bail, ResultExt};
use slog::Logger;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// How a git source directory is projected into the work dir. `Link` and `Copy` reuse an
/// existing checkout under `source/`; `Fetch` clones/updates the checkout in place inside the
/// work dir itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitDirMode {
    Link,
    Copy,
    Fetch,
}

impl fmt::Display for GitDirMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            GitDirMode::Link => "link",
            GitDirMode::Copy => "copy",
            GitDirMode::Fetch => "fetch",
        };
        write!(f, "{}", s)
    }
}

/// Tagged extraction plan. The printed form of each variant is the external `.extraction.info`
/// contract; see `print()`.
#[derive(Debug, Clone)]
pub enum ExtractionUnit {
    Tar {
        path: String,
        to: String,
        hash: String,
    },
    Zip {
        path: String,
        to: String,
        hash: String,
    },
    Patch {
        level: u32,
        apply_dir: String,
        path: String,
        hash: String,
    },
    FileCopy {
        path: String,
        to: String,
        hash: String,
    },
    FetchedFileCopy {
        path: String,
        to: String,
        hash: String,
    },
    GitDir {
        mode: GitDirMode,
        uri: String,
        to: String,
        head_sha: String,
        dirty_sha: Option<String>,
    },
}

impl ExtractionUnit {
    /// Canonical one-line printed form, matching the `.extraction.info` grammar.
    pub fn print(&self) -> String {
        match self {
            ExtractionUnit::Tar { path, hash, .. } => format!("TarFile {} {}", path, hash),
            ExtractionUnit::Zip { path, hash, .. } => format!("ZipFile {} {}", path, hash),
            ExtractionUnit::Patch {
                level,
                apply_dir,
                path,
                hash,
            } => format!("PatchFile {} {} {} {}", level, apply_dir, path, hash),
            ExtractionUnit::FileCopy { path, hash, .. } => format!("FileCopy {} {}", path, hash),
            ExtractionUnit::FetchedFileCopy { path, hash, .. } => {
                format!("FetchedFileCopy {} {}", path, hash)
            }
            ExtractionUnit::GitDir {
                mode,
                uri,
                to,
                head_sha,
                dirty_sha,
            } => match dirty_sha {
                Some(dirty) => format!("GitDir {} {} {} {} {}", mode, uri, to, head_sha, dirty),
                None => format!("GitDir {} {} {} {}", mode, uri, to, head_sha),
            },
        }
    }

    /// The content hash this unit contributes to the buildinfo hash.
    pub fn hash(&self) -> &str {
        match self {
            ExtractionUnit::Tar { hash, .. }
            | ExtractionUnit::Zip { hash, .. }
            | ExtractionUnit::Patch { hash, .. }
            | ExtractionUnit::FileCopy { hash, .. }
            | ExtractionUnit::FetchedFileCopy { hash, .. } => hash,
            ExtractionUnit::GitDir {
                dirty_sha,
                head_sha,
                ..
            } => dirty_sha.as_deref().unwrap_or(head_sha),
        }
    }
}

pub struct ExtractionEngine {
    dl_dir: PathBuf,
    source_dir: PathBuf,
}

impl ExtractionEngine {
    pub fn new(pwd: &Path) -> Self {
        ExtractionEngine {
            dl_dir: pwd.join("dl"),
            source_dir: pwd.join("source"),
        }
    }

    pub fn extract(&self, unit: &ExtractionUnit, work_dir: &Path, logger: &Logger) -> Result<()> {
        match unit {
            ExtractionUnit::Tar { path, to, .. } => self.extract_tar(path, to, work_dir),
            ExtractionUnit::Zip { path, to, .. } => self.extract_zip(path, to, work_dir),
            ExtractionUnit::Patch {
                level,
                apply_dir,
                path,
                ..
            } => self.apply_patch(*level, apply_dir, path, work_dir, logger),
            ExtractionUnit::FileCopy { path, to, .. } => self.copy_file(&self.resolve(path), to, work_dir),
            ExtractionUnit::FetchedFileCopy { path, to, .. } => {
                self.copy_file(&self.dl_dir.join(path), to, work_dir)
            }
            ExtractionUnit::GitDir { mode, to, .. } => self.project_git_dir(*mode, unit, to, work_dir),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        PathBuf::from(path)
    }

    fn target_dir(&self, to: &str, work_dir: &Path) -> PathBuf {
        if to.is_empty() {
            work_dir.to_path_buf()
        } else {
            work_dir.join(to)
        }
    }

    fn extract_tar(&self, path: &str, to: &str, work_dir: &Path) -> Result<()> {
        let target = self.target_dir(to, work_dir);
        fs::create_dir_all(&target)?;
        let source = self.dl_dir.join(path);

        if path.ends_with(".bz2") || path.ends_with(".tbz2") || path.ends_with(".tbz") {
            return self.extract_bzip2_tar(&source, path, &target);
        }

        let file = fs::File::open(&source)
            .with_context(|e| format!("could not open tarball {}: {}", source.display(), e))?;

        let decoded: Box<dyn std::io::Read> = if path.ends_with(".gz") || path.ends_with(".tgz") {
            Box::new(flate2::read::GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut archive = tar::Archive::new(decoded);
        archive
            .unpack(&target)
            .with_context(|e| format!("could not unpack {}: {}", source.display(), e))?;
        Ok(())
    }

    /// No native bzip2 decoder is in the dependency stack, matching `fetch.rs`'s
    /// `decompress_in_place`: shell out to the system `bunzip2` to materialize a plain tar
    /// alongside the source file, then hand that to `tar::Archive` as usual. This path is
    /// independent of fetch-time decompression, since a recipe can declare `extract()` on a
    /// `.tar.bz2` that was fetched without `decompress=true`.
    fn extract_bzip2_tar(&self, source: &Path, path: &str, target: &Path) -> Result<()> {
        let raw = fs::File::open(source)
            .with_context(|e| format!("could not open tarball {}: {}", source.display(), e))?;
        let decompressed_path = self.dl_dir.join(format!("{}.bunzip2-tmp", path));
        let out = fs::File::create(&decompressed_path)?;
        let status = std::process::Command::new("bunzip2")
            .arg("-k")
            .arg("-c")
            .stdin(std::process::Stdio::from(raw))
            .stdout(std::process::Stdio::from(out))
            .status()
            .with_context(|e| format!("could not run bunzip2 on {}: {}", source.display(), e))?;
        if !status.success() {
            bail!("bunzip2 exited with {} decompressing {}", status, source.display());
        }

        let file = fs::File::open(&decompressed_path).with_context(|e| {
            format!("could not open decompressed tarball {}: {}", decompressed_path.display(), e)
        })?;
        let mut archive = tar::Archive::new(file);
        let result = archive
            .unpack(target)
            .with_context(|e| format!("could not unpack {}: {}", source.display(), e));
        let _ = fs::remove_file(&decompressed_path);
        result?;
        Ok(())
    }

    fn extract_zip(&self, path: &str, to: &str, work_dir: &Path) -> Result<()> {
        let target = self.target_dir(to, work_dir);
        fs::create_dir_all(&target)?;
        let source = self.dl_dir.join(path);
        let file = fs::File::open(&source)
            .with_context(|e| format!("could not open zip {}: {}", source.display(), e))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|e| format!("could not read zip {}: {}", source.display(), e))?;
        archive
            .extract(&target)
            .with_context(|e| format!("could not unpack {}: {}", source.display(), e))?;
        Ok(())
    }

    /// Dry-run the patch first (`--dry-run`); only if that succeeds is it actually applied.
    /// A dry-run failure reports the patch path and fails the build without touching the tree.
    fn apply_patch(
        &self,
        level: u32,
        apply_dir: &str,
        path: &str,
        work_dir: &Path,
        logger: &Logger,
    ) -> Result<()> {
        let source = self.resolve(path);
        let target = self.target_dir(apply_dir, work_dir);
        let strip = format!("-p{}", level);

        CommandRunner::new("patch")
            .arg(&strip)
            .arg("--dry-run")
            .arg("-i")
            .arg(&source)
            .cwd(&target)
            .exec(logger)
            .with_context(|e| format!("Will fail to patch {}: {}", source.display(), e))?;

        CommandRunner::new("patch")
            .arg(&strip)
            .arg("-i")
            .arg(&source)
            .cwd(&target)
            .exec(logger)
            .with_context(|e| format!("could not apply patch {}: {}", source.display(), e))?;
        Ok(())
    }

    fn copy_file(&self, source: &Path, to: &str, work_dir: &Path) -> Result<()> {
        let target = self.target_dir(to, work_dir);
        fs::create_dir_all(&target)?;
        let dest = target.join(source.file_name().ok_or_else(|| {
            failure::format_err!("copy source {} has no file name", source.display())
        })?);
        fs::copy(source, &dest)?;
        Ok(())
    }

    fn project_git_dir(
        &self,
        mode: GitDirMode,
        unit: &ExtractionUnit,
        to: &str,
        work_dir: &Path,
    ) -> Result<()> {
        let local = if let ExtractionUnit::GitDir { uri, .. } = unit {
            uri.clone()
        } else {
            unreachable!()
        };
        let source_repo = self.source_dir.join(&local);
        let target = self.target_dir(to, work_dir);

        match mode {
            GitDirMode::Link => {
                if target.exists() {
                    fs::remove_file(&target).or_else(|_| fs::remove_dir_all(&target))?;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                symlink::symlink_dir(&source_repo, &target)?;
            }
            GitDirMode::Copy | GitDirMode::Fetch => {
                fs::create_dir_all(&target)?;
                crate::util::copy_dir(&source_repo, &target)?;
            }
        }
        Ok(())
    }

    /// Hash of the working tree if it differs from the committed tree at `HEAD` (a "dirty"
    /// checkout), else `None`. Computed the same way as directory-hash mode in the hash store:
    /// a sorted `<sha256> <relpath>` listing, hashed.
    pub fn dirty_hash(&self, repo_dir: &Path) -> Result<Option<String>> {
        let repo = git2::Repository::open(repo_dir)
            .with_context(|e| format!("could not open {}: {}", repo_dir.display(), e))?;
        let statuses = repo.statuses(None)?;
        if statuses.is_empty() {
            return Ok(None);
        }
        Ok(Some(hash_file_listing_over_workdir(repo_dir)?))
    }
}

fn hash_file_listing_over_workdir(root: &Path) -> Result<String> {
    crate::hash::hash_dir(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_forms_match_grammar() {
        let tar = ExtractionUnit::Tar {
            path: "foo.tar.gz".into(),
            to: "".into(),
            hash: "h".into(),
        };
        assert_eq!(tar.print(), "TarFile foo.tar.gz h");

        let patch = ExtractionUnit::Patch {
            level: 1,
            apply_dir: "src".into(),
            path: "fix.patch".into(),
            hash: "ph".into(),
        };
        assert_eq!(patch.print(), "PatchFile 1 src fix.patch ph");

        let git = ExtractionUnit::GitDir {
            mode: GitDirMode::Link,
            uri: "repo".into(),
            to: "src".into(),
            head_sha: "abc".into(),
            dirty_sha: None,
        };
        assert_eq!(git.print(), "GitDir link repo src abc");

        let git_dirty = ExtractionUnit::GitDir {
            mode: GitDirMode::Copy,
            uri: "repo".into(),
            to: "src".into(),
            head_sha: "abc".into(),
            dirty_sha: Some("def".into()),
        };
        assert_eq!(git_dirty.print(), "GitDir copy repo src abc def");
    }

    #[test]
    fn hash_prefers_dirty_over_head() {
        let unit = ExtractionUnit::GitDir {
            mode: GitDirMode::Fetch,
            uri: "repo".into(),
            to: "src".into(),
            head_sha: "abc".into(),
            dirty_sha: Some("def".into()),
        };
        assert_eq!(unit.hash(), "def");
    }
}
