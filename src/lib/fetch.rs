//! Acquiring sources: download, link, copy, or git-clone-at-refspec, with per-filename download
//! locking and the tarball-cache/build-cache fallback chain described by the tool's rebuild
//! engine.

use crate::util::error::Result;
use failure::{bail, format_err, ResultExt};
use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// A package's `Digest` file: `<filename> <sha256>` lines, tolerating blank lines and
/// `#`-prefixed comments.
#[derive(Debug, Clone, Default)]
pub struct Digest {
    entries: HashMap<String, String>,
}

impl Digest {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Digest::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|e| format!("could not read digest file {}: {}", path.display(), e))?;
        Ok(Digest::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            if let (Some(name), Some(hash)) = (parts.next(), parts.next()) {
                entries.insert(name.to_string(), hash.trim().to_string());
            }
        }
        Digest { entries }
    }

    pub fn get(&self, filename: &str) -> Option<&str> {
        self.entries.get(filename).map(String::as_str)
    }
}

/// Tagged fetch plan. Every unit produces a stable `relative_path` used by downstream
/// extraction, and a content hash; `Link`/`Copy` hashes are empty, since hashing them would
/// mean copying the target first.
#[derive(Debug)]
pub enum FetchUnit {
    Download {
        uri: String,
        decompress: bool,
        filename_override: Option<String>,
        hash: Mutex<String>,
        final_name: Mutex<String>,
    },
    Link {
        uri: String,
    },
    Copy {
        uri: String,
    },
    Git {
        remote: String,
        local: String,
        refspec: String,
        hash: Mutex<String>,
    },
}

impl FetchUnit {
    pub fn download(uri: String, decompress: bool, filename_override: Option<String>) -> Self {
        FetchUnit::Download {
            uri,
            decompress,
            filename_override,
            hash: Mutex::new(String::new()),
            final_name: Mutex::new(String::new()),
        }
    }

    pub fn link(uri: String) -> Self {
        FetchUnit::Link { uri }
    }

    pub fn copy(uri: String) -> Self {
        FetchUnit::Copy { uri }
    }

    pub fn git(remote: String, local: String, refspec: String) -> Self {
        FetchUnit::Git {
            remote,
            local,
            refspec,
            hash: Mutex::new(String::new()),
        }
    }

    /// Content hash of this fetch, empty for `Link`/`Copy`.
    pub fn hash(&self) -> String {
        match self {
            FetchUnit::Download { hash, .. } | FetchUnit::Git { hash, .. } => {
                hash.lock().unwrap().clone()
            }
            FetchUnit::Link { .. } | FetchUnit::Copy { .. } => String::new(),
        }
    }

    /// Path, relative to the global `dl/`/`source/` roots, that downstream extraction units
    /// should reference.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            FetchUnit::Download { final_name, .. } => PathBuf::from(final_name.lock().unwrap().clone()),
            FetchUnit::Link { uri } | FetchUnit::Copy { uri } => PathBuf::from(uri),
            FetchUnit::Git { local, .. } => PathBuf::from("source").join(local),
        }
    }
}

/// Per-download-filename lock-holder. Ensures at-most-one concurrent download per fully
/// qualified file name and cross-checks that repeated declarations of the same filename agree
/// on content hash.
#[derive(Default)]
struct DlTable {
    objects: Mutex<HashMap<String, Arc<Mutex<Option<String>>>>>,
}

impl DlTable {
    fn lock_for(&self, filename: &str) -> Arc<Mutex<Option<String>>> {
        let mut objects = self.objects.lock().unwrap();
        objects
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }
}

pub struct FetchEngine {
    dl_dir: PathBuf,
    source_dir: PathBuf,
    tarball_cache: Option<String>,
    dl_table: DlTable,
    client: reqwest::blocking::Client,
}

impl FetchEngine {
    pub fn new(pwd: &Path, tarball_cache: Option<String>) -> Result<Self> {
        let dl_dir = pwd.join("dl");
        let source_dir = pwd.join("source");
        fs::create_dir_all(&dl_dir)?;
        fs::create_dir_all(&source_dir)?;
        Ok(FetchEngine {
            dl_dir,
            source_dir,
            tarball_cache,
            dl_table: DlTable::default(),
            client: reqwest::blocking::Client::new(),
        })
    }

    /// Run a single fetch unit, placing its content into `work_dir` (for `Link`/`Copy`/`Git`)
    /// or into the shared `dl/` cache (for `Download`, which extraction later reads from).
    pub fn fetch(
        &self,
        unit: &FetchUnit,
        pkg_name: &str,
        digest: &Digest,
        work_dir: &Path,
    ) -> Result<bool> {
        match unit {
            FetchUnit::Download {
                uri,
                decompress,
                filename_override,
                hash,
                final_name,
            } => {
                let code_updated =
                    self.fetch_download(uri, *decompress, filename_override.as_deref(), pkg_name, digest, hash, final_name)?;
                Ok(code_updated)
            }
            FetchUnit::Link { uri } => {
                self.fetch_link(uri, work_dir)?;
                Ok(true)
            }
            FetchUnit::Copy { uri } => {
                self.fetch_copy(uri, work_dir)?;
                Ok(true)
            }
            FetchUnit::Git {
                remote,
                local,
                refspec,
                hash,
            } => self.fetch_git(remote, local, refspec, hash),
        }
    }

    fn resolve_final_name(uri: &str, decompress: bool, filename_override: Option<&str>) -> String {
        if let Some(name) = filename_override {
            return name.to_string();
        }
        let base = uri.rsplit('/').next().unwrap_or(uri).to_string();
        if decompress {
            if let Some(stripped) = base.strip_suffix(".bz2").or_else(|| base.strip_suffix(".gz")) {
                return stripped.to_string();
            }
        }
        base
    }

    fn fetch_download(
        &self,
        uri: &str,
        decompress: bool,
        filename_override: Option<&str>,
        pkg_name: &str,
        digest: &Digest,
        hash_out: &Mutex<String>,
        final_name_out: &Mutex<String>,
    ) -> Result<bool> {
        let final_name = Self::resolve_final_name(uri, decompress, filename_override);
        *final_name_out.lock().unwrap() = final_name.clone();

        let lock = self.dl_table.lock_for(&final_name);
        let mut slot = lock.lock().unwrap();

        let final_path = self.dl_dir.join(&final_name);
        let mut downloaded = false;

        if !final_path.exists() {
            let tmp_path = self.dl_dir.join(format!("{}.tmp", final_name));
            let from_cache = self
                .tarball_cache
                .as_ref()
                .map(|base| format!("{}/{}", base.trim_end_matches('/'), final_name));

            let mut fetched = false;
            if let Some(cache_url) = from_cache {
                if self.download_to(&cache_url, &tmp_path).is_ok() {
                    fetched = true;
                }
            }
            if !fetched {
                self.download_to(uri, &tmp_path)
                    .with_context(|e| format!("could not download {}: {}", uri, e))?;
            }

            fs::rename(&tmp_path, &final_path)?;
            downloaded = true;

            if decompress {
                self.decompress_in_place(uri, &final_path)?;
            }
        }

        let file_hash = crate::hash::hash_file(&final_path)?;

        if let Some(expected) = digest.get(&final_name) {
            if expected != file_hash {
                bail!(
                    "hash mismatch for {}: digest declared {}, downloaded file hashes to {}",
                    final_name,
                    expected,
                    file_hash
                );
            }
        } else {
            bail!(
                "missing hash: package {} declared a download of {} with no matching Digest entry",
                pkg_name,
                final_name
            );
        }

        if let Some(existing) = slot.as_ref() {
            if existing != &file_hash {
                bail!(
                    "two declarations of download {} disagree on content hash ({} vs {})",
                    final_name,
                    existing,
                    file_hash
                );
            }
        } else {
            *slot = Some(file_hash.clone());
        }

        *hash_out.lock().unwrap() = file_hash;
        Ok(downloaded)
    }

    fn download_to(&self, uri: &str, dest: &Path) -> Result<()> {
        let mut resp = self
            .client
            .get(uri)
            .send()
            .with_context(|e| format!("request to {} failed: {}", uri, e))?
            .error_for_status()
            .with_context(|e| format!("{} returned an error status: {}", uri, e))?;
        let mut file = fs::File::create(dest)?;
        std::io::copy(&mut resp, &mut file)?;
        Ok(())
    }

    fn decompress_in_place(&self, uri: &str, _final_path: &Path) -> Result<()> {
        // The download was already renamed to its decompressed final name; decompression of the
        // bytes we just fetched happens by re-reading the raw download into a sibling `.raw`
        // file and streaming it back through the matching decoder.
        let raw_ext = if uri.ends_with(".bz2") {
            "bz2"
        } else if uri.ends_with(".gz") {
            "gz"
        } else {
            return Ok(());
        };
        let final_path = _final_path;
        let raw_path = final_path.with_extension(format!(
            "{}.{}",
            final_path.extension().and_then(|e| e.to_str()).unwrap_or(""),
            raw_ext
        ));
        fs::rename(final_path, &raw_path)?;

        match raw_ext {
            "gz" => {
                let raw = fs::File::open(&raw_path)?;
                let mut decoder = flate2::read::GzDecoder::new(raw);
                let mut out = fs::File::create(final_path)?;
                std::io::copy(&mut decoder, &mut out)?;
            }
            "bz2" => {
                // No native bzip2 decoder is in the dependency stack; shell out to the system
                // `bunzip2`, writing its stdout directly to the final decompressed path.
                let raw = fs::File::open(&raw_path)?;
                let out = fs::File::create(final_path)?;
                let status = std::process::Command::new("bunzip2")
                    .arg("-c")
                    .stdin(std::process::Stdio::from(raw))
                    .stdout(std::process::Stdio::from(out))
                    .status()
                    .with_context(|e| format!("could not run bunzip2: {}", e))?;
                if !status.success() {
                    bail!("bunzip2 exited with {}", status);
                }
            }
            _ => unreachable!(),
        }
        let _ = fs::remove_file(&raw_path);
        Ok(())
    }

    /// Symlink the relative fetch path into the work dir; if it exists already, remove and
    /// retry once (this is the one sanctioned retry in the whole tool — recovery, not fault
    /// tolerance).
    fn fetch_link(&self, uri: &str, work_dir: &Path) -> Result<()> {
        let target = self.resolve_overlay_path(uri)?;
        let dest = work_dir.join(target.file_name().ok_or_else(|| {
            format_err!("link source {} has no file name", target.display())
        })?);

        match symlink::symlink_auto(&target, &dest) {
            Ok(()) => Ok(()),
            Err(_) => {
                let _ = fs::remove_file(&dest);
                symlink::symlink_auto(&target, &dest)
                    .with_context(|e| format!("could not link {} into work dir: {}", uri, e))?;
                Ok(())
            }
        }
    }

    fn fetch_copy(&self, uri: &str, work_dir: &Path) -> Result<()> {
        let source = self.resolve_overlay_path(uri)?;
        let dest = work_dir.join(source.file_name().ok_or_else(|| {
            format_err!("copy source {} has no file name", source.display())
        })?);
        if source.is_dir() {
            crate::util::copy_dir(&source, &dest)
        } else {
            fs::copy(&source, &dest).map(|_| ()).map_err(Into::into)
        }
    }

    fn resolve_overlay_path(&self, uri: &str) -> Result<PathBuf> {
        // Fetch-relative paths are resolved against the current directory by convention; the
        // overlay search itself is performed by the namespace/recipe layer before the fetch
        // engine is invoked, so by this point `uri` is already a workable filesystem path.
        Ok(PathBuf::from(uri))
    }

    /// Clone if `source/<local>` is absent; else ensure `origin` points at `remote` (forcibly
    /// refetching tags if it had to change), check out `refspec` detached, and verify branch
    /// tips when `refspec` names a branch rather than a commit.
    fn fetch_git(&self, remote: &str, local: &str, refspec: &str, hash_out: &Mutex<String>) -> Result<bool> {
        let dir = self.source_dir.join(local);
        let mut code_updated = false;

        let repo = if dir.exists() {
            let repo = git2::Repository::open(&dir)
                .with_context(|e| format!("could not open existing git dir {}: {}", dir.display(), e))?;
            let needs_refetch = match repo.find_remote("origin") {
                Ok(r) => r.url() != Some(remote),
                Err(_) => true,
            };
            if needs_refetch {
                if repo.find_remote("origin").is_ok() {
                    repo.remote_set_url("origin", remote)?;
                } else {
                    repo.remote("origin", remote)?;
                }
                let mut origin = repo.find_remote("origin")?;
                origin.fetch(&["+refs/tags/*:refs/tags/*"], None, None)?;
            }
            repo
        } else {
            fs::create_dir_all(dir.parent().unwrap_or(&self.source_dir))?;
            code_updated = true;
            git2::Repository::clone(remote, &dir)
                .with_context(|e| format!("could not clone {} into {}: {}", remote, dir.display(), e))?
        };

        // A 40-hex refspec already present in the local object database names a commit by
        // content, not a moving ref, so there is nothing a network fetch could learn about it;
        // skip straight to resolving it.
        let already_resolvable = is_commit_id(refspec) && repo.revparse_single(refspec).is_ok();

        if !already_resolvable {
            let mut origin = repo.find_remote("origin")?;
            origin
                .fetch(&[refspec, "+refs/heads/*:refs/remotes/origin/*"], None, None)
                .with_context(|e| format!("could not fetch {} from {}: {}", refspec, remote, e))?;
        }

        let obj = repo
            .revparse_single(refspec)
            .or_else(|_| repo.revparse_single(&format!("origin/{}", refspec)))
            .with_context(|e| format!("refspec {} not present in {}: {}", refspec, remote, e))?;

        repo.set_head_detached(obj.id())?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;

        let is_branch_name = !is_commit_id(refspec);
        if is_branch_name {
            if let Ok(branch_ref) = repo.find_reference(&format!("refs/remotes/origin/{}", refspec)) {
                let tip = branch_ref.peel_to_commit()?.id();
                if tip != obj.id() {
                    bail!(
                        "refspec {} resolved to {} but HEAD is {}",
                        refspec,
                        tip,
                        obj.id()
                    );
                }
            }
        }

        let head_hash = obj.id().to_string();
        let mut previous = hash_out.lock().unwrap();
        if !previous.is_empty() && *previous != head_hash {
            bail!(
                "git fetch of {}#{} hashed to {} but a previous declaration recorded {}",
                remote,
                refspec,
                head_hash,
                previous
            );
        }
        *previous = head_hash;

        Ok(code_updated)
    }
}

/// A 40-hex refspec is treated as a commit id, which means no network access is required to
/// know its hash ahead of time.
pub fn is_commit_id(refspec: &str) -> bool {
    refspec.len() == 40 && refspec.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_parses_comments_and_blanks() {
        let d = Digest::parse("\n# a comment\nfoo.tar.gz abcdef\n\nbar.tar.gz 123456\n");
        assert_eq!(d.get("foo.tar.gz"), Some("abcdef"));
        assert_eq!(d.get("bar.tar.gz"), Some("123456"));
    }

    #[test]
    fn commit_id_detection() {
        assert!(is_commit_id(&"a".repeat(40)));
        assert!(!is_commit_id("master"));
        assert!(!is_commit_id(&"a".repeat(39)));
    }

    #[test]
    fn resolve_final_name_strips_one_extension_when_decompressing() {
        assert_eq!(
            FetchEngine::resolve_final_name("http://x/y/foo.tar.gz", true, None),
            "foo.tar"
        );
        assert_eq!(
            FetchEngine::resolve_final_name("http://x/y/foo.tar.gz", false, None),
            "foo.tar.gz"
        );
        assert_eq!(
            FetchEngine::resolve_final_name("http://x/y/foo.tar.gz", true, Some("bar.tar.gz")),
            "bar.tar.gz"
        );
    }
}
