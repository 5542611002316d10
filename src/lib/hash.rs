//! Content hashing of files and file hierarchies (SHA-256 hex), used by every subsystem that
//! needs to decide "has this changed": `FetchEngine`, `ExtractionEngine`, `BuildInfo`, and the
//! rebuild engine's directory-hash output mode.

use crate::util::error::Result;
use failure::ResultExt;
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};
use walkdir::WalkDir;

/// Hash a single file's contents as lowercase hex SHA-256.
///
/// On I/O failure, the error propagates; callers are responsible for logging the failed path
/// and treating it as fatal to whichever unit was hashing it.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|e| format!("could not open {} for hashing: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    hash_reader(&mut reader)
}

fn hash_reader(reader: &mut impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.input(&buf[..n]);
    }
    Ok(hex::encode(hasher.result()))
}

/// Hash raw bytes directly (used for hashing printed representations of build/extraction units).
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.input(bytes);
    hex::encode(hasher.result())
}

/// Directory-hash mode used by `hash-output` packages: every regular file under `root` is
/// hashed, the `<sha256> <relative-path>` lines are sorted by path, and the resulting listing
/// is itself hashed. Returns the listing hash.
pub fn hash_dir(root: &Path) -> Result<String> {
    let mut lines: Vec<(String, String)> = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields children of root")
            .to_string_lossy()
            .into_owned();
        let hash = hash_file(entry.path())?;
        lines.push((rel, hash));
    }

    lines.sort_by(|a, b| a.0.cmp(&b.0));

    let mut listing = String::new();
    for (rel, hash) in &lines {
        listing.push_str(hash);
        listing.push(' ');
        listing.push_str(rel);
        listing.push('\n');
    }

    Ok(hash_bytes(listing.as_bytes()))
}

/// Process-wide init/teardown hook for the underlying cryptographic library. `sha2`'s pure-Rust
/// implementation has no global state to initialize, but the hook is kept so that a future
/// switch to a library binding (e.g. OpenSSL) has a single call site to wire up.
pub fn init() {}

pub fn teardown() {}
