//! Utility functions shared across the build orchestrator.

pub mod error;
pub mod graph;
pub mod shell;

use std::{fs, path::Path};

use failure::{format_err, ResultExt};
use walkdir::{DirEntry, WalkDir};

use crate::util::error::Result;

/// Recursively copy `from` into `to`, following symlinks and preserving the relative layout.
/// Mirrors the `cp -dpRuf` semantics required of `Copy` fetches and `FileCopy` extractions.
pub fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let walker = WalkDir::new(from)
        .follow_links(true)
        .into_iter()
        .filter_entry(|x| x.path() != to)
        .filter_map(|x| x.ok().filter(valid_file));

    for entry in walker {
        let to_p = to.join(entry.path().strip_prefix(from).unwrap());
        fs::create_dir_all(to_p.parent().unwrap())?;
        let _ = fs::copy(entry.path(), &to_p).with_context(|e| {
            format_err!(
                "couldn't copy {} to {}:\n{}",
                entry.path().display(),
                to_p.display(),
                e
            )
        })?;
    }

    Ok(())
}

pub fn clear_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        remove_dir_all::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

pub fn valid_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
}
