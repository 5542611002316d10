//! An ordered, append-only, printable record of everything that influences a package's output:
//! feature reads, the recipe file itself, the finalised extraction fingerprint, and one line per
//! dependency pointing at either its `.build.info` or its `.output.info`.
//!
//! The SHA-256 of the printed form is the package's `buildinfo_hash` — the key into the remote
//! build cache and the quantity every round-trip/idempotence law in the tool's testable
//! properties is stated in terms of.

use crate::features::FeatureMap;
use std::fmt::Write as _;

/// One fact recorded about a package's build. Variants and their printed form are part of the
/// external `.build.info`/`.extraction.info` contract; see the line grammar below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildUnit {
    FeatureValue { name: String, value: String },
    FeatureNil { name: String },
    PackageFile { path: String, hash: String },
    RequireFile { path: String, hash: String },
    ExtractionInfoFile { path: String, hash: String },
    BuildInfoFile { path: String, hash: String },
    OutputInfoFile { path: String, hash: String },
}

impl BuildUnit {
    /// The feature name this unit reads, if it's a feature unit. Used to check the ignore list.
    fn feature_name(&self) -> Option<&str> {
        match self {
            BuildUnit::FeatureValue { name, .. } | BuildUnit::FeatureNil { name } => Some(name),
            _ => None,
        }
    }

    /// Canonical one-line printed form, matching the `.build.info`/`.extraction.info` grammar.
    pub fn print(&self) -> String {
        match self {
            BuildUnit::FeatureValue { name, value } => format!("FeatureValue {} {}", name, value),
            BuildUnit::FeatureNil { name } => format!("FeatureNil {}", name),
            BuildUnit::PackageFile { path, hash } => format!("PackageFile {} {}", path, hash),
            BuildUnit::RequireFile { path, hash } => format!("RequireFile {} {}", path, hash),
            BuildUnit::ExtractionInfoFile { path, hash } => {
                format!("ExtractionInfoFile {} {}", path, hash)
            }
            BuildUnit::BuildInfoFile { path, hash } => format!("BuildInfoFile {} {}", path, hash),
            BuildUnit::OutputInfoFile { path, hash } => {
                format!("OutputInfoFile {} {}", path, hash)
            }
        }
    }
}

/// Ordered, append-only list of `BuildUnit`s. Insertion order is preserved and is part of the
/// external contract: each line of `.build.info` corresponds to exactly one unit, in order.
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    units: Vec<BuildUnit>,
}

impl BuildInfo {
    pub fn new() -> Self {
        BuildInfo { units: Vec::new() }
    }

    pub fn push(&mut self, unit: BuildUnit) {
        self.units.push(unit);
    }

    pub fn units(&self) -> &[BuildUnit] {
        &self.units
    }

    /// Render the printed form, skipping feature units whose name is on `features`' ignore
    /// list. Both `FeatureValue` and `FeatureNil` are suppressed for a given ignored name, so
    /// that toggling an ignored feature between unset and set never changes the hash either way
    /// — the whole point of the ignore list. All other unit kinds are always emitted.
    pub fn print(&self, features: &FeatureMap) -> String {
        let mut out = String::new();
        for unit in &self.units {
            if let Some(name) = unit.feature_name() {
                if features.is_ignored(name) {
                    continue;
                }
            }
            writeln!(out, "{}", unit.print()).expect("writing to a String never fails");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recipe_info_has_no_lines() {
        let bi = BuildInfo::new();
        let fm = FeatureMap::new();
        assert_eq!(bi.print(&fm), "");
    }

    #[test]
    fn ignored_feature_is_not_emitted() {
        let mut bi = BuildInfo::new();
        bi.push(BuildUnit::FeatureValue {
            name: "x".into(),
            value: "on".into(),
        });
        bi.push(BuildUnit::PackageFile {
            path: "package/a/a.lua".into(),
            hash: "deadbeef".into(),
        });

        let fm = FeatureMap::new();
        fm.ignore("x");

        let printed = bi.print(&fm);
        assert!(!printed.contains("FeatureValue"));
        assert!(printed.contains("PackageFile package/a/a.lua deadbeef"));
    }

    #[test]
    fn non_ignored_feature_is_emitted_in_order() {
        let mut bi = BuildInfo::new();
        bi.push(BuildUnit::PackageFile {
            path: "package/a/a.lua".into(),
            hash: "h1".into(),
        });
        bi.push(BuildUnit::FeatureValue {
            name: "x".into(),
            value: "on".into(),
        });

        let fm = FeatureMap::new();
        let printed = bi.print(&fm);
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines, vec!["PackageFile package/a/a.lua h1", "FeatureValue x on"]);
    }
}
