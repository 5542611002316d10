//! The process-wide state a recipe run needs, bundled into one handle instead of the
//! `WORLD`/`FEATURES`/`NAMESPACES`/`DLOBJECTS` global singletons the ancestor tool used. Every
//! sub-store (`FeatureMap`, the namespace table, `FetchEngine`'s per-filename download table) is
//! independently thread-safe, so `Context` itself needs no lock of its own — it is shared behind
//! an `Arc` and read concurrently by every worker thread.

use crate::{
    config::Config,
    extract::ExtractionEngine,
    fetch::FetchEngine,
    features::FeatureMap,
    namespace::{NameSpace, Overlay},
};
use failure::format_err;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Forced mode (`buildsys base p1 p2 -- k=v`): only the named packages are actually built; every
/// other package in the graph has its `built` flag set without running its commands, and its
/// `buildinfo_hash` taken from the existing `.build.info` on disk.
#[derive(Debug, Clone, Default)]
pub struct Forced {
    names: Option<HashSet<String>>,
}

impl Forced {
    pub fn none() -> Self {
        Forced { names: None }
    }

    pub fn of(names: Vec<String>) -> Self {
        Forced {
            names: Some(names.into_iter().collect()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.names.is_some()
    }

    pub fn is_forced(&self, pkg_name: &str) -> bool {
        match &self.names {
            Some(names) => names.contains(pkg_name),
            None => true,
        }
    }
}

pub struct Context {
    pub pwd: PathBuf,
    pub config: Config,
    pub features: Arc<FeatureMap>,
    pub overlay: Overlay,
    pub fetch: FetchEngine,
    pub extract: ExtractionEngine,
    pub forced: Forced,
    pub logger: slog::Logger,
    namespaces: Mutex<HashMap<String, Arc<NameSpace>>>,
}

impl Context {
    pub fn new(
        pwd: PathBuf,
        config: Config,
        overlay: Overlay,
        forced: Forced,
        logger: slog::Logger,
    ) -> crate::util::error::Result<Self> {
        let fetch = FetchEngine::new(&pwd, config.tarball_cache.clone())?;
        let extract = ExtractionEngine::new(&pwd);
        Ok(Context {
            pwd,
            config,
            features: Arc::new(FeatureMap::new()),
            overlay,
            fetch,
            extract,
            forced,
            logger,
            namespaces: Mutex::new(HashMap::new()),
        })
    }

    /// Find-or-create the namespace with the given name (process-wide set, internal lock, as
    /// every other shared-resource table in this tool).
    pub fn find_namespace(&self, name: &str) -> Arc<NameSpace> {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(NameSpace::new(name, self.overlay.clone(), self.pwd.clone()))
            })
            .clone()
    }

    pub fn namespaces(&self) -> Vec<Arc<NameSpace>> {
        self.namespaces.lock().unwrap().values().cloned().collect()
    }

    pub fn digest_for(&self, ns: &str, pkg: &str) -> crate::util::error::Result<crate::fetch::Digest> {
        let relative = PathBuf::from("package").join(pkg).join("Digest");
        match self.overlay.resolve(&relative) {
            Some(path) => crate::fetch::Digest::load(&path),
            None => {
                let _ = ns;
                Ok(crate::fetch::Digest::default())
            }
        }
    }

    pub fn pkg_logger(&self, ns: &str, pkg: &str) -> slog::Logger {
        self.logger.new(slog::o!("ns" => ns.to_string(), "pkg" => pkg.to_string()))
    }
}

pub fn missing_recipe(ns: &str, pkg: &str) -> failure::Error {
    format_err!("no recipe found for package {} in namespace {}", pkg, ns)
}
