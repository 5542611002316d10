//! A content-addressed source-package build orchestrator: an embedded Lua recipe interpreter,
//! a dependency graph and scheduler, and a rebuild engine that only re-runs a package's build
//! commands when its recipe, fetched sources, or dependency hashes have actually changed.

pub mod buildinfo;
pub mod builddir;
pub mod cmd;
pub mod composer;
pub mod config;
pub mod context;
pub mod extract;
pub mod features;
pub mod fetch;
pub mod graph;
pub mod hash;
pub mod namespace;
pub mod package;
pub mod rebuild;
pub mod recipe;
pub mod run;
pub mod scheduler;
pub mod util;
