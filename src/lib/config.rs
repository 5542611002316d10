//! Ambient process configuration: default parallelism, verbosity, and the cache URLs, layered
//! the same way the ancestor's `util::config::Config` is — sensible defaults first, then
//! overridden field-by-field by whatever the CLI actually parsed.

use crate::util::shell::{Shell, Verbosity};

/// Process-wide configuration, built once in `main` and threaded down into the scheduler and
/// rebuild engine. Unlike the ancestor's `Config`, there is no on-disk layered configuration
/// file and no registry/auth section — `buildsys` has no repository protocol to authenticate
/// against, so everything here comes from CLI flags or hardcoded defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// `--parallel-packages`; 0 means unbounded, matching the semantics of the scheduler's
    /// `threads_limit`. Defaults to the number of logical CPUs.
    pub threads_limit: usize,
    /// `--keep-going`.
    pub keep_going: bool,
    /// `--clean`.
    pub clean_before_build: bool,
    /// `--keep-staging`.
    pub keep_staging: bool,
    /// `--quietly`.
    pub quietly: bool,
    /// `--cache-server <url>`.
    pub cache_server: Option<String>,
    /// `--tarball-cache <url>`.
    pub tarball_cache: Option<String>,
    /// `--parse-only`.
    pub parse_only: bool,
    shell: Shell,
}

impl Config {
    pub fn new() -> Self {
        Config {
            threads_limit: num_cpus::get(),
            keep_going: false,
            clean_before_build: false,
            keep_staging: false,
            quietly: false,
            cache_server: None,
            tarball_cache: None,
            parse_only: false,
            shell: Shell::default(),
        }
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn verbosity(&mut self, v: Verbosity) {
        self.shell = Shell::new(v);
    }

    /// `--parallel-packages <N>` additionally disables parallel extraction, per spec; callers
    /// read `threads_limit == 1` to decide that.
    pub fn set_parallel_packages(&mut self, n: usize) {
        self.threads_limit = n;
    }

    pub fn extract_in_parallel(&self) -> bool {
        self.threads_limit != 1
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded_parallel() {
        let cfg = Config::new();
        assert!(cfg.extract_in_parallel());
        assert!(!cfg.keep_going);
    }

    #[test]
    fn single_worker_disables_parallel_extraction() {
        let mut cfg = Config::new();
        cfg.set_parallel_packages(1);
        assert!(!cfg.extract_in_parallel());
    }
}
