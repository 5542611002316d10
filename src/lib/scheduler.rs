//! A persistent, condvar-driven worker pool that walks the dependency graph bottom-up: a
//! coordinator picks the next eligible (all-dependencies-finished) package, hands it to an idle
//! worker, and wakes waiting workers whenever a package finishes and is removed from the graph.
//!
//! This generalizes a one-shot layered pool (drain a graph in discrete layers with a fresh
//! scoped pool per layer) into a single persistent pool that keeps `threads_limit` workers
//! busy across the whole run, started and stopped once.

use crate::{graph::DependencyGraph, package::Package, util::error::Result};
use std::sync::{Arc, Condvar, Mutex};

struct Shared<F> {
    graph: DependencyGraph<Arc<Package>>,
    in_flight: usize,
    errors: Vec<(String, failure::Error)>,
    stop: bool,
    on_finish: F,
}

pub struct Scheduler {
    threads_limit: usize,
    keep_going: bool,
}

impl Scheduler {
    /// `threads_limit == 0` means unbounded (per `Config::threads_limit`'s documented contract);
    /// mapped here to the number of logical CPUs rather than collapsing to a single worker.
    pub fn new(threads_limit: usize, keep_going: bool) -> Self {
        let threads_limit = if threads_limit == 0 {
            num_cpus::get()
        } else {
            threads_limit
        };
        Scheduler {
            threads_limit,
            keep_going,
        }
    }

    /// Run `build` for every package in `graph`, leaves first. `on_finish` is called once per
    /// package, immediately after it is removed from the graph on success (the `packageFinished`
    /// hook). Stops dispatching new work on the first error unless `keep_going` was set, in
    /// which case the failed subtree is pruned and unrelated subtrees keep draining; every error
    /// hit along the way is collected and reported together at the end.
    pub fn run<B, F>(&self, graph: DependencyGraph<Arc<Package>>, build: B, on_finish: F) -> Result<()>
    where
        B: Fn(&Package) -> Result<()> + Sync,
        F: Fn(&Package) + Sync,
    {
        let state = Mutex::new(Shared {
            graph,
            in_flight: 0,
            errors: Vec::new(),
            stop: false,
            on_finish,
        });
        let cv = Condvar::new();

        crossbeam::scope(|scope| {
            for _ in 0..self.threads_limit {
                scope.spawn(|| self.worker_loop(&state, &cv, &build));
            }
        });

        let errors = state.into_inner().unwrap().errors;

        if errors.is_empty() {
            Ok(())
        } else {
            let summary = errors
                .iter()
                .map(|(name, e)| format!("{}: {}", name, e))
                .collect::<Vec<_>>()
                .join("; ");
            Err(failure::format_err!(
                "{} package(s) failed to build: {}",
                errors.len(),
                summary
            ))
        }
    }

    fn worker_loop<B, F>(&self, state: &Mutex<Shared<F>>, cv: &Condvar, build: &B)
    where
        B: Fn(&Package) -> Result<()> + Sync,
        F: Fn(&Package) + Sync,
    {
        loop {
            let next = {
                let mut guard = state.lock().unwrap();
                loop {
                    if guard.stop && guard.in_flight == 0 {
                        return;
                    }
                    if guard.graph.is_empty() && guard.in_flight == 0 {
                        return;
                    }
                    if !guard.errors.is_empty() && !self.keep_going {
                        guard.stop = true;
                        cv.notify_all();
                        if guard.in_flight == 0 {
                            return;
                        }
                    }

                    let candidate = guard.graph.topo_next(|pkg| !pkg.lifecycle.is_building());
                    match candidate {
                        Some(idx) => {
                            guard.in_flight += 1;
                            let pkg = guard.graph.get(idx).clone();
                            pkg.lifecycle.mark_building();
                            break Some((idx, pkg));
                        }
                        None => {
                            if guard.stop || guard.graph.is_empty() {
                                return;
                            }
                            guard = cv.wait(guard).unwrap();
                        }
                    }
                }
            };

            let (idx, pkg) = match next {
                Some(v) => v,
                None => return,
            };

            let result = build(&pkg);

            let mut guard = state.lock().unwrap();
            guard.in_flight -= 1;
            match result {
                Ok(()) => {
                    // `build` itself has already recorded whether its commands actually ran (the
                    // `was_built` flag); it's responsible for that, not the scheduler.
                    guard.graph.delete_node(idx);
                    (guard.on_finish)(&pkg);
                }
                Err(e) => {
                    guard.errors.push((pkg.qualified_name(), e));
                    if !self.keep_going {
                        guard.stop = true;
                    } else {
                        // Drop the failed package and everything that (transitively) depends on
                        // it, so keep-going mode still makes progress on unrelated subtrees.
                        let mut doomed = guard.graph.parents(idx);
                        guard.graph.delete_node(idx);
                        while let Some(p) = doomed.pop() {
                            if guard.graph.node_indices().contains(&p) {
                                doomed.extend(guard.graph.parents(p));
                                guard.graph.delete_node(p);
                            }
                        }
                    }
                }
            }
            cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builddir::BuildDir;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempdir::TempDir;

    #[test]
    fn builds_all_packages_in_dependency_order() {
        let tmp = TempDir::new("sched").unwrap();
        let mut graph: DependencyGraph<Arc<Package>> = DependencyGraph::new();

        let make = |name: &str| {
            Arc::new(Package::new(
                "ns",
                name,
                BuildDir::new(tmp.path(), "ns", name).unwrap(),
                PathBuf::new(),
            ))
        };
        let a = make("a");
        let b = make("b");
        let ia = graph.add_package(a);
        let ib = graph.add_package(b);
        graph.add_dependency(ia, ib);

        let built_order = Mutex::new(Vec::new());
        let scheduler = Scheduler::new(2, false);
        let count = AtomicUsize::new(0);

        scheduler
            .run(
                graph,
                |pkg: &Package| {
                    count.fetch_add(1, Ordering::SeqCst);
                    built_order.lock().unwrap().push(pkg.name.clone());
                    Ok(())
                },
                |_| {},
            )
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let order = built_order.into_inner().unwrap();
        assert_eq!(order.iter().position(|n| n == "b"), Some(0));
    }

    #[test]
    fn stops_on_first_error_without_keep_going() {
        let tmp = TempDir::new("sched").unwrap();
        let mut graph: DependencyGraph<Arc<Package>> = DependencyGraph::new();
        let make = |name: &str| {
            Arc::new(Package::new(
                "ns",
                name,
                BuildDir::new(tmp.path(), "ns", name).unwrap(),
                PathBuf::new(),
            ))
        };
        graph.add_package(make("a"));

        let scheduler = Scheduler::new(1, false);
        let result = scheduler.run(graph, |_| Err(failure::format_err!("boom")), |_| {});
        assert!(result.is_err());
    }
}
