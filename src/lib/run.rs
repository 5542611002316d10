//! Top-level orchestration: discover a package's transitive recipe tree, check it for cycles,
//! then either dump it (`--parse-only`) or hand it to the scheduler for a real build.
//!
//! This is pure wiring, not a component in its own right: `main` calls into it to connect
//! `recipe::process`, `graph::DependencyGraph`, and `scheduler::Scheduler` into one pipeline.

use crate::{
    buildinfo::BuildUnit,
    context::Context,
    graph::DependencyGraph,
    package::Package,
    rebuild,
    recipe,
    scheduler::Scheduler,
    util::error::{ErrorKind, Result},
};
use std::{
    fs,
    io::Write,
    sync::Arc,
};

/// Walk `base_pkg`'s recipe tree to a fixed point: every package reachable by `depend()` is
/// processed exactly once, with a graph edge added for every dependency declaration (including
/// ones pointing at an already-processed package — a diamond dependency is only interpreted
/// once but still gets its own edge from each of its dependents).
pub fn discover(ctx: &Arc<Context>, base_pkg: &str) -> Result<DependencyGraph<Arc<Package>>> {
    let ns = ctx.find_namespace(base_pkg);
    let base = ns.find_or_create(base_pkg)?;
    base.lifecycle.mark_queued();

    let mut graph = DependencyGraph::new();
    let base_idx = graph.add_package(base.clone());
    let mut worklist = vec![(base_idx, base)];

    while let Some((idx, pkg)) = worklist.pop() {
        let discovered = recipe::process(ctx, &pkg)?;
        for dep in discovered {
            let dep_idx = graph.add_package(dep.clone());
            worklist.push((dep_idx, dep));
        }
        for dep in pkg.dependencies() {
            let dep_idx = graph
                .find(&dep)
                .expect("every dependency is registered as a graph node before its parent returns");
            graph.add_dependency(idx, dep_idx);
        }
    }

    Ok(graph)
}

/// Check the graph for cycles; on failure, log every cycled package as `{ns,pkg}`, then return
/// the scheduler error.
pub fn check_acyclic(ctx: &Context, graph: &DependencyGraph<Arc<Package>>) -> Result<()> {
    let cycled = graph.cycled_nodes();
    if cycled.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = cycled
        .iter()
        .map(|idx| {
            let pkg = graph.get(*idx);
            format!("{{{},{}}}", pkg.namespace, pkg.name)
        })
        .collect();
    slog::error!(ctx.logger, "Cycled Packages"; "packages" => names.join(", "));
    Err(ErrorKind::Cycle.into())
}

/// `--parse-only`: dump every package's recorded feature reads and dependency list without
/// scheduling a build.
pub fn parse_only_dump(ctx: &Context, graph: &DependencyGraph<Arc<Package>>) {
    for ns in ctx.namespaces() {
        println!("namespace {}", ns.name);
        for pkg in ns.all() {
            println!("  package {}", pkg.name);
            pkg.with_plan(|plan| {
                for unit in plan.build_info.units() {
                    match unit {
                        BuildUnit::FeatureValue { name, value } => {
                            println!("    feature {} = {}", name, value)
                        }
                        BuildUnit::FeatureNil { name } => println!("    feature {} = nil", name),
                        _ => {}
                    }
                }
            });
            let deps: Vec<String> = pkg.dependencies().iter().map(|d| d.qualified_name()).collect();
            if !deps.is_empty() {
                println!("    depends on {}", deps.join(", "));
            }
        }
    }
    let _ = graph;
}

/// Write `dependencies.dot` at process exit: one quoted `"ns:pkg" -> "ns:pkg";` line per edge.
pub fn write_dot(ctx: &Context, graph: &DependencyGraph<Arc<Package>>) -> Result<()> {
    let mut out = String::from("digraph dependencies {\n");
    for idx in graph.node_indices() {
        let pkg = graph.get(idx);
        for child_idx in graph.children(idx) {
            let dep = graph.get(child_idx);
            out.push_str(&format!(
                "  \"{}\" -> \"{}\";\n",
                pkg.qualified_name(),
                dep.qualified_name()
            ));
        }
    }
    out.push_str("}\n");
    let path = ctx.pwd.join("dependencies.dot");
    let mut file = fs::File::create(path)?;
    file.write_all(out.as_bytes())?;
    Ok(())
}

/// Run the full pipeline against an already-discovered, already-acyclic graph: hand it to the
/// scheduler, logging a line per finished package.
pub fn build_all(ctx: &Arc<Context>, graph: DependencyGraph<Arc<Package>>) -> Result<()> {
    let scheduler = Scheduler::new(ctx.config.threads_limit, ctx.config.keep_going);
    let logger = ctx.logger.clone();
    scheduler.run(
        graph,
        |pkg| rebuild::build(ctx, pkg, false),
        move |pkg| {
            slog::info!(logger, "finished"; "ns" => &pkg.namespace, "pkg" => &pkg.name);
        },
    )
}
