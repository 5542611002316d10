use buildsys::{
    config::Config,
    context::{Context, Forced},
    namespace::Overlay,
    run,
    util::shell::Verbosity,
};
use clap::{App, Arg};
use console::style;
use failure::{format_err, Error, ResultExt};
use slog::{o, Drain, Logger};
use std::{path::PathBuf, process::exit, sync::Arc, time::Instant};

fn cli() -> App<'static, 'static> {
    App::new("buildsys")
        .about("Content-addressed, recipe-driven source package build orchestrator")
        .arg(
            Arg::with_name("packages")
                .help("<base-package> followed by any packages to force-rebuild")
                .required(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("features")
                .help("key=value feature assignments")
                .multiple(true)
                .last(true),
        )
        .arg(Arg::with_name("clean").long("clean").help("clean every package's work dir before its build"))
        .arg(
            Arg::with_name("cache-server")
                .long("cache-server")
                .takes_value(true)
                .value_name("url")
                .help("enable the build cache (fetch-from)"),
        )
        .arg(
            Arg::with_name("tarball-cache")
                .long("tarball-cache")
                .takes_value(true)
                .value_name("url")
                .help("enable the tarball cache (fetch mirror)"),
        )
        .arg(
            Arg::with_name("overlay")
                .long("overlay")
                .takes_value(true)
                .value_name("path")
                .number_of_values(1)
                .multiple(true)
                .help("push an overlay to the top of the recipe search path"),
        )
        .arg(
            Arg::with_name("build-info-ignore-fv")
                .long("build-info-ignore-fv")
                .takes_value(true)
                .value_name("key")
                .number_of_values(1)
                .multiple(true)
                .help("ignore a feature when computing buildinfo hashes"),
        )
        .arg(
            Arg::with_name("parse-only")
                .long("parse-only")
                .help("process recipes and print feature values and namespaces, then exit"),
        )
        .arg(
            Arg::with_name("keep-going")
                .long("keep-going")
                .help("drain in-flight builds instead of exiting on first failure"),
        )
        .arg(
            Arg::with_name("quietly")
                .long("quietly")
                .help("redirect per-package build output to a log file instead of stdout"),
        )
        .arg(
            Arg::with_name("keep-staging")
                .long("keep-staging")
                .help("do not remove a package's staging dir after its build"),
        )
        .arg(
            Arg::with_name("parallel-packages")
                .long("parallel-packages")
                .takes_value(true)
                .value_name("N")
                .help("worker cap; also disables parallel extraction"),
        )
}

fn build_logger(quietly: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let min_level = if quietly { slog::Level::Warning } else { slog::Level::Info };
    let drain = slog::LevelFilter::new(drain, min_level).fuse();
    Logger::root(drain, o!())
}

fn go() -> Result<String, Error> {
    let args = cli().get_matches();

    let mut packages = args.values_of("packages").unwrap();
    let base_package = packages.next().expect("clap enforces at least one value").to_string();
    let forced: Vec<String> = packages.map(|s| s.to_string()).collect();

    let mut config = Config::new();
    if args.is_present("clean") {
        config.clean_before_build = true;
    }
    if args.is_present("keep-going") {
        config.keep_going = true;
    }
    if args.is_present("keep-staging") {
        config.keep_staging = true;
    }
    if args.is_present("quietly") {
        config.quietly = true;
        config.verbosity(Verbosity::Quiet);
    }
    if args.is_present("parse-only") {
        config.parse_only = true;
    }
    config.cache_server = args.value_of("cache-server").map(|s| s.to_string());
    config.tarball_cache = args.value_of("tarball-cache").map(|s| s.to_string());
    if let Some(n) = args.value_of("parallel-packages") {
        let n: usize = n
            .parse()
            .with_context(|_| format!("--parallel-packages expects a number, got {}", n))?;
        config.set_parallel_packages(n);
    }

    let overlays: Vec<PathBuf> = args
        .values_of("overlay")
        .map(|v| v.map(PathBuf::from).collect())
        .unwrap_or_default();
    let overlay = Overlay::new(overlays);

    let forced_mode = if forced.is_empty() {
        Forced::none()
    } else {
        Forced::of(forced)
    };

    let logger = build_logger(config.quietly);

    let ctx = Arc::new(
        Context::new(PathBuf::from("."), config, overlay, forced_mode, logger)
            .with_context(|e| format!("could not set up build context: {}", e))?,
    );

    for key in args.values_of("build-info-ignore-fv").into_iter().flatten() {
        ctx.features.ignore(key);
    }

    for kv in args.values_of("features").into_iter().flatten() {
        ctx.features
            .set_kv(kv)
            .map_err(|e| format_err!("invalid feature assignment {}: {}", kv, e))?;
    }

    let graph = run::discover(&ctx, &base_package)?;
    run::check_acyclic(&ctx, &graph)?;

    if ctx.config.parse_only {
        run::parse_only_dump(&ctx, &graph);
        run::write_dot(&ctx, &graph)?;
        return Ok("parsed recipes".to_string());
    }

    // Written up front: the scheduler destructively removes nodes from the graph as packages
    // finish, so this is the last point at which the full edge set is available.
    run::write_dot(&ctx, &graph)?;

    run::build_all(&ctx, graph).map(|()| format!("built {}", base_package))
}

fn main() {
    let start = Instant::now();
    let res = go();

    match res {
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            exit(1);
        }
        Ok(msg) => {
            let elapsed = start.elapsed();
            println!(
                "{} {} [{}.{}s]",
                style("done!").green().bold(),
                msg,
                elapsed.as_secs(),
                elapsed.subsec_millis() / 10
            );
            exit(0);
        }
    }
}
