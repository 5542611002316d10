//! The embedded recipe interpreter: a thin `mlua` binding over the fixed API recipes use to
//! declare dependencies, fetches, extractions, and build commands into a `Package`.
//!
//! Each recipe gets its own freshly constructed `Lua` instance — no state is shared between
//! recipes — with API functions closing over `Arc<Context>` and `Arc<Package>` so they can push
//! straight into the package's plan without an intermediate AST of their own.

use crate::{
    buildinfo::BuildUnit,
    cmd::CommandRunner,
    context::Context,
    extract::{ExtractionUnit, GitDirMode},
    fetch::FetchUnit,
    package::Package,
    util::error::Result,
};
use failure::{bail, ResultExt};
use mlua::{Lua, UserData, UserDataMethods, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc, Mutex},
};

/// Interpret `pkg`'s recipe file, recording everything it declares onto `pkg`. Returns the
/// dependency packages discovered for the first time by this run (via `depend()`), for the
/// caller to queue for their own processing pass.
pub fn process(ctx: &Arc<Context>, pkg: &Arc<Package>) -> Result<Vec<Arc<Package>>> {
    let source = fs::read_to_string(&pkg.recipe_path).with_context(|e| {
        format!("could not read recipe {}: {}", pkg.recipe_path.display(), e)
    })?;
    let hash = crate::hash::hash_file(&pkg.recipe_path)
        .with_context(|e| format!("could not hash recipe {}: {}", pkg.recipe_path.display(), e))?;
    pkg.push_build_unit(BuildUnit::PackageFile {
        path: display_path(&pkg.recipe_path),
        hash,
    });

    let digest = ctx
        .digest_for(&pkg.namespace, &pkg.name)
        .with_context(|e| format!("could not load digest for {}: {}", pkg.qualified_name(), e))?;
    pkg.set_digest(digest);

    let discovered = Arc::new(Mutex::new(Vec::new()));
    let lua = Lua::new();
    register_api(&lua, ctx.clone(), pkg.clone(), discovered.clone()).map_err(|e| lua_error(pkg, e))?;

    let chunk_name = pkg.recipe_path.display().to_string();
    lua.load(&source)
        .set_name(&chunk_name)
        .exec()
        .map_err(|e| lua_error(pkg, e))?;

    drop(lua);
    let discovered = discovered.lock().unwrap().clone();
    Ok(discovered)
}

fn display_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    s.strip_prefix("./").unwrap_or(&s).to_string()
}

fn lua_error(pkg: &Package, err: mlua::Error) -> failure::Error {
    failure::format_err!("recipe error in {}: {}", pkg.qualified_name(), err)
}

fn to_lua_err(e: failure::Error) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_string())
}

/// `mode ∈ { dl, git, linkgit, link, copyfile, copygit, copy, deps }`'s basename-derivation for
/// the git-backed methods: the final path component of the URI, trailing slash stripped.
fn git_local_name(uri: &str) -> String {
    Path::new(uri.trim_end_matches('/'))
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| uri.to_string())
}

fn register_api(
    lua: &Lua,
    ctx: Arc<Context>,
    pkg: Arc<Package>,
    discovered: Arc<Mutex<Vec<Arc<Package>>>>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("name", {
        let pkg = pkg.clone();
        lua.create_function(move |_, ()| Ok(pkg.name.clone()))?
    })?;

    globals.set("feature", {
        let ctx = ctx.clone();
        let pkg = pkg.clone();
        lua.create_function(
            move |_, (key, value, override_): (String, Option<String>, Option<bool>)| {
                match value {
                    None => match ctx.features.get(&pkg.name, &key) {
                        Some(v) => {
                            pkg.push_build_unit(BuildUnit::FeatureValue {
                                name: key.clone(),
                                value: v.clone(),
                            });
                            Ok(Some(v))
                        }
                        None => {
                            pkg.push_build_unit(BuildUnit::FeatureNil { name: key });
                            Ok(None)
                        }
                    },
                    Some(v) => {
                        ctx.features.set(&key, &v, override_.unwrap_or(false));
                        Ok(None)
                    }
                }
            },
        )?
    })?;

    globals.set("depend", {
        let ctx = ctx.clone();
        let pkg = pkg.clone();
        let discovered = discovered.clone();
        lua.create_function(move |_, (names, locally): (Value, Option<bool>)| {
            let locally = locally.unwrap_or(false);
            let list = lua_string_or_list(&names, "depend", 1)?;
            for dep_name in list {
                let dep = ctx
                    .find_namespace(&pkg.namespace)
                    .find_or_create(&dep_name)
                    .map_err(to_lua_err)?;
                if dep.lifecycle.try_mark_queued() {
                    discovered.lock().unwrap().push(dep.clone());
                }
                pkg.add_dependency(dep, locally);
            }
            Ok(())
        })?
    })?;

    globals.set("builddir", {
        let pkg = pkg.clone();
        lua.create_function(move |_, clean: Option<bool>| {
            if clean.unwrap_or(false) {
                pkg.builddir.clean().map_err(to_lua_err)?;
            }
            Ok(BuildDirHandle { pkg: pkg.clone() })
        })?
    })?;

    globals.set("intercept", {
        let pkg = pkg.clone();
        lua.create_function(move |_, ()| {
            pkg.flags.intercept_install.store(true, Ordering::Relaxed);
            Ok(())
        })?
    })?;

    globals.set("interceptstaging", {
        let pkg = pkg.clone();
        lua.create_function(move |_, ()| {
            pkg.flags.intercept_staging.store(true, Ordering::Relaxed);
            Ok(())
        })?
    })?;

    globals.set("hashoutput", {
        let pkg = pkg.clone();
        lua.create_function(move |_, ()| {
            pkg.flags.hash_output.store(true, Ordering::Relaxed);
            Ok(())
        })?
    })?;

    globals.set("buildlocally", {
        let pkg = pkg.clone();
        lua.create_function(move |_, ()| {
            pkg.flags.disable_fetch_from.store(true, Ordering::Relaxed);
            Ok(())
        })?
    })?;

    globals.set("keepstaging", {
        let pkg = pkg.clone();
        lua.create_function(move |_, ()| {
            pkg.flags.suppress_remove_staging.store(true, Ordering::Relaxed);
            Ok(())
        })?
    })?;

    Ok(())
}

fn lua_string_or_list(value: &Value, func: &str, pos: usize) -> mlua::Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.to_str()?.to_string()]),
        Value::Table(t) => {
            let mut out = Vec::new();
            for entry in t.sequence_values::<String>() {
                out.push(entry?);
            }
            Ok(out)
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "{}: argument {} must be a string or a table of strings, got {}",
            func,
            pos,
            other.type_name()
        ))),
    }
}

/// The handle `builddir()` returns to recipes: the surface through which a recipe declares
/// fetches, extractions, and build commands.
struct BuildDirHandle {
    pkg: Arc<Package>,
}

impl BuildDirHandle {
    fn fetch(&self, uri: &str, method: &str, extra: Option<Value>) -> Result<()> {
        match method {
            "dl" => {
                let decompress = extract_bool_extra(&extra, "fetch", "dl")?;
                self.pkg
                    .add_fetch(FetchUnit::download(uri.to_string(), decompress, None));
            }
            "git" => {
                let refspec = match extra {
                    Some(Value::String(s)) => s.to_str()?.to_string(),
                    Some(Value::Nil) | None => "origin/master".to_string(),
                    _ => bail!("fetch: git's extra argument must be a refspec string"),
                };
                let local = git_local_name(uri);
                self.pkg
                    .add_fetch(FetchUnit::git(uri.to_string(), local.clone(), refspec));
                self.pkg.add_extraction(ExtractionUnit::GitDir {
                    mode: GitDirMode::Fetch,
                    uri: local,
                    to: String::new(),
                    head_sha: String::new(),
                    dirty_sha: None,
                });
            }
            "linkgit" => {
                self.pkg.add_extraction(ExtractionUnit::GitDir {
                    mode: GitDirMode::Link,
                    uri: git_local_name(uri),
                    to: String::new(),
                    head_sha: String::new(),
                    dirty_sha: None,
                });
            }
            "copygit" => {
                self.pkg.add_extraction(ExtractionUnit::GitDir {
                    mode: GitDirMode::Copy,
                    uri: git_local_name(uri),
                    to: String::new(),
                    head_sha: String::new(),
                    dirty_sha: None,
                });
            }
            "link" => {
                self.pkg.add_fetch(FetchUnit::link(uri.to_string()));
                self.pkg.lifecycle.mark_code_updated();
            }
            "copy" => {
                self.pkg.add_fetch(FetchUnit::copy(uri.to_string()));
                self.pkg.lifecycle.mark_code_updated();
            }
            "copyfile" => {
                self.pkg.add_extraction(ExtractionUnit::FileCopy {
                    path: uri.to_string(),
                    to: String::new(),
                    hash: String::new(),
                });
            }
            "deps" => {
                let direct_only = extract_bool_extra(&extra, "fetch", "deps")?;
                self.pkg.set_deps_extract(PathBuf::from(uri), direct_only);
                self.pkg.lifecycle.mark_code_updated();
            }
            other => bail!("fetch: unrecognized method {:?}", other),
        }
        Ok(())
    }

    fn extract(&self, path: &str) -> Result<()> {
        let unit = if path.ends_with(".zip") {
            ExtractionUnit::Zip {
                path: path.to_string(),
                to: String::new(),
                hash: String::new(),
            }
        } else {
            ExtractionUnit::Tar {
                path: path.to_string(),
                to: String::new(),
                hash: String::new(),
            }
        };
        self.pkg.add_extraction(unit);
        Ok(())
    }

    fn patch(&self, subdir: &str, level: u32, patches: Vec<String>) -> Result<()> {
        for path in patches {
            self.pkg.add_extraction(ExtractionUnit::Patch {
                level,
                apply_dir: subdir.to_string(),
                path,
                hash: String::new(),
            });
        }
        Ok(())
    }

    fn cmd(&self, subdir: &str, program: &str, args: Vec<String>, env: Vec<(String, String)>) -> Result<()> {
        let mut runner = CommandRunner::new(program);
        runner.args(&args);
        runner.cwd(self.pkg.builddir.work.join(subdir));
        for (k, v) in env {
            runner.env(&k, v);
        }
        self.pkg.add_command(runner);
        Ok(())
    }

    fn shell(&self, subdir: &str, command: &str, env: Vec<(String, String)>) -> Result<()> {
        let mut runner = CommandRunner::new("bash");
        runner.arg("-c").arg(command);
        runner.cwd(self.pkg.builddir.work.join(subdir));
        for (k, v) in env {
            runner.env(&k, v);
        }
        self.pkg.add_command(runner);
        Ok(())
    }

    fn installfile(&self, path: &str) -> Result<()> {
        self.pkg.add_install_file(PathBuf::from(path), PathBuf::from(path));
        Ok(())
    }

    fn restore(&self, uri: &str, method: &str) -> Result<()> {
        if method != "copyfile" {
            bail!("restore: unrecognized method {:?}", method);
        }
        let mut runner = CommandRunner::new("cp");
        runner.arg("-dpRuf").arg(uri).arg(".");
        runner.cwd(&self.pkg.builddir.work);
        self.pkg.add_command(runner);
        Ok(())
    }

    fn invokebuild(&self, target: &str, buildsys_flags: Vec<String>, recipe_flags: Vec<String>) -> Result<()> {
        let exe = std::env::current_exe()
            .with_context(|e| format!("could not determine current executable: {}", e))?;
        let mut runner = CommandRunner::new(exe);
        runner.arg(target);
        runner.args(&buildsys_flags);
        if !recipe_flags.is_empty() {
            runner.arg("--");
            runner.args(&recipe_flags);
        }
        runner.cwd(&self.pkg.builddir.work);
        self.pkg.add_command(runner);
        Ok(())
    }

    fn mkdir(&self, path: &str, args: Vec<String>) -> Result<()> {
        let mut runner = CommandRunner::new("mkdir");
        runner.arg("-p").arg(path);
        runner.args(&args);
        runner.cwd(&self.pkg.builddir.work);
        self.pkg.add_command(runner);
        Ok(())
    }

    fn sed(&self, path: &str, expression: &str, files: Vec<String>) -> Result<()> {
        let mut runner = CommandRunner::new("sed");
        runner.arg("-i").arg("-e").arg(expression);
        runner.args(&files);
        runner.cwd(self.pkg.builddir.work.join(path));
        self.pkg.add_command(runner);
        Ok(())
    }
}

fn extract_bool_extra(extra: &Option<Value>, func: &str, method: &str) -> mlua::Result<bool> {
    match extra {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::Nil) | None => Ok(false),
        _ => Err(mlua::Error::RuntimeError(format!(
            "{}: {}'s extra argument must be a boolean",
            func, method
        ))),
    }
}

impl UserData for BuildDirHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method(
            "fetch",
            |_, this, (uri, method, extra): (String, String, Option<Value>)| {
                this.fetch(&uri, &method, extra).map_err(to_lua_err)
            },
        );
        methods.add_method("extract", |_, this, path: String| {
            this.extract(&path).map_err(to_lua_err)
        });
        methods.add_method(
            "patch",
            |_, this, (subdir, level, patches): (String, u32, Vec<String>)| {
                this.patch(&subdir, level, patches).map_err(to_lua_err)
            },
        );
        methods.add_method(
            "cmd",
            |_, this, (subdir, program, args, env): (String, String, Vec<String>, Option<Vec<(String, String)>>)| {
                this.cmd(&subdir, &program, args, env.unwrap_or_default())
                    .map_err(to_lua_err)
            },
        );
        methods.add_method(
            "shell",
            |_, this, (subdir, command, env): (String, String, Option<Vec<(String, String)>>)| {
                this.shell(&subdir, &command, env.unwrap_or_default())
                    .map_err(to_lua_err)
            },
        );
        methods.add_method("installfile", |_, this, path: String| {
            this.installfile(&path).map_err(to_lua_err)
        });
        methods.add_method("restore", |_, this, (uri, method): (String, String)| {
            this.restore(&uri, &method).map_err(to_lua_err)
        });
        methods.add_method(
            "invokebuild",
            |_, this, (target, buildsys_flags, recipe_flags): (String, Option<Vec<String>>, Option<Vec<String>>)| {
                this.invokebuild(&target, buildsys_flags.unwrap_or_default(), recipe_flags.unwrap_or_default())
                    .map_err(to_lua_err)
            },
        );
        methods.add_method("mkdir", |_, this, (path, args): (String, Option<Vec<String>>)| {
            this.mkdir(&path, args.unwrap_or_default()).map_err(to_lua_err)
        });
        methods.add_method(
            "sed",
            |_, this, (path, expression, files): (String, String, Vec<String>)| {
                this.sed(&path, &expression, files).map_err(to_lua_err)
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, context::Forced, namespace::Overlay};
    use tempdir::TempDir;

    fn write_recipe(tmp: &TempDir, ns: &str, pkg: &str, body: &str) -> PathBuf {
        let dir = tmp.path().join("package").join(pkg);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.lua", pkg));
        fs::write(&path, body).unwrap();
        let _ = ns;
        path
    }

    fn make_ctx(tmp: &TempDir) -> Arc<Context> {
        let overlay = Overlay::new(vec![tmp.path().to_path_buf()]);
        Arc::new(
            Context::new(
                tmp.path().to_path_buf(),
                Config::new(),
                overlay,
                Forced::none(),
                slog::Logger::root(slog::Discard, slog::o!()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn empty_recipe_records_only_package_file() {
        let tmp = TempDir::new("recipe").unwrap();
        write_recipe(&tmp, "a", "a", "name()");
        let ctx = make_ctx(&tmp);
        let ns = ctx.find_namespace("a");
        let pkg = ns.find_or_create("a").unwrap();

        let discovered = process(&ctx, &pkg).unwrap();
        assert!(discovered.is_empty());

        pkg.with_plan(|plan| {
            assert_eq!(plan.build_info.units().len(), 1);
        });
    }

    #[test]
    fn feature_reads_are_recorded() {
        let tmp = TempDir::new("recipe").unwrap();
        write_recipe(&tmp, "a", "a", "feature(\"x\")");
        let ctx = make_ctx(&tmp);
        ctx.features.set("x", "on", false);
        let ns = ctx.find_namespace("a");
        let pkg = ns.find_or_create("a").unwrap();

        process(&ctx, &pkg).unwrap();
        pkg.with_plan(|plan| {
            assert!(plan
                .build_info
                .units()
                .iter()
                .any(|u| u.print() == "FeatureValue x on"));
        });
    }

    #[test]
    fn depend_creates_and_queues_dependency_once() {
        let tmp = TempDir::new("recipe").unwrap();
        write_recipe(&tmp, "a", "a", "depend(\"b\")");
        write_recipe(&tmp, "a", "b", "name()");
        let ctx = make_ctx(&tmp);
        let ns = ctx.find_namespace("a");
        let pkg = ns.find_or_create("a").unwrap();

        let discovered = process(&ctx, &pkg).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "b");
        assert_eq!(pkg.dependencies().len(), 1);
    }

    #[test]
    fn intercept_sets_flag() {
        let tmp = TempDir::new("recipe").unwrap();
        write_recipe(&tmp, "a", "a", "intercept()\ninterceptstaging()");
        let ctx = make_ctx(&tmp);
        let ns = ctx.find_namespace("a");
        let pkg = ns.find_or_create("a").unwrap();

        process(&ctx, &pkg).unwrap();
        assert!(pkg.flags.intercept_install.load(Ordering::Relaxed));
        assert!(pkg.flags.intercept_staging.load(Ordering::Relaxed));
    }

    #[test]
    fn builddir_handle_records_fetch_and_command() {
        let tmp = TempDir::new("recipe").unwrap();
        write_recipe(
            &tmp,
            "a",
            "a",
            r#"
            local bd = builddir()
            bd:cmd(".", "true", {})
            "#,
        );
        let ctx = make_ctx(&tmp);
        let ns = ctx.find_namespace("a");
        let pkg = ns.find_or_create("a").unwrap();

        process(&ctx, &pkg).unwrap();
        pkg.with_plan(|plan| {
            assert_eq!(plan.commands.len(), 1);
        });
    }
}
