//! Spawning external programs with args+env+cwd, capturing merged stdout/stderr line-by-line
//! and feeding it to a logger. This is the only way user build commands, `tar`, `wget`, `git`,
//! `patch`, and friends are ever invoked; every outside effect of a build flows through here.

use crate::util::error::{ProcessError, Result};
use failure::ResultExt;
use slog::Logger;
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fmt,
    io::{BufRead, BufReader},
    path::Path,
    process::{Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
};

/// A builder for an external process, analogous to `std::process::Command` but cloneable and
/// printable (recipes print the commands they're about to record into `.build.info`-adjacent
/// logs).
#[derive(Clone, Debug)]
pub struct CommandRunner {
    program: OsString,
    args: Vec<OsString>,
    env: HashMap<String, OsString>,
    cwd: Option<OsString>,
}

impl fmt::Display for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "`{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", shell_escape::escape(arg.to_string_lossy()))?;
        }
        write!(f, "`")
    }
}

impl CommandRunner {
    pub fn new<T: AsRef<OsStr>>(program: T) -> Self {
        CommandRunner {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg<T: AsRef<OsStr>>(&mut self, arg: T) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<T: AsRef<OsStr>>(&mut self, args: &[T]) -> &mut Self {
        self.args.extend(args.iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn cwd<T: AsRef<OsStr>>(&mut self, path: T) -> &mut Self {
        self.cwd = Some(path.as_ref().to_os_string());
        self
    }

    pub fn env<T: AsRef<OsStr>>(&mut self, key: &str, val: T) -> &mut Self {
        self.env.insert(key.to_string(), val.as_ref().to_os_string());
        self
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(cwd) = self.cwd.as_ref().map(Path::new) {
            command.current_dir(cwd);
        }
        command.args(&self.args);
        for (k, v) in &self.env {
            command.env(k, v);
        }
        command
    }

    /// Run the process to completion, streaming merged stdout+stderr line-by-line to `logger`
    /// (and, when `echo` is set, to the package's `build.log`/stdout as well). A line containing
    /// `error:` is logged at `warn`, one containing `warning:` likewise, everything else at
    /// `info`. Returns success iff the child's exit status is zero.
    pub fn exec(&self, logger: &Logger) -> Result<()> {
        let mut command = self.build_command();
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().with_context(|_| {
            process_error(&format!("could not execute process {}", self), None)
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::channel::<String>();
        let tx2 = tx.clone();
        let out_logger = logger.clone();
        let t_out = thread::spawn(move || stream_lines(stdout, tx));
        let t_err = thread::spawn(move || stream_lines(stderr, tx2));

        // Lines arrive interleaved as they're produced; we don't try to preserve strict
        // stdout/stderr ordering relative to each other, only each stream's own order.
        for line in rx {
            log_line(&out_logger, &line);
        }

        let _ = t_out.join();
        let _ = t_err.join();

        let status = child.wait().with_context(|_| {
            process_error(&format!("could not wait on process {}", self), None)
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(process_error(
                &format!("process didn't exit successfully: {}", self),
                Some(status),
            )
            .into())
        }
    }
}

fn stream_lines(read: impl std::io::Read, tx: mpsc::Sender<String>) {
    let reader = BufReader::new(read);
    for line in reader.lines() {
        match line {
            Ok(l) => {
                if tx.send(l).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn log_line(logger: &Logger, line: &str) {
    if line.contains("error:") {
        slog::warn!(logger, "{}", line);
    } else if line.contains("warning:") {
        slog::warn!(logger, "{}", line);
    } else {
        slog::info!(logger, "{}", line);
    }
}

fn process_error(msg: &str, status: Option<ExitStatus>) -> ProcessError {
    let exit = match status {
        Some(s) => s.to_string(),
        None => "never executed".to_string(),
    };
    ProcessError {
        desc: format!("{} ({})", msg, exit),
        exit: status,
        output: None,
    }
}
