//! Because nothing ever works correctly...

pub use failure::Fail;
use std::process::{ExitStatus, Output};

pub type Result<T> = std::result::Result<T, failure::Error>;

/// Coarse classification of the places a build run can fail: recipe, fetch, extraction,
/// build-command, scheduler, and configuration errors. Human-readable detail lives in the
/// `failure::Error` context chain built up around whichever variant applies.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "recipe error")]
    Recipe,
    #[fail(display = "fetch error")]
    Fetch,
    #[fail(display = "extraction error")]
    Extraction,
    #[fail(display = "build command failed")]
    BuildCommand,
    #[fail(display = "dependency cycle detected")]
    Cycle,
    #[fail(display = "configuration error")]
    Configuration,
    #[doc(hidden)]
    #[fail(display = "this should be impossible")]
    __Nonexhaustive,
}

/// Raised when a spawned program exits non-zero or can't be spawned at all.
#[derive(Debug, Fail)]
#[fail(display = "{}", desc)]
pub struct ProcessError {
    pub desc: String,
    pub exit: Option<ExitStatus>,
    pub output: Option<Output>,
}
