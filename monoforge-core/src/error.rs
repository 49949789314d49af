//! Error types and result aliases.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::process::Stream;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error in {context}: {error}")]
    Toml {
        error: toml::de::Error,
        context: String,
    },

    #[error("Config file not found above {0}. Expected 'monoforge.toml' in the workspace.")]
    ConfigNotFound(PathBuf),

    #[error("Invalid config for task '{task}': {message}")]
    InvalidConfig { task: String, message: String },

    #[error("Failed to execute {command}: {source} (called from {origin})")]
    Spawn {
        command: String,
        source: std::io::Error,
        origin: CallSite,
    },

    #[error("Process failed with code {code}: {command} (called from {origin})")]
    ExitCode {
        command: String,
        code: i32,
        origin: CallSite,
    },

    #[error("Failed to execute {command} - signal {signal} (called from {origin})")]
    Signal {
        command: String,
        signal: i32,
        origin: CallSite,
    },

    #[error("Output reader for {stream} failed: {message}")]
    OutputReader { stream: Stream, message: String },

    #[error("Circular dependency detected involving: {}. Fix the declared task dependencies.", .members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'. Available tasks: {available}")]
    UnknownDependency {
        task: String,
        dependency: String,
        available: String,
    },

    #[error("Task not found: {name}. Available tasks: {available}")]
    TaskNotFound { name: String, available: String },

    #[error("Task '{task}' failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<Error>,
    },

    /// One or more units of a level failed while running with
    /// [`ExecutionPolicy::SettleAll`](crate::graph::ExecutionPolicy::SettleAll).
    ///
    /// Displays as the first failure; `failed` lists every failed unit.
    #[error("{first}")]
    Aggregate {
        failed: Vec<String>,
        #[source]
        first: Box<Error>,
    },
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Toml {
            error,
            context: "monoforge.toml".to_string(),
        }
    }
}

impl Error {
    /// Where the failing process was launched from, for process errors.
    pub fn origin(&self) -> Option<&CallSite> {
        match self {
            Error::Spawn { origin, .. }
            | Error::ExitCode { origin, .. }
            | Error::Signal { origin, .. } => Some(origin),
            Error::Task { source, .. } => source.origin(),
            Error::Aggregate { first, .. } => first.origin(),
            _ => None,
        }
    }

    /// Exit code of the failed process, if the failure was a rejected exit code.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ExitCode { code, .. } => Some(*code),
            Error::Task { source, .. } => source.exit_code(),
            Error::Aggregate { first, .. } => first.exit_code(),
            _ => None,
        }
    }
}

/// Source location and stack captured where a process was requested.
///
/// Process failures surface asynchronously, so the plumbing frame that builds
/// the error says little. This records the caller instead.
#[derive(Clone)]
pub struct CallSite {
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

impl CallSite {
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Captured only when `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` is enabled.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("location", &format_args!("{}", self.location))
            .field("backtrace", &self.backtrace.status())
            .finish()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
