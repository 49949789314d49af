//! Per-invocation state shared by commands.

use std::path::Path;

use crate::error::Result;
use crate::process::{ExitCodeSlot, ProcessRunner};
use crate::root::WorkspaceRootResolver;

/// Owns the memoized workspace root and the inherited exit code for one tool
/// invocation. Tests build their own instead of sharing a global.
#[derive(Default)]
pub struct Context {
    resolver: WorkspaceRootResolver,
    exit_code: ExitCodeSlot,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(resolver: WorkspaceRootResolver) -> Self {
        Self {
            resolver,
            exit_code: ExitCodeSlot::new(),
        }
    }

    /// Root for `start`, or the cached root if one was already resolved.
    pub async fn root(&self, start: &Path) -> &Path {
        self.resolver.resolve(start).await
    }

    /// # Errors
    ///
    /// Returns an error if the current directory cannot be read.
    pub async fn root_from_env(&self) -> Result<&Path> {
        self.resolver.resolve_from_env().await
    }

    /// A runner that abbreviates the resolved root in its logs and reports
    /// inherited exit codes to this context.
    pub fn runner(&self) -> ProcessRunner {
        let runner = ProcessRunner::new().with_exit_code_slot(self.exit_code.clone());
        match self.resolver.cached() {
            Some(root) => runner.with_root(root),
            None => runner,
        }
    }

    /// Exit code the invoking program should finish with, if any child ran
    /// under [`ExitCodePolicy::Inherit`](crate::process::ExitCodePolicy::Inherit)
    /// and failed.
    pub fn inherited_exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }
}
