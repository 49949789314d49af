//! Core library for workspace task orchestration.
//!
//! Three pieces do the real work: [`process`] runs external commands,
//! [`root`] finds the enclosing workspace root and [`graph`] orders and runs
//! dependent tasks.

pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod plan;
pub mod process;
pub mod root;

pub use config::{Config, CONFIG_FILE_NAME};
pub use context::Context;
pub use error::{CallSite, Error, Result};
pub use graph::{order, ExecutionPolicy, RunReport, Scheduler, TaskNode};
pub use plan::{select, task_nodes, TaskPlan};
pub use process::{
    Capture, ExitCodePolicy, ExitCodeSlot, OutputChunk, ProcessResult, ProcessRunner,
    RunningProcess, SpawnSpec, Stream,
};
pub use root::{find_up, MarkerFile, MarkerProbe, WorkspaceRootResolver};
