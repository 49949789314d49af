//! Turning configured tasks into schedulable units.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::graph::TaskNode;
use crate::process::{Capture, ExitCodePolicy, ProcessResult, ProcessRunner, SpawnSpec};

/// A task ready to be executed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    pub name: String,
    pub command: String,
    pub depends_on: Vec<String>,
    pub policy: ExitCodePolicy,
    pub capture: Capture,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl TaskPlan {
    /// `sh -c <command>` in the task directory.
    pub fn spawn_spec(&self) -> SpawnSpec {
        let spec = SpawnSpec::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .capture(self.capture)
            .policy(self.policy.clone());
        self.env
            .iter()
            .fold(spec, |spec, (key, value)| spec.env(key, value))
    }

    /// Wraps the plan in a [`TaskNode`] whose body runs it through `runner`.
    pub fn into_node(self, runner: &ProcessRunner) -> TaskNode<ProcessResult> {
        let runner = runner.clone();
        let spec = self.spawn_spec();
        TaskNode::new(self.name, move || runner.run(spec)).depends_on(self.depends_on)
    }
}

/// Summary of a plan, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary<'a> {
    pub name: &'a str,
    pub command: &'a str,
    pub depends_on: &'a [String],
}

impl<'a> From<&'a TaskPlan> for PlanSummary<'a> {
    fn from(plan: &'a TaskPlan) -> Self {
        Self {
            name: &plan.name,
            command: &plan.command,
            depends_on: &plan.depends_on,
        }
    }
}

/// Keeps the requested tasks and everything they transitively depend on,
/// in their original order. An empty request selects every plan.
///
/// # Errors
///
/// Returns [`Error::TaskNotFound`] for a requested name with no plan.
pub fn select(plans: Vec<TaskPlan>, requested: &[String]) -> Result<Vec<TaskPlan>> {
    if requested.is_empty() {
        return Ok(plans);
    }

    let by_name: HashMap<&str, &TaskPlan> = plans.iter().map(|p| (p.name.as_str(), p)).collect();
    let mut keep: HashSet<String> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();

    for name in requested {
        if !by_name.contains_key(name.as_str()) {
            return Err(Error::TaskNotFound {
                name: name.clone(),
                available: plans
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        stack.push(name.as_str());
    }

    while let Some(current) = stack.pop() {
        if !keep.insert(current.to_string()) {
            continue;
        }
        // Unknown dependencies are left for the scheduler to report.
        if let Some(plan) = by_name.get(current) {
            stack.extend(plan.depends_on.iter().map(String::as_str));
        }
    }

    Ok(plans
        .into_iter()
        .filter(|p| keep.contains(&p.name))
        .collect())
}

/// Builds scheduler units for `plans`, all sharing `runner`.
pub fn task_nodes(plans: Vec<TaskPlan>, runner: &ProcessRunner) -> Vec<TaskNode<ProcessResult>> {
    plans
        .into_iter()
        .map(|plan| plan.into_node(runner))
        .collect()
}
