//! TOML configuration for workspace tasks.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::plan::TaskPlan;
use crate::process::{Capture, ExitCodePolicy};
use crate::root::find_up;

pub const CONFIG_FILE_NAME: &str = "monoforge.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskValue {
    Simple(String),
    Complex(TaskTable),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTable {
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub exit_codes: Option<ExitCodesValue>,
    #[serde(default)]
    pub capture: Capture,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

/// Either a list of accepted codes or one of `"inherit"` / `"any"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExitCodesValue {
    Codes(Vec<i32>),
    Named(String),
}

impl ExitCodesValue {
    fn to_policy(&self, task: &str) -> Result<ExitCodePolicy> {
        match self {
            ExitCodesValue::Codes(codes) => Ok(ExitCodePolicy::FixedSet(codes.clone())),
            ExitCodesValue::Named(name) => match name.to_lowercase().as_str() {
                "inherit" => Ok(ExitCodePolicy::Inherit),
                "any" => Ok(ExitCodePolicy::Any),
                other => Err(Error::InvalidConfig {
                    task: task.to_string(),
                    message: format!(
                        "exit_codes must be a list of codes, \"inherit\" or \"any\", got \"{}\"",
                        other
                    ),
                }),
            },
        }
    }
}

/// Workspace-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Maximum units of one level in flight at once.
    pub default_parallel: Option<usize>,
}

/// Contents of `monoforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskValue>,
    /// Directory holding the config file. Relative task paths resolve here.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl Config {
    /// Parses config text; `dir` anchors relative task directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid config TOML.
    pub fn parse(content: &str, dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.dir = dir.into();
        Ok(config)
    }

    /// Loads `monoforge.toml` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigNotFound`] if the file is missing.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Err(Error::ConfigNotFound(dir.to_path_buf()));
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content, dir).map_err(|e| match e {
            Error::Toml { error, .. } => Error::Toml {
                error,
                context: path.display().to_string(),
            },
            other => other,
        })
    }

    /// Loads the closest `monoforge.toml` at or above `start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigNotFound`] if no ancestor has one.
    pub fn discover(start: &Path) -> Result<Self> {
        let path = find_up(start, &[CONFIG_FILE_NAME])
            .ok_or_else(|| Error::ConfigNotFound(start.to_path_buf()))?;
        let dir = path.parent().unwrap_or(start);
        Self::load(dir)
    }

    /// Task plans in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error if a task carries an invalid `exit_codes` value.
    pub fn task_plans(&self) -> Result<Vec<TaskPlan>> {
        self.tasks
            .iter()
            .map(|(name, value)| self.to_plan(name, value))
            .collect()
    }

    fn to_plan(&self, name: &str, value: &TaskValue) -> Result<TaskPlan> {
        let plan = match value {
            TaskValue::Simple(command) => TaskPlan {
                name: name.to_string(),
                command: command.clone(),
                depends_on: Vec::new(),
                policy: ExitCodePolicy::default(),
                capture: Capture::None,
                cwd: self.dir.clone(),
                env: Vec::new(),
            },
            TaskValue::Complex(table) => TaskPlan {
                name: name.to_string(),
                command: table.command.clone(),
                depends_on: table.depends_on.clone(),
                policy: match table.exit_codes {
                    Some(ref codes) => codes.to_policy(name)?,
                    None => ExitCodePolicy::default(),
                },
                capture: table.capture,
                cwd: match table.cwd {
                    Some(ref cwd) => self.dir.join(cwd),
                    None => self.dir.clone(),
                },
                env: table
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        };

        if plan.command.trim().is_empty() {
            return Err(Error::InvalidConfig {
                task: name.to_string(),
                message: "command cannot be empty".to_string(),
            });
        }

        Ok(plan)
    }
}
