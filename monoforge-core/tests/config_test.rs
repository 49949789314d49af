use std::fs;
use std::path::PathBuf;

use monoforge_core::config::{Config, CONFIG_FILE_NAME};
use monoforge_core::plan::select;
use monoforge_core::process::{Capture, ExitCodePolicy};
use monoforge_core::Error;
use tempfile::TempDir;

const SAMPLE: &str = r#"
[workspace]
default_parallel = 4

[tasks]
lint = "cargo clippy"
build = { command = "cargo build", depends_on = ["lint"] }
test.command = "cargo test"
test.depends_on = ["build"]
test.exit_codes = [0, 101]
test.capture = "both"
test.cwd = "crates/app"
test.env = { RUST_LOG = "info" }
release = { command = "cargo publish", exit_codes = "inherit" }
"#;

#[test]
fn test_parse_task_forms() {
    let config = Config::parse(SAMPLE, "/repo").unwrap();
    assert_eq!(config.workspace.default_parallel, Some(4));

    let plans = config.task_plans().unwrap();
    let names: Vec<&str> = plans.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["lint", "build", "test", "release"]);

    let lint = &plans[0];
    assert_eq!(lint.command, "cargo clippy");
    assert!(lint.depends_on.is_empty());
    assert_eq!(lint.policy, ExitCodePolicy::FixedSet(vec![0]));
    assert_eq!(lint.capture, Capture::None);
    assert_eq!(lint.cwd, PathBuf::from("/repo"));

    let test = &plans[2];
    assert_eq!(test.depends_on, vec!["build"]);
    assert_eq!(test.policy, ExitCodePolicy::FixedSet(vec![0, 101]));
    assert_eq!(test.capture, Capture::Both);
    assert_eq!(test.cwd, PathBuf::from("/repo").join("crates/app"));
    assert_eq!(test.env, vec![("RUST_LOG".to_string(), "info".to_string())]);

    assert_eq!(plans[3].policy, ExitCodePolicy::Inherit);
}

#[test]
fn test_spawn_spec_runs_through_shell() {
    let config = Config::parse(SAMPLE, "/repo").unwrap();
    let plans = config.task_plans().unwrap();
    let spec = plans[1].spawn_spec();

    assert_eq!(spec.program(), "sh");
    assert_eq!(spec.arguments(), &["-c".to_string(), "cargo build".to_string()]);
    assert_eq!(spec.working_dir(), Some(std::path::Path::new("/repo")));
    assert_eq!(spec.command_line(), "sh -c cargo build");
}

#[test]
fn test_invalid_exit_codes_value() {
    let config = Config::parse(
        r#"
[tasks]
flaky = { command = "true", exit_codes = "sometimes" }
"#,
        "/repo",
    )
    .unwrap();

    let err = config.task_plans().unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { ref task, .. } if task == "flaky"));
}

#[test]
fn test_empty_command_rejected() {
    let config = Config::parse("[tasks]\nnothing = \"  \"\n", "/repo").unwrap();
    assert!(config.task_plans().is_err());
}

#[test]
fn test_malformed_toml() {
    let err = Config::parse("[tasks\nbroken", "/repo").unwrap_err();
    assert!(err.to_string().contains("TOML parse error"));
}

#[test]
fn test_select_pulls_in_transitive_dependencies() {
    let config = Config::parse(SAMPLE, "/repo").unwrap();
    let plans = config.task_plans().unwrap();

    let selected = select(plans, &["test".to_string()]).unwrap();
    let names: Vec<&str> = selected.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["lint", "build", "test"]);
}

#[test]
fn test_select_everything_when_empty() {
    let config = Config::parse(SAMPLE, "/repo").unwrap();
    let plans = config.task_plans().unwrap();

    assert_eq!(select(plans, &[]).unwrap().len(), 4);
}

#[test]
fn test_select_unknown_task() {
    let config = Config::parse(SAMPLE, "/repo").unwrap();
    let plans = config.task_plans().unwrap();

    let err = select(plans, &["deploy".to_string()]).unwrap_err();
    assert!(matches!(err, Error::TaskNotFound { ref name, .. } if name == "deploy"));
    assert!(err.to_string().contains("lint, build, test, release"));
}

#[test]
fn test_load_missing_config() {
    let temp_dir = TempDir::new().unwrap();
    let err = Config::load(temp_dir.path()).unwrap_err();
    assert!(matches!(err, Error::ConfigNotFound(_)));
}

#[test]
fn test_discover_from_nested_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::write(root.join(CONFIG_FILE_NAME), "[tasks]\nbuild = \"make\"\n").unwrap();
    let nested = root.join("packages").join("web");
    fs::create_dir_all(&nested).unwrap();

    let config = Config::discover(&nested).unwrap();
    assert_eq!(config.dir, root);
    assert_eq!(config.task_plans().unwrap()[0].cwd, root);
}

#[test]
fn test_load_reports_file_path_on_parse_error() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "tasks = 3").unwrap();

    let err = Config::load(temp_dir.path()).unwrap_err();
    assert!(err.to_string().contains(CONFIG_FILE_NAME));
}
