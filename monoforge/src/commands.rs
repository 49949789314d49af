//! Command implementations for the CLI.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context as _, Result};
use monoforge_core::graph::{order, ExecutionPolicy, Scheduler};
use monoforge_core::plan::{select, task_nodes, PlanSummary};
use monoforge_core::{Config, Context, Error, ExitCodePolicy, SpawnSpec, TaskPlan};
use owo_colors::OwoColorize;
use tracing::debug;

async fn resolve_root(ctx: &Context, start: Option<PathBuf>) -> Result<PathBuf> {
    let root = match start {
        Some(start) => {
            let start = start
                .canonicalize()
                .with_context(|| format!("Cannot access {}", start.display()))?;
            ctx.root(&start).await
        }
        None => ctx.root_from_env().await?,
    };
    Ok(root.to_path_buf())
}

fn load_config(root: &Path) -> Result<Config> {
    match Config::load(root) {
        Err(Error::ConfigNotFound(_)) => Ok(Config::discover(root)?),
        other => Ok(other?),
    }
}

fn load_plans(root: &Path, tasks: &[String]) -> Result<(Config, Vec<TaskPlan>)> {
    let config = load_config(root)?;
    let plans = select(config.task_plans()?, tasks)?;
    Ok((config, plans))
}

pub async fn cmd_root(ctx: &Context, start: Option<PathBuf>) -> Result<()> {
    let root = resolve_root(ctx, start).await?;
    println!("{}", root.display());
    Ok(())
}

pub async fn cmd_order(
    ctx: &Context,
    start: Option<PathBuf>,
    tasks: Vec<String>,
    json: bool,
) -> Result<()> {
    let root = resolve_root(ctx, start).await?;
    let (_, plans) = load_plans(&root, &tasks)?;
    let nodes = task_nodes(plans.clone(), &ctx.runner());
    let levels = order(&nodes)?;

    if json {
        let summaries: Vec<PlanSummary<'_>> = plans.iter().map(PlanSummary::from).collect();
        let data = serde_json::json!({
            "root": root,
            "levels": levels,
            "tasks": summaries,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{}", "[Execution Order]".bold().cyan());
    println!();

    if levels.is_empty() {
        println!("  {} No tasks configured", "WARNING:".yellow());
    } else {
        for (idx, level) in levels.iter().enumerate() {
            println!(
                "  {} {}",
                format!("{:2}", idx + 1).bright_black(),
                level.join(", ").bold().white()
            );
        }
    }
    println!();

    Ok(())
}

pub async fn cmd_run(
    ctx: &Context,
    start: Option<PathBuf>,
    tasks: Vec<String>,
    parallel: Option<usize>,
    continue_on_error: bool,
) -> Result<()> {
    let started = Instant::now();
    let root = resolve_root(ctx, start).await?;
    let (config, plans) = load_plans(&root, &tasks)?;
    let total = plans.len();

    let policy = if continue_on_error {
        ExecutionPolicy::SettleAll
    } else {
        ExecutionPolicy::AbortFast
    };
    let scheduler =
        Scheduler::new().with_max_parallel(parallel.or(config.workspace.default_parallel));

    println!("{}", "[Running tasks]".bold().cyan());
    println!();

    let report = scheduler
        .run_report(task_nodes(plans, &ctx.runner()), policy)
        .await?;
    let (results, failure) = report.into_parts();

    for (name, result) in &results {
        println!(
            "  {} {} {}",
            "OK".green(),
            name.bold().white(),
            format!("(exit {})", result.status().unwrap_or_default()).bright_black()
        );
    }

    println!();
    let duration = started.elapsed();
    match failure {
        None => {
            println!(
                "  {} All {} tasks completed successfully",
                "OK".green(),
                results.len().to_string().bold().green()
            );
            println!(
                "  {} Duration: {:.2}s",
                "TIME:".bright_black(),
                duration.as_secs_f64()
            );
            println!();
            Ok(())
        }
        Some(err) => {
            log_origin(&err);
            let failed = match err {
                Error::Aggregate { ref failed, .. } => failed.clone(),
                Error::Task { ref task, .. } => vec![task.clone()],
                _ => Vec::new(),
            };
            for name in &failed {
                println!("  {} {}", "FAILED".red(), name.bold().red());
            }
            println!(
                "  {} {} of {} tasks failed",
                "WARNING:".yellow(),
                failed.len().to_string().bold().red(),
                total
            );
            println!(
                "  {} Duration: {:.2}s",
                "TIME:".bright_black(),
                duration.as_secs_f64()
            );
            println!();
            Err(err.into())
        }
    }
}

pub async fn cmd_exec(
    ctx: &Context,
    start: Option<PathBuf>,
    program: String,
    args: Vec<String>,
) -> Result<()> {
    let root = resolve_root(ctx, start).await?;
    let spec = SpawnSpec::new(program)
        .args(args)
        .current_dir(&root)
        .policy(ExitCodePolicy::Inherit);

    if let Err(err) = ctx.runner().run(spec).await {
        log_origin(&err);
        return Err(err.into());
    }
    Ok(())
}

fn log_origin(err: &Error) {
    if let Some(origin) = err.origin() {
        debug!(location = %origin, "process failure backtrace:\n{}", origin.backtrace());
    }
}
