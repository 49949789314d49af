mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use monoforge_core::Context;
use tracing::Level;

#[derive(Parser)]
#[command(name = "monoforge")]
#[command(about = "Run dependent tasks across a multi-package workspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory to start the workspace root search from.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short, long, global = true, action)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the workspace root.
    Root,
    /// Print the execution levels of the selected tasks.
    Order {
        tasks: Vec<String>,
        #[arg(long, action)]
        json: bool,
    },
    /// Run the selected tasks and everything they depend on.
    Run {
        tasks: Vec<String>,
        #[arg(short = 'j', long)]
        parallel: Option<usize>,
        #[arg(long, action)]
        continue_on_error: bool,
    },
    /// Run one command from the workspace root and exit with its code.
    Exec {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::new();
    let start = cli.cwd;

    match cli.command {
        Commands::Root => commands::cmd_root(&ctx, start).await?,
        Commands::Order { tasks, json } => commands::cmd_order(&ctx, start, tasks, json).await?,
        Commands::Run {
            tasks,
            parallel,
            continue_on_error,
        } => commands::cmd_run(&ctx, start, tasks, parallel, continue_on_error).await?,
        Commands::Exec { program, args } => commands::cmd_exec(&ctx, start, program, args).await?,
    }

    if let Some(code) = ctx.inherited_exit_code() {
        std::process::exit(code);
    }

    Ok(())
}
