use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod commands;
pub mod config;
pub mod executors;
pub mod runner;
pub mod session_store;
pub mod utils;

use crate::config::{AppContext, DispatchPaths};
use crate::runner::process::{OsProcesses, ProcessRegistry};

/// Dispatch - launch, track and resume external AI coding agents from your command line.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Start an agent run
  Run {
    agent: String,
    /// Prompt passed to the executor
    prompt: Vec<String>,
    /// Detach and return immediately; inspect later with `view`
    #[arg(long)]
    background: bool,
    /// Keep the run attached even if the agent defaults to background
    #[arg(long, conflicts_with = "background")]
    no_background: bool,
    /// Override the executor key for this run
    #[arg(long)]
    executor: Option<String>,
    /// Override the execution mode for this run
    #[arg(long)]
    mode: Option<String>,
  },
  /// Continue a tracked session with a new prompt
  #[command(visible_alias = "continue")]
  Resume {
    session_id: String,
    prompt: Vec<String>,
    #[arg(long)]
    background: bool,
    #[arg(long, conflicts_with = "background")]
    no_background: bool,
  },
  /// List tracked runs with their live status
  #[command(visible_alias = "runs")]
  List,
  /// Show one run in detail, including the tail of its log
  View {
    session_id: String,
    /// Number of log lines to show
    #[arg(long, default_value_t = 60)]
    lines: usize,
  },
  /// Signal a run to stop
  Stop { session_id: String },
  /// Drop all tracked sessions for an agent
  Clear { agent: String },
}

pub fn run() -> Result<()> {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
    .format_timestamp_secs()
    .try_init();

  let cli = Cli::parse();
  let cwd = std::env::current_dir()?;
  let config = config::load_config(&cwd)?;
  let ctx = AppContext {
    paths: DispatchPaths::new(cwd),
    config,
    processes: Arc::new(ProcessRegistry::new(Arc::new(OsProcesses))),
  };

  match cli.command {
    Commands::Run {
      agent,
      prompt,
      background,
      no_background,
      executor,
      mode,
    } => {
      let opts = commands::run::RunOptions {
        background: tri_state(background, no_background),
        executor,
        mode,
      };
      commands::run::run(&ctx, &agent, &prompt.join(" "), &opts)
    }
    Commands::Resume {
      session_id,
      prompt,
      background,
      no_background,
    } => commands::resume::run(
      &ctx,
      &session_id,
      &prompt.join(" "),
      tri_state(background, no_background),
    ),
    Commands::List => commands::list::run(&ctx),
    Commands::View { session_id, lines } => commands::view::run(&ctx, &session_id, lines),
    Commands::Stop { session_id } => commands::stop::run(&ctx, &session_id),
    Commands::Clear { agent } => commands::clear::run(&ctx, &agent),
  }
}

fn tri_state(yes: bool, no: bool) -> Option<bool> {
  if yes {
    Some(true)
  } else if no {
    Some(false)
  } else {
    None
  }
}
