use clap::Parser;
use provis::checkpoint::{self, PlanSource};
use provis::config::{OnFail, RunContext};
use provis::core::{Setup, Status};
use provis::net::Ssh2Connector;
use provis::ui::TerminalPrompt;
use std::io;
use std::process::ExitCode;

/// Imperative, resumable server setup over SSH.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// A plan file to run, or (part of) the name of a checkpoint to resume.
    #[arg(short, long)]
    file: String,

    /// Show the output of the commands that run.
    #[arg(short, long)]
    verbose: bool,

    /// What to do when a command fails.
    #[arg(short = 'e', long, value_enum, default_value = "continue")]
    onfail: OnFail,

    /// Print the commands that would run without connecting anywhere.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = RunContext::new(cli.verbose, cli.debug, cli.onfail)?;

    let mut setup = match checkpoint::resolve(&cli.file, &ctx.cache_dir)? {
        PlanSource::Checkpoint(path) => {
            println!("Resuming from {}", path.display());
            checkpoint::resume(&path)?
        }
        PlanSource::PlanFile(path) => Setup::from_file(path)?,
    };

    let status =
        provis::run_plan(&mut setup, &ctx, Ssh2Connector, TerminalPrompt, io::stdout()).await?;

    // A run that completed with failures still exits zero; the resume
    // instruction has already been printed.
    if matches!(status, Status::Success | Status::Pending) {
        println!("Server setup complete!");
    }
    Ok(())
}
