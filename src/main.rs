use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use conductor::collab::{
    CommandVerifier, GitCli, NoopTracker, SubprocessAgent, VerifyCommand,
};
use conductor::controller::{Collaborators, RunController};
use conductor::errors::{AgentError, AgentResult};
use conductor::learning::FileLearningHistory;
use conductor::state::store::RunStateStore;
use conductor::RunConfig;

#[derive(Parser)]
#[command(name = "conductor", about = "Crash-resumable software-change agent runs", version)]
struct Cli {
    /// Repository the run operates on.
    #[arg(long, default_value = ".", global = true)]
    worktree: PathBuf,

    /// Directory for run documents, events and artifacts.
    #[arg(long, default_value = ".conductor", global = true)]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run for a task.
    Run {
        /// Task description or tracker reference.
        task: String,

        /// Run id; derived from the task when omitted.
        #[arg(long)]
        run_id: Option<String>,

        /// Agent CLI invoked for cognition and implementation.
        #[arg(long, default_value = "agent")]
        agent: String,

        /// Verification command as `name=shell`, repeatable.
        #[arg(long = "verify", value_parser = parse_verify_command)]
        verify_commands: Vec<VerifyCommand>,

        /// Plan and verify without mutating the repo or remote state.
        #[arg(long)]
        dry_run: bool,
    },
    /// Resume an interrupted or blocked run.
    Resume {
        run_id: String,

        #[arg(long, default_value = "agent")]
        agent: String,

        #[arg(long = "verify", value_parser = parse_verify_command)]
        verify_commands: Vec<VerifyCommand>,
    },
    /// Show a run's phase, step ledger and blocked reason.
    Status { run_id: String },
}

fn parse_verify_command(raw: &str) -> Result<VerifyCommand, String> {
    let (name, shell) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=shell, got `{raw}`"))?;
    if name.is_empty() || shell.is_empty() {
        return Err(format!("expected name=shell, got `{raw}`"));
    }
    Ok(VerifyCommand {
        name: name.to_string(),
        shell: shell.to_string(),
    })
}

fn build_controller(
    store: Arc<RunStateStore>,
    config: RunConfig,
    agent: &str,
) -> RunController {
    let agent = Arc::new(SubprocessAgent::new(agent, Vec::new()));
    let history = FileLearningHistory::new(config.state_dir.join("learning.jsonl"));
    let verifier = CommandVerifier::new(config.verify_commands.clone(), false);
    let collab = Collaborators {
        cognition: agent.clone(),
        implementer: agent,
        vcs: Arc::new(GitCli),
        runner: Arc::new(verifier),
        // Wired by embedders; the CLI completes runs at the PR boundary.
        provider: None,
        tracker: Arc::new(NoopTracker),
        history: Arc::new(history),
    };
    RunController::new(store, config, collab)
}

/// Flip the cancel flag on the first Ctrl-C and let the run wind down.
fn spawn_cancel_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested");
            let _ = tx.send(true);
        }
    });
    rx
}

fn print_status(store: &RunStateStore, run_id: &str) -> AgentResult<()> {
    let doc = store.load(run_id)?;
    println!("run:    {}", doc.run.id);
    println!("status: {}", doc.run.status.as_str());
    println!("phase:  {}", doc.run.phase);
    println!("attempt: {}", doc.run.attempt);
    if let Some(reason) = &doc.blocked_reason {
        println!("blocked: {reason}");
    }
    if let Some(review) = &doc.review {
        println!(
            "review: {} iteration(s), pr {:?}, converged: {}",
            review.iterations, review.pr_number, review.converged
        );
    }
    if !doc.steps.is_empty() {
        println!("steps:");
        for (id, rec) in &doc.steps {
            let error = rec
                .error
                .as_ref()
                .map(|e| format!(" ({})", e.code))
                .unwrap_or_default();
            println!("  {id}: {:?}{error}", rec.status);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> AgentResult<()> {
    let store = Arc::new(RunStateStore::new(&cli.state_dir)?);

    match cli.command {
        Command::Run {
            task,
            run_id,
            agent,
            verify_commands,
            dry_run,
        } => {
            let run_id = run_id.unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4()));
            let config = RunConfig::new(&cli.worktree, &cli.state_dir)
                .with_verify_commands(verify_commands)
                .with_dry_run(dry_run);
            let controller = build_controller(store, config, &agent);
            let cancel = spawn_cancel_signal();
            let outcome = controller.start(&run_id, &task, cancel).await?;
            tracing::info!(
                run_id = %outcome.run_id,
                status = outcome.status.as_str(),
                phase = %outcome.phase,
                "run stopped"
            );
            Ok(())
        }
        Command::Resume {
            run_id,
            agent,
            verify_commands,
        } => {
            let config = RunConfig::new(&cli.worktree, &cli.state_dir)
                .with_verify_commands(verify_commands);
            let controller = build_controller(store, config, &agent);
            let cancel = spawn_cancel_signal();
            let outcome = controller.resume(&run_id, cancel).await?;
            tracing::info!(
                run_id = %outcome.run_id,
                status = outcome.status.as_str(),
                phase = %outcome.phase,
                "run stopped"
            );
            Ok(())
        }
        Command::Status { run_id } => print_status(&store, &run_id),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}

fn report_error(err: &AgentError) {
    eprintln!("error [{}]: {err}", err.code());
    for step in err.remediation() {
        eprintln!("  hint: {step}");
    }
}
