use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use patchgate::config::Config;
use patchgate::generate::OpenRouterGenerator;
use patchgate::pipeline::Pipeline;
use patchgate::retrieve::KeywordRetriever;
use patchgate::run::{Run, TaskType};
use patchgate::store::RunStore;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "patchgate",
    about = "An auditable review-and-patch pipeline for your codebase",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a task and execute the full pipeline against a repository
    Run {
        /// Path to the repository (defaults to current directory)
        #[arg(default_value = ".")]
        repo: PathBuf,

        /// What to do, in plain language
        #[arg(short, long)]
        task: String,

        /// refactor, bugfix or review
        #[arg(short = 'k', long, default_value = "bugfix")]
        task_type: String,

        /// Optional explicit config file (defaults to the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print a stored run with its stage records and audit trail
    Show {
        /// Run id
        run_id: Uuid,

        /// Path to the repository holding the run database
        #[arg(default_value = ".")]
        repo: PathBuf,
    },

    /// Remove orphaned sandbox workspaces left by crashed runs
    Cleanup {
        /// Path to the repository whose worktree registrations to prune
        #[arg(default_value = ".")]
        repo: PathBuf,
    },

    /// Configure the OpenRouter API key
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("patchgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run { repo, task, task_type, config } => run_pipeline(repo, task, task_type, config).await,
        Commands::Show { run_id, repo } => show_run(run_id, repo),
        Commands::Cleanup { repo } => cleanup_sandboxes(repo),
        Commands::Setup => {
            patchgate::config::setup_api_key_interactive().map_err(|e| anyhow!(e))?;
            Ok(())
        }
    }
}

fn cleanup_sandboxes(repo: PathBuf) -> Result<()> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Failed to resolve repository '{}'", repo.display()))?;
    let removed = patchgate::sandbox::cleanup_orphans(&repo).map_err(|e| anyhow!(e))?;
    eprintln!("  Removed {} orphaned sandbox director{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

async fn run_pipeline(
    repo: PathBuf,
    task: String,
    task_type: String,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Failed to resolve repository '{}'", repo.display()))?;
    let task_type = TaskType::from_str(&task_type)
        .ok_or_else(|| anyhow!("Unknown task type '{}' (refactor|bugfix|review)", task_type))?;

    let config = match config_path {
        Some(path) => Config::load_from(&path).map_err(|e| anyhow!(e))?,
        None => Config::load(),
    };

    let api_key = config.get_api_key().ok_or_else(|| {
        anyhow!("No OpenRouter API key configured. Set OPENROUTER_API_KEY to enable generation.")
    })?;
    let generator = OpenRouterGenerator::new(api_key, &config.model);

    let store = Arc::new(RunStore::open(&repo).context("Failed to open run store")?);
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(KeywordRetriever::new()),
        Arc::new(generator),
        config,
    )
    .map_err(|e| anyhow!("{}", e))?;

    // Ctrl-C requests cancellation; in-flight sandbox processes are killed
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Cancellation requested...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    eprintln!("  Submitting run against {}", repo.display());
    let run_id = pipeline.submit(&repo, task_type, &task).map_err(|e| anyhow!("{}", e))?;
    eprintln!("  Run id: {}", run_id);

    let run = pipeline.execute(run_id).await.map_err(|e| anyhow!("{}", e))?;
    print_report(&run, &store)?;
    Ok(())
}

fn show_run(run_id: Uuid, repo: PathBuf) -> Result<()> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Failed to resolve repository '{}'", repo.display()))?;
    let store = Arc::new(RunStore::open(&repo).context("Failed to open run store")?);
    let run = store
        .get_run(run_id)
        .context("Failed to load run")?
        .ok_or_else(|| anyhow!("No run {} in {}", run_id, repo.display()))?;
    print_report(&run, &store)?;
    Ok(())
}

fn print_report(run: &Run, store: &RunStore) -> Result<()> {
    println!();
    println!("  Run {}", run.id);
    println!("  Task [{}]: {}", run.task_type.as_str(), run.task_description);
    if let (Some(sha), Some(branch)) = (&run.commit_sha, &run.branch) {
        println!("  Repo: {} @ {} ({})", run.repo_path, branch, &sha[..sha.len().min(12)]);
    }
    println!("  Stage: {}", run.stage.as_str());

    match run.decision {
        Some(decision) => println!("  Decision: {}", decision.as_str().to_uppercase()),
        None => {
            if let Some(reason) = &run.failure_reason {
                println!("  Failed: {}", reason);
            } else {
                println!("  Decision: pending");
            }
        }
    }
    if let (Some(quality), Some(risk)) = (run.quality_score, run.risk_score) {
        println!("  Quality: {:.1}/100   Risk: {:.3}", quality, risk);
    }

    println!();
    println!("  Stages:");
    for record in &run.stage_records {
        let marker = match record.status {
            patchgate::run::StageStatus::Succeeded => "+",
            patchgate::run::StageStatus::Failed => "x",
            patchgate::run::StageStatus::Skipped => "·",
        };
        let attempt = if record.attempt > 1 {
            format!(" (attempt {})", record.attempt)
        } else {
            String::new()
        };
        let error = record
            .error
            .as_deref()
            .map(|e| format!(" - {}", patchgate::util::truncate(e, 100)))
            .unwrap_or_default();
        println!("    {} {}{}{}", marker, record.stage.as_str(), attempt, error);
    }

    let trail = store.audit_trail(run.id).context("Failed to load audit trail")?;
    if !trail.is_empty() {
        println!();
        println!("  Audit trail:");
        for entry in &trail {
            println!(
                "    {} [{}] {}",
                entry.created_at.format("%H:%M:%S"),
                entry.actor.as_str(),
                entry.message
            );
        }
    }
    println!();
    Ok(())
}
