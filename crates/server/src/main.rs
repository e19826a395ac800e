//! Hivemind Server
//!
//! CLI and JSON API over the swarm orchestrator. `run` executes one pipeline
//! in the terminal, `serve` exposes it over HTTP with an SSE event feed.

mod api;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use hivemind_core::state::io::write_runtime_file;
use hivemind_core::state::{HivemindDb, StageCounts, SwarmSettings};
use hivemind_core::swarm::{Orchestrator, SwarmEvent, SwarmEventKind, SwarmMode, SwarmOptions};
use hivemind_core::tools::WorktreeManager;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use tracing_subscriber::EnvFilter;

/// Application state
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub event_tx: broadcast::Sender<SwarmEvent>,
}

pub type SharedState = Arc<AppState>;

#[derive(Parser, Clone)]
#[command(author, version, about = "Hivemind - coding-agent swarm pipeline")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Run the pipeline once and print the result as JSON
    Run {
        /// What the swarm should do
        prompt: String,
        /// Force a mode: chat, swarm or project
        #[arg(short, long)]
        mode: Option<String>,
        /// Project directory the workers operate on
        #[arg(short, long)]
        project: Option<PathBuf>,
        /// Restart the pipeline while confidence stays below the threshold
        #[arg(long)]
        continuous: bool,
        /// Agents per stage: research,plan,code,validate,security,synthesize
        #[arg(long, value_delimiter = ',')]
        counts: Option<Vec<usize>>,
        /// Disable worktree isolation for CODE agents
        #[arg(long)]
        no_worktrees: bool,
    },
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Remove every worktree left behind in a repository
    Cleanup {
        /// Repository path
        #[arg(short, long)]
        project: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_state() -> anyhow::Result<(Arc<HivemindDb>, SwarmSettings)> {
    let db = Arc::new(HivemindDb::open()?);
    let settings = match SwarmSettings::load(&db) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Stored settings unreadable, using defaults: {:#}", e);
            SwarmSettings::default()
        }
    };
    Ok((db, settings))
}

fn parse_counts(counts: &[usize]) -> anyhow::Result<StageCounts> {
    match counts {
        [research, plan, code, validate, security, synthesize] => Ok(StageCounts {
            research: *research,
            plan: *plan,
            code: *code,
            validate: *validate,
            security: *security,
            synthesize: *synthesize,
        }),
        _ => anyhow::bail!("--counts takes exactly six comma-separated values"),
    }
}

fn print_event(event: &SwarmEvent) {
    match event.kind {
        SwarmEventKind::SystemMessage => {
            if let Some(message) = event.message() {
                println!("» {}", message);
            }
        }
        SwarmEventKind::AgentOutput => {}
        SwarmEventKind::AgentStarted
        | SwarmEventKind::AgentCompleted
        | SwarmEventKind::AgentFailed
        | SwarmEventKind::AgentCancelled
        | SwarmEventKind::CacheHit => {
            println!("  [{}] {:?}", event.agent, event.kind);
        }
        _ => {}
    }
}

async fn run_once(
    prompt: String,
    mode: Option<String>,
    project: Option<PathBuf>,
    continuous: bool,
    counts: Option<Vec<usize>>,
    no_worktrees: bool,
) -> anyhow::Result<()> {
    let (db, settings) = open_state()?;

    let mut options = SwarmOptions::new(prompt);
    if let Some(mode) = mode {
        let parsed = SwarmMode::parse(&mode)
            .ok_or_else(|| anyhow::anyhow!("Unknown mode '{}': use chat, swarm or project", mode))?;
        options = options.with_mode(parsed);
    }
    if let Some(project) = project {
        options = options.with_project_path(project);
    }
    if let Some(counts) = counts {
        options = options.with_counts(parse_counts(&counts)?);
    }
    if continuous {
        options = options.with_continuous(true);
    }
    if no_worktrees {
        options.use_worktrees = Some(false);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(Orchestrator::new(settings, db)?.with_event_channel(tx));

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let context = orchestrator.context();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling swarm...");
            let killed = context.cancel();
            tracing::info!(killed, "Swarm cancellation requested");
        }
    });

    let result = orchestrator.run_swarm_pipeline(options).await;
    drop(orchestrator);
    // Remaining events flush once the last sender is gone
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;

    let json = serde_json::to_string_pretty(&result)?;
    match write_runtime_file("runs/last_result.json", &json).await {
        Ok(path) => tracing::debug!("Saved result to {:?}", path),
        Err(e) => tracing::warn!("Failed to save result: {:#}", e),
    }
    println!("{}", json);
    Ok(())
}

async fn cleanup(project: Option<PathBuf>) -> anyhow::Result<()> {
    let repo = match project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    if !WorktreeManager::is_git_repo(&repo) {
        anyhow::bail!("{} is not a git repository", repo.display());
    }
    let removed = WorktreeManager::default().cleanup_all_worktrees(&repo).await?;
    println!("Removed {} worktree(s)", removed);
    Ok(())
}

// === Server Entry ===

pub async fn run_server(port: u16) -> anyhow::Result<()> {
    let (db, settings) = open_state()?;
    let (event_tx, _) = broadcast::channel::<SwarmEvent>(256);
    let (tx, mut rx) = mpsc::unbounded_channel::<SwarmEvent>();

    let orchestrator = Arc::new(Orchestrator::new(settings, db)?.with_event_channel(tx));

    // Fan the orchestrator's events out to every SSE subscriber
    let fanout = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let _ = fanout.send(event);
        }
    });

    let state: SharedState = Arc::new(AppState {
        orchestrator,
        event_tx,
    });

    let app = Router::new()
        .nest("/api/swarm", api::swarm::swarm_routes())
        .route("/api/events", get(api::swarm::events))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("Hivemind server running at http://{}", addr);
    tracing::info!("Routes: POST /api/swarm/run, POST /api/swarm/cancel, GET /api/swarm/last-run, GET /api/events");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    match args.command {
        Some(CliCommand::Run {
            prompt,
            mode,
            project,
            continuous,
            counts,
            no_worktrees,
        }) => run_once(prompt, mode, project, continuous, counts, no_worktrees).await,
        Some(CliCommand::Serve { port }) => run_server(port).await,
        Some(CliCommand::Cleanup { project }) => cleanup(project).await,
        None => run_server(8080).await,
    }
}
