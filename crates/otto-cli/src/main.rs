//! otto — autonomous coding-agent runtime.
//!
//! The CLI is a thin shell over `otto-core`: it wires configuration, the
//! session store, and the provider together, runs the autonomous supervisor,
//! and maps the halt reason to a process exit code.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use otto_core::ai::retry::RetryBudget;
use otto_core::autonomous::supervisor::AutonomousSupervisor;
use otto_core::{
    AgentEventKind, ChatProvider, EventStream, FsSessionStore, HttpProvider, LlmDriver,
    PromptBundle, RuntimeConfig, SafetyGate, ScriptedProvider, ScriptedResponse, SessionStore,
    StatusSnapshot, ToolOrchestrator, ToolRegistry, TurnEngine,
};

#[derive(Parser)]
#[command(name = "otto")]
#[command(about = "Autonomous coding-agent runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the autonomous loop against the current project.
    ///
    /// Reads the prompt bundle (PROMPT.md, CHECKLIST.md, BUILD.md) from the
    /// session root and iterates until the dual-condition exit gate fires or
    /// a guard (circuit breaker, rate limit, iteration budget) halts the run.
    Run {
        /// Maximum iterations for this run.
        #[arg(short, long)]
        max_loops: Option<u32>,

        /// Use the scripted in-process provider instead of the network.
        #[arg(long)]
        dry_run: bool,
    },

    /// List stored sessions.
    Sessions,

    /// Print the latest supervisor status for a session.
    Status {
        /// Session id; defaults to the most recent session.
        session_id: Option<String>,
    },

    /// Delete a stored session.
    Delete { session_id: String },
}

fn init_logging(config: &RuntimeConfig) {
    let log_dir = config.session_root.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory: {}", e);
        return;
    }
    match std::fs::File::create(log_dir.join("otto.log")) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                )
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => eprintln!("failed to create log file: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = RuntimeConfig::from_env()?;
    init_logging(&config);

    let store = Arc::new(FsSessionStore::new(config.session_root.join("sessions")));

    match cli.command {
        Commands::Run { max_loops, dry_run } => run(config, store, max_loops, dry_run).await,
        Commands::Sessions => {
            for header in store.list()? {
                println!(
                    "{}  turns={:<4} tokens={:<8} last_activity={}",
                    header.id,
                    header.metrics.turn_count,
                    header.token_total,
                    header.last_activity_at.to_rfc3339()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { session_id } => {
            let id = match session_id {
                Some(id) => id,
                None => match store.list()?.first() {
                    Some(header) => header.id.clone(),
                    None => {
                        eprintln!("no sessions found");
                        return Ok(ExitCode::FAILURE);
                    }
                },
            };
            let status = StatusSnapshot::read(&store.session_dir(&id).join("status.json"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { session_id } => {
            store.delete(&session_id)?;
            println!("deleted {}", session_id);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(
    config: RuntimeConfig,
    store: Arc<FsSessionStore>,
    max_loops: Option<u32>,
    dry_run: bool,
) -> Result<ExitCode> {
    let max_loops = max_loops.unwrap_or(config.loop_max);

    let provider: Arc<dyn ChatProvider> = if dry_run {
        Arc::new(ScriptedProvider::new(vec![ScriptedResponse::new(
            "[DONE] task complete\n```json\n{\"exit_signal\": true, \"status\": \"complete\", \
             \"summary\": \"dry run\"}\n```",
        )]))
    } else {
        Arc::new(HttpProvider::new(
            &config.base_url,
            &config.api_key,
            &config.model,
        )?)
    };

    let driver = Arc::new(LlmDriver::new(provider, Arc::new(RetryBudget::default())));

    // Concrete tools plug in here; the engine contract is tool-agnostic.
    let registry = Arc::new(ToolRegistry::build(Vec::new())?);
    let working_dir = std::env::current_dir()?;
    let gate = Arc::new(SafetyGate::new(config.approval_policy, working_dir.clone()));

    let orchestrator = ToolOrchestrator::new(registry.clone(), gate, working_dir)
        .with_parallelism(config.tool_parallelism)
        .with_output_token_cap(config.tool_output_token_cap)
        .with_tool_timeout(std::time::Duration::from_secs(config.tool_timeout_secs));

    let turn_engine = TurnEngine::new(driver, orchestrator, registry.ai_tools())
        .with_max_tool_iterations(config.max_tool_iterations);

    let (mut session, prior_iterations) =
        AutonomousSupervisor::resume_or_new(store.as_ref(), &config, &config.session_root);

    let bundle = PromptBundle::load_from(&config.session_root);
    let events = EventStream::new(session.id.clone());
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the loop; the supervisor persists before yielding.
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested, finishing current iteration");
            ctrlc_cancel.cancel();
        }
    });

    // Mirror assistant text to stdout as it streams.
    let mut subscriber = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscriber.recv().await {
            match event.kind {
                AgentEventKind::TextDelta { delta } => print!("{}", delta),
                AgentEventKind::AgentEnd { .. } => println!(),
                AgentEventKind::AgentError { error, code, .. } => {
                    eprintln!("\n[{}] {}", code, error)
                }
                _ => {}
            }
        }
    });

    let skills = Arc::new(otto_core::SkillRegistry::load_from(
        &config.session_root.join("skills"),
    ));
    let mut supervisor = AutonomousSupervisor::new(config, store.clone(), turn_engine, &session.id)
        .with_skills(skills);
    let report = supervisor
        .run(
            &mut session,
            &bundle,
            max_loops,
            prior_iterations,
            &events,
            &cancel,
        )
        .await?;

    drop(events);
    let _ = printer.await;

    println!(
        "halted: {} after {} iteration(s), {} file(s) touched",
        report.halt_reason.as_str(),
        report.iterations_run,
        report.files_modified.len()
    );

    Ok(ExitCode::from(report.halt_reason.exit_code() as u8))
}
