//! rho - on-device agent CLI

mod config;
mod tools;

use anyhow::Context;
use clap::Parser;
use rho_agent::{
    AgentOrchestrator, GenerationAction, GenerationEvent, InMemoryChatStore, ModelStateCoordinator,
    RunStatus, SteeringMode, SubAgentResult, TaggedContextBuilder, ToolRegistry,
};
use rho_engine::{BackendKind, LocalModelResolver, ScriptedResponse, ScriptedSession};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Chat the CLI runs its prompt in
const CHAT_ID: &str = "cli";

/// rho - on-device agent
#[derive(Parser, Debug)]
#[command(name = "rho")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Prompt to run
    prompt: Option<String>,

    /// Config file (default: ~/.config/rho/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay script overriding the configured one
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Maximum loop iterations
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let default_filter = if args.verbose {
        "rho_agent=debug,rho_engine=debug,rho=debug"
    } else {
        "rho_agent=info,rho_engine=info,rho=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(prompt) = args.prompt else {
        eprintln!("Usage: rho <PROMPT>  (see --help)");
        std::process::exit(2);
    };

    let cfg = config::Config::load(args.config.as_deref());
    let model = cfg.model();

    let script = args.replay.or_else(|| cfg.replay.script.clone());
    let responses = match script {
        Some(path) => load_script(&path)?,
        None => Vec::new(),
    };

    let store = InMemoryChatStore::new().with_chat(CHAT_ID, model.clone());
    let model_state = Arc::new(build_model_state(
        &cfg,
        Arc::new(store.clone()),
        responses,
        model.backend,
    ));

    let tools = ToolRegistry::new()
        .with_tool(Arc::new(tools::CalculatorTool::new()))
        .with_concurrency(true);
    let mut orchestrator_config = cfg.orchestrator_config();
    if let Some(max) = args.max_iterations {
        orchestrator_config.max_iterations = max;
    }
    let orchestrator = AgentOrchestrator::new(
        model_state,
        Arc::new(store),
        Arc::new(TaggedContextBuilder::new()),
        tools,
        orchestrator_config,
    );

    orchestrator
        .load(CHAT_ID)
        .await
        .with_context(|| format!("Failed to load model {}", model.id))?;
    tracing::info!("Model {} ready on the {} backend", model.id, model.backend);

    run_command(&orchestrator, &prompt).await
}

/// Register one replay session per backend kind; the configured backend plays the script
fn build_model_state(
    cfg: &config::Config,
    store: Arc<InMemoryChatStore>,
    responses: Vec<ScriptedResponse>,
    scripted_backend: BackendKind,
) -> ModelStateCoordinator {
    let chunk_delay = Duration::from_millis(cfg.replay.chunk_delay_ms.unwrap_or(0));
    let fallback = ScriptedResponse::text(
        "<final>No replay script is configured. Set [replay].script to a JSON list of responses.</final>",
    );

    let mut coordinator = ModelStateCoordinator::new(
        store,
        Arc::new(LocalModelResolver::new(cfg.models_dir())),
    )
    .with_loader_config(cfg.loader_config());
    let mut responses = Some(responses);
    for kind in [BackendKind::Accelerated, BackendKind::Cpu, BackendKind::Remote] {
        let mut session = ScriptedSession::new(kind)
            .with_chunk_delay(chunk_delay)
            .with_fallback(fallback.clone());
        if kind == scripted_backend {
            if let Some(responses) = responses.take() {
                session = session.with_responses(responses);
            }
        }
        coordinator = coordinator.with_session(Arc::new(session));
    }
    coordinator
}

fn load_script(path: &Path) -> anyhow::Result<Vec<ScriptedResponse>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read replay script {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid replay script {}", path.display()))
}

async fn run_command(orchestrator: &AgentOrchestrator, prompt: &str) -> anyhow::Result<()> {
    println!("rho> {}", prompt);
    println!();

    let mut receiver = orchestrator.subscribe();

    // Spawn event handler
    let printer = tokio::spawn(async move {
        let mut printed = 0;
        let mut current = None;
        while let Ok(event) = receiver.recv().await {
            match event {
                GenerationEvent::StreamUpdated {
                    run_id,
                    iteration,
                    text,
                } => {
                    // Print only what is new in this iteration
                    if current != Some((run_id, iteration)) {
                        if current.is_some() {
                            println!();
                        }
                        current = Some((run_id, iteration));
                        printed = 0;
                    }
                    let text_chars: Vec<char> = text.chars().collect();
                    if text_chars.len() < printed {
                        printed = 0;
                    }
                    let new_text: String = text_chars[printed..].iter().collect();
                    print!("{}", new_text);
                    std::io::stdout().flush().ok();
                    printed = text_chars.len();
                }
                GenerationEvent::ToolStarted {
                    tool_name,
                    arguments,
                    ..
                } => {
                    println!("\n[Running {} {}]", tool_name, arguments);
                }
                GenerationEvent::ToolCompleted {
                    tool_name,
                    result,
                    is_error,
                    ..
                } => {
                    if is_error {
                        println!("[{} failed: {}]", tool_name, result);
                    } else {
                        println!("[{}: {}]", tool_name, truncate_chars(&result, 200));
                    }
                }
                GenerationEvent::MemoryFlushRequested { utilization, .. } => {
                    println!("\n[Context {:.0}% full, asking the model to compact]", utilization * 100.0);
                }
                GenerationEvent::SubAgentSpawned { id, .. } => {
                    println!("[Sub-agent {} started]", id);
                }
                GenerationEvent::SubAgentFinished { id, result } => match result {
                    SubAgentResult::Completed { duration_ms, .. } => {
                        println!("[Sub-agent {} completed in {}ms]", id, duration_ms)
                    }
                    SubAgentResult::Failed { error, .. } => {
                        println!("[Sub-agent {} failed: {}]", id, error)
                    }
                    SubAgentResult::Cancelled { .. } => println!("[Sub-agent {} cancelled]", id),
                    SubAgentResult::TimedOut { duration_ms } => {
                        println!("[Sub-agent {} timed out after {}ms]", id, duration_ms)
                    }
                },
                GenerationEvent::GenerationFailed { error, .. } => {
                    eprintln!("\nError: {}", error);
                }
                _ => {}
            }
        }
    });

    // Ctrl-C stops the run instead of killing the process
    let handle = orchestrator.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.steer(SteeringMode::HardStop);
        }
    });

    let result = orchestrator
        .generate(prompt, GenerationAction::default())
        .await;

    // Wait a bit for final events
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();
    interrupt.abort();

    let outcome = result?;
    println!();
    println!("\n{}", outcome.text());
    let status = match outcome.status {
        RunStatus::Completed => "completed",
        RunStatus::Interrupted => "interrupted",
    };
    println!(
        "\n[{} | {} iteration(s) | tools: {} | {:.1}s]",
        status,
        outcome.iterations,
        if outcome.tools_used.is_empty() {
            "none".to_string()
        } else {
            outcome.tools_used.join(", ")
        },
        outcome.duration.as_secs_f64()
    );

    Ok(())
}

/// Truncate to `max` characters, appending an ellipsis when cut
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}
