use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use agentflow::config::{load_env_file, EngineConfig};
use agentflow::engine::Engine;
use agentflow::gateway::OpenAiGateway;
use agentflow::logger::init_tracing;
use agentflow::mcp::NullMcpClient;
use agentflow::pipeline::PipelineDefinition;
use agentflow::registry::InMemoryCapabilityRegistry;
use agentflow::store::{InMemoryExecutionRepository, InMemoryPipelineRepository};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "agentflow",
    about = "Pipeline engine for agents and MCP tools",
    version = "0.1.0"
)]
struct Cli {
    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a pipeline definition file
    Validate(ValidateArgs),

    /// Execute a pipeline definition against one input
    Run(RunArgs),

    /// Score an (agent, server) pair from a capability catalog
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Pipeline definition (JSON)
    file: PathBuf,

    /// Capability catalog with agents and MCP servers (JSON)
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline definition (JSON)
    file: PathBuf,

    /// Input payload; parsed as JSON when possible, passed as text otherwise
    #[arg(long)]
    input: String,

    /// Capability catalog with agents and MCP servers (JSON)
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[arg(long)]
    agent: String,

    #[arg(long)]
    server: String,

    #[arg(long)]
    catalog: PathBuf,
}

fn load_registry(catalog: Option<&PathBuf>) -> Result<Arc<InMemoryCapabilityRegistry>> {
    let registry = Arc::new(InMemoryCapabilityRegistry::new());
    if let Some(path) = catalog {
        registry
            .load_catalog_file(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?;
    }
    Ok(registry)
}

fn build_engine(registry: Arc<InMemoryCapabilityRegistry>) -> Engine {
    let api_key = env::var("OPENAI_KEY").unwrap_or_else(|_| {
        warn!("OPENAI_KEY is not set; agent-call nodes will fail");
        String::new()
    });
    let gateway = Arc::new(OpenAiGateway::new(api_key));
    Engine::new(
        registry,
        gateway,
        Arc::new(NullMcpClient),
        Arc::new(InMemoryPipelineRepository::new()),
        Arc::new(InMemoryExecutionRepository::new()),
        EngineConfig::from_env(),
    )
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    load_env_file(&PathBuf::from(".env"));

    match cli.command {
        Commands::Validate(args) => {
            let def = PipelineDefinition::load_from_file(&args.file.to_string_lossy())?;
            let registry = load_registry(args.catalog.as_ref())?;
            let engine = build_engine(registry);

            let report = engine.validate_pipeline(&def);
            if report.valid {
                info!("Valid pipeline: {}", args.file.display());
                Ok(())
            } else {
                for issue in &report.issues {
                    eprintln!("issue: {}", issue);
                }
                bail!("pipeline failed validation with {} issues", report.issues.len());
            }
        }
        Commands::Run(args) => {
            let def = PipelineDefinition::load_from_file(&args.file.to_string_lossy())?;
            let registry = load_registry(args.catalog.as_ref())?;
            let engine = build_engine(registry);

            let input: Value = serde_json::from_str(&args.input)
                .unwrap_or_else(|_| json!(args.input));
            let record = engine.execute_pipeline(&def, input).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);

            if record.status == agentflow::execution::ExecutionStatus::Failed {
                process::exit(1);
            }
            Ok(())
        }
        Commands::Analyze(args) => {
            let registry = load_registry(Some(&args.catalog))?;
            let engine = build_engine(registry);

            let report = engine.analyze_compatibility(&args.agent, &args.server)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
