// SPDX-License-Identifier: MIT

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use parley_rs::adk::memory::InMemoryMemory;
use parley_rs::adk::model::openai::OpenAiModel;
use parley_rs::parley::flow::loader::{FlowCatalog, FlowLoader};
use parley_rs::parley::flow::nodes::{ExternalInput, Services};
use parley_rs::parley::flow::session::{FileSessionStore, MemorySessionStore, SessionStore};
use parley_rs::parley::flow::strategy;
use parley_rs::parley::flow::ExecutorRegistry;
use parley_rs::parley::tools::ToolRegistry;
use parley_rs::parley::{server, AdvanceResponse, EngineConfig, FlowEngine};

const DEFAULT_STORE_DIR: &str = ".parley/sessions";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine config file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Directory of flow files
        #[arg(long, default_value = "flows")]
        flows_dir: PathBuf,

        #[arg(short, long, default_value_t = 3000)]
        port: u16,

        /// Seconds between deadline sweeps
        #[arg(long, default_value_t = 5)]
        sweep_secs: u64,
    },
    /// Check that a flow file loads
    Validate {
        /// Path to the flow file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Talk to a flow on the terminal
    Chat {
        /// Path to the flow file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Make one advance call against a file-backed session
    Advance {
        #[arg(long, default_value = "flows")]
        flows_dir: PathBuf,

        /// Flow id
        #[arg(long)]
        flow: String,

        /// Session to resume; a new one is started when omitted
        #[arg(long)]
        session: Option<String>,

        /// User text
        #[arg(short, long)]
        input: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Args::parse();
    if matches!(args.command, Commands::Serve { .. }) {
        tracing_subscriber::fmt::init();
    } else {
        env_logger::init();
    }

    let config = EngineConfig::load(args.config.as_deref()).context("loading engine config")?;

    match args.command {
        Commands::Serve {
            flows_dir,
            port,
            sweep_secs,
        } => {
            let catalog = load_catalog(&flows_dir)?;
            let store: Arc<dyn SessionStore> = match &config.store_dir {
                Some(dir) => Arc::new(FileSessionStore::open(dir).await?),
                None => {
                    log::warn!("No store_dir configured, sessions live in memory only");
                    Arc::new(MemorySessionStore::new())
                }
            };
            let engine = build_engine(catalog, config, store).await?;
            server::serve(Arc::new(engine), port, Duration::from_secs(sweep_secs.max(1)))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        Commands::Validate { file } => {
            let graph = FlowLoader::new()
                .load_flow(&file)
                .with_context(|| format!("validating {}", file.display()))?;
            let (strategy, reason) = strategy::select(&graph, &ExecutorRegistry::with_defaults());
            println!(
                "{}: ok ({} nodes, {} strategy: {})",
                graph.id(),
                graph.nodes().count(),
                strategy,
                reason
            );
        }
        Commands::Chat { file } => {
            let mut catalog = FlowCatalog::new();
            let graph = catalog.insert(FlowLoader::new().load_flow(&file)?);
            let engine =
                build_engine(catalog, config, Arc::new(MemorySessionStore::new())).await?;
            chat(&engine, graph.id()).await?;
        }
        Commands::Advance {
            flows_dir,
            flow,
            session,
            input,
        } => {
            let catalog = load_catalog(&flows_dir)?;
            let dir = config
                .store_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
            let store = Arc::new(FileSessionStore::open(&dir).await?);
            let engine = build_engine(catalog, config, store).await?;

            let response = engine
                .advance(&flow, session.as_deref(), input.map(ExternalInput::text))
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

fn load_catalog(dir: &Path) -> anyhow::Result<FlowCatalog> {
    let catalog = FlowLoader::new()
        .load_dir(dir)
        .with_context(|| format!("loading flows from {}", dir.display()))?;
    if catalog.is_empty() {
        bail!("no flows found in {}", dir.display());
    }
    log::info!("Loaded {} flows", catalog.len());
    Ok(catalog)
}

async fn build_engine(
    catalog: FlowCatalog,
    config: EngineConfig,
    store: Arc<dyn SessionStore>,
) -> anyhow::Result<FlowEngine> {
    let tools = ToolRegistry::from_config(&config).await?;
    for name in tools.names().await {
        log::info!("Registered tool: {}", name);
    }

    let mut services = Services::new(Arc::new(tools), Arc::new(config))
        .with_memory(Arc::new(InMemoryMemory::new()));

    let model_name = std::env::var("PARLEY_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    match OpenAiModel::new(model_name.clone()) {
        Ok(model) => {
            log::info!("Using model: {}", model_name);
            services = services.with_model(Arc::new(model));
        }
        Err(e) => log::warn!("No language model available: {}", e),
    }

    Ok(FlowEngine::new(catalog, services, store))
}

async fn chat(engine: &FlowEngine, flow_id: &str) -> anyhow::Result<()> {
    let mut response = engine.advance(flow_id, None, None).await?;
    print_turn(&response);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while response.awaiting_input {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line == "/quit" {
            engine.cancel(&response.session_id).await?;
            println!("[cancelled]");
            return Ok(());
        }
        response = engine
            .advance(flow_id, Some(&response.session_id), Some(ExternalInput::text(line)))
            .await?;
        print_turn(&response);
    }

    println!("[{}]", response.status);
    if let Some(handoff) = &response.handoff {
        println!("[transfer to {}]", handoff.destination);
    }
    Ok(())
}

fn print_turn(response: &AdvanceResponse) {
    for message in &response.messages {
        println!("agent> {}", message);
    }
    if let Some(error) = &response.error {
        eprintln!("error: {}", error.message);
    }
}
