//! Hindsight CLI
//!
//! A thin local harness for exercising the Hindsight memory engine:
//! retain, recall, reflect, and bank/document/entity/operation management
//! against a local SQLite-backed store. Not a server, not an MCP transport
//! — those are external collaborators (see `hindsight-core`'s crate docs).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use hindsight_core::llm::HeuristicCompletionClient;
use hindsight_core::model::unit::Budget;
use hindsight_core::retain::RetainItem;
use hindsight_core::retrieve::RecallRequest;
use hindsight_core::task::InlineBackend;
use hindsight_core::{Engine, EngineConfig, Store};

#[cfg(feature = "embeddings")]
use hindsight_core::llm::LocalEmbedder;

#[derive(Parser)]
#[command(name = "hindsight", version, about = "Local harness for the Hindsight memory engine")]
struct Cli {
    /// Path to the SQLite database file. Defaults to the platform data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Retain one or more facts into a bank.
    Retain {
        /// Bank to write into.
        #[arg(long, default_value = "default")]
        bank: String,
        /// Raw text to extract facts from. Repeat for multiple items.
        #[arg(required = true)]
        text: Vec<String>,
        /// Attach items to a document id instead of standalone conversation turns.
        #[arg(long)]
        document: Option<String>,
    },
    /// Recall facts relevant to a query.
    Recall {
        #[arg(long, default_value = "default")]
        bank: String,
        query: String,
        #[arg(long, value_enum, default_value = "mid")]
        budget: BudgetArg,
        #[arg(long, default_value_t = 2000)]
        max_tokens: u32,
    },
    /// Recall and synthesize a grounded answer.
    Reflect {
        #[arg(long, default_value = "default")]
        bank: String,
        query: String,
        #[arg(long, value_enum, default_value = "mid")]
        budget: BudgetArg,
    },
    /// Bank management.
    Bank {
        #[command(subcommand)]
        action: BankAction,
    },
    /// Document management.
    Document {
        #[command(subcommand)]
        action: DocumentAction,
    },
    /// Entity management.
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },
}

#[derive(Subcommand)]
enum BankAction {
    List,
    Delete { bank_id: String },
}

#[derive(Subcommand)]
enum DocumentAction {
    List {
        #[arg(long, default_value = "default")]
        bank: String,
    },
    Delete {
        #[arg(long, default_value = "default")]
        bank: String,
        document_id: String,
    },
}

#[derive(Subcommand)]
enum EntityAction {
    List {
        #[arg(long, default_value = "default")]
        bank: String,
    },
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum BudgetArg {
    Low,
    Mid,
    High,
}

impl From<BudgetArg> for Budget {
    fn from(value: BudgetArg) -> Self {
        match value {
            BudgetArg::Low => Budget::Low,
            BudgetArg::Mid => Budget::Mid,
            BudgetArg::High => Budget::High,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!("{err}");
        eprintln!("{} {err}", "error:".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let engine = build_engine(cli.data_dir)?;

    match cli.command {
        Command::Retain { bank, text, document } => {
            let items = text.into_iter().map(RetainItem::new).collect();
            let outcome = engine.retain(&bank, items, document).await?;
            println!("{} {} item(s) retained into '{bank}'", "ok:".green().bold(), outcome.items_count);
        }
        Command::Recall { bank, query, budget, max_tokens } => {
            let request = RecallRequest::new(bank, query, budget.into(), max_tokens);
            let result = engine.recall(request).await?;
            for scored in &result.results {
                println!("{:>6.3}  {}", scored.score, scored.unit.text);
            }
            println!("{} {} result(s)", "ok:".green().bold(), result.results.len());
        }
        Command::Reflect { bank, query, budget } => {
            let request = hindsight_core::engine::ReflectRequest::new(bank, query, budget.into());
            let result = engine.reflect(request).await?;
            println!("{}", result.text);
        }
        Command::Bank { action } => match action {
            BankAction::List => {
                for bank in engine.list_banks().await? {
                    println!("{}", bank.bank_id);
                }
            }
            BankAction::Delete { bank_id } => {
                engine.delete_bank(&bank_id).await?;
                println!("{} bank '{bank_id}' deleted", "ok:".green().bold());
            }
        },
        Command::Document { action } => match action {
            DocumentAction::List { bank } => {
                for document in engine.list_documents(&bank, 100, 0).await? {
                    let preview: String = document.original_text.chars().take(60).collect();
                    println!("{}  {} unit(s)  {preview}", document.id, document.unit_count);
                }
            }
            DocumentAction::Delete { bank, document_id } => {
                engine.delete_document(&bank, &document_id).await?;
                println!("{} document '{document_id}' deleted", "ok:".green().bold());
            }
        },
        Command::Entity { action } => match action {
            EntityAction::List { bank } => {
                for entity in engine.list_entities(&bank, 100, 0).await? {
                    println!("{}  {}", entity.id, entity.canonical_name);
                }
            }
        },
    }

    engine.shutdown().await?;
    Ok(())
}

/// Wires a CLI-scoped engine: inline task execution (no background worker
/// to outlive a one-shot invocation), a heuristic completion client so the
/// harness runs with no LLM credentials configured, and a local embedder
/// when the `embeddings` feature is enabled.
fn build_engine(data_dir: Option<PathBuf>) -> anyhow::Result<Engine> {
    let mut config = EngineConfig::from_env();
    if let Some(dir) = data_dir {
        config.db_path = Some(dir.join("hindsight.db"));
    }

    let store = Arc::new(Store::open(config.db_path.as_deref(), config.retry)?);
    info!(path = ?store.pool().db_path(), "store opened");

    #[cfg(feature = "embeddings")]
    let embedder: Arc<dyn hindsight_core::Embedder> = Arc::new(LocalEmbedder::new(config.embedding_dimensions));
    #[cfg(not(feature = "embeddings"))]
    let embedder: Arc<dyn hindsight_core::Embedder> = Arc::new(NullEmbedder { dimensions: config.embedding_dimensions });

    let completion = Arc::new(HeuristicCompletionClient::new());
    let tasks = InlineBackend::new();

    Ok(Engine::new(store, embedder, completion, config, tasks))
}

#[cfg(not(feature = "embeddings"))]
struct NullEmbedder {
    dimensions: usize,
}

#[cfg(not(feature = "embeddings"))]
#[async_trait::async_trait]
impl hindsight_core::Embedder for NullEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, hindsight_core::EngineError> {
        Ok(texts.iter().map(|_| vec![0.0; self.dimensions]).collect())
    }
    fn dimensions(&self) -> usize {
        self.dimensions
    }
    fn model_name(&self) -> &str {
        "null"
    }
}
