use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kbase_core::EngineConfig;
use kbase_rag::{Engine, SearchFilters};

const DEFAULT_CONFIG: &str = "kbase.toml";

#[derive(Parser, Debug)]
#[command(
    name = "kbase",
    version,
    about = "Chunk, embed and retrieve customer-service training material"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config (if absent) and create the stores.
    Init {
        #[arg(long)]
        force: bool,
    },
    CreateCorpus {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        group: String,
    },
    /// Store raw text on a draft corpus; `-` reads stdin.
    Ingest { corpus_id: i64, input: PathBuf },
    /// Lock a corpus, then chunk and embed it before exiting.
    Finalize { corpus_id: i64 },
    Revectorize { corpus_id: i64 },
    Delete { corpus_id: i64 },
    Status { corpus_id: i64 },
    Retrieve {
        query: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    IndexSearch {
        query: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
    IndexStats,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    match cli.command {
        Commands::Init { force } => init(&config_path, force),
        command => {
            let config = load_config(&config_path)?;
            let engine = Engine::open(config).context("failed to open engine")?;
            run(&engine, command)
        }
    }
}

fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } => bail!("init runs before the engine is opened"),
        Commands::CreateCorpus { tag, group } => {
            let corpus = engine.create_corpus(&tag, &group)?;
            print_json(&json!({
                "id": corpus.id,
                "tag": corpus.tag,
                "group": corpus.group,
            }))?;
        }
        Commands::Ingest { corpus_id, input } => {
            let text = read_input(&input)?;
            engine
                .ingest(corpus_id, &text)
                .with_context(|| format!("failed to ingest into corpus {corpus_id}"))?;
            info!(corpus_id, input = %input.display(), "ingested");
        }
        Commands::Finalize { corpus_id } => {
            let scheduled = engine.finalize(corpus_id)?;
            engine.wait_idle();
            let status = engine.corpus_status(corpus_id)?;
            print_json(&json!({
                "id": corpus_id,
                "newly_finalized": scheduled,
                "vectorized": status.corpus.vectorized,
                "chunks": status.chunks.total,
                "embedded": status.chunks.embedded,
            }))?;
        }
        Commands::Revectorize { corpus_id } => {
            let report = engine.revectorize(corpus_id)?;
            print_json(&json!({
                "id": report.corpus_id,
                "attempted": report.attempted,
                "embedded": report.embedded,
                "failed": report.failed,
                "vectorized": report.vectorized,
            }))?;
        }
        Commands::Delete { corpus_id } => {
            engine
                .delete(corpus_id)
                .with_context(|| format!("failed to delete corpus {corpus_id}"))?;
            println!("deleted corpus {corpus_id}");
        }
        Commands::Status { corpus_id } => {
            let status = engine.corpus_status(corpus_id)?;
            print_json(&json!({
                "id": status.corpus.id,
                "tag": status.corpus.tag,
                "group": status.corpus.group,
                "finalized": status.corpus.finalized,
                "vectorized": status.corpus.vectorized,
                "chunks": status.chunks.total,
                "embedded": status.chunks.embedded,
            }))?;
        }
        Commands::Retrieve {
            query,
            k,
            tag,
            group,
        } => {
            let context = engine.retrieve(&query, k, &SearchFilters { tag, group })?;
            if context.is_empty() {
                eprintln!("no matching knowledge");
            } else {
                print!("{context}");
            }
        }
        Commands::IndexSearch { query, k } => {
            let hits = engine.search_index(&query, k)?;
            let rows: Vec<_> = hits
                .into_iter()
                .map(|hit| {
                    json!({
                        "id": hit.internal_id,
                        "distance": hit.distance,
                        "metadata": hit.metadata,
                        "content": hit.content,
                    })
                })
                .collect();
            print_json(&json!(rows))?;
        }
        Commands::IndexStats => match engine.index_stats()? {
            Some(stats) => print_json(&json!({
                "live": stats.live,
                "tombstones": stats.tombstones,
                "generation": stats.generation,
                "dimension": stats.dimension,
            }))?,
            None => bail!("the relational deployment has no embedded index"),
        },
    }
    Ok(())
}

fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        info!(path = %config_path.display(), "keeping existing config");
    } else {
        let rendered = toml::to_string_pretty(&EngineConfig::default())
            .context("failed to render default config")?;
        fs::write(config_path, rendered)
            .with_context(|| format!("failed to write config {}", config_path.display()))?;
        println!("wrote {}", config_path.display());
    }
    let config = load_config(config_path)?;
    Engine::open(config).context("failed to initialize stores")?;
    Ok(())
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::load(path).with_context(|| format!("invalid config {}", path.display()))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
