//! Command-line entry point for the retrieval engine.

use clap::{Parser, Subcommand};
use recall::{
    EngineConfig, Indexer, OllamaEmbedder, SearchEngine, SearchMode, SearchResult, Store,
    SyncOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recall", about = "Index and search a personal markdown corpus")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store database path, overriding the config.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Incrementally index a directory tree of markdown files.
    Sync {
        root: PathBuf,
        /// Opaque category tag recorded on files written this run.
        #[arg(long)]
        category: Option<String>,
        /// Re-chunk and re-embed everything, ignoring stored hashes.
        #[arg(long)]
        rebuild: bool,
    },
    /// Search the indexed corpus.
    Search {
        query: String,
        #[arg(long, default_value = "hybrid")]
        mode: SearchMode,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
        /// Emit results as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },
    /// Print store health metrics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(store_path) = &cli.store {
        config.store_path = Some(store_path.clone());
    }

    let store = Store::open(&config.resolved_store_path()).await?;
    let embedder = Arc::new(OllamaEmbedder::new(&config.embedding)?);

    match cli.command {
        Command::Sync {
            root,
            category,
            rebuild,
        } => {
            let indexer = Indexer::new(store, embedder, &config);
            let options = SyncOptions {
                category,
                force: rebuild,
            };
            let stats = indexer.sync(&root, &options).await?;
            println!(
                "added {} | updated {} | removed {} | unchanged {} | failed {} | chunks {}",
                stats.added, stats.updated, stats.removed, stats.unchanged, stats.failed,
                stats.chunks
            );
        }
        Command::Search {
            query,
            mode,
            limit,
            min_score,
            json,
        } => {
            let engine = SearchEngine::new(store, embedder);
            let results = engine.search(&query, mode, limit, min_score).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No matching chunks found.");
            } else {
                print!("{}", format_results(&results));
            }
        }
        Command::Stats => {
            let stats = store.stats().await?;
            println!("store size:      {} bytes", stats.db_size_bytes);
            println!("files:           {}", stats.files);
            println!("chunks:          {}", stats.chunks);
            println!(
                "embedding model: {}",
                stats.embedding_model.as_deref().unwrap_or("unknown")
            );
            println!(
                "embedding dim:   {}",
                stats
                    .embedding_dim
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
    }

    Ok(())
}

/// Format search results for terminal display.
fn format_results(results: &[SearchResult]) -> String {
    let mut output = String::new();
    for (i, result) in results.iter().enumerate() {
        let title = result
            .file_title
            .as_deref()
            .unwrap_or(result.file_path.as_str());
        let category = result.category.as_deref().unwrap_or("-");
        output.push_str(&format!(
            "{}. {} [{}] (score: {:.3}) lines {}-{}\n   {}\n",
            i + 1,
            title,
            category,
            result.score,
            result.start_line,
            result.end_line,
            snippet(&result.content),
        ));
    }
    output
}

/// First 200 characters of a chunk, snapped to a char boundary.
fn snippet(content: &str) -> String {
    let trimmed = content.trim().replace('\n', " ");
    if trimmed.len() <= 200 {
        return trimmed;
    }
    let mut end = 200;
    while !trimmed.is_char_boundary(end) && end < trimmed.len() {
        end += 1;
    }
    format!("{}...", &trimmed[..end])
}
