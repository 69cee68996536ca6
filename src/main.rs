//! # Severus CLI (`severus`)
//!
//! ## Usage
//!
//! ```bash
//! severus --config ./config/severus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `severus serve` | Start the HTTP server |
//! | `severus ingest [--dry-run] [--full]` | Build or refresh the embeddings cache |
//! | `severus status` | Print cache readiness and statistics |
//! | `severus search "<query>"` | Run corpus retrieval from the command line |
//! | `severus catalog` | List supported satellites and their bands |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use severus::config;
use severus::corpus;
use severus::embedding::create_provider;
use severus::ingest::{run_ingest, IngestOptions};
use severus::server;
use severus_core::catalog::{self, SpectralIndex, CATALOG};

/// Severus: burn-severity maps and a wildfire assistant.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/severus.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "severus",
    about = "Burn-severity mapping over Earth Engine imagery with a retrieval-augmented wildfire assistant",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/severus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Extract, chunk and embed the document folder into the cache file.
    ///
    /// Unchanged chunks keep their previous embedding unless `--full` is given.
    Ingest {
        /// Scan and chunk only; embed nothing and leave the cache untouched.
        #[arg(long)]
        dry_run: bool,

        /// Re-embed every chunk, ignoring the existing cache.
        #[arg(long)]
        full: bool,
    },

    /// Show whether the embeddings cache is loaded and what it holds.
    Status,

    /// Search the corpus the way the assistant does.
    Search {
        /// Question or keywords.
        query: String,

        /// Maximum number of results (default: `[rag].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum cosine similarity (default: `[rag].min_similarity`).
        #[arg(long)]
        min_similarity: Option<f32>,
    },

    /// List the satellite catalog. Does not need a config file.
    Catalog,
}

fn print_catalog() {
    println!("{:<10} {:<34} {:<30} {:>6}  NDVI / NBR", "KEY", "LABEL", "COLLECTION", "SCALE");
    for profile in CATALOG {
        let ndvi = profile.bands(SpectralIndex::Ndvi);
        let nbr = profile.bands(SpectralIndex::Nbr);
        println!(
            "{:<10} {:<34} {:<30} {:>5}m  {},{} / {},{}",
            profile.key,
            catalog::label_for(profile.key).unwrap_or("-"),
            profile.collection_id,
            profile.pixel_scale,
            ndvi.numerator,
            ndvi.denominator,
            nbr.numerator,
            nbr.denominator
        );
    }
}

/// `RUST_LOG` directives when present and valid, `info` otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Catalog = cli.command {
        catalog::validate_catalog()?;
        print_catalog();
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { dry_run, full } => {
            let provider = create_provider(&cfg.embedding)?;
            if !dry_run && !cfg.embedding.is_enabled() {
                eprintln!("Warning: embedding provider is disabled; chunks will be stored without vectors.");
            }
            let (report, _) =
                run_ingest(&cfg, provider.as_ref(), IngestOptions { dry_run, full }).await?;
            report.print();
        }
        Commands::Status => {
            corpus::run_status(&cfg).await?;
        }
        Commands::Search {
            query,
            top_k,
            min_similarity,
        } => {
            if !cfg.embedding.is_enabled() {
                anyhow::bail!("Search requires an embedding provider; set [embedding].provider");
            }
            let provider = Arc::from(create_provider(&cfg.embedding)?);
            corpus::run_search(&cfg, provider, &query, top_k, min_similarity).await?;
        }
        Commands::Catalog => {}
    }

    Ok(())
}
