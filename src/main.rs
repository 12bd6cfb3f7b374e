mod db;
mod error;
mod extract;
mod grid;
mod normalize;
mod pipeline;
mod record;
mod sitemap;
mod sources;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::pipeline::PipelineOptions;
use crate::sources::SourceProfile;

#[derive(Parser)]
#[command(name = "listing_scraper", about = "Real-estate listing scraper (inline JSON payloads)")]
struct Cli {
    /// SQLite database path
    #[arg(long, default_value = db::DEFAULT_DB_PATH, global = true)]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Discover listing URLs (sitemap or grid search) and populate the queue
    Discover {
        /// Source to discover (jll, compass)
        source: String,
    },
    /// Scrape unvisited pages into normalized records
    Scrape {
        /// Source to scrape (jll, compass)
        source: String,
        /// Max records to produce (default: all unvisited)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Max concurrent fetches
        #[arg(short, long, default_value_t = pipeline::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Discover + scrape in one pass
    Run {
        /// Source to run (jll, compass)
        source: String,
        /// Max records to produce
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Max concurrent fetches
        #[arg(short, long, default_value_t = pipeline::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Show queue and scraping statistics
    Stats {
        /// Source to report on (jll, compass)
        source: String,
    },
}

fn lookup(source: &str) -> anyhow::Result<SourceProfile> {
    match sources::profile(source) {
        Some(p) => Ok(p),
        None => bail!(
            "unknown source '{}' (known: {})",
            source,
            sources::known_sources().join(", ")
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            println!("Initialized {}", cli.db);
            Ok(())
        }
        Commands::Discover { source } => {
            let profile = lookup(&source)?;
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let urls = discover(&profile).await?;
            let inserted = db::insert_pages(&conn, profile.name, &urls)?;
            println!(
                "Inserted {} new listing URLs ({} total discovered)",
                inserted,
                urls.len()
            );
            Ok(())
        }
        Commands::Scrape {
            source,
            limit,
            concurrency,
        } => {
            let profile = lookup(&source)?;
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let pages = db::fetch_unvisited(&conn, profile.name, None)?;
            if pages.is_empty() {
                println!("No unvisited pages. Run 'discover {}' first.", source);
                return Ok(());
            }
            scrape(&conn, &profile, pages, limit, concurrency).await
        }
        Commands::Run {
            source,
            limit,
            concurrency,
        } => {
            let profile = lookup(&source)?;
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;

            let t_discover = Instant::now();
            let urls = discover(&profile).await?;
            let inserted = db::insert_pages(&conn, profile.name, &urls)?;
            println!(
                "Discovered {} URLs ({} new) in {:.1}s",
                urls.len(),
                inserted,
                t_discover.elapsed().as_secs_f64()
            );

            let pages = db::fetch_unvisited(&conn, profile.name, None)?;
            if pages.is_empty() {
                println!("Nothing to scrape (all pages already visited).");
                return Ok(());
            }
            scrape(&conn, &profile, pages, limit, concurrency).await
        }
        Commands::Stats { source } => {
            let profile = lookup(&source)?;
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn, profile.name)?;
            println!("Queued:    {}", s.pages);
            println!("Visited:   {}", s.visited);
            println!("Unvisited: {}", s.unvisited);
            println!("Listings:  {}", s.listings);
            println!("Errors:    {}", s.errors);
            for (kind, count) in &s.error_kinds {
                println!("  {:<22} {}", kind, count);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Pick the discovery strategy the source supports: sitemap walk when it
/// publishes one, capped grid search otherwise.
async fn discover(profile: &SourceProfile) -> anyhow::Result<Vec<String>> {
    if profile.sitemap.is_some() {
        return sitemap::fetch_listing_urls(profile).await;
    }
    let cfg = profile
        .search
        .as_ref()
        .with_context(|| format!("source '{}' has no discovery method", profile.name))?;
    let source = grid::HttpSearchSource::new(cfg)?;
    let urls = grid::discover(&source, cfg, grid::US_VIEWPORT).await?;
    Ok(urls)
}

async fn scrape(
    conn: &rusqlite::Connection,
    profile: &SourceProfile,
    pages: Vec<(i64, String)>,
    limit: Option<usize>,
    concurrency: usize,
) -> anyhow::Result<()> {
    println!("Scraping {} pages (streaming to DB)...", pages.len());
    let fetcher = Arc::new(pipeline::HttpFetcher::new()?);
    let opts = PipelineOptions { concurrency, limit };
    let stats = pipeline::scrape_pages_streaming(conn, fetcher, profile, pages, &opts).await?;
    println!(
        "Done: {} records, {} errors (of {} queued).",
        stats.ok, stats.errors, stats.total
    );
    for (kind, count) in &stats.error_kinds {
        println!("  {:<22} {}", kind, count);
    }
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
