use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rusqlite::Connection;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ScrapeError;
use crate::extract;
use crate::normalize;
use crate::record::Listing;
use crate::sources::SourceProfile;

pub const DEFAULT_CONCURRENCY: usize = 10;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const REQUEST_TIMEOUT_SECS: u64 = 30;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Version/17.4 Safari/605.1.15 AppleWebKit/605.1.15 (KHTML, like Gecko)",
];

/// How a page is fetched. The production impl is HTTP; tests substitute
/// instrumented stubs.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        let ua = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, ua)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ScrapeError::Transient(e.to_string())
                } else {
                    ScrapeError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ScrapeError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ScrapeError::Permanent(format!("HTTP {}", status)));
        }
        response
            .text()
            .await
            .map_err(|e| ScrapeError::Transient(e.to_string()))
    }
}

/// One finished page, emitted in completion order.
pub struct PageOutcome {
    pub page_id: i64,
    pub url: String,
    pub result: Result<Listing, ScrapeError>,
    pub latency_ms: i64,
}

pub struct PipelineOptions {
    pub concurrency: usize,
    /// Stop admitting new pages once this many records have been produced.
    /// Pages already in flight run to completion, so the final count may
    /// exceed the limit by at most the concurrency width.
    pub limit: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            limit: None,
        }
    }
}

pub struct PipelineStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
    pub error_kinds: BTreeMap<&'static str, usize>,
}

/// Spawn the bounded workers and return the completion-order result stream.
/// Duplicate URLs are admitted once (first occurrence wins); at most
/// `concurrency` fetches are in flight at any instant.
pub fn spawn_workers(
    fetcher: Arc<dyn Fetcher>,
    profile: SourceProfile,
    pages: Vec<(i64, String)>,
    opts: &PipelineOptions,
) -> mpsc::Receiver<PageOutcome> {
    let mut seen = HashSet::new();
    let pages: Vec<(i64, String)> = pages
        .into_iter()
        .filter(|(_, url)| seen.insert(url.clone()))
        .collect();

    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    let produced = Arc::new(AtomicUsize::new(0));
    let limit = opts.limit;
    let (tx, rx) = mpsc::channel::<PageOutcome>(opts.concurrency * 2);

    for (page_id, url) in pages {
        let fetcher = Arc::clone(&fetcher);
        let sem = Arc::clone(&semaphore);
        let produced = Arc::clone(&produced);
        let profile = profile.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            // Admission gate: re-checked under the permit so a reached limit
            // stops new fetches without cancelling in-flight pages.
            if let Some(limit) = limit {
                if produced.load(Ordering::SeqCst) >= limit {
                    return;
                }
            }

            let (result, latency_ms) = process_page(fetcher.as_ref(), &profile, &url).await;

            if result.is_ok() {
                produced.fetch_add(1, Ordering::SeqCst);
            }
            let _ = tx
                .send(PageOutcome {
                    page_id,
                    url,
                    result,
                    latency_ms,
                })
                .await;
        });
    }
    // Receiver closes once every spawned task has finished.
    drop(tx);

    rx
}

/// Fetch, extract and normalize one page, reporting the latency of the
/// final fetch attempt. Every failure is scoped to this URL; callers record
/// it and move on.
async fn process_page(
    fetcher: &dyn Fetcher,
    profile: &SourceProfile,
    url: &str,
) -> (Result<Listing, ScrapeError>, i64) {
    let (fetched, latency_ms) = fetch_with_retry(fetcher, url).await;
    let result = fetched.and_then(|body| {
        let payload = extract::payload(&body, profile.marker)?;
        normalize::normalize(&payload.value, profile, url)
    });
    (result, latency_ms)
}

/// Latency covers the last request only, never the backoff sleeps.
async fn fetch_with_retry(fetcher: &dyn Fetcher, url: &str) -> (Result<String, ScrapeError>, i64) {
    let mut attempt = 0;
    loop {
        let start = Instant::now();
        let fetched = fetcher.fetch(url).await;
        let latency_ms = start.elapsed().as_millis() as i64;
        match fetched {
            Err(ScrapeError::Transient(msg)) => {
                if attempt == MAX_RETRIES {
                    let err = ScrapeError::Permanent(format!("retries exhausted: {}", msg));
                    return (Err(err), latency_ms);
                }
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "Transient failure on {} (attempt {}/{}), backing off {:.1}s: {}",
                    url,
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64(),
                    msg
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return (other, latency_ms),
        }
    }
}

/// Scrape pages concurrently, saving each record to the DB as it arrives.
pub async fn scrape_pages_streaming(
    conn: &Connection,
    fetcher: Arc<dyn Fetcher>,
    profile: &SourceProfile,
    pages: Vec<(i64, String)>,
    opts: &PipelineOptions,
) -> Result<PipelineStats> {
    let total = pages.len();
    let mut rx = spawn_workers(fetcher, profile.clone(), pages, opts);

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Prepare statements once, reuse for each row
    let mut insert_listing = conn.prepare(
        "INSERT INTO listings (source, listing_id, url, record, latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(source, listing_id) DO UPDATE SET
             url = excluded.url,
             record = excluded.record,
             latency_ms = excluded.latency_ms,
             scraped_at = datetime('now')",
    )?;
    let mut insert_error = conn.prepare(
        "INSERT INTO fetch_errors (source, url, kind, message) VALUES (?1, ?2, ?3, ?4)",
    )?;
    let mut mark_visited =
        conn.prepare("UPDATE pages SET visited = 1, visited_at = datetime('now') WHERE id = ?1")?;

    let mut ok = 0usize;
    let mut errors = 0usize;
    let mut error_kinds: BTreeMap<&'static str, usize> = BTreeMap::new();

    while let Some(outcome) = rx.recv().await {
        match &outcome.result {
            Ok(listing) => {
                let record = serde_json::to_string(listing)?;
                insert_listing.execute(rusqlite::params![
                    listing.source_name,
                    listing.listing_id,
                    outcome.url,
                    record,
                    outcome.latency_ms,
                ])?;
                ok += 1;
            }
            Err(e) => {
                warn!("Failed {}: {}", outcome.url, e);
                insert_error.execute(rusqlite::params![
                    profile.name,
                    outcome.url,
                    e.kind(),
                    e.to_string(),
                ])?;
                *error_kinds.entry(e.kind()).or_insert(0) += 1;
                errors += 1;
            }
        }
        mark_visited.execute(rusqlite::params![outcome.page_id])?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!("Scraped {} pages ({} ok, {} errors)", ok + errors, ok, errors);

    Ok(PipelineStats {
        total,
        ok,
        errors,
        error_kinds,
    })
}
