use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ScrapeError;
use crate::sources::SearchConfig;

/// Below this span (degrees, either axis) a viewport is not split further
/// even when its result count hits the cap.
const MIN_SPAN_DEG: f64 = 0.01;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

/// Viewport covering the continental US, the default discovery root.
pub const US_VIEWPORT: BoundingBox = BoundingBox {
    north: 49.0,
    east: -66.0,
    south: 24.0,
    west: -125.0,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub north: f64,
    pub east: f64,
    pub south: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Split into four equal quadrants around the center point.
    pub fn quadrants(&self) -> [BoundingBox; 4] {
        let mid_lat = (self.north + self.south) / 2.0;
        let mid_lng = (self.east + self.west) / 2.0;
        [
            BoundingBox { north: self.north, east: mid_lng, south: mid_lat, west: self.west },
            BoundingBox { north: self.north, east: self.east, south: mid_lat, west: mid_lng },
            BoundingBox { north: mid_lat, east: mid_lng, south: self.south, west: self.west },
            BoundingBox { north: mid_lat, east: self.east, south: self.south, west: mid_lng },
        ]
    }

    /// Smaller of the two axis extents, in degrees.
    pub fn span(&self) -> f64 {
        (self.north - self.south).min((self.east - self.west).abs())
    }
}

/// One page of search results for a viewport.
pub struct SearchPage {
    /// The source's reported result count for the whole viewport, truncated
    /// at its cap.
    pub total: usize,
    pub urls: Vec<String>,
}

#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn page(&self, viewport: &BoundingBox, offset: usize) -> Result<SearchPage, ScrapeError>;
}

/// Already-admitted listing URLs. `admit` is insert-if-absent, so a URL
/// surfacing in several overlapping viewports is emitted exactly once.
#[derive(Default)]
pub struct Frontier {
    seen: Mutex<HashSet<String>>,
}

impl Frontier {
    pub fn admit(&self, url: &str) -> bool {
        self.seen.lock().unwrap().insert(url.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Walk a capped search grid and return every distinct listing URL under
/// `root`, in discovery order.
///
/// A viewport whose reported count reaches the source's cap has a truncated
/// result set; it is split into quadrants and re-queried instead of walked.
/// Viewports under the cap are paged through in `stride` steps until a short
/// page.
///
/// Search failures are scoped to their viewport: a query that still fails
/// after retries skips that viewport (or ends its walk) and the traversal
/// continues, keeping everything already admitted.
pub async fn discover(
    source: &dyn SearchSource,
    cfg: &SearchConfig,
    root: BoundingBox,
) -> Result<Vec<String>, ScrapeError> {
    let frontier = Frontier::default();
    let mut urls = Vec::new();
    let mut stack = vec![root];

    while let Some(viewport) = stack.pop() {
        let first = match page_with_retry(source, &viewport, 0).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Search failed for viewport {:?}, skipping it: {}", viewport, e);
                continue;
            }
        };

        if first.total >= cfg.result_cap {
            if viewport.span() > MIN_SPAN_DEG {
                debug!(
                    "Viewport {:?} reports {} (cap {}), splitting",
                    viewport, first.total, cfg.result_cap
                );
                stack.extend(viewport.quadrants());
                continue;
            }
            // Can't split further; walk it and accept a possible under-count.
            warn!(
                "Viewport {:?} is at the result cap but below the minimum span; \
                 some listings may be missed",
                viewport
            );
        }

        admit_page(&frontier, &mut urls, &first);
        let mut offset = cfg.stride;
        let mut last_len = first.urls.len();
        while last_len == cfg.stride {
            let page = match page_with_retry(source, &viewport, offset).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        "Search failed at offset {} of viewport {:?}, ending its walk: {}",
                        offset, viewport, e
                    );
                    break;
                }
            };
            last_len = page.urls.len();
            admit_page(&frontier, &mut urls, &page);
            offset += cfg.stride;
        }
    }

    info!("Discovered {} listing URLs", urls.len());
    Ok(urls)
}

/// Transient search failures get the same backoff discipline as page
/// fetches; exhausted retries surface as a permanent failure the caller
/// scopes to the viewport.
async fn page_with_retry(
    source: &dyn SearchSource,
    viewport: &BoundingBox,
    offset: usize,
) -> Result<SearchPage, ScrapeError> {
    let mut attempt = 0;
    loop {
        match source.page(viewport, offset).await {
            Err(ScrapeError::Transient(msg)) => {
                if attempt == MAX_RETRIES {
                    return Err(ScrapeError::Permanent(format!("retries exhausted: {}", msg)));
                }
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "Transient search failure at offset {} (attempt {}/{}), backing off {:.1}s: {}",
                    offset,
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64(),
                    msg
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn admit_page(frontier: &Frontier, urls: &mut Vec<String>, page: &SearchPage) {
    for url in &page.urls {
        if frontier.admit(url) {
            urls.push(url.clone());
        }
    }
}

/// Live search client speaking the site's viewport search API.
pub struct HttpSearchSource {
    client: reqwest::Client,
    endpoint: String,
    base: String,
    stride: usize,
}

impl HttpSearchSource {
    pub fn new(cfg: &SearchConfig) -> anyhow::Result<Self> {
        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        let base = {
            let parsed = url::Url::parse(&endpoint)?;
            format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or_default())
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            base,
            stride: cfg.stride,
        })
    }

    fn request_body(&self, viewport: &BoundingBox, offset: usize) -> Value {
        let ne = json!({ "latitude": viewport.north, "longitude": viewport.east });
        let sw = json!({ "latitude": viewport.south, "longitude": viewport.west });
        json!({
            "rawLolSearchQuery": {
                "listingTypes": [2],
                "saleStatuses": [12, 9],
                "num": self.stride,
                "start": offset,
                "sortOrder": 46,
                "nePoint": ne,
                "swPoint": sw,
            },
            "viewport": { "northeast": ne, "southwest": sw },
            "viewportFrom": "response",
            "purpose": "search",
        })
    }

    fn parse_response(&self, data: &Value) -> SearchPage {
        let results = data.get("lolResults").unwrap_or(data);
        let total = results
            .get("totalItems")
            .or_else(|| data.get("totalCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let urls = results
            .get("data")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("listing").unwrap_or(item).get("navigationPageLink"))
                    .filter_map(|l| l.as_str())
                    .map(|path| format!("{}{}", self.base, path))
                    .collect()
            })
            .unwrap_or_default();
        SearchPage { total, urls }
    }
}

#[async_trait]
impl SearchSource for HttpSearchSource {
    async fn page(&self, viewport: &BoundingBox, offset: usize) -> Result<SearchPage, ScrapeError> {
        const UAS: &[&str] = &[
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        ];
        let ua = UAS.choose(&mut rand::thread_rng()).copied().unwrap_or(UAS[0]);
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::USER_AGENT, ua)
            .header(reqwest::header::REFERER, &self.base)
            .json(&self.request_body(viewport, offset))
            .send()
            .await
            .map_err(|e| ScrapeError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ScrapeError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ScrapeError::Permanent(format!("HTTP {}", status)));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| ScrapeError::Transient(e.to_string()))?;
        Ok(self.parse_response(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CFG: SearchConfig = SearchConfig {
        endpoint: "https://search.test/",
        result_cap: 500,
        stride: 40,
    };

    struct FnSource<F>(F);

    #[async_trait]
    impl<F> SearchSource for FnSource<F>
    where
        F: Fn(&BoundingBox, usize) -> Result<SearchPage, ScrapeError> + Send + Sync,
    {
        async fn page(&self, v: &BoundingBox, offset: usize) -> Result<SearchPage, ScrapeError> {
            (self.0)(v, offset)
        }
    }

    fn page_of(prefix: &str, offset: usize, len: usize) -> SearchPage {
        SearchPage {
            total: 0,
            urls: (offset..offset + len)
                .map(|i| format!("https://x/{}/{}", prefix, i))
                .collect(),
        }
    }

    #[tokio::test]
    async fn offset_walk_ends_on_short_page() {
        // 100 results: pages of 40, 40, 20.
        let source = FnSource(|_: &BoundingBox, offset| {
            let len = if offset < 80 { 40 } else { 20 };
            Ok(SearchPage { total: 100, ..page_of("a", offset, len) })
        });
        let urls = discover(&source, &CFG, US_VIEWPORT).await.unwrap();
        assert_eq!(urls.len(), 100);
        assert_eq!(urls[0], "https://x/a/0");
        assert_eq!(urls[99], "https://x/a/99");
    }

    #[tokio::test]
    async fn capped_viewport_splits_into_quadrants() {
        let splits = AtomicUsize::new(0);
        let source = FnSource(|v: &BoundingBox, offset| {
            if *v == US_VIEWPORT {
                splits.fetch_add(1, Ordering::SeqCst);
                // Truncated set; these URLs must not be taken at face value.
                Ok(SearchPage { total: 500, ..page_of("root", offset, 40) })
            } else {
                let prefix = format!("{:.0}x{:.0}", v.north, v.east);
                Ok(SearchPage { total: 10, ..page_of(&prefix, offset, 10) })
            }
        });
        let urls = discover(&source, &CFG, US_VIEWPORT).await.unwrap();
        assert_eq!(splits.load(Ordering::SeqCst), 1, "capped root queried once");
        assert_eq!(urls.len(), 40);
        assert!(urls.iter().all(|u| !u.contains("/root/")));
    }

    #[tokio::test]
    async fn nested_split_when_quadrant_is_still_capped() {
        let root = BoundingBox { north: 4.0, east: 4.0, south: 0.0, west: 0.0 };
        let source = FnSource(move |v: &BoundingBox, offset| {
            if v.span() > 1.1 {
                Ok(SearchPage { total: 500, urls: vec![] })
            } else {
                let prefix = format!("{:.0}-{:.0}", v.south, v.west);
                Ok(SearchPage { total: 5, ..page_of(&prefix, offset, 5) })
            }
        });
        let urls = discover(&source, &CFG, root).await.unwrap();
        // Two levels of splitting: 16 leaf viewports of 5 each.
        assert_eq!(urls.len(), 80);
    }

    #[tokio::test]
    async fn overlapping_viewports_deduplicated() {
        let source = FnSource(|v: &BoundingBox, offset| {
            if *v == US_VIEWPORT {
                Ok(SearchPage { total: 500, urls: vec![] })
            } else {
                // Every quadrant reports the same three listings.
                Ok(SearchPage { total: 3, ..page_of("shared", offset, 3) })
            }
        });
        let urls = discover(&source, &CFG, US_VIEWPORT).await.unwrap();
        assert_eq!(urls.len(), 3);
    }

    #[tokio::test]
    async fn minimum_span_viewport_walked_despite_cap() {
        let tiny = BoundingBox { north: 40.005, east: -73.0, south: 40.0, west: -73.005 };
        let calls = AtomicUsize::new(0);
        let source = FnSource(|_: &BoundingBox, offset| {
            calls.fetch_add(1, Ordering::SeqCst);
            let len = if offset == 0 { 40 } else { 10 };
            Ok(SearchPage { total: 500, ..page_of("tiny", offset, len) })
        });
        let urls = discover(&source, &CFG, tiny).await.unwrap();
        assert_eq!(urls.len(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_search_error_retried_during_walk() {
        let attempts = AtomicUsize::new(0);
        let source = FnSource(|v: &BoundingBox, offset| {
            if *v == US_VIEWPORT {
                return Ok(SearchPage { total: 500, urls: vec![] });
            }
            // The north-west quadrant's first probe trips a rate limit once.
            if v.north == US_VIEWPORT.north
                && v.west == US_VIEWPORT.west
                && offset == 0
                && attempts.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(ScrapeError::Transient("HTTP 429".into()));
            }
            let prefix = format!("{:.0}-{:.0}", v.north, v.west);
            Ok(SearchPage { total: 5, ..page_of(&prefix, offset, 5) })
        });
        let urls = discover(&source, &CFG, US_VIEWPORT).await.unwrap();
        // All four quadrants contribute, including the retried one.
        assert_eq!(urls.len(), 20);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_viewport_skipped_without_losing_siblings() {
        let source = FnSource(|v: &BoundingBox, offset| {
            if *v == US_VIEWPORT {
                return Ok(SearchPage { total: 500, urls: vec![] });
            }
            if v.north == US_VIEWPORT.north && v.west == US_VIEWPORT.west {
                return Err(ScrapeError::Transient("HTTP 503".into()));
            }
            let prefix = format!("{:.0}-{:.0}", v.north, v.west);
            Ok(SearchPage { total: 5, ..page_of(&prefix, offset, 5) })
        });
        // One quadrant exhausts its retries; the other three still land.
        let urls = discover(&source, &CFG, US_VIEWPORT).await.unwrap();
        assert_eq!(urls.len(), 15);
    }

    #[tokio::test]
    async fn walk_failure_keeps_earlier_pages() {
        let source = FnSource(|_: &BoundingBox, offset| {
            if offset == 0 {
                Ok(SearchPage { total: 100, ..page_of("a", 0, 40) })
            } else {
                Err(ScrapeError::Permanent("HTTP 410".into()))
            }
        });
        let urls = discover(&source, &CFG, US_VIEWPORT).await.unwrap();
        assert_eq!(urls.len(), 40);
    }

    #[test]
    fn quadrants_tile_the_parent() {
        let q = US_VIEWPORT.quadrants();
        assert_eq!(q[0].west, US_VIEWPORT.west);
        assert_eq!(q[1].east, US_VIEWPORT.east);
        assert_eq!(q[2].south, US_VIEWPORT.south);
        assert!((q[0].south - q[2].north).abs() < f64::EPSILON);
    }

    #[test]
    fn frontier_admits_each_url_once() {
        let f = Frontier::default();
        assert!(f.admit("https://x/1"));
        assert!(!f.admit("https://x/1"));
        assert!(f.admit("https://x/2"));
        assert_eq!(f.len(), 2);
    }
}
