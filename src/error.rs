use thiserror::Error;

/// Per-page failure kinds. Every variant is scoped to a single URL; none of
/// them aborts a run.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The page contains no occurrence of the payload marker that is
    /// actually followed by a JSON object.
    #[error("payload marker not found")]
    MarkerAbsent,

    /// The document ended before the payload's braces balanced (truncated
    /// HTML, or an unterminated string literal inside the payload).
    #[error("payload braces never balanced (truncated document)")]
    UnterminatedPayload,

    /// The brace-balanced substring failed to decode as JSON.
    #[error("payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    /// The decoded payload lacks a required identity field; the record is
    /// dropped whole rather than emitted partially.
    #[error("payload missing required field: {0}")]
    SchemaViolation(&'static str),

    /// Timeout, connection reset, 429 or 5xx. Retried with backoff; becomes
    /// `Permanent` once retries are exhausted.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Non-retryable HTTP status, or a transient failure out of retries.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl ScrapeError {
    /// Stable label used in the failure manifest and the fetch_errors table.
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::MarkerAbsent => "marker_absent",
            ScrapeError::UnterminatedPayload => "unterminated_payload",
            ScrapeError::Decode(_) => "decode",
            ScrapeError::SchemaViolation(_) => "schema_violation",
            ScrapeError::Transient(_) => "transient",
            ScrapeError::Permanent(_) => "permanent",
        }
    }
}
