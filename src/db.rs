use anyhow::Result;
use rusqlite::Connection;

pub const DEFAULT_DB_PATH: &str = "data/listings.sqlite";

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pages (
            id         INTEGER PRIMARY KEY,
            source     TEXT NOT NULL,
            url        TEXT UNIQUE NOT NULL,
            visited    BOOLEAN NOT NULL DEFAULT 0,
            visited_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_pages_visited ON pages(source, visited);

        -- One normalized record per listing; re-scrapes replace in place.
        CREATE TABLE IF NOT EXISTS listings (
            id         INTEGER PRIMARY KEY,
            source     TEXT NOT NULL,
            listing_id TEXT NOT NULL,
            url        TEXT NOT NULL,
            record     TEXT NOT NULL,
            latency_ms INTEGER,
            scraped_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source, listing_id)
        );
        CREATE INDEX IF NOT EXISTS idx_listings_source ON listings(source);

        CREATE TABLE IF NOT EXISTS fetch_errors (
            id          INTEGER PRIMARY KEY,
            source      TEXT NOT NULL,
            url         TEXT NOT NULL,
            kind        TEXT NOT NULL,
            message     TEXT NOT NULL,
            occurred_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_errors_kind ON fetch_errors(source, kind);
        ",
    )?;
    Ok(())
}

// ── URL queue ──

pub fn insert_pages(conn: &Connection, source: &str, urls: &[String]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO pages (source, url) VALUES (?1, ?2)")?;
        for url in urls {
            count += stmt.execute(rusqlite::params![source, url])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn fetch_unvisited(
    conn: &Connection,
    source: &str,
    limit: Option<usize>,
) -> Result<Vec<(i64, String)>> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT id, url FROM pages WHERE source = ?1 AND visited = 0 ORDER BY id LIMIT {}",
            n
        ),
        None => "SELECT id, url FROM pages WHERE source = ?1 AND visited = 0 ORDER BY id"
            .to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([source], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub pages: usize,
    pub visited: usize,
    pub unvisited: usize,
    pub listings: usize,
    pub errors: usize,
    pub error_kinds: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection, source: &str) -> Result<Stats> {
    let pages: usize = conn.query_row(
        "SELECT COUNT(*) FROM pages WHERE source = ?1",
        [source],
        |r| r.get(0),
    )?;
    let visited: usize = conn.query_row(
        "SELECT COUNT(*) FROM pages WHERE source = ?1 AND visited = 1",
        [source],
        |r| r.get(0),
    )?;
    let listings: usize = conn.query_row(
        "SELECT COUNT(*) FROM listings WHERE source = ?1",
        [source],
        |r| r.get(0),
    )?;
    let errors: usize = conn.query_row(
        "SELECT COUNT(*) FROM fetch_errors WHERE source = ?1",
        [source],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT kind, COUNT(*) FROM fetch_errors WHERE source = ?1
         GROUP BY kind ORDER BY COUNT(*) DESC",
    )?;
    let error_kinds = stmt
        .query_map([source], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stats {
        pages,
        visited,
        unvisited: pages - visited,
        listings,
        errors,
        error_kinds,
    })
}
