//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::http::{CacheRequest, CachedResponse};

/// One row of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
  pub method: String,
  pub url: String,
  pub status: u16,
  pub size: usize,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Implementations must tolerate concurrent callers; the agent adds no locking
/// of its own and never relies on read-modify-write atomicity across calls.
pub trait CacheStorage: Send + Sync {
  /// Open a bucket, creating it if it does not exist.
  fn open(&self, name: &str) -> Result<()>;

  /// Whether a bucket with this name exists.
  fn has(&self, name: &str) -> Result<bool>;

  /// Names of all buckets in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all of its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a request in every bucket, oldest bucket first.
  fn match_request(&self, request: &CacheRequest) -> Result<Option<CachedResponse>>;

  /// Look up a request in a single bucket.
  fn match_in(&self, bucket: &str, request: &CacheRequest) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the same request.
  /// Creates the bucket if it does not exist.
  fn put(&self, bucket: &str, request: &CacheRequest, response: &CachedResponse) -> Result<()>;

  /// Store several responses atomically: either all are written or none are.
  fn put_all(&self, bucket: &str, entries: &[(CacheRequest, CachedResponse)]) -> Result<()>;

  /// List the entries of a bucket.
  fn entries(&self, bucket: &str) -> Result<Vec<EntrySummary>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - every lookup misses and writes are dropped.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, _name: &str) -> Result<()> {
    Ok(())
  }

  fn has(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn match_request(&self, _request: &CacheRequest) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn match_in(&self, _bucket: &str, _request: &CacheRequest) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _bucket: &str, _request: &CacheRequest, _response: &CachedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _bucket: &str, _entries: &[(CacheRequest, CachedResponse)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn entries(&self, _bucket: &str) -> Result<Vec<EntrySummary>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory database, dropped with the storage.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named buckets, id gives creation order
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by hashed method + URL
CREATE TABLE IF NOT EXISTS entries (
    bucket_id INTEGER NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket_id, request_key),
    FOREIGN KEY (bucket_id) REFERENCES buckets(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_request ON entries(request_key);
"#;

const RESPONSE_COLUMNS: &str =
  "e.response_url, e.status, e.status_text, e.headers, e.body, e.cached_at";

/// Raw response columns, decoded outside the row closure so JSON and date
/// errors surface as cache errors rather than SQL errors.
struct ResponseRow {
  url: String,
  status: u16,
  status_text: String,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl ResponseRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      url: row.get(0)?,
      status: row.get(1)?,
      status_text: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      cached_at: row.get(5)?,
    })
  }

  fn into_response(self) -> Result<CachedResponse> {
    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(CachedResponse {
      url: self.url,
      status: self.status,
      status_text: self.status_text,
      headers,
      body: self.body,
      cached_at: Some(parse_datetime(&self.cached_at)?),
    })
  }
}

/// Insert the bucket if missing and return its id.
fn ensure_bucket(conn: &Connection, name: &str) -> Result<i64> {
  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", name, e))?;

  conn
    .query_row(
      "SELECT id FROM buckets WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up bucket {}: {}", name, e))
}

fn insert_entry(
  conn: &Connection,
  bucket_id: i64,
  request: &CacheRequest,
  response: &CachedResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (bucket_id, request_key, method, url, response_url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket_id,
        request.cache_key(),
        request.method().as_str(),
        request.url().as_str(),
        response.url,
        response.status,
        response.status_text,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    ensure_bucket(&conn, name)?;
    Ok(())
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM buckets WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM entries WHERE bucket_id IN (SELECT id FROM buckets WHERE name = ?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, request: &CacheRequest) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT {} FROM entries e
       INNER JOIN buckets b ON b.id = e.bucket_id
       WHERE e.request_key = ?
       ORDER BY b.id
       LIMIT 1",
      RESPONSE_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![request.cache_key()], ResponseRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", request, e))?;

    row.map(ResponseRow::into_response).transpose()
  }

  fn match_in(&self, bucket: &str, request: &CacheRequest) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT {} FROM entries e
       INNER JOIN buckets b ON b.id = e.bucket_id
       WHERE b.name = ? AND e.request_key = ?",
      RESPONSE_COLUMNS
    );

    let row = conn
      .query_row(
        &sql,
        params![bucket, request.cache_key()],
        ResponseRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", request, bucket, e))?;

    row.map(ResponseRow::into_response).transpose()
  }

  fn put(&self, bucket: &str, request: &CacheRequest, response: &CachedResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let bucket_id = ensure_bucket(&conn, bucket)?;
    insert_entry(&conn, bucket_id, request, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(CacheRequest, CachedResponse)]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let bucket_id = ensure_bucket(&tx, bucket)?;
    for (request, response) in entries {
      insert_entry(&tx, bucket_id, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, bucket: &str) -> Result<Vec<EntrySummary>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT e.method, e.url, e.status, length(e.body), e.cached_at FROM entries e
         INNER JOIN buckets b ON b.id = e.bucket_id
         WHERE b.name = ?
         ORDER BY e.url",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, u16>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, String>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, status, size, cached_at)| -> Result<EntrySummary> {
        Ok(EntrySummary {
          method,
          url,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
