//! SQLite persistence for identities, face encodings, queries and suggestions.
//!
//! Encodings are stored as two little-endian `f64` blobs (`vec_low`, `vec_high`).
//! Nearest-owner lookups run in SQL through the `face_distance` scalar function
//! registered on every connection.
//!
//! All helpers take `&Connection` so they can run inside a `Transaction`.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::time::Duration;

use crate::error::RecognitionError;
use crate::frame::FaceRect;

/// Length of each encoding half.
pub const HALF_LEN: usize = 64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Known person.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Identity {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
}

impl Identity {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Persisted embedding of a known face.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaceEncoding {
    pub id: String,
    pub identity_id: String,
    pub vec_low: Vec<f64>,
    pub vec_high: Vec<f64>,
}

/// Recognition attempt waiting on review.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryRow {
    pub id: String,
    pub camera_id: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    pub suggestion_count: u32,
}

/// One face of a query that needs review.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SuggestionRow {
    pub id: String,
    pub query_id: String,
    pub rect: FaceRect,
    #[serde(skip)]
    pub vec_low: Vec<f64>,
    #[serde(skip)]
    pub vec_high: Vec<f64>,
    pub identity_id: Option<String>,
    pub score: Option<f64>,
    pub created_at: i64,
}

/// Open a store connection: WAL, foreign keys, busy timeout, schema and SQL functions.
pub fn open_store(db_path: &str) -> Result<Connection> {
    let conn = crate::open_db_connection(db_path)
        .with_context(|| format!("open database {}", db_path))?;
    prepare(&conn)?;
    Ok(conn)
}

/// Make an already open connection usable as a store.
pub fn prepare(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    ensure_schema(conn)?;
    register_functions(conn)?;
    Ok(())
}

pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS identity (
          id TEXT PRIMARY KEY,
          first_name TEXT NOT NULL,
          last_name TEXT NOT NULL,
          created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS face_encoding (
          id TEXT PRIMARY KEY,
          identity_id TEXT NOT NULL REFERENCES identity(id) ON DELETE CASCADE,
          vec_low BLOB NOT NULL,
          vec_high BLOB NOT NULL,
          created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS query (
          id TEXT PRIMARY KEY,
          camera_id TEXT,
          created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS suggestion (
          id TEXT PRIMARY KEY,
          query_id TEXT NOT NULL REFERENCES query(id) ON DELETE CASCADE,
          identity_id TEXT REFERENCES identity(id) ON DELETE SET NULL,
          rect TEXT NOT NULL,
          vec_low BLOB NOT NULL,
          vec_high BLOB NOT NULL,
          score REAL,
          created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_face_encoding_identity ON face_encoding(identity_id);
        CREATE INDEX IF NOT EXISTS idx_suggestion_query ON suggestion(query_id);
        CREATE INDEX IF NOT EXISTS idx_query_created ON query(created_at);
        "#,
    )?;
    Ok(())
}

/// Register `face_distance(vec_low, vec_high, probe_low, probe_high)`:
/// `sqrt(|vec_low - probe_low|² + |vec_high - probe_high|²)`.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "face_distance",
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let mut halves = Vec::with_capacity(4);
            for index in 0..4 {
                let blob = ctx
                    .get_raw(index)
                    .as_blob()
                    .map_err(|err| rusqlite::Error::UserFunctionError(Box::new(err)))?;
                halves.push(
                    blob_to_vec(blob)
                        .map_err(|err| rusqlite::Error::UserFunctionError(err.into()))?,
                );
            }
            let low = squared_distance(&halves[0], &halves[2])
                .map_err(|err| rusqlite::Error::UserFunctionError(err.into()))?;
            let high = squared_distance(&halves[1], &halves[3])
                .map_err(|err| rusqlite::Error::UserFunctionError(err.into()))?;
            Ok((low + high).sqrt())
        },
    )?;
    Ok(())
}

fn squared_distance(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(anyhow!(
            "encoding halves differ in length ({} vs {})",
            a.len(),
            b.len()
        ));
    }
    Ok(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum())
}

pub fn vec_to_blob(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f64>> {
    if blob.len() % 8 != 0 {
        return Err(anyhow!("encoding blob of {} bytes is not a f64 array", blob.len()));
    }
    Ok(blob
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}

/// Split a full embedding into its stored halves.
pub fn split_encoding(encoding: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
    if encoding.len() != HALF_LEN * 2 {
        return Err(RecognitionError::InvalidEncoding {
            expected: HALF_LEN * 2,
            actual: encoding.len(),
        }
        .into());
    }
    let (low, high) = encoding.split_at(HALF_LEN);
    Ok((low.to_vec(), high.to_vec()))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// -------------------- Identities --------------------

pub fn insert_identity(conn: &Connection, id: &str, first_name: &str, last_name: &str) -> Result<Identity> {
    conn.execute(
        "INSERT INTO identity (id, first_name, last_name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, first_name, last_name, now_millis()],
    )?;
    Ok(Identity {
        id: id.to_string(),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
    })
}

pub fn get_identity(conn: &Connection, id: &str) -> Result<Option<Identity>> {
    Ok(conn
        .query_row(
            "SELECT id, first_name, last_name FROM identity WHERE id = ?1",
            params![id],
            identity_from_row,
        )
        .optional()?)
}

pub fn list_identities(conn: &Connection) -> Result<Vec<Identity>> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name FROM identity ORDER BY last_name, first_name, id",
    )?;
    let rows = stmt.query_map([], identity_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
    })
}

// -------------------- Face encodings --------------------

pub fn insert_face_encoding(
    conn: &Connection,
    id: &str,
    identity_id: &str,
    vec_low: &[f64],
    vec_high: &[f64],
) -> Result<FaceEncoding> {
    conn.execute(
        "INSERT INTO face_encoding (id, identity_id, vec_low, vec_high, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            identity_id,
            vec_to_blob(vec_low),
            vec_to_blob(vec_high),
            now_millis()
        ],
    )?;
    Ok(FaceEncoding {
        id: id.to_string(),
        identity_id: identity_id.to_string(),
        vec_low: vec_low.to_vec(),
        vec_high: vec_high.to_vec(),
    })
}

pub fn list_face_encodings(conn: &Connection, identity_id: &str) -> Result<Vec<FaceEncoding>> {
    let mut stmt = conn.prepare(
        "SELECT id, identity_id, vec_low, vec_high FROM face_encoding
         WHERE identity_id = ?1 ORDER BY created_at, id",
    )?;
    let mut rows = stmt.query(params![identity_id])?;
    let mut encodings = Vec::new();
    while let Some(row) = rows.next()? {
        let low: Vec<u8> = row.get(2)?;
        let high: Vec<u8> = row.get(3)?;
        encodings.push(FaceEncoding {
            id: row.get(0)?,
            identity_id: row.get(1)?,
            vec_low: blob_to_vec(&low)?,
            vec_high: blob_to_vec(&high)?,
        });
    }
    Ok(encodings)
}

/// Identity owning the closest encoding within `threshold`, with that distance.
pub fn nearest_identity(
    conn: &Connection,
    vec_low: &[f64],
    vec_high: &[f64],
    threshold: f64,
) -> Result<Option<(String, f64)>> {
    Ok(conn
        .query_row(
            "SELECT identity_id, MIN(face_distance(vec_low, vec_high, ?1, ?2)) AS distance
             FROM face_encoding
             WHERE face_distance(vec_low, vec_high, ?1, ?2) <= ?3
             GROUP BY identity_id
             ORDER BY distance ASC
             LIMIT 1",
            params![vec_to_blob(vec_low), vec_to_blob(vec_high), threshold],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )
        .optional()?)
}

// -------------------- Queries & suggestions --------------------

pub fn insert_query(conn: &Connection, id: &str, camera_id: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO query (id, camera_id, created_at) VALUES (?1, ?2, ?3)",
        params![id, camera_id, now_millis()],
    )?;
    Ok(())
}

pub fn delete_query(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM query WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn list_queries(conn: &Connection) -> Result<Vec<QueryRow>> {
    let mut stmt = conn.prepare(
        "SELECT q.id, q.camera_id, q.created_at, COUNT(s.id)
         FROM query q LEFT JOIN suggestion s ON s.query_id = q.id
         GROUP BY q.id
         ORDER BY q.created_at ASC, q.rowid ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(QueryRow {
            id: row.get(0)?,
            camera_id: row.get(1)?,
            created_at: row.get(2)?,
            suggestion_count: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_suggestion(conn: &Connection, suggestion: &SuggestionRow) -> Result<()> {
    conn.execute(
        "INSERT INTO suggestion (id, query_id, identity_id, rect, vec_low, vec_high, score, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            suggestion.id,
            suggestion.query_id,
            suggestion.identity_id,
            serde_json::to_string(&suggestion.rect.to_array())?,
            vec_to_blob(&suggestion.vec_low),
            vec_to_blob(&suggestion.vec_high),
            suggestion.score,
            suggestion.created_at,
        ],
    )?;
    Ok(())
}

const SUGGESTION_COLUMNS: &str =
    "id, query_id, rect, vec_low, vec_high, identity_id, score, created_at";

pub fn get_suggestion(conn: &Connection, query_id: &str, suggestion_id: &str) -> Result<Option<SuggestionRow>> {
    let sql = format!(
        "SELECT {} FROM suggestion WHERE query_id = ?1 AND id = ?2",
        SUGGESTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![query_id, suggestion_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(suggestion_from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list_suggestions(conn: &Connection) -> Result<Vec<SuggestionRow>> {
    let sql = format!(
        "SELECT {} FROM suggestion ORDER BY created_at ASC, rowid ASC",
        SUGGESTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(suggestion_from_row(row)?);
    }
    Ok(out)
}

fn suggestion_from_row(row: &Row<'_>) -> Result<SuggestionRow> {
    let rect: String = row.get(2)?;
    let rect: [u32; 4] = serde_json::from_str(&rect).context("invalid suggestion rect")?;
    let low: Vec<u8> = row.get(3)?;
    let high: Vec<u8> = row.get(4)?;
    Ok(SuggestionRow {
        id: row.get(0)?,
        query_id: row.get(1)?,
        rect: FaceRect::from_array(rect),
        vec_low: blob_to_vec(&low)?,
        vec_high: blob_to_vec(&high)?,
        identity_id: row.get(5)?,
        score: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn update_suggestion_match(
    conn: &Connection,
    suggestion_id: &str,
    identity_id: Option<&str>,
    score: Option<f64>,
) -> Result<()> {
    conn.execute(
        "UPDATE suggestion SET identity_id = ?2, score = ?3 WHERE id = ?1",
        params![suggestion_id, identity_id, score],
    )?;
    Ok(())
}

/// Delete one suggestion, and its query when it was the last one.
///
/// Returns true when the query was deleted too.
pub fn remove_suggestion(conn: &Connection, query_id: &str, suggestion_id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM suggestion WHERE query_id = ?1 AND id = ?2",
        params![query_id, suggestion_id],
    )?;
    if deleted == 0 {
        return Err(RecognitionError::SuggestionNotFound {
            query_id: query_id.to_string(),
            suggestion_id: suggestion_id.to_string(),
        }
        .into());
    }
    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM suggestion WHERE query_id = ?1",
        params![query_id],
        |row| row.get(0),
    )?;
    if remaining == 0 {
        delete_query(conn, query_id)?;
        return Ok(true);
    }
    Ok(false)
}
