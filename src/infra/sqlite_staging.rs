use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::app::ports::{AppendOutcome, Checkpoint, CheckpointStore, StagingStore};
use crate::domain::{Channel, StagedRecord, StoredRow};
use crate::error::{PipelineError, Result};

static TABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid table name regex"));

const SELECT_COLUMNS: &str = "row_offset, channel, source_label, quality, attributes, raw_key";

/// Staging layer, batch keys, cursors and stage checkpoints in one SQLite file.
pub struct SqliteStagingStore {
    conn: Mutex<Connection>,
}

impl SqliteStagingStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS staged_batches (
                batch_key   TEXT PRIMARY KEY,
                table_name  TEXT NOT NULL,
                row_count   INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pipeline_cursors (
                name       TEXT PRIMARY KEY,
                position   INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS stage_checkpoints (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id       TEXT NOT NULL,
                stage        TEXT NOT NULL,
                cursor       INTEGER,
                completed_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Store("staging connection lock poisoned".to_string()))
    }
}

fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    if !TABLE_NAME.is_match(table) {
        return Err(PipelineError::Config(format!("invalid staging table name '{table}'")));
    }
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            row_offset   INTEGER PRIMARY KEY AUTOINCREMENT,
            source_label TEXT NOT NULL CHECK (length(trim(source_label)) > 0),
            quality      INTEGER NOT NULL,
            attributes   TEXT NOT NULL,
            raw_key      TEXT NOT NULL,
            channel      TEXT NOT NULL CHECK (channel IN ('batch', 'inline')),
            batch_key    TEXT,
            staged_at    TEXT NOT NULL
        );
        "#
    ))?;
    Ok(())
}

type RawRow = (i64, String, String, i64, String, String);

fn query_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StoredRow>> {
    let mut stmt = conn.prepare(sql)?;
    let raw: Vec<RawRow> = stmt
        .query_map(params, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<std::result::Result<_, _>>()?;

    raw.into_iter()
        .map(|(offset, channel, source_label, quality, attributes, raw_key)| -> Result<StoredRow> {
            let attributes: BTreeMap<String, f64> = serde_json::from_str(&attributes)?;
            let channel = channel.parse::<Channel>().map_err(PipelineError::Store)?;
            Ok(StoredRow {
                offset: offset as u64,
                channel,
                record: StagedRecord {
                    attributes,
                    quality,
                    source_label,
                    raw_key,
                },
            })
        })
        .collect()
}

#[async_trait]
impl StagingStore for SqliteStagingStore {
    async fn append_rows(
        &self,
        table: &str,
        rows: &[StagedRecord],
        channel: Channel,
        batch_key: Option<&str>,
    ) -> Result<AppendOutcome> {
        let mut conn = self.conn()?;
        ensure_table(&conn, table)?;
        let tx = conn.transaction()?;

        if let Some(key) = batch_key {
            let seen: Option<i64> = tx
                .query_row(
                    "SELECT row_count FROM staged_batches WHERE batch_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if seen.is_some() {
                debug!("Batch {} already staged, skipping append", key);
                return Ok(AppendOutcome::DuplicateBatch);
            }
        }

        let staged_at = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table} (source_label, quality, attributes, raw_key, channel, batch_key, staged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?;
            for row in rows {
                let attributes = serde_json::to_string(&row.attributes)?;
                stmt.execute(params![
                    row.source_label,
                    row.quality,
                    attributes,
                    row.raw_key,
                    channel.as_str(),
                    batch_key,
                    staged_at,
                ])?;
            }
        }

        if let Some(key) = batch_key {
            tx.execute(
                "INSERT INTO staged_batches (batch_key, table_name, row_count, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, table, rows.len() as i64, staged_at],
            )?;
        }
        tx.commit()?;
        Ok(AppendOutcome::Appended(rows.len()))
    }

    async fn read_all(&self, table: &str) -> Result<Vec<StoredRow>> {
        let conn = self.conn()?;
        ensure_table(&conn, table)?;
        query_rows(
            &conn,
            &format!("SELECT {SELECT_COLUMNS} FROM {table} ORDER BY row_offset"),
            [],
        )
    }

    async fn read_after(
        &self,
        table: &str,
        after: u64,
        channel: Option<Channel>,
    ) -> Result<Vec<StoredRow>> {
        let conn = self.conn()?;
        ensure_table(&conn, table)?;
        match channel {
            Some(ch) => query_rows(
                &conn,
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM {table}
                     WHERE row_offset > ?1 AND channel = ?2 ORDER BY row_offset"
                ),
                params![after as i64, ch.as_str()],
            ),
            None => query_rows(
                &conn,
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM {table} WHERE row_offset > ?1 ORDER BY row_offset"
                ),
                params![after as i64],
            ),
        }
    }

    async fn head(&self, table: &str, limit: usize) -> Result<Vec<StoredRow>> {
        let conn = self.conn()?;
        ensure_table(&conn, table)?;
        query_rows(
            &conn,
            &format!("SELECT {SELECT_COLUMNS} FROM {table} ORDER BY row_offset LIMIT ?1"),
            params![limit as i64],
        )
    }
}

#[async_trait]
impl CheckpointStore for SqliteStagingStore {
    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let pos: Option<i64> = conn
            .query_row(
                "SELECT position FROM pipeline_cursors WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pos.map(|p| p as u64))
    }

    async fn store_cursor(&self, name: &str, value: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pipeline_cursors (name, position, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET position=excluded.position, updated_at=excluded.updated_at",
            params![name, value as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn delete_cursor(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM pipeline_cursors WHERE name = ?1", params![name])?;
        Ok(())
    }

    async fn last_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let row: Option<(String, Option<i64>, String)> = conn
            .query_row(
                "SELECT stage, cursor, completed_at FROM stage_checkpoints
                 WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(stage, cursor, completed_at)| -> Result<Checkpoint> {
            let completed_at = DateTime::parse_from_rfc3339(&completed_at)
                .map_err(|e| PipelineError::Store(format!("bad checkpoint timestamp: {e}")))?
                .with_timezone(&Utc);
            Ok(Checkpoint {
                stage: stage.parse()?,
                cursor: cursor.map(|c| c as u64),
                completed_at,
            })
        })
        .transpose()
    }

    async fn record_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO stage_checkpoints (run_id, stage, cursor, completed_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                checkpoint.stage.as_str(),
                checkpoint.cursor.map(|c| c as i64),
                checkpoint.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
