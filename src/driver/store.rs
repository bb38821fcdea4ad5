//! Durable relay markers: processed ids, last relay per pair, scheduled
//! finalizations and the registry cursor.
//!
//! One writer per database file. Each settle runs in a single transaction so
//! a crash cannot leave a request processed without its pair marker.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::ids::RequestId;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::payload::ValuationPayload;

/// Where a pair's most recent finalization landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRelay {
    pub request_id: RequestId,
    pub tx_hash: String,
    pub ts: u64,
}

/// A finalize call waiting for its earliest allowed time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFinalize {
    pub request_id: RequestId,
    pub pair: String,
    pub payload: ValuationPayload,
    pub consensus_ref: Vec<u8>,
    pub consensus_reached: bool,
    pub due_at: u64,
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open state store {}", path))?;
        let mut store = Self { conn };
        store.init()?;
        log(
            Level::Info,
            Domain::Store,
            "store.opened",
            obj(&[
                ("path", v_str(path)),
                ("cursor", v_int(store.cursor()?)),
                ("pending", v_int(store.pending_finalizations()?.len() as u64)),
            ]),
        );
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS processed (
                request_id TEXT PRIMARY KEY,
                processed_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS last_by_pair (
                pair TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                tx_hash TEXT NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pending_finalize (
                request_id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                payload TEXT NOT NULL,
                consensus_ref TEXT NOT NULL,
                consensus_reached INTEGER NOT NULL,
                due_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS cursor (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                block_height INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn is_processed(&self, id: &RequestId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed WHERE request_id = ?1",
                params![id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_processed(&mut self, id: &RequestId, ts: u64) -> Result<()> {
        self.settle(id, ts, None)
    }

    /// Mark `id` processed, drop its pending finalize and, when given,
    /// record it as the pair's latest relay. All or nothing.
    pub fn settle(&mut self, id: &RequestId, ts: u64, last: Option<(&str, &LastRelay)>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO processed (request_id, processed_at) VALUES (?1, ?2)",
            params![id.to_hex(), ts as i64],
        )?;
        tx.execute(
            "DELETE FROM pending_finalize WHERE request_id = ?1",
            params![id.to_hex()],
        )?;
        if let Some((pair, marker)) = last {
            tx.execute(
                "INSERT INTO last_by_pair (pair, request_id, tx_hash, ts) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(pair) DO UPDATE SET
                    request_id = excluded.request_id,
                    tx_hash = excluded.tx_hash,
                    ts = excluded.ts",
                params![pair, marker.request_id.to_hex(), marker.tx_hash, marker.ts as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn last_by_pair(&self, pair: &str) -> Result<Option<LastRelay>> {
        let row: Option<(String, String, i64)> = self
            .conn
            .query_row(
                "SELECT request_id, tx_hash, ts FROM last_by_pair WHERE pair = ?1",
                params![pair],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(id, tx_hash, ts)| -> Result<LastRelay> {
            Ok(LastRelay {
                request_id: id.parse()?,
                tx_hash,
                ts: ts as u64,
            })
        })
        .transpose()
    }

    /// Insert or replace the scheduled finalize for a request.
    pub fn schedule_finalize(&mut self, pending: &PendingFinalize) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_finalize
                (request_id, pair, payload, consensus_ref, consensus_reached, due_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pending.request_id.to_hex(),
                pending.pair,
                pending.payload.to_hex(),
                hex::encode(&pending.consensus_ref),
                pending.consensus_reached as i64,
                pending.due_at as i64
            ],
        )?;
        Ok(())
    }

    /// All scheduled finalizations, earliest due first.
    pub fn pending_finalizations(&self) -> Result<Vec<PendingFinalize>> {
        let mut stmt = self.conn.prepare(
            "SELECT request_id, pair, payload, consensus_ref, consensus_reached, due_at
             FROM pending_finalize ORDER BY due_at, request_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, pair, payload, consensus_ref, reached, due_at) = row?;
            out.push(PendingFinalize {
                request_id: id.parse()?,
                pair,
                payload: ValuationPayload::from_hex(&payload)?,
                consensus_ref: hex::decode(consensus_ref)?,
                consensus_reached: reached != 0,
                due_at: due_at as u64,
            });
        }
        Ok(out)
    }

    pub fn cursor(&self) -> Result<u64> {
        let height: Option<i64> = self
            .conn
            .query_row("SELECT block_height FROM cursor WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        Ok(height.unwrap_or(0) as u64)
    }

    pub fn set_cursor(&mut self, block_height: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cursor (id, block_height) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET block_height = excluded.block_height",
            params![block_height as i64],
        )?;
        Ok(())
    }
}
