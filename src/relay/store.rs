//! SQLite copy of the relay book, so requests, per-pair latest values and
//! the provenance log outlive the process.
//!
//! Written through after every accepted transition. Readers (the `latest`
//! binary) open the same file and query it directly.

use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{ProposedView, RelayBook, RelayConfig, RelayEvent, Request};
use crate::ids::{PairKey, RequestId};
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::payload::ValuationPayload;

pub struct BookStore {
    conn: Connection,
}

impl BookStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open relay book {}", path))?;
        // Shares the file with the driver's StateStore.
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS relay_requests (
                request_id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS relay_latest (
                pair TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS relay_events (
                seq INTEGER PRIMARY KEY,
                request_id TEXT NOT NULL,
                body TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Persist the current state of `id`, its pair's latest pointer and any
    /// events not yet on disk. All or nothing.
    pub fn record(&mut self, book: &RelayBook, id: &RequestId) -> Result<()> {
        let Some(request) = book.request(id) else {
            return Ok(());
        };
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO relay_requests (request_id, body) VALUES (?1, ?2)",
            params![id.to_hex(), serde_json::to_string(request)?],
        )?;
        if book.get_latest_request_id(&request.pair) == Some(*id) {
            tx.execute(
                "INSERT OR REPLACE INTO relay_latest (pair, request_id, payload) VALUES (?1, ?2, ?3)",
                params![request.pair.to_hex(), id.to_hex(), request.proposed_value.to_hex()],
            )?;
        }
        let stored: i64 = tx.query_row("SELECT COUNT(*) FROM relay_events", [], |row| row.get(0))?;
        for (seq, event) in book.events().iter().enumerate().skip(stored as usize) {
            tx.execute(
                "INSERT INTO relay_events (seq, request_id, body) VALUES (?1, ?2, ?3)",
                params![seq as i64, event.id().to_hex(), serde_json::to_string(event)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self, config: RelayConfig) -> Result<RelayBook> {
        let mut stmt = self.conn.prepare("SELECT body FROM relay_requests")?;
        let requests = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|body| -> Result<Request> { Ok(serde_json::from_str(&body?)?) })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare("SELECT pair, request_id FROM relay_latest")?;
        let latest = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .map(|row| -> Result<(PairKey, RequestId)> {
                let (pair, id) = row?;
                Ok((pair.parse::<PairKey>()?, id.parse::<RequestId>()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare("SELECT body FROM relay_events ORDER BY seq")?;
        let events = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|body| -> Result<RelayEvent> { Ok(serde_json::from_str(&body?)?) })
            .collect::<Result<Vec<_>>>()?;

        log(
            Level::Info,
            Domain::Store,
            "relay_book.loaded",
            obj(&[
                ("requests", v_int(requests.len() as u64)),
                ("pairs", v_int(latest.len() as u64)),
                ("events", v_int(events.len() as u64)),
            ]),
        );
        Ok(RelayBook::restore(config, requests, latest, events))
    }

    /// Last finalized payload and its request id for a pair.
    pub fn latest(&self, pair: &PairKey) -> Result<Option<(RequestId, ValuationPayload)>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT request_id, payload FROM relay_latest WHERE pair = ?1",
                params![pair.to_hex()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, payload)| -> Result<(RequestId, ValuationPayload)> {
            Ok((id.parse()?, ValuationPayload::from_hex(&payload)?))
        })
        .transpose()
    }

    /// Same shape as `RelayBook::get_proposed`: unknown ids read as `None`.
    pub fn proposed(&self, id: &RequestId) -> Result<ProposedView> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM relay_requests WHERE request_id = ?1",
                params![id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Ok(ProposedView::default());
        };
        let request: Request = serde_json::from_str(&body)?;
        log(
            Level::Debug,
            Domain::Store,
            "relay_book.read",
            obj(&[("request_id", v_str(&id.to_hex())), ("state", v_str(request.state.as_str()))]),
        );
        Ok(ProposedView {
            payload: request.proposed_value,
            proposed_at: request.proposed_at,
            pair: request.pair,
            state: request.state,
        })
    }
}
