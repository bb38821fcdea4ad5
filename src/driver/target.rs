//! Write side of the reconciliation boundary as the driver sees it.
//!
//! Every method has two failure layers: the outer `anyhow::Result` is
//! transport (retried by the driver), the inner `RelayError` is the state
//! machine refusing the call (never retried).

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::ids::{PairKey, RequestId};
use crate::payload::ValuationPayload;
use crate::relay::store::BookStore;
use crate::relay::{FinalizeOutcome, ProposedView, RelayBook, RelayError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: String,
}

#[async_trait]
pub trait RelayTarget {
    async fn propose(
        &self,
        id: RequestId,
        pair: PairKey,
        payload: ValuationPayload,
        api_ref: Vec<u8>,
    ) -> Result<Result<Receipt, RelayError>>;

    async fn finalize(
        &self,
        id: RequestId,
        payload: ValuationPayload,
        consensus_ref: Vec<u8>,
        consensus_reached: bool,
    ) -> Result<Result<(FinalizeOutcome, Receipt), RelayError>>;

    async fn get_proposed(&self, id: RequestId) -> Result<ProposedView>;
}

/// In-process target over a shared [`RelayBook`], optionally written
/// through to a [`BookStore`] after every accepted transition.
#[derive(Clone)]
pub struct LocalRelay {
    book: Arc<Mutex<RelayBook>>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<Mutex<BookStore>>>,
}

impl LocalRelay {
    pub fn new(book: Arc<Mutex<RelayBook>>, clock: Arc<dyn Clock>) -> Self {
        Self { book, clock, store: None }
    }

    pub fn with_store(mut self, store: BookStore) -> Self {
        self.store = Some(Arc::new(Mutex::new(store)));
        self
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut RelayBook) -> T) -> Result<T> {
        let mut book = self.book.lock().map_err(|_| anyhow!("relay book lock poisoned"))?;
        Ok(f(&mut book))
    }

    /// Apply one transition and persist it before reporting success.
    fn transition<T>(
        &self,
        id: RequestId,
        f: impl FnOnce(&mut RelayBook) -> Result<T, RelayError>,
    ) -> Result<Result<T, RelayError>> {
        let mut book = self.book.lock().map_err(|_| anyhow!("relay book lock poisoned"))?;
        let outcome = f(&mut book);
        if outcome.is_ok() {
            if let Some(store) = &self.store {
                let mut store = store.lock().map_err(|_| anyhow!("relay store lock poisoned"))?;
                store.record(&book, &id)?;
            }
        }
        Ok(outcome)
    }
}

/// Deterministic stand-in for a transaction hash.
fn receipt(op: &str, id: &RequestId, payload: &ValuationPayload, at: u64) -> Receipt {
    let mut hasher = Sha256::new();
    hasher.update(op.as_bytes());
    hasher.update(id.as_bytes());
    hasher.update(payload.encode());
    hasher.update(at.to_be_bytes());
    Receipt {
        tx_hash: format!("0x{}", hex::encode(hasher.finalize())),
    }
}

#[async_trait]
impl RelayTarget for LocalRelay {
    async fn propose(
        &self,
        id: RequestId,
        pair: PairKey,
        payload: ValuationPayload,
        api_ref: Vec<u8>,
    ) -> Result<Result<Receipt, RelayError>> {
        let now = self.clock.now();
        self.transition(id, |book| {
            book.propose(id, pair, payload, api_ref, now)
                .map(|()| receipt("propose", &id, &payload, now))
        })
    }

    async fn finalize(
        &self,
        id: RequestId,
        payload: ValuationPayload,
        consensus_ref: Vec<u8>,
        consensus_reached: bool,
    ) -> Result<Result<(FinalizeOutcome, Receipt), RelayError>> {
        let now = self.clock.now();
        self.transition(id, |book| {
            book.finalize(id, payload, consensus_ref, consensus_reached, now)
                .map(|outcome| (outcome, receipt("finalize", &id, &payload, now)))
        })
    }

    async fn get_proposed(&self, id: RequestId) -> Result<ProposedView> {
        self.with_book(|book| book.get_proposed(&id))
    }
}
