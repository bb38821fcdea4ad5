//! Relay driver: watches the consensus registry and walks each request
//! through propose/finalize exactly once.
//!
//! One tick at a time. Restarts are safe: processed ids, scheduled
//! finalizations and the poll cursor live in the [`store::StateStore`], and
//! the relay state machine rejects any duplicate transition.

pub mod optimist;
pub mod registry;
pub mod retry;
pub mod store;
pub mod target;

use std::sync::Arc;

use anyhow::Result;

use crate::clock::Clock;
use crate::ids::RequestId;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::payload::ValuationPayload;
use crate::relay::{FinalizeOutcome, RelayError, RequestState};
use crate::valuation::execution::parse_input;
use crate::valuation::pairs::{self, PairConfig};
use optimist::OptimisticSource;
use registry::{ConsensusRegistry, EligibleResult};
use retry::{retry_async, RetryConfig};
use store::{LastRelay, PendingFinalize, StateStore};
use target::RelayTarget;

#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Pair symbols this deployment relays.
    pub pairs: Vec<String>,
    /// When set, results from other programs are ignored.
    pub program_id: Option<String>,
    pub min_finalization_delay: u64,
    pub retry: RetryConfig,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub observed: usize,
    pub skipped: usize,
    pub proposed: usize,
    pub scheduled: usize,
    pub finalized: usize,
    pub repudiated: usize,
    pub expired: usize,
    pub deferred: usize,
    /// Refused by the relay for any reason other than timing; settled unfinished.
    pub rejected: usize,
}

pub struct RelayDriver {
    registry: Box<dyn ConsensusRegistry + Send + Sync>,
    target: Box<dyn RelayTarget + Send + Sync>,
    optimist: Option<Box<dyn OptimisticSource + Send + Sync>>,
    store: StateStore,
    clock: Arc<dyn Clock>,
    cfg: DriverConfig,
}

impl RelayDriver {
    pub fn new(
        registry: Box<dyn ConsensusRegistry + Send + Sync>,
        target: Box<dyn RelayTarget + Send + Sync>,
        optimist: Option<Box<dyn OptimisticSource + Send + Sync>>,
        store: StateStore,
        clock: Arc<dyn Clock>,
        cfg: DriverConfig,
    ) -> Self {
        Self {
            registry,
            target,
            optimist,
            store,
            clock,
            cfg,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn serves(&self, pair: &PairConfig) -> bool {
        self.cfg.pairs.iter().any(|p| p.eq_ignore_ascii_case(pair.symbol))
    }

    /// Payment for `pair` settled: request a fresh valuation and, when an
    /// optimistic source is configured, propose its estimate right away.
    pub async fn on_payment_settled(&mut self, pair: &str) -> Result<RequestId> {
        let pair = pairs::lookup(pair)?;
        if !self.serves(pair) {
            anyhow::bail!("pair {} is not relayed by this deployment", pair.symbol);
        }

        let id = retry_async(&self.cfg.retry, "submit_valuation_request", || {
            self.registry.submit_valuation_request(pair.symbol)
        })
        .await?;
        log(
            Level::Info,
            Domain::Driver,
            "driver.request_submitted",
            obj(&[("request_id", v_str(&id.to_hex())), ("pair", v_str(pair.symbol))]),
        );

        let Some(optimist) = &self.optimist else {
            return Ok(id);
        };
        let payload = match optimist.estimate(pair).await {
            Ok(payload) => payload,
            Err(err) => {
                // Consensus will still land; the request is proposed from it instead.
                log(
                    Level::Warn,
                    Domain::Driver,
                    "driver.estimate_unavailable",
                    obj(&[
                        ("request_id", v_str(&id.to_hex())),
                        ("pair", v_str(pair.symbol)),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
                return Ok(id);
            }
        };

        let api_ref = format!("api:{}", pair.symbol).into_bytes();
        let proposed = retry_async(&self.cfg.retry, "propose", || {
            self.target.propose(id, pair.key(), payload, api_ref.clone())
        })
        .await?;
        match proposed {
            Ok(receipt) => log(
                Level::Info,
                Domain::Driver,
                "driver.optimistic_proposed",
                obj(&[
                    ("request_id", v_str(&id.to_hex())),
                    ("pair", v_str(pair.symbol)),
                    ("tx_hash", v_str(&receipt.tx_hash)),
                ]),
            ),
            Err(err) => log(
                Level::Warn,
                Domain::Driver,
                "driver.optimistic_rejected",
                obj(&[("request_id", v_str(&id.to_hex())), ("error", v_str(&err.to_string()))]),
            ),
        }
        Ok(id)
    }

    /// Poll once, handle every new result, then run due finalizations.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let cursor = self.store.cursor()?;
        let mut results = retry_async(&self.cfg.retry, "poll_eligible_results", || {
            self.registry.poll_eligible_results(cursor)
        })
        .await?;
        results.retain(|r| r.block_height > cursor);
        results.sort_by_key(|r| r.block_height);

        let mut high_water = cursor;
        for result in &results {
            report.observed += 1;
            self.observe(result, &mut report).await?;
            high_water = high_water.max(result.block_height);
        }
        // Only after every result is handled; a failed tick re-reads them all.
        if high_water > cursor {
            self.store.set_cursor(high_water)?;
        }

        self.finalize_due(&mut report).await?;
        log(
            Level::Info,
            Domain::Driver,
            "driver.tick",
            obj(&[
                ("cursor", v_int(high_water)),
                ("observed", v_int(report.observed as u64)),
                ("proposed", v_int(report.proposed as u64)),
                ("scheduled", v_int(report.scheduled as u64)),
                ("finalized", v_int(report.finalized as u64)),
                ("repudiated", v_int(report.repudiated as u64)),
                ("expired", v_int(report.expired as u64)),
                ("rejected", v_int(report.rejected as u64)),
            ]),
        );
        Ok(report)
    }

    async fn observe(&mut self, result: &EligibleResult, report: &mut TickReport) -> Result<()> {
        let id = result.request_id;
        if self.store.is_processed(&id)? {
            report.skipped += 1;
            return Ok(());
        }
        if let (Some(want), Some(got)) = (&self.cfg.program_id, &result.program_id) {
            if !want.eq_ignore_ascii_case(got) {
                report.skipped += 1;
                return Ok(());
            }
        }
        let pair = match parse_input(&result.exec_inputs) {
            Ok(pair) if self.serves(pair) => pair,
            _ => {
                report.skipped += 1;
                return Ok(());
            }
        };

        let consensus = result.usable_payload();
        let view = retry_async(&self.cfg.retry, "get_proposed", || self.target.get_proposed(id)).await?;
        let now = self.clock.now();

        match view.state {
            RequestState::Finalized => {
                self.store.mark_processed(&id, now)?;
                report.skipped += 1;
            }
            RequestState::None | RequestState::ConsensusError => {
                let Some(payload) = consensus else {
                    // Nothing optimistic to reconcile and nothing trustworthy to publish.
                    log(
                        Level::Warn,
                        Domain::Driver,
                        "driver.no_usable_result",
                        obj(&[
                            ("request_id", v_str(&id.to_hex())),
                            ("pair", v_str(pair.symbol)),
                            ("exit_code", v_int(result.exit_code as u64)),
                            ("consensus", serde_json::Value::Bool(result.consensus)),
                        ]),
                    );
                    self.store.mark_processed(&id, now)?;
                    return Ok(());
                };
                let api_ref = format!("relay:block:{}", result.block_height).into_bytes();
                let proposed = retry_async(&self.cfg.retry, "propose", || {
                    self.target.propose(id, pair.key(), payload, api_ref.clone())
                })
                .await?;
                let proposed_at = match proposed {
                    Ok(_) => {
                        report.proposed += 1;
                        now
                    }
                    // Someone else got there first; their proposal sets the clock.
                    Err(RelayError::AlreadyProposed(_)) => {
                        retry_async(&self.cfg.retry, "get_proposed", || self.target.get_proposed(id))
                            .await?
                            .proposed_at
                    }
                    Err(err) => {
                        self.reject(id, pair.symbol, &err, now, report)?;
                        return Ok(());
                    }
                };
                self.schedule(id, pair, result, Some(payload), proposed_at)?;
                report.scheduled += 1;
            }
            RequestState::Proposed => {
                // An optimistic value is live; reconcile it at its earliest finalize time.
                self.schedule(id, pair, result, consensus, view.proposed_at)?;
                report.scheduled += 1;
            }
        }
        Ok(())
    }

    fn schedule(
        &mut self,
        id: RequestId,
        pair: &PairConfig,
        result: &EligibleResult,
        consensus: Option<ValuationPayload>,
        proposed_at: u64,
    ) -> Result<()> {
        let pending = PendingFinalize {
            request_id: id,
            pair: pair.symbol.to_string(),
            payload: consensus.unwrap_or_default(),
            consensus_ref: result.consensus_ref(),
            consensus_reached: consensus.is_some(),
            due_at: proposed_at.saturating_add(self.cfg.min_finalization_delay),
        };
        self.store.schedule_finalize(&pending)?;
        log(
            Level::Debug,
            Domain::Driver,
            "driver.finalize_scheduled",
            obj(&[
                ("request_id", v_str(&id.to_hex())),
                ("pair", v_str(pair.symbol)),
                ("due_at", v_int(pending.due_at)),
                ("consensus_reached", serde_json::Value::Bool(pending.consensus_reached)),
            ]),
        );
        Ok(())
    }

    fn reject(
        &mut self,
        id: RequestId,
        pair: &str,
        err: &RelayError,
        now: u64,
        report: &mut TickReport,
    ) -> Result<()> {
        self.store.settle(&id, now, None)?;
        report.rejected += 1;
        log(
            Level::Warn,
            Domain::Driver,
            "driver.relay_rejected",
            obj(&[
                ("request_id", v_str(&id.to_hex())),
                ("pair", v_str(pair)),
                ("error", v_str(&err.to_string())),
            ]),
        );
        Ok(())
    }

    async fn repropose(&mut self, pending: PendingFinalize, now: u64, report: &mut TickReport) -> Result<()> {
        let id = pending.request_id;
        let pair = pairs::lookup(&pending.pair)?;
        let api_ref = format!("relay:repropose:{}", now).into_bytes();
        let proposed = retry_async(&self.cfg.retry, "propose", || {
            self.target.propose(id, pair.key(), pending.payload, api_ref.clone())
        })
        .await?;
        if let Err(err) = proposed {
            return self.reject(id, &pending.pair, &err, now, report);
        }
        report.proposed += 1;
        let due_at = now.saturating_add(self.cfg.min_finalization_delay);
        log(
            Level::Warn,
            Domain::Driver,
            "driver.reproposed",
            obj(&[
                ("request_id", v_str(&id.to_hex())),
                ("pair", v_str(&pending.pair)),
                ("due_at", v_int(due_at)),
            ]),
        );
        self.store.schedule_finalize(&PendingFinalize { due_at, ..pending })?;
        report.deferred += 1;
        Ok(())
    }

    async fn finalize_due(&mut self, report: &mut TickReport) -> Result<()> {
        let now = self.clock.now();
        let due: Vec<PendingFinalize> = self
            .store
            .pending_finalizations()?
            .into_iter()
            .filter(|p| p.due_at <= now)
            .collect();

        for pending in due {
            let id = pending.request_id;
            let outcome = retry_async(&self.cfg.retry, "finalize", || {
                self.target.finalize(
                    id,
                    pending.payload,
                    pending.consensus_ref.clone(),
                    pending.consensus_reached,
                )
            })
            .await?;

            match outcome {
                Ok((FinalizeOutcome::Finalized, receipt)) => {
                    let marker = LastRelay {
                        request_id: id,
                        tx_hash: receipt.tx_hash,
                        ts: now,
                    };
                    self.store.settle(&id, now, Some((pending.pair.as_str(), &marker)))?;
                    report.finalized += 1;
                }
                Ok((FinalizeOutcome::ConsensusError { reason }, _)) => {
                    self.store.settle(&id, now, None)?;
                    report.repudiated += 1;
                    log(
                        Level::Warn,
                        Domain::Driver,
                        "driver.repudiated",
                        obj(&[
                            ("request_id", v_str(&id.to_hex())),
                            ("pair", v_str(&pending.pair)),
                            ("reason", serde_json::to_value(reason).unwrap_or_default()),
                        ]),
                    );
                }
                Err(RelayError::TooEarly { elapsed, min, .. }) => {
                    let retry_at = now + (min - elapsed.min(min));
                    self.store.schedule_finalize(&PendingFinalize {
                        due_at: retry_at,
                        ..pending
                    })?;
                    report.deferred += 1;
                }
                Err(RelayError::TooLate { elapsed, window, .. }) => {
                    // The request stays Proposed on the relay for good.
                    self.store.settle(&id, now, None)?;
                    report.expired += 1;
                    log(
                        Level::Error,
                        Domain::Driver,
                        "driver.finalize_expired",
                        obj(&[
                            ("request_id", v_str(&id.to_hex())),
                            ("pair", v_str(&pending.pair)),
                            ("elapsed", v_int(elapsed)),
                            ("window", v_int(window)),
                        ]),
                    );
                }
                // The relay lost the proposal (fresh book); publish the consensus value again.
                Err(RelayError::NotProposed {
                    state: RequestState::None,
                    ..
                }) if pending.consensus_reached => {
                    self.repropose(pending, now, report).await?;
                }
                Err(err) => {
                    self.reject(id, &pending.pair, &err, now, report)?;
                }
            }
        }
        Ok(())
    }
}
