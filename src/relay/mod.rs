//! Optimistic relay: propose now, reconcile against consensus later.
//!
//! A request moves `None -> Proposed -> Finalized | ConsensusError`. The
//! proposed payload only becomes the pair's latest value when a consensus
//! payload equal in every slot arrives inside the finalization window. Wrong
//! state calls fail immediately; the state field is the only guard against
//! duplicate or concurrent driver ticks.

pub mod events;
pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{PairKey, RequestId};
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::payload::{PayloadError, ValuationPayload, SLOT_COUNT};
pub use events::{RelayEvent, Repudiation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    None,
    Proposed,
    Finalized,
    ConsensusError,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::None => "none",
            RequestState::Proposed => "proposed",
            RequestState::Finalized => "finalized",
            RequestState::ConsensusError => "consensus_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("request {0} is already proposed")]
    AlreadyProposed(RequestId),
    #[error("request {0} is already finalized")]
    AlreadyFinalized(RequestId),
    #[error("request {id} is not proposed (state {})", .state.as_str())]
    NotProposed { id: RequestId, state: RequestState },
    #[error("request {id} finalized too early: {elapsed}s elapsed, {min}s required")]
    TooEarly { id: RequestId, elapsed: u64, min: u64 },
    #[error("request {id} finalized too late: {elapsed}s elapsed, window {window}s")]
    TooLate { id: RequestId, elapsed: u64, window: u64 },
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Seconds a proposal stays exposed before it may be finalized.
    pub min_finalization_delay: u64,
    /// Seconds after proposal past which finalize is refused.
    pub finalization_window: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_finalization_delay: 90,
            finalization_window: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub pair: PairKey,
    pub proposed_value: ValuationPayload,
    pub consensus_value: ValuationPayload,
    pub proposed_at: u64,
    pub state: RequestState,
    pub api_ref: Vec<u8>,
    pub consensus_ref: Vec<u8>,
}

/// `get_proposed` view; unknown ids read as an empty `None` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProposedView {
    pub payload: ValuationPayload,
    pub proposed_at: u64,
    pub pair: PairKey,
    pub state: RequestState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FinalizeOutcome {
    Finalized,
    ConsensusError { reason: Repudiation },
}

/// Reconciliation state for all requests and the per-pair latest values.
#[derive(Debug, Default)]
pub struct RelayBook {
    config: RelayConfig,
    requests: HashMap<RequestId, Request>,
    latest_by_pair: HashMap<PairKey, ValuationPayload>,
    latest_request_by_pair: HashMap<PairKey, RequestId>,
    events: Vec<RelayEvent>,
}

impl RelayBook {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Rebuild a book from persisted requests, per-pair latest pointers and
    /// the provenance log. The latest payload of a pair is the proposed value
    /// of the request it points at.
    pub fn restore(
        config: RelayConfig,
        requests: Vec<Request>,
        latest: Vec<(PairKey, RequestId)>,
        events: Vec<RelayEvent>,
    ) -> Self {
        let requests: HashMap<RequestId, Request> =
            requests.into_iter().map(|r| (r.id, r)).collect();
        let mut latest_by_pair = HashMap::new();
        let mut latest_request_by_pair = HashMap::new();
        for (pair, id) in latest {
            if let Some(r) = requests.get(&id).filter(|r| r.state == RequestState::Finalized) {
                latest_by_pair.insert(pair, r.proposed_value);
                latest_request_by_pair.insert(pair, id);
            }
        }
        Self {
            config,
            requests,
            latest_by_pair,
            latest_request_by_pair,
            events,
        }
    }

    pub fn config(&self) -> RelayConfig {
        self.config
    }

    /// Publish an optimistic payload for `id`. Allowed from `None` and
    /// `ConsensusError`; never touches the pair's latest value.
    pub fn propose(
        &mut self,
        id: RequestId,
        pair: PairKey,
        payload: ValuationPayload,
        api_ref: Vec<u8>,
        now: u64,
    ) -> Result<(), RelayError> {
        match self.state_of(&id) {
            RequestState::None | RequestState::ConsensusError => {}
            RequestState::Proposed => return Err(RelayError::AlreadyProposed(id)),
            RequestState::Finalized => return Err(RelayError::AlreadyFinalized(id)),
        }
        payload.validate()?;

        self.requests.insert(
            id,
            Request {
                id,
                pair,
                proposed_value: payload,
                consensus_value: ValuationPayload::default(),
                proposed_at: now,
                state: RequestState::Proposed,
                api_ref: api_ref.clone(),
                consensus_ref: Vec::new(),
            },
        );
        self.events.push(RelayEvent::Proposed {
            id,
            pair,
            payload,
            api_ref,
            at: now,
        });
        log(
            Level::Info,
            Domain::Relay,
            "relay.proposed",
            obj(&[
                ("request_id", v_str(&id.to_hex())),
                ("pair", v_str(&pair.to_hex())),
                ("payload", v_str(&payload.to_hex())),
                ("at", v_int(now)),
            ]),
        );
        Ok(())
    }

    /// Reconcile a proposal with the consensus result.
    ///
    /// Timing errors leave the request untouched. A missing consensus or any
    /// slot difference moves it to `ConsensusError`; only an exact match
    /// finalizes and updates the pair's latest value.
    pub fn finalize(
        &mut self,
        id: RequestId,
        consensus_payload: ValuationPayload,
        consensus_ref: Vec<u8>,
        consensus_reached: bool,
        now: u64,
    ) -> Result<FinalizeOutcome, RelayError> {
        let config = self.config;
        let request = match self.requests.get_mut(&id) {
            Some(r) if r.state == RequestState::Proposed => r,
            other => {
                return Err(RelayError::NotProposed {
                    id,
                    state: other.map(|r| r.state).unwrap_or_default(),
                })
            }
        };

        let elapsed = now.saturating_sub(request.proposed_at);
        if elapsed < config.min_finalization_delay {
            return Err(RelayError::TooEarly {
                id,
                elapsed,
                min: config.min_finalization_delay,
            });
        }
        if elapsed > config.finalization_window {
            return Err(RelayError::TooLate {
                id,
                elapsed,
                window: config.finalization_window,
            });
        }

        request.consensus_value = consensus_payload;
        request.consensus_ref = consensus_ref.clone();
        let pair = request.pair;
        let proposed = request.proposed_value;

        if let Some(reason) = repudiation(&proposed, &consensus_payload, consensus_reached) {
            request.state = RequestState::ConsensusError;
            self.events.push(RelayEvent::ConsensusError {
                id,
                pair,
                proposed,
                consensus: consensus_payload,
                reason,
                at: now,
            });
            log(
                Level::Warn,
                Domain::Relay,
                "relay.consensus_error",
                obj(&[
                    ("request_id", v_str(&id.to_hex())),
                    ("pair", v_str(&pair.to_hex())),
                    ("reason", serde_json::to_value(reason).unwrap_or_default()),
                ]),
            );
            return Ok(FinalizeOutcome::ConsensusError { reason });
        }

        request.state = RequestState::Finalized;
        self.latest_by_pair.insert(pair, proposed);
        self.latest_request_by_pair.insert(pair, id);
        self.events.push(RelayEvent::Finalized {
            id,
            pair,
            payload: proposed,
            consensus_ref,
            at: now,
        });
        log(
            Level::Info,
            Domain::Relay,
            "relay.finalized",
            obj(&[
                ("request_id", v_str(&id.to_hex())),
                ("pair", v_str(&pair.to_hex())),
                ("elapsed", v_int(elapsed)),
            ]),
        );
        Ok(FinalizeOutcome::Finalized)
    }

    /// Last finalized payload for the pair. Never a pending proposal.
    pub fn get_latest(&self, pair: &PairKey) -> Option<ValuationPayload> {
        self.latest_by_pair.get(pair).copied()
    }

    pub fn get_latest_request_id(&self, pair: &PairKey) -> Option<RequestId> {
        self.latest_request_by_pair.get(pair).copied()
    }

    pub fn get_proposed(&self, id: &RequestId) -> ProposedView {
        self.requests
            .get(id)
            .map(|r| ProposedView {
                payload: r.proposed_value,
                proposed_at: r.proposed_at,
                pair: r.pair,
                state: r.state,
            })
            .unwrap_or_default()
    }

    pub fn request(&self, id: &RequestId) -> Option<&Request> {
        self.requests.get(id)
    }

    pub fn state_of(&self, id: &RequestId) -> RequestState {
        self.requests.get(id).map(|r| r.state).unwrap_or_default()
    }

    pub fn events(&self) -> &[RelayEvent] {
        &self.events
    }
}

fn repudiation(
    proposed: &ValuationPayload,
    consensus: &ValuationPayload,
    consensus_reached: bool,
) -> Option<Repudiation> {
    if !consensus_reached {
        return Some(Repudiation::NoConsensus);
    }
    (0..SLOT_COUNT)
        .find(|&slot| proposed.slots()[slot] != consensus.slots()[slot])
        .map(|slot| Repudiation::SlotMismatch { slot })
}
