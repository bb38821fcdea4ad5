use serde::{Deserialize, Serialize};

use crate::ids::{PairKey, RequestId};
use crate::payload::ValuationPayload;

/// Why a proposal was repudiated at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Repudiation {
    /// The consensus network reported no agreement.
    NoConsensus,
    /// First slot (in payload order) where consensus and proposal differ.
    SlotMismatch { slot: usize },
}

/// Append-only provenance log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RelayEvent {
    Proposed {
        id: RequestId,
        pair: PairKey,
        payload: ValuationPayload,
        api_ref: Vec<u8>,
        at: u64,
    },
    Finalized {
        id: RequestId,
        pair: PairKey,
        payload: ValuationPayload,
        consensus_ref: Vec<u8>,
        at: u64,
    },
    ConsensusError {
        id: RequestId,
        pair: PairKey,
        proposed: ValuationPayload,
        consensus: ValuationPayload,
        reason: Repudiation,
        at: u64,
    },
}

impl RelayEvent {
    pub fn id(&self) -> RequestId {
        match self {
            RelayEvent::Proposed { id, .. }
            | RelayEvent::Finalized { id, .. }
            | RelayEvent::ConsensusError { id, .. } => *id,
        }
    }
}
