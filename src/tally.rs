//! Reduce per-node reveals to one canonical payload.
//!
//! Only reveals that are in consensus and exited cleanly take part. Each slot
//! gets its own median; with an even count the lower middle is taken so the
//! result is always a value some node actually produced.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::payload::{ValuationPayload, SLOT_COUNT};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TallyError {
    #[error("no consensus among revealed results")]
    NoConsensusReveal,
}

/// One node's decoded output for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reveal {
    pub value: ValuationPayload,
    pub exit_code: u8,
    pub in_consensus: bool,
}

/// A reveal as it comes off the wire, body still ABI-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReveal {
    #[serde(with = "hex_body")]
    pub body: Vec<u8>,
    pub exit_code: u8,
    pub in_consensus: bool,
}

mod hex_body {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(body)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

pub fn aggregate(reveals: &[Reveal]) -> Result<ValuationPayload, TallyError> {
    let eligible: Vec<&ValuationPayload> = reveals
        .iter()
        .filter(|r| r.in_consensus && r.exit_code == 0)
        .map(|r| &r.value)
        .collect();
    if eligible.is_empty() {
        log(
            Level::Warn,
            Domain::Tally,
            "tally.no_consensus",
            obj(&[("reveals", v_int(reveals.len() as u64))]),
        );
        return Err(TallyError::NoConsensusReveal);
    }

    let mut slots = [U256::zero(); SLOT_COUNT];
    for (idx, slot) in slots.iter_mut().enumerate() {
        let mut column: Vec<U256> = eligible.iter().map(|p| p.slots()[idx]).collect();
        column.sort_unstable();
        *slot = column[(column.len() - 1) / 2];
    }
    let payload = ValuationPayload::from_slots(slots);
    log(
        Level::Info,
        Domain::Tally,
        "tally.aggregated",
        obj(&[
            ("eligible", v_int(eligible.len() as u64)),
            ("reveals", v_int(reveals.len() as u64)),
            ("payload", v_str(&payload.to_hex())),
        ]),
    );
    Ok(payload)
}

/// Decode raw reveal bodies, dropping any that do not parse, then aggregate.
pub fn tally(raw: &[RawReveal]) -> Result<ValuationPayload, TallyError> {
    let mut decoded = Vec::with_capacity(raw.len());
    for (idx, reveal) in raw.iter().enumerate() {
        if reveal.exit_code != 0 {
            // Failed executions carry an error message, not a payload.
            continue;
        }
        match ValuationPayload::decode(&reveal.body) {
            Ok(value) => decoded.push(Reveal {
                value,
                exit_code: reveal.exit_code,
                in_consensus: reveal.in_consensus,
            }),
            Err(err) => log(
                Level::Warn,
                Domain::Tally,
                "tally.reveal_dropped",
                obj(&[("index", v_int(idx as u64)), ("error", v_str(&err.to_string()))]),
            ),
        }
    }
    aggregate(&decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(a: u64, b: u64, c: u64, flags: u8) -> ValuationPayload {
        ValuationPayload::new(U256::from(a), U256::from(b), U256::from(c), flags)
    }

    fn reveal(value: ValuationPayload) -> Reveal {
        Reveal { value, exit_code: 0, in_consensus: true }
    }

    #[test]
    fn test_median_is_per_field() {
        let reveals = [
            reveal(payload(10, 300, 5, 0)),
            reveal(payload(30, 100, 6, 2)),
            reveal(payload(20, 200, 4, 1)),
        ];
        // No single reveal equals the result
        assert_eq!(aggregate(&reveals).unwrap(), payload(20, 200, 5, 1));
    }

    #[test]
    fn test_even_count_takes_lower_middle() {
        let reveals = [
            reveal(payload(10, 1, 1, 0)),
            reveal(payload(40, 4, 4, 0)),
            reveal(payload(20, 2, 2, 0)),
            reveal(payload(30, 3, 3, 0)),
        ];
        assert_eq!(aggregate(&reveals).unwrap(), payload(20, 2, 2, 0));
    }

    #[test]
    fn test_single_outlier_ignored() {
        let honest = payload(1_000_000, 400_002, 6_990, 2);
        let reveals = [
            reveal(honest),
            reveal(payload(9_999_999, 0, 0, 7)),
            reveal(honest),
        ];
        assert_eq!(aggregate(&reveals).unwrap(), honest);
    }

    #[test]
    fn test_filters_failed_and_dissenting() {
        let honest = payload(5, 5, 5, 0);
        let reveals = [
            Reveal { value: payload(100, 100, 100, 0), exit_code: 1, in_consensus: true },
            Reveal { value: payload(100, 100, 100, 0), exit_code: 0, in_consensus: false },
            reveal(honest),
        ];
        assert_eq!(aggregate(&reveals).unwrap(), honest);
    }

    #[test]
    fn test_no_consensus() {
        let reveals = [Reveal { value: payload(1, 1, 1, 0), exit_code: 0, in_consensus: false }];
        assert_eq!(aggregate(&reveals), Err(TallyError::NoConsensusReveal));
        assert_eq!(aggregate(&[]), Err(TallyError::NoConsensusReveal));
    }

    #[test]
    fn test_raw_tally_drops_undecodable() {
        let good = payload(7, 7, 7, 0);
        let raw = vec![
            RawReveal { body: good.encode(), exit_code: 0, in_consensus: true },
            RawReveal { body: vec![1, 2, 3], exit_code: 0, in_consensus: true },
            RawReveal { body: b"Execution error: boom".to_vec(), exit_code: 1, in_consensus: true },
        ];
        assert_eq!(tally(&raw).unwrap(), good);

        let none_usable = vec![RawReveal { body: vec![0; 10], exit_code: 0, in_consensus: true }];
        assert_eq!(tally(&none_usable), Err(TallyError::NoConsensusReveal));
    }

    #[test]
    fn test_raw_reveal_json_body_is_hex() {
        let raw = RawReveal { body: vec![0xde, 0xad], exit_code: 0, in_consensus: true };
        let json = serde_json::to_string(&raw).unwrap();
        assert!(json.contains("\"0xdead\""));
        let back: RawReveal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, raw);
    }
}
