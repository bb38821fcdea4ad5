//! The four-slot valuation payload and its ABI `int256[]` wire format.
//!
//! Slot order is fixed: fair price, confidence score, max safe execution
//! size, flags. All values are scaled by 1e6 except the flag bitmask. Each
//! slot is an int256 word in two's complement; a valid payload only holds
//! non-negative words.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Fixed-point scale of every payload slot except flags.
pub const SCALE: u64 = 1_000_000;

/// 24h divergence above the reference band.
pub const FLAG_DIVERGENCE: u8 = 0x1;
/// Liquidity score below the warning threshold.
pub const FLAG_LOW_LIQUIDITY: u8 = 0x2;
/// Confidence score below the warning threshold.
pub const FLAG_LOW_CONFIDENCE: u8 = 0x4;
pub const FLAG_MASK: u8 = FLAG_DIVERGENCE | FLAG_LOW_LIQUIDITY | FLAG_LOW_CONFIDENCE;

pub const SLOT_COUNT: usize = 4;
const WORD: usize = 32;
/// Head word + length word + four value words.
pub const ENCODED_LEN: usize = WORD * (2 + SLOT_COUNT);

const SLOT_NAMES: [&str; SLOT_COUNT] = [
    "fair_price",
    "confidence_score",
    "max_safe_execution_size",
    "flags",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload must be 192 bytes, got {len}")]
    BadSize { len: usize },
    #[error("unexpected array offset {0}")]
    BadOffset(U256),
    #[error("expected 4 values, got {0}")]
    BadLength(U256),
    #[error("slot {slot} is negative")]
    Negative { slot: &'static str },
    #[error("flags {0} outside defined bits")]
    FlagsOutOfRange(U256),
    #[error("invalid hex: {0}")]
    Hex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct ValuationPayload {
    slots: [U256; SLOT_COUNT],
}

impl ValuationPayload {
    pub fn new(fair_price: U256, confidence_score: U256, max_safe_size: U256, flags: u8) -> Self {
        Self {
            slots: [fair_price, confidence_score, max_safe_size, U256::from(flags)],
        }
    }

    /// Wrap raw words without checking the invariant; see [`validate`](Self::validate).
    pub fn from_slots(slots: [U256; SLOT_COUNT]) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[U256; SLOT_COUNT] {
        &self.slots
    }

    pub fn fair_price(&self) -> U256 {
        self.slots[0]
    }

    pub fn confidence_score(&self) -> U256 {
        self.slots[1]
    }

    pub fn max_safe_execution_size(&self) -> U256 {
        self.slots[2]
    }

    pub fn flags(&self) -> U256 {
        self.slots[3]
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & U256::from(flag) != U256::zero()
    }

    /// Slots 0..=2 non-negative and flags within the three defined bits.
    pub fn validate(&self) -> Result<(), PayloadError> {
        for (value, name) in self.slots.iter().zip(SLOT_NAMES) {
            if value.bit(255) {
                return Err(PayloadError::Negative { slot: name });
            }
        }
        if self.flags() > U256::from(FLAG_MASK) {
            return Err(PayloadError::FlagsOutOfRange(self.flags()));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; ENCODED_LEN];
        U256::from(WORD).to_big_endian(&mut out[0..WORD]);
        U256::from(SLOT_COUNT).to_big_endian(&mut out[WORD..2 * WORD]);
        for (i, value) in self.slots.iter().enumerate() {
            let start = (2 + i) * WORD;
            value.to_big_endian(&mut out[start..start + WORD]);
        }
        out
    }

    /// Decode a single ABI-encoded `int256[]` of length four and check the
    /// payload invariant.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.len() != ENCODED_LEN {
            return Err(PayloadError::BadSize { len: bytes.len() });
        }
        let offset = U256::from_big_endian(&bytes[0..WORD]);
        if offset != U256::from(WORD) {
            return Err(PayloadError::BadOffset(offset));
        }
        let length = U256::from_big_endian(&bytes[WORD..2 * WORD]);
        if length != U256::from(SLOT_COUNT) {
            return Err(PayloadError::BadLength(length));
        }
        let mut slots = [U256::zero(); SLOT_COUNT];
        for (i, slot) in slots.iter_mut().enumerate() {
            let start = (2 + i) * WORD;
            *slot = U256::from_big_endian(&bytes[start..start + WORD]);
        }
        let payload = Self { slots };
        payload.validate()?;
        Ok(payload)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.encode()))
    }

    pub fn from_hex(value: &str) -> Result<Self, PayloadError> {
        let cleaned = value.trim().strip_prefix("0x").unwrap_or(value.trim());
        let bytes = hex::decode(cleaned).map_err(|e| PayloadError::Hex(e.to_string()))?;
        Self::decode(&bytes)
    }
}
