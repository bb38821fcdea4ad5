//! Valuation engine: two reserve snapshots in, one risk payload out.
//!
//! Pure and synchronous. Reserve reads live in [`source`], the node-side
//! entrypoint in [`execution`].

pub mod execution;
pub mod math;
pub mod pairs;
pub mod source;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, v_big, v_int, v_str, Domain, Level};
use crate::payload::ValuationPayload;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValuationError {
    #[error("unsupported pair: {0}")]
    UnsupportedPair(String),
    #[error("pool reserve is zero")]
    ZeroReserve,
    #[error("price rounds to zero at 1e6 scale")]
    PriceUnderflow,
    #[error("reserve source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("malformed execution input: {0}")]
    MalformedInput(String),
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

/// Raw pool reserves oriented as base/quote, with token decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveSnapshot {
    pub reserve_base: U256,
    pub reserve_quote: U256,
    pub decimals_base: u8,
    pub decimals_quote: u8,
}

impl ReserveSnapshot {
    pub fn new(reserve_base: U256, reserve_quote: U256, decimals_base: u8, decimals_quote: u8) -> Self {
        Self {
            reserve_base,
            reserve_quote,
            decimals_base,
            decimals_quote,
        }
    }
}

/// Every intermediate of one valuation, all at scale 1e6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Valuation {
    pub spot: U256,
    pub hist: U256,
    pub fair_price: U256,
    pub liquidity_score: U256,
    pub delta: U256,
    pub temporal_score: U256,
    pub confidence: U256,
    pub max_safe_size: U256,
    pub flags: u8,
}

impl Valuation {
    pub fn payload(&self) -> ValuationPayload {
        ValuationPayload::new(self.fair_price, self.confidence, self.max_safe_size, self.flags)
    }
}

/// Value a supported pair from its current and ~24h-old reserves.
pub fn valuate(
    pair: &str,
    now: &ReserveSnapshot,
    hist: &ReserveSnapshot,
) -> Result<Valuation, ValuationError> {
    let config = pairs::lookup(pair)?;
    let valuation = compute(now, hist)?;
    log(
        Level::Debug,
        Domain::Valuation,
        "valuation.computed",
        obj(&[
            ("pair", v_str(config.symbol)),
            ("spot", v_big(valuation.spot)),
            ("hist", v_big(valuation.hist)),
            ("fair_price", v_big(valuation.fair_price)),
            ("liquidity_score", v_big(valuation.liquidity_score)),
            ("delta", v_big(valuation.delta)),
            ("confidence", v_big(valuation.confidence)),
            ("max_safe_size", v_big(valuation.max_safe_size)),
            ("flags", v_int(valuation.flags as u64)),
        ]),
    );
    Ok(valuation)
}

/// The fixed-point pipeline without pair lookup or logging.
pub fn compute(now: &ReserveSnapshot, hist: &ReserveSnapshot) -> Result<Valuation, ValuationError> {
    let spot = math::spot_price(now)?;
    let hist_price = math::spot_price(hist)?;
    let fair_price = math::fair_price(spot, hist_price)?;

    let liquidity_score = math::liquidity_score(math::quote_reserve_1e6(now)?)?;
    let delta = math::divergence(spot, hist_price)?;
    let temporal_score = math::temporal_score(delta);
    let confidence = math::confidence(liquidity_score, temporal_score)?;

    let max_safe_size = math::max_safe_execution_size(now, spot)?;
    let flags = math::build_flags(delta, liquidity_score, confidence);

    Ok(Valuation {
        spot,
        hist: hist_price,
        fair_price,
        liquidity_score,
        delta,
        temporal_score,
        confidence,
        max_safe_size,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{FLAG_DIVERGENCE, FLAG_LOW_LIQUIDITY};

    fn snap(base: u128, quote: u128) -> ReserveSnapshot {
        ReserveSnapshot::new(U256::from(base), U256::from(quote), 18, 6)
    }

    #[test]
    fn test_one_to_one_scenario() {
        let now = snap(10u128.pow(18), 10u128.pow(6));
        let v = valuate("WCRO-USDC", &now, &now).unwrap();
        assert_eq!(v.spot, U256::from(1_000_000u64));
        assert_eq!(v.fair_price, U256::from(1_000_000u64));
        assert_eq!(v.delta, U256::zero());
        // 2 USDC of depth against a 500k reference
        assert_eq!(v.liquidity_score, U256::from(4u64));
        assert_eq!(v.temporal_score, U256::from(1_000_000u64));
        assert_eq!(v.confidence, U256::from(400_002u64));
        assert_eq!(v.max_safe_size, U256::from(6_990u64));
        assert_eq!(v.flags, FLAG_LOW_LIQUIDITY);
    }

    #[test]
    fn test_divergent_deep_pool() {
        // 10M WCRO / 1M USDC now at 0.10, 24h ago at 0.09
        let now = snap(10u128.pow(25), 10u128.pow(12));
        let hist = snap(10u128.pow(25), 9 * 10u128.pow(11));
        let v = compute(&now, &hist).unwrap();
        assert_eq!(v.fair_price, U256::from(96_666u64));
        assert_eq!(v.delta, U256::from(100_000u64));
        assert_eq!(v.liquidity_score, U256::from(1_000_000u64));
        assert_eq!(v.confidence, U256::from(600_000u64));
        assert_eq!(v.flags, FLAG_DIVERGENCE);
        assert_eq!(v.max_safe_size, U256::from(6_990_972_903u64));
    }

    #[test]
    fn test_unsupported_pair() {
        let now = snap(1, 1);
        assert_eq!(
            valuate("ETH-USDC", &now, &now),
            Err(ValuationError::UnsupportedPair("ETH-USDC".to_string()))
        );
    }

    #[test]
    fn test_zero_historical_reserve() {
        let now = snap(10u128.pow(18), 10u128.pow(6));
        let hist = snap(10u128.pow(18), 0);
        assert_eq!(compute(&now, &hist), Err(ValuationError::ZeroReserve));
    }
}
