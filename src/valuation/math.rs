//! Fixed-point building blocks of the valuation pipeline.
//!
//! Everything here is integer-only with truncating division. Independent
//! nodes must reproduce byte-identical payloads, so no step may depend on
//! platform float behavior.

use primitive_types::U256;

use super::{ReserveSnapshot, ValuationError};
use crate::payload::{FLAG_DIVERGENCE, FLAG_LOW_CONFIDENCE, FLAG_LOW_LIQUIDITY, SCALE};

/// Reference pool depth (quote units at 1e6) that earns a full liquidity score.
pub const LIQUIDITY_REFERENCE_1E6: u64 = 500_000_000_000;
/// 24h divergence at which the temporal score reaches zero (5%).
pub const DIVERGENCE_BAND_1E6: u64 = 50_000;
/// Slippage ceiling for the max safe execution size (1%).
pub const SLIPPAGE_LIMIT_1E6: u64 = 10_000;
pub const LIQUIDITY_WARN_SCORE: u64 = 200_000;
pub const CONFIDENCE_WARN_SCORE: u64 = 200_000;
pub const LIQUIDITY_WEIGHT: u64 = 600_000;
pub const TEMPORAL_WEIGHT: u64 = 400_000;
pub const BISECTION_ITERATIONS: u32 = 28;

const FEE_NUMERATOR: u64 = 997;
const FEE_DENOMINATOR: u64 = 1000;

fn scale() -> U256 {
    U256::from(SCALE)
}

fn mul(a: U256, b: U256, ctx: &'static str) -> Result<U256, ValuationError> {
    a.checked_mul(b).ok_or(ValuationError::Overflow(ctx))
}

fn add(a: U256, b: U256, ctx: &'static str) -> Result<U256, ValuationError> {
    a.checked_add(b).ok_or(ValuationError::Overflow(ctx))
}

pub fn pow10(exp: u8) -> Result<U256, ValuationError> {
    // 10^77 is the largest power of ten below 2^256
    if exp > 77 {
        return Err(ValuationError::Overflow("pow10"));
    }
    Ok(U256::exp10(exp as usize))
}

pub fn abs_diff(a: U256, b: U256) -> U256 {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// Quote per base, both normalized to their decimals, at scale 1e6.
pub fn spot_price(snapshot: &ReserveSnapshot) -> Result<U256, ValuationError> {
    if snapshot.reserve_base.is_zero() || snapshot.reserve_quote.is_zero() {
        return Err(ValuationError::ZeroReserve);
    }
    let numerator = mul(
        mul(snapshot.reserve_quote, pow10(snapshot.decimals_base)?, "spot_price")?,
        scale(),
        "spot_price",
    )?;
    let denominator = mul(snapshot.reserve_base, pow10(snapshot.decimals_quote)?, "spot_price")?;
    Ok(numerator / denominator)
}

/// Quote reserve expressed at scale 1e6 regardless of token decimals.
pub fn quote_reserve_1e6(snapshot: &ReserveSnapshot) -> Result<U256, ValuationError> {
    let scaled = mul(snapshot.reserve_quote, scale(), "quote_reserve")?;
    Ok(scaled / pow10(snapshot.decimals_quote)?)
}

/// Weighted 2:1 toward spot.
pub fn fair_price(spot: U256, hist: U256) -> Result<U256, ValuationError> {
    let weighted = add(mul(spot, U256::from(2u8), "fair_price")?, hist, "fair_price")?;
    Ok(weighted / U256::from(3u8))
}

/// Pool depth (both sides, valued in quote) against the reference depth, capped at 1e6.
pub fn liquidity_score(quote_1e6: U256) -> Result<U256, ValuationError> {
    let reference = U256::from(LIQUIDITY_REFERENCE_1E6);
    let liquidity = mul(quote_1e6, U256::from(2u8), "liquidity_score")?;
    if liquidity >= reference {
        return Ok(scale());
    }
    Ok(mul(liquidity, scale(), "liquidity_score")? / reference)
}

/// Relative distance between spot and the historical price, scale 1e6.
pub fn divergence(spot: U256, hist: U256) -> Result<U256, ValuationError> {
    if spot.is_zero() {
        return Err(ValuationError::PriceUnderflow);
    }
    Ok(mul(abs_diff(spot, hist), scale(), "divergence")? / spot)
}

/// Full credit at zero divergence, linearly down to zero at the band edge.
pub fn temporal_score(delta: U256) -> U256 {
    let band = U256::from(DIVERGENCE_BAND_1E6);
    if delta >= band {
        return U256::zero();
    }
    let penalty = delta * scale() / band;
    scale().saturating_sub(penalty)
}

pub fn confidence(liquidity_score: U256, temporal_score: U256) -> Result<U256, ValuationError> {
    let liq = mul(U256::from(LIQUIDITY_WEIGHT), liquidity_score, "confidence")?;
    let time = mul(U256::from(TEMPORAL_WEIGHT), temporal_score, "confidence")?;
    Ok(add(liq, time, "confidence")? / scale())
}

pub fn build_flags(delta: U256, liquidity_score: U256, confidence: U256) -> u8 {
    let mut flags = 0u8;
    if delta > U256::from(DIVERGENCE_BAND_1E6) {
        flags |= FLAG_DIVERGENCE;
    }
    if liquidity_score < U256::from(LIQUIDITY_WARN_SCORE) {
        flags |= FLAG_LOW_LIQUIDITY;
    }
    if confidence < U256::from(CONFIDENCE_WARN_SCORE) {
        flags |= FLAG_LOW_CONFIDENCE;
    }
    flags
}

/// Constant-product output with the 0.3% pool fee.
pub fn amm_amount_out(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
) -> Result<U256, ValuationError> {
    let amount_in_with_fee = mul(amount_in, U256::from(FEE_NUMERATOR), "amm")?;
    let numerator = mul(amount_in_with_fee, reserve_out, "amm")?;
    let denominator = add(
        mul(reserve_in, U256::from(FEE_DENOMINATOR), "amm")?,
        amount_in_with_fee,
        "amm",
    )?;
    if denominator.is_zero() {
        return Err(ValuationError::ZeroReserve);
    }
    Ok(numerator / denominator)
}

/// Slippage of selling `amount_in` quote units into the pool, scale 1e6.
///
/// Returns `None` when the trade is too small to yield any base output.
pub fn slippage(
    amount_in: U256,
    snapshot: &ReserveSnapshot,
    spot: U256,
) -> Result<Option<U256>, ValuationError> {
    if spot.is_zero() {
        return Err(ValuationError::PriceUnderflow);
    }
    let amount_out = amm_amount_out(amount_in, snapshot.reserve_quote, snapshot.reserve_base)?;
    if amount_out.is_zero() {
        return Ok(None);
    }
    let numerator = mul(
        mul(amount_in, pow10(snapshot.decimals_base)?, "slippage")?,
        scale(),
        "slippage",
    )?;
    let denominator = mul(amount_out, pow10(snapshot.decimals_quote)?, "slippage")?;
    let effective_price = numerator / denominator;
    Ok(Some(mul(abs_diff(effective_price, spot), scale(), "slippage")? / spot))
}

/// Largest quote amount whose execution stays under the slippage ceiling.
///
/// Bisection over `[0, reserve_quote / 2]` with a fixed iteration count so
/// every node walks the same midpoints. Slippage is non-decreasing in the
/// trade size for a constant-product pool.
pub fn max_safe_execution_size(
    snapshot: &ReserveSnapshot,
    spot: U256,
) -> Result<U256, ValuationError> {
    if snapshot.reserve_base.is_zero() || snapshot.reserve_quote.is_zero() {
        return Err(ValuationError::ZeroReserve);
    }
    let limit = U256::from(SLIPPAGE_LIMIT_1E6);
    let mut low = U256::zero();
    let mut high = snapshot.reserve_quote / U256::from(2u8);
    let mut best = U256::zero();

    'bisect: for _ in 0..BISECTION_ITERATIONS {
        let mid = (low + high) / U256::from(2u8);
        if mid.is_zero() {
            break 'bisect;
        }
        match slippage(mid, snapshot, spot)? {
            Some(s) if s < limit => {
                best = mid;
                low = mid + U256::one();
            }
            _ => {
                high = mid.saturating_sub(U256::one());
            }
        }
    }

    Ok(best)
}
