//! End-to-end valuation: reserves through the execution phase, into reveals,
//! through the tally, and back out of the wire format.

use primitive_types::U256;
use proptest::prelude::*;

use poolrelay::payload::{ValuationPayload, ENCODED_LEN, FLAG_DIVERGENCE, FLAG_LOW_LIQUIDITY};
use poolrelay::tally::tally;
use poolrelay::valuation::execution::{execute, EXIT_FAILURE, EXIT_SUCCESS};
use poolrelay::valuation::source::StaticReserveSource;
use poolrelay::valuation::{compute, math, ReserveSnapshot};

fn snap(base: u128, quote: u128) -> ReserveSnapshot {
    ReserveSnapshot::new(U256::from(base), U256::from(quote), 18, 6)
}

fn source(now: ReserveSnapshot, hist: ReserveSnapshot) -> StaticReserveSource {
    StaticReserveSource { now, hist }
}

const INPUT: &str = r#"{"pair": "WCRO-USDC"}"#;

#[tokio::test]
async fn test_one_to_one_pool_end_to_end() {
    let pool = snap(10u128.pow(18), 10u128.pow(6));
    let report = execute(&source(pool, pool), INPUT).await;
    assert_eq!(report.exit_code, EXIT_SUCCESS);
    assert_eq!(report.body.len(), ENCODED_LEN);
    assert_eq!(report.body[31], 0x20);
    assert_eq!(report.body[63], 4);

    let payload = ValuationPayload::decode(&report.body).unwrap();
    assert_eq!(payload.fair_price(), U256::from(1_000_000u64));
    assert_eq!(payload.confidence_score(), U256::from(400_002u64));
    assert_eq!(payload.max_safe_execution_size(), U256::from(6_990u64));
    assert_eq!(payload.flags(), U256::from(FLAG_LOW_LIQUIDITY));
}

#[tokio::test]
async fn test_deep_pool_with_divergent_history() {
    let now = snap(10u128.pow(25), 10u128.pow(12));
    let hist = snap(10u128.pow(25), 9 * 10u128.pow(11));
    let report = execute(&source(now, hist), INPUT).await;
    let payload = ValuationPayload::decode(&report.body).unwrap();

    assert_eq!(payload.fair_price(), U256::from(96_666u64));
    assert_eq!(payload.confidence_score(), U256::from(600_000u64));
    assert_eq!(payload.flags(), U256::from(FLAG_DIVERGENCE));
    assert_eq!(payload.max_safe_execution_size(), U256::from(6_990_972_903u64));
}

#[tokio::test]
async fn test_deep_stable_pool_is_fully_confident() {
    let pool = snap(10u128.pow(25), 10u128.pow(12));
    let payload = compute(&pool, &pool).unwrap().payload();
    assert_eq!(payload.confidence_score(), U256::from(1_000_000u64));
    assert_eq!(payload.flags(), U256::zero());
}

#[tokio::test]
async fn test_failed_execution_is_excluded_from_tally() {
    let pool = snap(10u128.pow(18), 10u128.pow(6));
    let good = execute(&source(pool, pool), INPUT).await;
    let bad = execute(&source(pool, pool), r#"{"pair": "WBTC-USDC"}"#).await;
    assert_eq!(bad.exit_code, EXIT_FAILURE);
    assert!(String::from_utf8_lossy(&bad.body).starts_with("Execution error"));

    let expected = ValuationPayload::decode(&good.body).unwrap();
    let reveals = vec![bad.into_reveal(true), good.clone().into_reveal(true), good.into_reveal(true)];
    assert_eq!(tally(&reveals).unwrap(), expected);
}

#[tokio::test]
async fn test_single_outlier_node_does_not_move_tally() {
    let pool = snap(10u128.pow(25), 10u128.pow(12));
    let skewed = snap(10u128.pow(25), 2 * 10u128.pow(12));
    let honest = execute(&source(pool, pool), INPUT).await;
    let outlier = execute(&source(skewed, skewed), INPUT).await;
    let expected = ValuationPayload::decode(&honest.body).unwrap();

    let reveals = vec![
        honest.clone().into_reveal(true),
        outlier.into_reveal(true),
        honest.into_reveal(true),
    ];
    assert_eq!(tally(&reveals).unwrap(), expected);
}

#[test]
fn test_max_safe_size_sits_on_the_slippage_boundary() {
    let pool = snap(2 * 10u128.pow(20), 2 * 10u128.pow(8));
    let spot = math::spot_price(&pool).unwrap();
    let best = math::max_safe_execution_size(&pool, spot).unwrap();
    assert_eq!(best, U256::from(1_398_194u64));

    let limit = U256::from(math::SLIPPAGE_LIMIT_1E6);
    let at = math::slippage(best, &pool, spot).unwrap().unwrap();
    let above = math::slippage(best + U256::one(), &pool, spot).unwrap().unwrap();
    assert!(at < limit);
    assert!(above >= limit);
}

proptest! {
    #[test]
    fn prop_fair_price_between_spot_and_history(
        base in 10u128.pow(18)..10u128.pow(23),
        quote in 10u128.pow(6)..10u128.pow(14),
        hist_base in 10u128.pow(18)..10u128.pow(23),
        hist_quote in 10u128.pow(6)..10u128.pow(14),
    ) {
        let v = compute(&snap(base, quote), &snap(hist_base, hist_quote)).unwrap();
        prop_assert!(v.fair_price >= v.spot.min(v.hist));
        prop_assert!(v.fair_price <= v.spot.max(v.hist));
        prop_assert!(v.confidence <= U256::from(1_000_000u64));
    }

    #[test]
    fn prop_confidence_monotone_in_liquidity(
        a in 0u64..=1_000_000,
        b in 0u64..=1_000_000,
        time in 0u64..=1_000_000,
    ) {
        let (lo, hi) = (a.min(b), a.max(b));
        let t = U256::from(time);
        let c_lo = math::confidence(U256::from(lo), t).unwrap();
        let c_hi = math::confidence(U256::from(hi), t).unwrap();
        prop_assert!(c_lo <= c_hi);
    }

    #[test]
    fn prop_confidence_non_increasing_in_divergence(
        a in 0u64..200_000,
        b in 0u64..200_000,
        liq in 0u64..=1_000_000,
    ) {
        let (lo, hi) = (a.min(b), a.max(b));
        let l = U256::from(liq);
        let c_lo = math::confidence(l, math::temporal_score(U256::from(lo))).unwrap();
        let c_hi = math::confidence(l, math::temporal_score(U256::from(hi))).unwrap();
        prop_assert!(c_lo >= c_hi);
    }
}
