use anyhow::Result;
use async_trait::async_trait;

use crate::payload::ValuationPayload;
use crate::valuation::pairs::PairConfig;
use crate::valuation::source::ReserveSource;
use crate::valuation::valuate;

/// Produces the optimistic payload proposed before consensus lands.
#[async_trait]
pub trait OptimisticSource {
    async fn estimate(&self, pair: &PairConfig) -> Result<ValuationPayload>;
}

/// Runs the valuation engine locally on fresh reserve reads, the same
/// computation every consensus node performs.
pub struct EngineEstimator<S> {
    source: S,
}

impl<S> EngineEstimator<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S> OptimisticSource for EngineEstimator<S>
where
    S: ReserveSource + Send + Sync,
{
    async fn estimate(&self, pair: &PairConfig) -> Result<ValuationPayload> {
        let (now, hist) = self.source.snapshots(pair).await?;
        Ok(valuate(pair.symbol, &now, &hist)?.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valuation::pairs::WCRO_USDC;
    use crate::valuation::source::StaticReserveSource;
    use crate::valuation::ReserveSnapshot;
    use primitive_types::U256;

    #[tokio::test]
    async fn test_estimate_matches_engine() {
        let snap = ReserveSnapshot::new(U256::exp10(18), U256::exp10(6), 18, 6);
        let estimator = EngineEstimator::new(StaticReserveSource { now: snap, hist: snap });
        let payload = estimator.estimate(&WCRO_USDC).await.unwrap();
        assert_eq!(payload.fair_price(), U256::from(1_000_000u64));
        assert_eq!(payload.max_safe_execution_size(), U256::from(6_990u64));
        assert_eq!(payload.flags(), U256::from(2u8));
    }

    #[tokio::test]
    async fn test_zero_reserve_surfaces() {
        let snap = ReserveSnapshot::new(U256::zero(), U256::exp10(6), 18, 6);
        let estimator = EngineEstimator::new(StaticReserveSource { now: snap, hist: snap });
        assert!(estimator.estimate(&WCRO_USDC).await.is_err());
    }
}
