//! Pairs this deployment knows how to value.

use primitive_types::U256;

use super::{ReserveSnapshot, ValuationError};
use crate::ids::PairKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairConfig {
    pub symbol: &'static str,
    /// Constant-product pool contract.
    pub pool: &'static str,
    pub base: &'static str,
    pub quote: &'static str,
    pub base_decimals: u8,
    pub quote_decimals: u8,
}

pub const WCRO_USDC: PairConfig = PairConfig {
    symbol: "WCRO-USDC",
    pool: "0xE61Db569E231B3f5530168Aa2C9D50246525b6d6",
    base: "0x5C7F8A570d578ED84E63fdFA7b1eE72dEae1AE23",
    quote: "0xc21223249CA28397B4B6541dfFaEcC539BfF0c59",
    base_decimals: 18,
    quote_decimals: 6,
};

pub static SUPPORTED_PAIRS: &[PairConfig] = &[WCRO_USDC];

pub fn lookup(symbol: &str) -> Result<&'static PairConfig, ValuationError> {
    let wanted = symbol.trim();
    SUPPORTED_PAIRS
        .iter()
        .find(|p| p.symbol.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| ValuationError::UnsupportedPair(wanted.to_string()))
}

impl PairConfig {
    pub fn key(&self) -> PairKey {
        PairKey::from_symbol(self.symbol)
    }

    /// Map the pool's `(reserve0, reserve1)` onto base/quote using `token0`.
    pub fn orient(
        &self,
        token0: &str,
        reserve0: U256,
        reserve1: U256,
    ) -> Result<ReserveSnapshot, ValuationError> {
        let (reserve_base, reserve_quote) = if token0.eq_ignore_ascii_case(self.base) {
            (reserve0, reserve1)
        } else if token0.eq_ignore_ascii_case(self.quote) {
            (reserve1, reserve0)
        } else {
            return Err(ValuationError::SourceUnavailable(format!(
                "token0 {} is neither side of {}",
                token0, self.symbol
            )));
        };
        Ok(ReserveSnapshot::new(
            reserve_base,
            reserve_quote,
            self.base_decimals,
            self.quote_decimals,
        ))
    }
}
