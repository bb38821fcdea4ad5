use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use primitive_types::U256;
use reqwest::Client;
use serde_json::{json, Value};

use super::pairs::PairConfig;
use super::{ReserveSnapshot, ValuationError};
use crate::logging::{log, obj, v_int, v_str, Domain, Level};

const SELECTOR_GET_RESERVES: &str = "0902f1ac";
const SELECTOR_TOKEN0: &str = "0dfe1681";

/// Where a node reads pool reserves from.
#[async_trait]
pub trait ReserveSource {
    /// Reserves at the latest block and roughly 24h earlier, in that order.
    async fn snapshots(
        &self,
        pair: &PairConfig,
    ) -> Result<(ReserveSnapshot, ReserveSnapshot), ValuationError>;
}

fn unavailable(err: impl Display) -> ValuationError {
    ValuationError::SourceUnavailable(err.to_string())
}

/// Ethereum JSON-RPC reader for UniswapV2-style pools.
#[derive(Clone)]
pub struct RpcReserveSource {
    client: Client,
    url: String,
    blocks_24h: u64,
}

impl RpcReserveSource {
    pub fn new(url: String, blocks_24h: u64, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, blocks_24h })
    }

    async fn request(&self, body: Value) -> Result<Value, ValuationError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(unavailable(format!("rpc http {}: {}", status, text)));
        }
        let value: Value = resp.json().await.map_err(unavailable)?;
        if let Some(error) = value.get("error") {
            return Err(unavailable(format!("rpc error: {}", error)));
        }
        Ok(value)
    }

    async fn result_str(&self, body: Value) -> Result<String, ValuationError> {
        let value = self.request(body).await?;
        value
            .get("result")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| unavailable("rpc response missing result"))
    }

    pub async fn block_number(&self) -> Result<u64, ValuationError> {
        let result = self
            .result_str(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_blockNumber",
                "params": []
            }))
            .await?;
        u64::from_str_radix(result.trim_start_matches("0x"), 16)
            .map_err(|_| unavailable(format!("invalid block number {}", result)))
    }

    async fn eth_call(&self, to: &str, selector: &str, block: Option<u64>) -> Result<String, ValuationError> {
        let block_tag = block
            .map(|n| format!("0x{:x}", n))
            .unwrap_or_else(|| "latest".to_string());
        self.result_str(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                { "to": to, "data": format!("0x{}", selector) },
                block_tag
            ]
        }))
        .await
    }

    pub async fn token0(&self, pool: &str) -> Result<String, ValuationError> {
        let word = self.eth_call(pool, SELECTOR_TOKEN0, None).await?;
        parse_address_word(&word).ok_or_else(|| unavailable("cannot parse token0"))
    }

    pub async fn reserves_at(&self, pool: &str, block: u64) -> Result<(U256, U256), ValuationError> {
        let data = self.eth_call(pool, SELECTOR_GET_RESERVES, Some(block)).await?;
        parse_reserves(&data).ok_or_else(|| unavailable("cannot parse getReserves result"))
    }
}

#[async_trait]
impl ReserveSource for RpcReserveSource {
    async fn snapshots(
        &self,
        pair: &PairConfig,
    ) -> Result<(ReserveSnapshot, ReserveSnapshot), ValuationError> {
        let token0 = self.token0(pair.pool).await?;
        let latest = self.block_number().await?;
        let earlier = latest.saturating_sub(self.blocks_24h);

        let (now0, now1) = self.reserves_at(pair.pool, latest).await?;
        let (hist0, hist1) = self.reserves_at(pair.pool, earlier).await?;
        log(
            Level::Debug,
            Domain::Valuation,
            "reserves.read",
            obj(&[
                ("pair", v_str(pair.symbol)),
                ("block", v_int(latest)),
                ("hist_block", v_int(earlier)),
            ]),
        );
        Ok((
            pair.orient(&token0, now0, now1)?,
            pair.orient(&token0, hist0, hist1)?,
        ))
    }
}

/// Fixed reserves, for replays and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticReserveSource {
    pub now: ReserveSnapshot,
    pub hist: ReserveSnapshot,
}

#[async_trait]
impl ReserveSource for StaticReserveSource {
    async fn snapshots(
        &self,
        _pair: &PairConfig,
    ) -> Result<(ReserveSnapshot, ReserveSnapshot), ValuationError> {
        Ok((self.now, self.hist))
    }
}

/// Last 20 bytes of a 32-byte ABI word, as a 0x-prefixed address.
pub fn parse_address_word(value: &str) -> Option<String> {
    let cleaned = value.strip_prefix("0x").unwrap_or(value);
    if cleaned.len() != 64 || hex::decode(cleaned).is_err() {
        return None;
    }
    Some(format!("0x{}", &cleaned[24..]))
}

/// `(reserve0, reserve1)` from a `getReserves()` return (three words).
pub fn parse_reserves(value: &str) -> Option<(U256, U256)> {
    let cleaned = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(cleaned).ok()?;
    if bytes.len() < 96 {
        return None;
    }
    Some((
        U256::from_big_endian(&bytes[0..32]),
        U256::from_big_endian(&bytes[32..64]),
    ))
}
