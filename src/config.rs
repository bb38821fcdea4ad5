use crate::driver::retry::RetryConfig;
use crate::driver::DriverConfig;
use crate::relay::RelayConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub registry_url: String,
    pub rpc_url: String,
    pub program_id: Option<String>,
    pub pairs: Vec<String>,
    pub sqlite_path: String,
    pub poll_secs: u64,
    pub min_finalization_delay: u64,
    pub finalization_window: u64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    /// ~24h of blocks at the chain's block time
    pub blocks_24h: u64,
    pub http_timeout_ms: u64,
    /// Propose a locally computed estimate as soon as a payment settles.
    pub optimistic: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            registry_url: std::env::var("REGISTRY_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),
            rpc_url: std::env::var("RPC_URL").unwrap_or_else(|_| "https://evm.cronos.org".to_string()),
            program_id: std::env::var("PROGRAM_ID").ok().filter(|v| !v.trim().is_empty()),
            pairs: std::env::var("PAIRS")
                .unwrap_or_else(|_| "WCRO-USDC".to_string())
                .split(',')
                .map(|p| p.trim().to_uppercase())
                .filter(|p| !p.is_empty())
                .collect(),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./relay.sqlite".to_string()),
            poll_secs: std::env::var("POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(15),
            min_finalization_delay: std::env::var("MIN_FINALIZATION_DELAY").ok().and_then(|v| v.parse().ok()).unwrap_or(90),
            finalization_window: std::env::var("FINALIZATION_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            retry_max_attempts: std::env::var("RETRY_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(4),
            retry_base_ms: std::env::var("RETRY_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(250),
            retry_max_delay_ms: std::env::var("RETRY_MAX_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000),
            retry_jitter: std::env::var("RETRY_JITTER").ok().and_then(|v| v.parse().ok()).unwrap_or(0.2),
            blocks_24h: std::env::var("BLOCKS_24H").ok().and_then(|v| v.parse().ok()).unwrap_or(17_280),
            http_timeout_ms: std::env::var("HTTP_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000),
            optimistic: std::env::var("OPTIMISTIC").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(true),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            min_finalization_delay: self.min_finalization_delay,
            finalization_window: self.finalization_window,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_delay_ms,
            jitter_factor: self.retry_jitter.clamp(0.0, 1.0),
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            pairs: self.pairs.clone(),
            program_id: self.program_id.clone(),
            min_finalization_delay: self.min_finalization_delay,
            retry: self.retry_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_configs_follow_fields() {
        let mut cfg = Config::from_env();
        cfg.min_finalization_delay = 30;
        cfg.finalization_window = 120;
        cfg.retry_max_attempts = 0;
        cfg.retry_jitter = 3.0;
        cfg.pairs = vec!["WCRO-USDC".to_string()];

        let relay = cfg.relay_config();
        assert_eq!((relay.min_finalization_delay, relay.finalization_window), (30, 120));

        let retry = cfg.retry_config();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.jitter_factor, 1.0);

        let driver = cfg.driver_config();
        assert_eq!(driver.pairs, vec!["WCRO-USDC".to_string()]);
        assert_eq!(driver.min_finalization_delay, 30);
    }
}
