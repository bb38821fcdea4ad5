//! Client side of the consensus network's request registry.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::retry::{is_retryable_http_error, Permanent};
use crate::ids::RequestId;
use crate::payload::ValuationPayload;

/// One request whose consensus round has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleResult {
    pub request_id: RequestId,
    #[serde(default)]
    pub program_id: Option<String>,
    /// ABI-encoded `int256[]`, hex.
    pub payload: String,
    pub exit_code: u8,
    pub consensus: bool,
    /// The execution input, `{"pair": "..."}`.
    pub exec_inputs: String,
    pub block_height: u64,
}

impl EligibleResult {
    /// The consensus payload, when the round succeeded and it decodes.
    pub fn usable_payload(&self) -> Option<ValuationPayload> {
        if self.exit_code != 0 || !self.consensus {
            return None;
        }
        ValuationPayload::from_hex(&self.payload).ok()
    }

    /// Provenance blob attached to finalize.
    pub fn consensus_ref(&self) -> Vec<u8> {
        format!(
            "consensus:block={}:exit={}:agreed={}",
            self.block_height, self.exit_code, self.consensus
        )
        .into_bytes()
    }
}

#[async_trait]
pub trait ConsensusRegistry {
    async fn submit_valuation_request(&self, pair: &str) -> Result<RequestId>;
    /// Results with `block_height > since`.
    async fn poll_eligible_results(&self, since: u64) -> Result<Vec<EligibleResult>>;
}

#[derive(Clone)]
pub struct HttpRegistry {
    client: Client,
    base: Url,
    program_id: Option<String>,
}

#[derive(Deserialize)]
struct ResultsPage {
    results: Vec<EligibleResult>,
}

#[derive(Deserialize)]
struct SubmitResp {
    request_id: RequestId,
}

impl HttpRegistry {
    pub fn new(base: &str, program_id: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid registry url {}", base))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base, program_id })
    }

    pub fn results_url(&self, since: u64) -> Result<Url> {
        let mut url = self.base.join("results")?;
        url.query_pairs_mut().append_pair("since", &since.to_string());
        if let Some(program) = &self.program_id {
            url.query_pairs_mut().append_pair("program_id", program);
        }
        Ok(url)
    }

    pub fn requests_url(&self) -> Result<Url> {
        Ok(self.base.join("requests")?)
    }
}

async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let msg = format!("{} failed: {} {}", what, status, body);
    if is_retryable_http_error(status.as_u16()) {
        Err(anyhow!(msg))
    } else {
        Err(anyhow::Error::new(Permanent(msg)))
    }
}

#[async_trait]
impl ConsensusRegistry for HttpRegistry {
    async fn submit_valuation_request(&self, pair: &str) -> Result<RequestId> {
        let exec_inputs = json!({ "pair": pair }).to_string();
        let resp = self
            .client
            .post(self.requests_url()?)
            .json(&json!({
                "program_id": self.program_id,
                "exec_inputs": exec_inputs,
            }))
            .send()
            .await?;
        let resp = check_status(resp, "submit request").await?;
        let parsed: SubmitResp = resp.json().await?;
        Ok(parsed.request_id)
    }

    async fn poll_eligible_results(&self, since: u64) -> Result<Vec<EligibleResult>> {
        let resp = self.client.get(self.results_url(since)?).send().await?;
        let resp = check_status(resp, "poll results").await?;
        let page: ResultsPage = resp.json().await?;
        Ok(page.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    #[test]
    fn test_result_json_shape() {
        let payload = ValuationPayload::new(U256::from(5u8), U256::from(6u8), U256::from(7u8), 1);
        let raw = format!(
            r#"{{"request_id":"0x{}","payload":"{}","exit_code":0,"consensus":true,
                "exec_inputs":"{{\"pair\":\"WCRO-USDC\"}}","block_height":1200}}"#,
            "11".repeat(32),
            payload.to_hex()
        );
        let result: EligibleResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(result.request_id, RequestId([0x11; 32]));
        assert_eq!(result.program_id, None);
        assert_eq!(result.usable_payload(), Some(payload));
        assert_eq!(result.exec_inputs, r#"{"pair":"WCRO-USDC"}"#);
    }

    #[test]
    fn test_failed_round_has_no_usable_payload() {
        let payload = ValuationPayload::default().to_hex();
        let mut result = EligibleResult {
            request_id: RequestId([1; 32]),
            program_id: None,
            payload,
            exit_code: 1,
            consensus: true,
            exec_inputs: String::new(),
            block_height: 1,
        };
        assert_eq!(result.usable_payload(), None);
        result.exit_code = 0;
        result.consensus = false;
        assert_eq!(result.usable_payload(), None);
        result.consensus = true;
        assert_eq!(result.usable_payload(), Some(ValuationPayload::default()));
        result.payload = "0x1234".to_string();
        assert_eq!(result.usable_payload(), None);
    }

    #[test]
    fn test_urls_keep_base_path() {
        let reg = HttpRegistry::new(
            "http://registry.local/api/v1",
            Some("0xprog".to_string()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            reg.results_url(17).unwrap().as_str(),
            "http://registry.local/api/v1/results?since=17&program_id=0xprog"
        );
        assert_eq!(reg.requests_url().unwrap().as_str(), "http://registry.local/api/v1/requests");
    }
}
