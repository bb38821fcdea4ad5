//! Node-side execution phase: request input in, reveal body and exit code out.

use serde::Deserialize;

use super::pairs::{self, PairConfig};
use super::source::ReserveSource;
use super::{valuate, ValuationError};
use crate::logging::{log, obj, v_big, v_int, v_str, Domain, Level};
use crate::tally::RawReveal;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Deserialize)]
struct ExecutionInput {
    pair: Option<String>,
}

/// Parse `{"pair": "<symbol>"}` and resolve it against the supported pairs.
pub fn parse_input(input: &str) -> Result<&'static PairConfig, ValuationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValuationError::MalformedInput("missing input: pair required".to_string()));
    }
    let parsed: ExecutionInput = serde_json::from_str(trimmed)
        .map_err(|e| ValuationError::MalformedInput(e.to_string()))?;
    let pair = parsed
        .pair
        .ok_or_else(|| ValuationError::MalformedInput("missing pair in input".to_string()))?;
    pairs::lookup(&pair)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub exit_code: u8,
    /// ABI payload on success, error text otherwise.
    pub body: Vec<u8>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }

    pub fn into_reveal(self, in_consensus: bool) -> RawReveal {
        RawReveal {
            body: self.body,
            exit_code: self.exit_code,
            in_consensus,
        }
    }
}

/// Run one valuation the way a consensus node does. Never fails: errors
/// become a non-zero exit code so the node drops out of aggregation.
pub async fn execute<S>(source: &S, input: &str) -> ExecutionReport
where
    S: ReserveSource + ?Sized + Sync,
{
    match run(source, input).await {
        Ok(body) => ExecutionReport {
            exit_code: EXIT_SUCCESS,
            body,
        },
        Err(err) => {
            log(
                Level::Error,
                Domain::Valuation,
                "execution.failed",
                obj(&[("error", v_str(&err.to_string())), ("exit_code", v_int(EXIT_FAILURE as u64))]),
            );
            ExecutionReport {
                exit_code: EXIT_FAILURE,
                body: format!("Execution error: {}", err).into_bytes(),
            }
        }
    }
}

async fn run<S>(source: &S, input: &str) -> Result<Vec<u8>, ValuationError>
where
    S: ReserveSource + ?Sized + Sync,
{
    let pair = parse_input(input)?;
    let (now, hist) = source.snapshots(pair).await?;
    let valuation = valuate(pair.symbol, &now, &hist)?;
    let payload = valuation.payload();
    log(
        Level::Info,
        Domain::Valuation,
        "execution.payload",
        obj(&[
            ("pair", v_str(pair.symbol)),
            ("fair_price", v_big(payload.fair_price())),
            ("confidence", v_big(payload.confidence_score())),
            ("max_safe_size", v_big(payload.max_safe_execution_size())),
            ("flags", v_big(payload.flags())),
        ]),
    );
    Ok(payload.encode())
}
