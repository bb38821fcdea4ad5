//! Run the execution phase for one pair, the way a consensus node would.
//!
//! Usage:
//!   valuate <PAIR> [--reserves=<base>,<quote>,<hist_base>,<hist_quote>]
//!
//! Without `--reserves` the current and ~24h-old reserves are read over RPC
//! (`RPC_URL`, `BLOCKS_24H`). Prints one JSON line and exits with the
//! execution's exit code.

use std::time::Duration;

use primitive_types::U256;
use serde_json::json;

use poolrelay::config::Config;
use poolrelay::payload::ValuationPayload;
use poolrelay::valuation::execution::{execute, ExecutionReport};
use poolrelay::valuation::pairs;
use poolrelay::valuation::source::{ReserveSource, RpcReserveSource, StaticReserveSource};
use poolrelay::valuation::ReserveSnapshot;

fn print_usage() {
    eprintln!("usage: valuate <PAIR> [--reserves=<base>,<quote>,<hist_base>,<hist_quote>]");
}

fn parse_reserves(pair: &str, spec: &str) -> Result<StaticReserveSource, String> {
    let cfg = pairs::lookup(pair).map_err(|e| e.to_string())?;
    let values = spec
        .split(',')
        .map(|v| U256::from_dec_str(v.trim()).map_err(|e| format!("bad reserve {:?}: {:?}", v, e)))
        .collect::<Result<Vec<_>, _>>()?;
    let [base, quote, hist_base, hist_quote] = values[..] else {
        return Err(format!("expected 4 reserves, got {}", values.len()));
    };
    Ok(StaticReserveSource {
        now: ReserveSnapshot::new(base, quote, cfg.base_decimals, cfg.quote_decimals),
        hist: ReserveSnapshot::new(hist_base, hist_quote, cfg.base_decimals, cfg.quote_decimals),
    })
}

fn render(pair: &str, report: &ExecutionReport) -> serde_json::Value {
    if !report.is_success() {
        return json!({
            "pair": pair,
            "exit_code": report.exit_code,
            "error": String::from_utf8_lossy(&report.body),
        });
    }
    match ValuationPayload::decode(&report.body) {
        Ok(payload) => json!({
            "pair": pair,
            "exit_code": report.exit_code,
            "payload": payload.to_hex(),
            "fair_price": payload.fair_price().to_string(),
            "confidence_score": payload.confidence_score().to_string(),
            "max_safe_execution_size": payload.max_safe_execution_size().to_string(),
            "flags": payload.flags().to_string(),
        }),
        Err(e) => json!({
            "pair": pair,
            "exit_code": report.exit_code,
            "error": e.to_string(),
        }),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }
    let pair = args[1].clone();
    let reserves = args[2..].iter().find_map(|a| a.strip_prefix("--reserves="));

    let source: Box<dyn ReserveSource + Send + Sync> = match reserves {
        Some(spec) => match parse_reserves(&pair, spec) {
            Ok(source) => Box::new(source),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            let cfg = Config::from_env();
            match RpcReserveSource::new(
                cfg.rpc_url.clone(),
                cfg.blocks_24h,
                Duration::from_millis(cfg.http_timeout_ms),
            ) {
                Ok(source) => Box::new(source),
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    let input = json!({ "pair": pair }).to_string();
    let report = execute(source.as_ref(), &input).await;
    println!("{}", render(&pair, &report));
    std::process::exit(report.exit_code as i32);
}
