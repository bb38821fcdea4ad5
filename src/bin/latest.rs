//! Read relayed valuations from the relay book on disk.
//!
//! Usage:
//!   latest <PAIR> [--db=<path>]
//!   latest --request=<id> [--db=<path>]
//!
//! The database defaults to `SQLITE_PATH`, the file the relay daemon writes.
//! Prints one JSON line; a pair with nothing finalized prints `null` and
//! exits 2.

use serde_json::json;

use poolrelay::config::Config;
use poolrelay::ids::{PairKey, RequestId};
use poolrelay::payload::ValuationPayload;
use poolrelay::relay::store::BookStore;

fn print_usage() {
    eprintln!("usage: latest <PAIR> | --request=<id> [--db=<path>]");
}

fn payload_json(payload: &ValuationPayload) -> serde_json::Value {
    json!({
        "payload": payload.to_hex(),
        "fair_price": payload.fair_price().to_string(),
        "confidence_score": payload.confidence_score().to_string(),
        "max_safe_execution_size": payload.max_safe_execution_size().to_string(),
        "flags": payload.flags().to_string(),
    })
}

fn run(args: &[String]) -> anyhow::Result<i32> {
    let db = args
        .iter()
        .find_map(|a| a.strip_prefix("--db="))
        .map(str::to_string)
        .unwrap_or_else(|| Config::from_env().sqlite_path);
    let store = BookStore::open(&db)?;

    if let Some(raw) = args.iter().find_map(|a| a.strip_prefix("--request=")) {
        let id: RequestId = raw.parse()?;
        let view = store.proposed(&id)?;
        println!(
            "{}",
            json!({
                "request_id": id.to_hex(),
                "state": view.state.as_str(),
                "pair": view.pair.to_hex(),
                "proposed_at": view.proposed_at,
                "value": payload_json(&view.payload),
            })
        );
        return Ok(0);
    }

    let Some(pair) = args.iter().find(|a| !a.starts_with("--")) else {
        print_usage();
        return Ok(1);
    };
    match store.latest(&PairKey::from_symbol(pair))? {
        Some((id, payload)) => {
            println!(
                "{}",
                json!({
                    "pair": pair,
                    "request_id": id.to_hex(),
                    "value": payload_json(&payload),
                })
            );
            Ok(0)
        }
        None => {
            println!("null");
            Ok(2)
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        std::process::exit(1);
    }
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
