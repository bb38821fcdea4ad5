//! Aggregate raw reveals read as JSON lines on stdin.
//!
//! Each line: `{"body": "0x...", "exit_code": 0, "in_consensus": true}`.
//! Prints the aggregated payload as one JSON line; exits 1 when no reveal
//! qualifies.

use std::io::{self, BufRead};

use serde_json::json;

use poolrelay::tally::{tally, RawReveal};

fn main() {
    let stdin = io::stdin();
    let mut reveals = Vec::new();

    for line in stdin.lock().lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawReveal>(&line) {
            Ok(reveal) => reveals.push(reveal),
            Err(err) => eprintln!("bad reveal json: {}", err),
        }
    }

    match tally(&reveals) {
        Ok(payload) => {
            println!(
                "{}",
                json!({
                    "reveals": reveals.len(),
                    "payload": payload.to_hex(),
                    "fair_price": payload.fair_price().to_string(),
                    "confidence_score": payload.confidence_score().to_string(),
                    "max_safe_execution_size": payload.max_safe_execution_size().to_string(),
                    "flags": payload.flags().to_string(),
                })
            );
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    }
}
