use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use poolrelay::clock::{Clock, SystemClock};
use poolrelay::config::Config;
use poolrelay::driver::optimist::{EngineEstimator, OptimisticSource};
use poolrelay::driver::registry::HttpRegistry;
use poolrelay::driver::store::StateStore;
use poolrelay::driver::target::LocalRelay;
use poolrelay::driver::RelayDriver;
use poolrelay::logging::{log, obj, run_id, v_int, v_str, Domain, Level};
use poolrelay::relay::store::BookStore;
use poolrelay::valuation::source::RpcReserveSource;

/// Each stdin line names a pair whose valuation payment has settled.
fn spawn_payment_feed() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let pair = line.trim().to_string();
            if pair.is_empty() {
                continue;
            }
            if tx.send(pair).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let timeout = Duration::from_millis(cfg.http_timeout_ms);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = HttpRegistry::new(&cfg.registry_url, cfg.program_id.clone(), timeout)?;
    // The relay book lives beside the driver state so a restart resumes both.
    let book_store = BookStore::open(&cfg.sqlite_path)?;
    let book = Arc::new(Mutex::new(book_store.load(cfg.relay_config())?));
    let target = LocalRelay::new(book, clock.clone()).with_store(book_store);
    let optimist: Option<Box<dyn OptimisticSource + Send + Sync>> = if cfg.optimistic {
        let source = RpcReserveSource::new(cfg.rpc_url.clone(), cfg.blocks_24h, timeout)?;
        Some(Box::new(EngineEstimator::new(source)))
    } else {
        None
    };
    let store = StateStore::open(&cfg.sqlite_path)?;

    log(
        Level::Info,
        Domain::System,
        "system.start",
        obj(&[
            ("run_id", v_str(run_id())),
            ("registry", v_str(&cfg.registry_url)),
            ("pairs", v_str(&cfg.pairs.join(","))),
            ("sqlite", v_str(&cfg.sqlite_path)),
            ("poll_secs", v_int(cfg.poll_secs)),
            ("optimistic", serde_json::Value::Bool(cfg.optimistic)),
        ]),
    );

    let mut driver = RelayDriver::new(
        Box::new(registry),
        Box::new(target),
        optimist,
        store,
        clock,
        cfg.driver_config(),
    );

    let mut payments = spawn_payment_feed();
    let mut payments_open = true;
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.poll_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // A failed tick leaves the cursor where it was; the next poll repeats it.
                if let Err(e) = driver.tick().await {
                    log(
                        Level::Error,
                        Domain::Driver,
                        "driver.tick_failed",
                        obj(&[("error", v_str(&format!("{:#}", e)))]),
                    );
                }
            }
            pair = payments.recv(), if payments_open => {
                let Some(pair) = pair else {
                    payments_open = false;
                    continue;
                };
                if let Err(e) = driver.on_payment_settled(&pair).await {
                    log(
                        Level::Error,
                        Domain::Driver,
                        "driver.payment_failed",
                        obj(&[("pair", v_str(&pair)), ("error", v_str(&format!("{:#}", e)))]),
                    );
                }
            }
        }
    }
}
