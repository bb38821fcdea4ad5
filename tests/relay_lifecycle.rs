//! Relay lifecycle through the async target, driven by a manual clock.

use std::sync::{Arc, Mutex};

use primitive_types::U256;

use poolrelay::clock::ManualClock;
use poolrelay::driver::target::{LocalRelay, RelayTarget};
use poolrelay::ids::{PairKey, RequestId};
use poolrelay::payload::ValuationPayload;
use poolrelay::relay::events::{RelayEvent, Repudiation};
use poolrelay::relay::{FinalizeOutcome, RelayBook, RelayConfig, RelayError, RequestState};

const T0: u64 = 1_700_000_000;

fn setup() -> (Arc<Mutex<RelayBook>>, Arc<ManualClock>, LocalRelay) {
    let book = Arc::new(Mutex::new(RelayBook::new(RelayConfig::default())));
    let clock = Arc::new(ManualClock::new(T0));
    let relay = LocalRelay::new(book.clone(), clock.clone());
    (book, clock, relay)
}

fn pair() -> PairKey {
    PairKey::from_symbol("WCRO-USDC")
}

fn payload(fair: u64) -> ValuationPayload {
    ValuationPayload::new(U256::from(fair), U256::from(400_002u64), U256::from(6_990u64), 2)
}

#[tokio::test]
async fn test_propose_wait_finalize_updates_latest() {
    let (book, clock, relay) = setup();
    let id = RequestId([1; 32]);

    relay
        .propose(id, pair(), payload(1_000_000), b"api:WCRO-USDC".to_vec())
        .await
        .unwrap()
        .unwrap();
    // A pending proposal is never served as the latest value.
    assert_eq!(book.lock().unwrap().get_latest(&pair()), None);

    clock.advance(91);
    let (outcome, receipt) = relay
        .finalize(id, payload(1_000_000), b"consensus".to_vec(), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, FinalizeOutcome::Finalized);
    assert!(receipt.tx_hash.starts_with("0x"));

    let book = book.lock().unwrap();
    assert_eq!(book.get_latest(&pair()), Some(payload(1_000_000)));
    assert_eq!(book.get_latest_request_id(&pair()), Some(id));
    assert_eq!(book.state_of(&id), RequestState::Finalized);
    assert!(matches!(book.events(), [RelayEvent::Proposed { .. }, RelayEvent::Finalized { .. }]));
}

#[tokio::test]
async fn test_finalize_window_boundaries() {
    let (_, clock, relay) = setup();
    let id = RequestId([2; 32]);
    relay.propose(id, pair(), payload(1), vec![]).await.unwrap().unwrap();

    clock.advance(89);
    let early = relay.finalize(id, payload(1), vec![], true).await.unwrap();
    assert!(matches!(early, Err(RelayError::TooEarly { elapsed: 89, min: 90, .. })));

    clock.advance(1);
    let at_min = relay.finalize(id, payload(1), vec![], true).await.unwrap();
    assert!(matches!(at_min, Ok((FinalizeOutcome::Finalized, _))));

    let again = relay.finalize(id, payload(1), vec![], true).await.unwrap();
    assert!(matches!(again, Err(RelayError::NotProposed { state: RequestState::Finalized, .. })));
}

#[tokio::test]
async fn test_expired_proposal_stays_proposed() {
    let (book, clock, relay) = setup();
    let id = RequestId([3; 32]);
    relay.propose(id, pair(), payload(1), vec![]).await.unwrap().unwrap();

    clock.advance(301);
    let late = relay.finalize(id, payload(1), vec![], true).await.unwrap();
    assert!(matches!(late, Err(RelayError::TooLate { elapsed: 301, window: 300, .. })));
    assert_eq!(book.lock().unwrap().state_of(&id), RequestState::Proposed);

    let view = relay.get_proposed(id).await.unwrap();
    assert_eq!(view.proposed_at, T0);
    assert_eq!(view.payload, payload(1));
}

#[tokio::test]
async fn test_mismatch_repudiates_then_consensus_value_is_reproposed() {
    let (book, clock, relay) = setup();
    let id = RequestId([4; 32]);
    relay.propose(id, pair(), payload(990_000), vec![]).await.unwrap().unwrap();

    clock.advance(120);
    let (outcome, _) = relay
        .finalize(id, payload(1_000_000), b"consensus".to_vec(), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        FinalizeOutcome::ConsensusError {
            reason: Repudiation::SlotMismatch { slot: 0 }
        }
    );
    assert_eq!(book.lock().unwrap().get_latest(&pair()), None);

    relay.propose(id, pair(), payload(1_000_000), vec![]).await.unwrap().unwrap();
    clock.advance(90);
    let (outcome, _) = relay
        .finalize(id, payload(1_000_000), b"consensus".to_vec(), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, FinalizeOutcome::Finalized);
    assert_eq!(book.lock().unwrap().get_latest(&pair()), Some(payload(1_000_000)));
}

#[tokio::test]
async fn test_missing_consensus_repudiates() {
    let (book, clock, relay) = setup();
    let id = RequestId([5; 32]);
    relay.propose(id, pair(), payload(7), vec![]).await.unwrap().unwrap();
    clock.advance(200);

    let (outcome, _) = relay
        .finalize(id, ValuationPayload::default(), vec![], false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        FinalizeOutcome::ConsensusError {
            reason: Repudiation::NoConsensus
        }
    );
    assert_eq!(book.lock().unwrap().state_of(&id), RequestState::ConsensusError);
}
