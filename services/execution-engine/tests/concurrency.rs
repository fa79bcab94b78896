//! Races between workers, and between a worker and a cancellation
//!
//! The execution claim serializes workers and cancellations per order;
//! versioned ledger writes decide everything else.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{assert_reservation_matches, reliance, GatedLedger, Rig};
use execution_engine::config::SessionConfig;
use execution_engine::dispatch::Job;
use execution_engine::worker::Evaluation;
use rust_decimal::Decimal;
use types::errors::EngineError;
use types::numeric::Price;
use types::order::{OrderStatus, Side};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_execute_once() {
    let rig = Rig::new();
    let user = rig.funded_user(10_000).await;
    let order = rig.limit(user, Side::BUY, 10, 100).await.unwrap();
    rig.tick(95).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let worker = rig.worker.clone();
        let order_id = order.order_id;
        handles.push(tokio::spawn(async move {
            worker.process(&Job::new(order_id)).await.unwrap()
        }));
    }

    let mut executed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Evaluation::Executed(price) => {
                assert_eq!(price, Price::from_u64(95));
                executed += 1;
            }
            other => assert!(
                matches!(other, Evaluation::Skipped | Evaluation::Claimed),
                "unexpected outcome {:?}",
                other
            ),
        }
    }
    assert_eq!(executed, 1);

    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(9_050));
    assert_eq!(account.reserved, Decimal::ZERO);
    assert_eq!(account.held_quantity(&reliance()), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_execution_lets_the_commit_complete() {
    let ledger = Arc::new(GatedLedger::on_execution());
    let rig = Arc::new(Rig::with(ledger.clone(), SessionConfig::default()));
    let user = rig.funded_user(10_000).await;
    let order = rig.limit(user, Side::BUY, 10, 100).await.unwrap();
    rig.tick(95).await;

    // The worker passes its status check and stalls on its settlement commit
    let worker = {
        let rig = rig.clone();
        tokio::spawn(async move { rig.evaluate(order.order_id).await })
    };
    ledger.reached.notified().await;

    // The cancel arrives mid-execution and waits for the claim
    let cancel = {
        let rig = rig.clone();
        tokio::spawn(async move { rig.admission.cancel(user, order.order_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cancel.is_finished());
    assert!(rig.order(order.order_id).await.unwrap().is_open());

    ledger.release.notify_one();
    assert_eq!(worker.await.unwrap(), Evaluation::Executed(Price::from_u64(95)));

    let err = cancel.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)), "{:?}", err);

    let closed = rig.order(order.order_id).await.unwrap();
    assert_eq!(closed.status, OrderStatus::CLOSED);
    assert_eq!(closed.executed_price, Some(Price::from_u64(95)));
    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(9_050));
    assert_eq!(account.reserved, Decimal::ZERO);
    assert_eq!(account.held_quantity(&reliance()), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_in_progress_defers_evaluation() {
    let ledger = Arc::new(GatedLedger::on_cancel());
    let rig = Arc::new(Rig::with(ledger.clone(), SessionConfig::default()));
    let user = rig.funded_user(10_000).await;
    let order = rig.limit(user, Side::BUY, 10, 100).await.unwrap();
    rig.tick(95).await;

    // The cancel takes the claim and stalls on its delete commit
    let cancel = {
        let rig = rig.clone();
        tokio::spawn(async move { rig.admission.cancel(user, order.order_id).await })
    };
    ledger.reached.notified().await;

    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Claimed);
    ledger.release.notify_one();
    cancel.await.unwrap().unwrap();

    // The deferred delivery finds the order gone
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Skipped);
    assert!(rig.order(order.order_id).await.is_none());
    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(10_000));
    assert_eq!(account.reserved, Decimal::ZERO);
    assert_eq!(account.held_quantity(&reliance()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_overdraw() {
    let rig = Arc::new(Rig::new());
    let user = rig.funded_user(1_000).await;

    // Twenty orders of 100 each against 1 000 cash: at most ten fit
    let mut handles = Vec::new();
    for _ in 0..20 {
        let rig = rig.clone();
        handles.push(tokio::spawn(async move {
            rig.limit(user, Side::BUY, 1, 100).await
        }));
    }

    let mut accepted: i64 = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected rejection: {:?}", other),
        }
    }
    assert_eq!(accepted, 10);

    let account = rig.account(user).await;
    assert_eq!(account.reserved, Decimal::from(100 * accepted));
    assert_eq!(account.available, Decimal::from(1_000 - 100 * accepted));
    assert_reservation_matches(rig.ledger.as_ref(), user).await;
}
