//! Order lifecycle scenarios driven through admission and the worker
//!
//! Covers:
//! - BUY 10 @ 100 against 10 000 cash, executed on a tick at 95
//! - Market close failing a waiting order and releasing its reservation
//! - Cancel restoring balances; update moving the reservation by the delta
//! - SELL settlement and the execution-side holdings check

mod common;

use common::{assert_reservation_matches, ist, reliance, Rig};
use execution_engine::admission::UpdateOrder;
use execution_engine::worker::Evaluation;
use rust_decimal::Decimal;
use types::errors::EngineError;
use types::notification::UpdateKind;
use types::numeric::Price;
use types::order::{OrderStatus, Side};

#[tokio::test]
async fn buy_executes_at_better_price_and_settles() {
    let rig = Rig::new();
    let user = rig.funded_user(10_000).await;
    let mut updates = rig.notifier.subscribe().await.unwrap();

    let order = rig.limit(user, Side::BUY, 10, 100).await.unwrap();
    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(9_000));
    assert_eq!(account.reserved, Decimal::from(1_000));

    // No price yet, then a price above target parks the order
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::PriceRetry);
    rig.tick(102).await;
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Waiting);
    assert_eq!(rig.watchlist.members(&reliance()).await.unwrap(), vec![order.order_id]);

    rig.tick(95).await;
    assert_eq!(
        rig.evaluate(order.order_id).await,
        Evaluation::Executed(Price::from_u64(95))
    );

    let closed = rig.order(order.order_id).await.unwrap();
    assert_eq!(closed.status, OrderStatus::CLOSED);
    assert_eq!(closed.executed_price, Some(Price::from_u64(95)));

    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(9_050));
    assert_eq!(account.reserved, Decimal::ZERO);
    let holding = account.holding(&reliance()).unwrap();
    assert_eq!(holding.quantity, 10);
    assert_eq!(holding.average_cost, Decimal::from(95));

    let update = updates.next().await.unwrap();
    assert_eq!(update.kind, UpdateKind::Executed);
    assert_eq!(update.executed_price, Some(Price::from_u64(95)));
    assert!(rig.watchlist.members(&reliance()).await.unwrap().is_empty());

    // A late duplicate delivery changes nothing
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Skipped);
    assert_eq!(rig.account(user).await.available, Decimal::from(9_050));
}

#[tokio::test]
async fn market_close_fails_waiting_order() {
    let rig = Rig::new();
    rig.clock.set(ist(15, 0));
    let user = rig.funded_user(5_000).await;
    let order = rig.limit(user, Side::BUY, 20, 100).await.unwrap();

    rig.tick(110).await;
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Waiting);

    rig.clock.set(ist(15, 31));
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Failed);

    let failed = rig.order(order.order_id).await.unwrap();
    assert_eq!(failed.status, OrderStatus::FAILED);
    assert_eq!(failed.executed_price, None);
    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(5_000));
    assert_eq!(account.reserved, Decimal::ZERO);

    // Terminal orders cannot be mutated
    let err = rig.admission.cancel(user, order.order_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn cancel_and_update_keep_reservation_exact() {
    let rig = Rig::new();
    let user = rig.funded_user(10_000).await;

    let a = rig.limit(user, Side::BUY, 10, 100).await.unwrap();
    let b = rig.limit(user, Side::BUY, 5, 200).await.unwrap();
    assert_reservation_matches(rig.ledger.as_ref(), user).await;
    assert_eq!(rig.account(user).await.reserved, Decimal::from(2_000));

    let before = rig.account(user).await;
    rig.admission
        .update(
            user,
            a.order_id,
            UpdateOrder {
                price: Some(Decimal::from(90)),
                quantity: Some(12),
                kind: None,
            },
        )
        .await
        .unwrap();
    let after = rig.account(user).await;
    // 10 @ 100 -> 12 @ 90 moves the reservation by +80
    assert_eq!(after.reserved - before.reserved, Decimal::from(80));
    assert_eq!(before.available - after.available, Decimal::from(80));
    assert_reservation_matches(rig.ledger.as_ref(), user).await;

    rig.admission.cancel(user, b.order_id).await.unwrap();
    rig.admission.cancel(user, a.order_id).await.unwrap();
    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(10_000));
    assert_eq!(account.reserved, Decimal::ZERO);

    // A cancelled order's pending job finds a tombstone
    assert_eq!(rig.evaluate(a.order_id).await, Evaluation::Skipped);
}

#[tokio::test]
async fn sell_settles_and_never_below_target() {
    let rig = Rig::new();
    let user = rig.funded_user(1_000).await;
    let buy = rig.limit(user, Side::BUY, 4, 100).await.unwrap();
    rig.tick(100).await;
    rig.evaluate(buy.order_id).await;

    let sell = rig.limit(user, Side::SELL, 4, 120).await.unwrap();
    rig.tick(119).await;
    assert_eq!(rig.evaluate(sell.order_id).await, Evaluation::Waiting);
    rig.tick(125).await;
    assert_eq!(
        rig.evaluate(sell.order_id).await,
        Evaluation::Executed(Price::from_u64(125))
    );

    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(1_100));
    assert!(account.holding(&reliance()).is_none());
}

#[tokio::test]
async fn oversold_sell_fails_at_execution() {
    let rig = Rig::new();
    let user = rig.funded_user(1_000).await;
    let buy = rig.limit(user, Side::BUY, 3, 100).await.unwrap();
    rig.tick(100).await;
    rig.evaluate(buy.order_id).await;

    // Both sells pass admission against 3 held units
    let first = rig.limit(user, Side::SELL, 3, 100).await.unwrap();
    let second = rig.limit(user, Side::SELL, 2, 100).await.unwrap();

    assert_eq!(
        rig.evaluate(first.order_id).await,
        Evaluation::Executed(Price::from_u64(100))
    );
    assert_eq!(rig.evaluate(second.order_id).await, Evaluation::Failed);
    assert_eq!(
        rig.order(second.order_id).await.unwrap().status,
        OrderStatus::FAILED
    );
    assert_eq!(rig.account(user).await.available, Decimal::from(1_000));
}

#[tokio::test]
async fn amended_order_is_re_evaluated_at_new_target() {
    let rig = Rig::new();
    let user = rig.funded_user(10_000).await;
    let order = rig.limit(user, Side::BUY, 1, 100).await.unwrap();
    rig.tick(105).await;
    assert_eq!(rig.evaluate(order.order_id).await, Evaluation::Waiting);

    rig.admission
        .update(
            user,
            order.order_id,
            UpdateOrder {
                price: Some(Decimal::from(106)),
                ..UpdateOrder::default()
            },
        )
        .await
        .unwrap();
    assert!(rig.queue.is_pending(&order.order_id));
    assert_eq!(
        rig.evaluate(order.order_id).await,
        Evaluation::Executed(Price::from_u64(105))
    );
    let account = rig.account(user).await;
    assert_eq!(account.available, Decimal::from(9_895));
    assert_eq!(account.reserved, Decimal::ZERO);
}
