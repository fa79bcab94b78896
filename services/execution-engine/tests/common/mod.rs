//! Shared fixtures for the execution engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use execution_engine::admission::{AdmissionService, PlaceOrder};
use execution_engine::config::{AdmissionConfig, QueueConfig, SessionConfig, WorkerConfig};
use execution_engine::dispatch::{DispatchQueue, Job};
use execution_engine::dispatcher::PriceDispatcher;
use execution_engine::ledger::{InMemoryLedger, LedgerTx, LedgerWrite, OrderLedger};
use execution_engine::notifier::Notifier;
use execution_engine::price_store::{InMemoryPriceStore, PriceStore};
use execution_engine::session::{ManualClock, MarketSession};
use execution_engine::watchlist::Watchlist;
use execution_engine::worker::{Evaluation, MatchingWorker};
use rust_decimal::Decimal;
use tokio::sync::Notify;
use types::account::UserAccount;
use types::errors::EngineResult;
use types::ids::{InstrumentId, OrderId, UserId};
use types::numeric::{Price, Quantity};
use types::order::{Order, OrderKind, OrderStatus, Side};

/// Route engine logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Unix nanos for a wall-clock time in IST on 2024-02-19, a Monday.
pub fn ist(hour: u32, minute: u32) -> i64 {
    FixedOffset::east_opt(330 * 60)
        .unwrap()
        .with_ymd_and_hms(2024, 2, 19, hour, minute, 0)
        .unwrap()
        .timestamp_nanos_opt()
        .unwrap()
}

/// Components wired by hand so tests can drive the worker directly.
pub struct Rig {
    pub store: Arc<InMemoryPriceStore>,
    pub ledger: Arc<dyn OrderLedger>,
    pub queue: DispatchQueue,
    pub watchlist: Watchlist,
    pub notifier: Notifier,
    pub admission: AdmissionService,
    pub worker: Arc<MatchingWorker>,
    pub clock: Arc<ManualClock>,
    // Keeps the subscription channel open for the worker's handle
    pub dispatcher: PriceDispatcher,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(Arc::new(InMemoryLedger::new()), SessionConfig::default())
    }

    pub fn with(ledger: Arc<dyn OrderLedger>, session: SessionConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryPriceStore::new());
        let clock = ManualClock::new(ist(10, 0));
        let queue = DispatchQueue::new(QueueConfig::default());
        let watchlist = Watchlist::new(store.clone());
        let notifier = Notifier::new(store.clone());
        let worker_config = WorkerConfig::default();

        let dispatcher = PriceDispatcher::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            watchlist.clone(),
            worker_config.sweep_interval(),
        );
        let worker = Arc::new(MatchingWorker::new(
            store.clone(),
            ledger.clone(),
            watchlist.clone(),
            notifier.clone(),
            dispatcher.handle(),
            MarketSession::from_config(&session).unwrap(),
            clock.clone(),
            worker_config.clone(),
        ));
        let admission = AdmissionService::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            watchlist.clone(),
            notifier.clone(),
            clock.clone(),
            AdmissionConfig::default(),
            &worker_config,
        );

        Self {
            store,
            ledger,
            queue,
            watchlist,
            notifier,
            admission,
            worker,
            clock,
            dispatcher,
        }
    }

    pub async fn funded_user(&self, cash: i64) -> UserId {
        let user = UserId::new();
        self.admission.deposit(user, Decimal::from(cash)).await.unwrap();
        user
    }

    pub async fn limit(&self, user: UserId, side: Side, qty: u64, price: i64) -> EngineResult<Order> {
        self.admission
            .place(
                user,
                PlaceOrder {
                    instrument: "RELIANCE".into(),
                    side,
                    quantity: qty,
                    kind: OrderKind::LIMIT,
                    price: Some(Decimal::from(price)),
                },
            )
            .await
    }

    pub async fn tick(&self, price: u64) {
        self.store
            .set_price(&reliance(), Price::from_u64(price), self.clock_now())
            .await
            .unwrap();
    }

    pub async fn evaluate(&self, order_id: OrderId) -> Evaluation {
        self.worker.process(&Job::new(order_id)).await.unwrap()
    }

    pub async fn account(&self, user: UserId) -> UserAccount {
        self.ledger.find_account(&user).await.unwrap().unwrap()
    }

    pub async fn order(&self, order_id: OrderId) -> Option<Order> {
        self.ledger.find_order(&order_id).await.unwrap()
    }

    fn clock_now(&self) -> i64 {
        use execution_engine::session::Clock;
        self.clock.now_nanos()
    }
}

pub fn reliance() -> InstrumentId {
    InstrumentId::new("RELIANCE")
}

/// `reserved` must equal the notional of the user's OPEN BUY orders.
pub async fn assert_reservation_matches(ledger: &dyn OrderLedger, user: UserId) {
    let account = ledger.find_account(&user).await.unwrap().unwrap();
    let open_buys: Decimal = ledger
        .orders_for_user(&user)
        .await
        .unwrap()
        .iter()
        .filter(|o| o.status == OrderStatus::OPEN && o.side == Side::BUY)
        .map(|o| o.target_price.notional(o.quantity).unwrap())
        .sum();
    assert!(account.check_invariant(), "negative balance: {:?}", account);
    assert_eq!(account.reserved, open_buys, "reservation drifted for {}", user);
}

pub fn qty(n: u64) -> Quantity {
    Quantity::new(n)
}

/// Ledger wrapper that parks the first commit matching a predicate until the
/// test releases it, to force a specific interleaving of two writers.
pub struct GatedLedger {
    inner: InMemoryLedger,
    matches: Box<dyn Fn(&LedgerTx) -> bool + Send + Sync>,
    armed: AtomicBool,
    pub reached: Notify,
    pub release: Notify,
}

impl GatedLedger {
    pub fn new(matches: impl Fn(&LedgerTx) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: InMemoryLedger::new(),
            matches: Box::new(matches),
            armed: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Gate on the commit that closes an order.
    pub fn on_execution() -> Self {
        Self::new(|tx| {
            tx.writes().iter().any(|w| {
                matches!(w, LedgerWrite::UpdateOrder(o) if o.status == OrderStatus::CLOSED)
            })
        })
    }

    /// Gate on the commit that deletes an order.
    pub fn on_cancel() -> Self {
        Self::new(|tx| {
            tx.writes()
                .iter()
                .any(|w| matches!(w, LedgerWrite::DeleteOrder { .. }))
        })
    }
}

#[async_trait]
impl OrderLedger for GatedLedger {
    async fn find_order(&self, order_id: &OrderId) -> EngineResult<Option<Order>> {
        self.inner.find_order(order_id).await
    }

    async fn find_account(&self, user_id: &UserId) -> EngineResult<Option<UserAccount>> {
        self.inner.find_account(user_id).await
    }

    async fn find_open_by_instrument_crossing(
        &self,
        instrument: &InstrumentId,
        price: Price,
    ) -> EngineResult<Vec<Order>> {
        self.inner.find_open_by_instrument_crossing(instrument, price).await
    }

    async fn open_orders(&self) -> EngineResult<Vec<Order>> {
        self.inner.open_orders().await
    }

    async fn orders_for_user(&self, user_id: &UserId) -> EngineResult<Vec<Order>> {
        self.inner.orders_for_user(user_id).await
    }

    async fn commit(&self, tx: LedgerTx) -> EngineResult<()> {
        if (self.matches)(&tx) && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.commit(tx).await
    }
}
