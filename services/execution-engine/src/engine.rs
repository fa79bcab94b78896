//! Engine assembly and lifecycle
//!
//! [`EngineBuilder`] wires the price store, ledger, dispatch queue, matching
//! worker, price dispatcher and optional feed together. [`Engine::start`]
//! re-enqueues every OPEN order found in the ledger and spawns the background
//! tasks; [`Engine::shutdown`] stops them and flushes the ledger.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use types::errors::EngineResult;

use crate::admission::AdmissionService;
use crate::config::EngineConfig;
use crate::dispatch::DispatchQueue;
use crate::dispatcher::{DispatcherHandle, PriceDispatcher};
use crate::feed::{FeedSupervisor, PriceSource, RandomWalkSource};
use crate::ledger::{InMemoryLedger, OrderLedger};
use crate::notifier::Notifier;
use crate::price_store::{InMemoryPriceStore, PriceStore};
use crate::session::{Clock, MarketSession, SystemClock};
use crate::watchlist::Watchlist;
use crate::worker::MatchingWorker;

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn PriceStore>>,
    ledger: Option<Arc<dyn OrderLedger>>,
    clock: Option<Arc<dyn Clock>>,
    price_source: Option<Box<dyn PriceSource>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            ledger: None,
            clock: None,
            price_source: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PriceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `ledger` instead of opening one from `[journal]`.
    pub fn with_ledger(mut self, ledger: Arc<dyn OrderLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Feed ticks from `source` instead of the configured random walk.
    pub fn with_price_source(mut self, source: Box<dyn PriceSource>) -> Self {
        self.price_source = Some(source);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let config = self.config;
        let session = MarketSession::from_config(&config.session)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryPriceStore::new()));
        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => Arc::new(InMemoryLedger::open_with(&config.journal)?),
        };

        let queue = DispatchQueue::new(config.queue.clone());
        let watchlist = Watchlist::new(store.clone());
        let notifier = Notifier::new(store.clone());
        let dispatcher = PriceDispatcher::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            watchlist.clone(),
            config.worker.sweep_interval(),
        );
        let dispatcher_handle = dispatcher.handle();

        let worker = Arc::new(MatchingWorker::new(
            store.clone(),
            ledger.clone(),
            watchlist.clone(),
            notifier.clone(),
            dispatcher_handle.clone(),
            session,
            clock.clone(),
            config.worker.clone(),
        ));
        let admission = AdmissionService::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            watchlist,
            notifier.clone(),
            clock.clone(),
            config.admission.clone(),
            &config.worker,
        );

        let feed = match self.price_source {
            Some(source) => Some(FeedSupervisor::new(source, store.clone(), config.feed.clone())),
            None if config.feed.enabled => {
                let source = RandomWalkSource::from_config(&config.feed, clock)?;
                Some(FeedSupervisor::new(Box::new(source), store.clone(), config.feed.clone()))
            }
            None => None,
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Engine {
            config,
            store,
            ledger,
            queue,
            notifier,
            admission,
            worker,
            dispatcher_handle,
            pending: Mutex::new(Some(Pending { dispatcher, feed })),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Components consumed by the first `start`.
struct Pending {
    dispatcher: PriceDispatcher,
    feed: Option<FeedSupervisor>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn PriceStore>,
    ledger: Arc<dyn OrderLedger>,
    queue: DispatchQueue,
    notifier: Notifier,
    admission: AdmissionService,
    worker: Arc<MatchingWorker>,
    dispatcher_handle: DispatcherHandle,
    pending: Mutex<Option<Pending>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Spawn the background tasks and re-enqueue OPEN orders.
    ///
    /// Returns the number of orders recovered. Calling it again is a no-op.
    pub async fn start(&self) -> EngineResult<usize> {
        let Some(Pending { dispatcher, feed }) = self.pending.lock().take() else {
            return Ok(0);
        };

        let mut tasks = Vec::with_capacity(3);

        let queue = self.queue.clone();
        let worker = self.worker.clone();
        let rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { queue.run(worker, rx).await }));

        tasks.push(tokio::spawn(dispatcher.run(self.shutdown_tx.subscribe())));

        if let Some(feed) = feed {
            let rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                feed.run(rx).await;
            }));
        }
        self.tasks.lock().extend(tasks);

        let open = self.ledger.open_orders().await?;
        let recovered = open.len();
        for order in open {
            self.queue.enqueue(order.order_id);
        }
        info!(
            recovered,
            feed = self.config.feed.enabled,
            max_in_flight = self.config.queue.max_in_flight,
            "Execution engine started"
        );
        Ok(recovered)
    }

    /// Stop background tasks, wait for in-flight jobs and flush the ledger.
    pub async fn shutdown(&self) -> EngineResult<()> {
        info!("Execution engine shutting down");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Engine task ended abnormally");
            }
        }
        self.ledger.flush().await?;
        info!("Execution engine stopped");
        Ok(())
    }

    pub fn admission(&self) -> &AdmissionService {
        &self.admission
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn OrderLedger> {
        &self.ledger
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher_handle
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::PlaceOrder;
    use crate::session::ManualClock;
    use rust_decimal::Decimal;
    use types::ids::{InstrumentId, UserId};
    use types::numeric::Price;
    use types::order::{OrderKind, OrderStatus, Side};

    fn always_open() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.session.always_open = true;
        config
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_joins() {
        let engine = EngineBuilder::new(always_open()).build().unwrap();
        assert_eq!(engine.start().await.unwrap(), 0);
        assert_eq!(engine.start().await.unwrap(), 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_enqueues_open_orders() {
        let ledger = Arc::new(InMemoryLedger::new());
        let clock = ManualClock::new(1_708_000_000_000_000_000);

        let first = EngineBuilder::new(always_open())
            .with_ledger(ledger.clone())
            .with_clock(clock.clone())
            .build()
            .unwrap();
        let user = UserId::new();
        first.admission().deposit(user, Decimal::from(1_000)).await.unwrap();
        let order = first
            .admission()
            .place(
                user,
                PlaceOrder {
                    instrument: "HDFC".into(),
                    side: Side::BUY,
                    quantity: 1,
                    kind: OrderKind::LIMIT,
                    price: Some(Decimal::from(100)),
                },
            )
            .await
            .unwrap();

        // A fresh engine over the same ledger picks the order up
        let second = EngineBuilder::new(always_open())
            .with_ledger(ledger.clone())
            .with_clock(clock)
            .build()
            .unwrap();
        second
            .store()
            .set_price(&InstrumentId::new("HDFC"), Price::from_u64(99), 1)
            .await
            .unwrap();
        assert_eq!(second.start().await.unwrap(), 1);

        let mut closed = false;
        for _ in 0..100 {
            let stored = second.ledger().find_order(&order.order_id).await.unwrap().unwrap();
            if stored.status == OrderStatus::CLOSED {
                assert_eq!(stored.executed_price, Some(Price::from_u64(99)));
                closed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(closed, "recovered order never executed");
        second.shutdown().await.unwrap();
    }
}
