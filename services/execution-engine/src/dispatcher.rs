//! Price dispatcher
//!
//! The single owner of price-channel subscriptions. Workers ask, through a
//! [`DispatcherHandle`], for an instrument to be watched when they park an
//! order. On each tick the dispatcher looks up OPEN orders whose trigger rule
//! is satisfied at the new price, intersects them with the instrument's
//! watchlist and enqueues those orders for evaluation.
//!
//! A periodic sweep re-enqueues every parked order and every dead-lettered
//! job, so an order on an instrument that stops ticking still reaches its
//! session-close or max-wait failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use types::ids::{InstrumentId, OrderId};

use crate::dispatch::DispatchQueue;
use crate::keys;
use crate::ledger::OrderLedger;
use crate::price_store::{PriceStore, PriceTick};
use crate::watchlist::Watchlist;

const TICK_BUFFER: usize = 1024;

/// Cheap handle used by workers to request subscriptions.
#[derive(Clone)]
pub struct DispatcherHandle {
    control: mpsc::UnboundedSender<InstrumentId>,
    subscribed: Arc<DashSet<InstrumentId>>,
}

impl DispatcherHandle {
    /// Make sure ticks for `instrument` reach the dispatcher.
    pub fn ensure_subscribed(&self, instrument: &InstrumentId) {
        if self.subscribed.insert(instrument.clone()) && self.control.send(instrument.clone()).is_err() {
            self.subscribed.remove(instrument);
            warn!(instrument = %instrument, "Price dispatcher is not running");
        }
    }

    pub fn is_subscribed(&self, instrument: &InstrumentId) -> bool {
        self.subscribed.contains(instrument)
    }

    pub fn subscribed_instruments(&self) -> Vec<InstrumentId> {
        self.subscribed.iter().map(|i| i.key().clone()).collect()
    }
}

pub struct PriceDispatcher {
    store: Arc<dyn PriceStore>,
    ledger: Arc<dyn OrderLedger>,
    queue: DispatchQueue,
    watchlist: Watchlist,
    sweep_interval: Duration,
    handle: DispatcherHandle,
    control_rx: mpsc::UnboundedReceiver<InstrumentId>,
}

impl PriceDispatcher {
    pub fn new(
        store: Arc<dyn PriceStore>,
        ledger: Arc<dyn OrderLedger>,
        queue: DispatchQueue,
        watchlist: Watchlist,
        sweep_interval: Duration,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        Self {
            store,
            ledger,
            queue,
            watchlist,
            sweep_interval,
            handle: DispatcherHandle {
                control,
                subscribed: Arc::new(DashSet::new()),
            },
            control_rx,
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (tick_tx, mut tick_rx) = mpsc::channel::<PriceTick>(TICK_BUFFER);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately
        sweep.tick().await;

        info!(sweep_interval_ms = self.sweep_interval.as_millis() as u64, "Price dispatcher running");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
                Some(instrument) = self.control_rx.recv() => {
                    self.subscribe(instrument, tick_tx.clone(), shutdown.clone()).await;
                }
                Some(tick) = tick_rx.recv() => {
                    self.on_tick(tick).await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("Price dispatcher stopped");
    }

    async fn subscribe(
        &self,
        instrument: InstrumentId,
        tick_tx: mpsc::Sender<PriceTick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let channel = keys::price_channel(&instrument);
        let mut subscription = match self.store.subscribe(&channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Price subscription failed");
                // Let the next parked order retry
                self.handle.subscribed.remove(&instrument);
                return;
            }
        };
        info!(instrument = %instrument, %channel, "Subscribed to price channel");

        // Ticks published before the subscription existed were missed
        if let Ok(Some(price)) = self.store.get_price(&instrument).await {
            self.on_tick(PriceTick {
                instrument: instrument.clone(),
                price,
                timestamp: types::unix_nanos(),
            })
            .await;
        }

        let subscribed = self.handle.subscribed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = subscription.recv() => {
                        let Some(raw) = message else { break };
                        match serde_json::from_str::<PriceTick>(&raw) {
                            Ok(tick) => {
                                if tick_tx.send(tick).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(%channel, error = %e, "Undecodable price tick"),
                        }
                    }
                }
            }
            subscribed.remove(&instrument);
            debug!(instrument = %instrument, "Price forwarder stopped");
        });
    }

    /// Enqueue parked orders that the new price triggers.
    pub async fn on_tick(&self, tick: PriceTick) -> usize {
        let crossing = match self
            .ledger
            .find_open_by_instrument_crossing(&tick.instrument, tick.price)
            .await
        {
            Ok(orders) => orders,
            Err(e) => {
                warn!(instrument = %tick.instrument, error = %e, "Crossing lookup failed");
                return 0;
            }
        };
        if crossing.is_empty() {
            return 0;
        }

        let parked: HashSet<OrderId> = match self.watchlist.members(&tick.instrument).await {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                warn!(instrument = %tick.instrument, error = %e, "Watchlist read failed");
                return 0;
            }
        };

        let mut dispatched = 0;
        for order in crossing {
            if parked.contains(&order.order_id) && self.queue.enqueue(order.order_id) {
                dispatched += 1;
            }
        }
        debug!(
            instrument = %tick.instrument,
            price = %tick.price,
            dispatched,
            "Price tick dispatched"
        );
        dispatched
    }

    /// Re-enqueue every parked order and every dead-lettered job.
    pub async fn sweep(&self) -> usize {
        let mut enqueued = 0;
        for instrument in self.handle.subscribed_instruments() {
            match self.watchlist.members(&instrument).await {
                Ok(members) => {
                    for order_id in members {
                        if self.queue.enqueue(order_id) {
                            enqueued += 1;
                        }
                    }
                }
                Err(e) => warn!(instrument = %instrument, error = %e, "Sweep skipped instrument"),
            }
        }

        let dead = self.queue.drain_dead_letters();
        let revived = dead.len();
        for letter in dead {
            if self.queue.enqueue(letter.order_id) {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(enqueued, revived, "Expiry sweep re-enqueued orders");
        }
        enqueued
    }
}
