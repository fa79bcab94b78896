//! Admission and mutation API
//!
//! Every mutation validates first, then commits the order write and the
//! matching account write in one version-conditioned ledger transaction.
//! Nothing is written when a check fails. Mutations for one user run one at
//! a time on this instance; version checks still guard against other writers.
//! Cancellation holds the order's execution claim while it deletes, so it
//! never lands between a worker's status check and its settlement. Queue,
//! watchlist, tombstone and cache housekeeping happen after the commit and
//! are best-effort.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use types::account::UserAccount;
use types::errors::{EngineError, EngineResult};
use types::ids::{InstrumentId, OrderId, UserId};
use types::notification::OrderUpdate;
use types::numeric::{Price, Quantity};
use types::order::{Order, OrderKind, Side};

use crate::accountant::{self, retry_on_conflict};
use crate::claim::OrderClaim;
use crate::config::{AdmissionConfig, WorkerConfig};
use crate::dispatch::DispatchQueue;
use crate::keys;
use crate::ledger::{LedgerTx, OrderLedger};
use crate::notifier::Notifier;
use crate::price_store::PriceStore;
use crate::session::Clock;
use crate::watchlist::Watchlist;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub instrument: String,
    pub side: Side,
    pub quantity: u64,
    pub kind: OrderKind,
    /// Required for LIMIT; ignored for MARKET, which snapshots the store price
    #[serde(default)]
    pub price: Option<Decimal>,
}

/// Fields to change on an OPEN order. Omitted fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateOrder {
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<u64>,
    #[serde(default)]
    pub kind: Option<OrderKind>,
}

impl UpdateOrder {
    fn is_empty(&self) -> bool {
        self.price.is_none() && self.quantity.is_none() && self.kind.is_none()
    }
}

/// Cached read model: balances plus the OPEN orders behind the reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioView {
    pub account: UserAccount,
    pub open_orders: Vec<Order>,
    pub generated_at: i64,
}

pub struct AdmissionService {
    store: Arc<dyn PriceStore>,
    ledger: Arc<dyn OrderLedger>,
    queue: DispatchQueue,
    watchlist: Watchlist,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    config: AdmissionConfig,
    tombstone_ttl: Duration,
    lock_ttl: Duration,
    user_gates: DashMap<UserId, Arc<Mutex<()>>>,
}

impl AdmissionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PriceStore>,
        ledger: Arc<dyn OrderLedger>,
        queue: DispatchQueue,
        watchlist: Watchlist,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        config: AdmissionConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            queue,
            watchlist,
            notifier,
            clock,
            config,
            tombstone_ttl: worker.tombstone_ttl(),
            lock_ttl: worker.lock_ttl(),
            user_gates: DashMap::new(),
        }
    }

    // ── Place ───────────────────────────────────────────────────────

    pub async fn place(&self, user_id: UserId, request: PlaceOrder) -> EngineResult<Order> {
        let instrument = parse_instrument(&request.instrument)?;
        let quantity = parse_quantity(request.quantity)?;
        let target = match request.kind {
            OrderKind::LIMIT => parse_price(request.price.ok_or_else(|| {
                EngineError::Validation("LIMIT order requires a price".into())
            })?)?,
            OrderKind::MARKET => self.snapshot_price(&instrument).await?,
        };
        // Settlement multiplies the same way on either side
        target.notional(quantity)?;

        let order = {
            let gate = self.user_gate(&user_id);
            let _serial = gate.lock().await;
            retry_on_conflict(self.config.conflict_retries, || {
                self.try_place(user_id, &instrument, request.side, quantity, request.kind, target)
            })
            .await?
        };

        self.queue.enqueue(order.order_id);
        self.invalidate_view(&user_id).await;
        info!(
            order_id = %order.order_id,
            %user_id,
            instrument = %order.instrument,
            side = %order.side,
            quantity = quantity.get(),
            target = %target,
            "Order placed"
        );
        Ok(order)
    }

    async fn try_place(
        &self,
        user_id: UserId,
        instrument: &InstrumentId,
        side: Side,
        quantity: Quantity,
        kind: OrderKind,
        target: Price,
    ) -> EngineResult<Order> {
        let mut account = self.account(&user_id).await?;
        let order = Order::new(
            user_id,
            instrument.clone(),
            side,
            quantity,
            kind,
            target,
            self.clock.now_nanos(),
        );

        let tx = match side {
            Side::BUY => {
                accountant::reserve_for_buy(&mut account, target, quantity)?;
                LedgerTx::new().create_order(order.clone()).update_account(account)
            }
            Side::SELL => {
                accountant::check_holdings(&account, instrument, quantity)?;
                LedgerTx::new().create_order(order.clone())
            }
        };
        self.ledger.commit(tx).await?;
        Ok(order)
    }

    // ── Update ──────────────────────────────────────────────────────

    pub async fn update(
        &self,
        user_id: UserId,
        order_id: OrderId,
        request: UpdateOrder,
    ) -> EngineResult<Order> {
        if request.is_empty() {
            return Err(EngineError::Validation("update changes nothing".into()));
        }
        if let Some(quantity) = request.quantity {
            parse_quantity(quantity)?;
        }
        if let Some(price) = request.price {
            parse_price(price)?;
        }

        let (updated, old_price) = {
            let gate = self.user_gate(&user_id);
            let _serial = gate.lock().await;
            retry_on_conflict(self.config.conflict_retries, || {
                self.try_update(user_id, order_id, &request)
            })
            .await?
        };

        // The old parking and pending job are void. An evaluation still
        // holding the claim loses its version check; the fresh job is
        // deferred until that evaluation lets go.
        self.unpark(&updated).await;
        self.queue.remove(&order_id);
        self.queue.enqueue(order_id);

        self.notifier
            .publish(&OrderUpdate::updated(&updated, old_price, updated.updated_at))
            .await;
        self.invalidate_view(&user_id).await;
        info!(
            %order_id,
            %user_id,
            old_price = %old_price,
            new_price = %updated.target_price,
            quantity = updated.quantity.get(),
            "Order updated"
        );
        Ok(updated)
    }

    async fn try_update(
        &self,
        user_id: UserId,
        order_id: OrderId,
        request: &UpdateOrder,
    ) -> EngineResult<(Order, Price)> {
        let order = self.owned_order(&user_id, &order_id).await?;
        order.ensure_open()?;

        let kind = request.kind.unwrap_or(order.kind);
        let quantity = match request.quantity {
            Some(q) => parse_quantity(q)?,
            None => order.quantity,
        };
        let price = if request.kind == Some(OrderKind::MARKET) {
            self.snapshot_price(&order.instrument).await?
        } else if let Some(p) = request.price {
            parse_price(p)?
        } else {
            order.target_price
        };
        let new_amount = price.notional(quantity)?;

        let mut amended = order.clone();
        amended.amend(price, quantity, kind, self.clock.now_nanos())?;

        let mut account = self.account(&user_id).await?;
        let tx = match order.side {
            Side::BUY => {
                accountant::adjust_buy_reservation(
                    &mut account,
                    order.reserved_amount()?,
                    new_amount,
                )?;
                LedgerTx::new().update_order(amended.clone()).update_account(account)
            }
            Side::SELL => {
                accountant::check_holdings(&account, &order.instrument, quantity)?;
                LedgerTx::new().update_order(amended.clone())
            }
        };
        self.ledger.commit(tx).await?;
        amended.version += 1;
        Ok((amended, order.target_price))
    }

    // ── Cancel ──────────────────────────────────────────────────────

    /// Delete an OPEN order and reverse its reservation.
    ///
    /// Waits up to `cancel_claim_wait_ms` for an evaluation in progress to
    /// finish. If that evaluation executes the order, the cancel fails with
    /// `InvalidState` and the execution stands.
    pub async fn cancel(&self, user_id: UserId, order_id: OrderId) -> EngineResult<Order> {
        self.owned_order(&user_id, &order_id).await?.ensure_open()?;

        let claim = OrderClaim::acquire_within(
            self.store.as_ref(),
            order_id,
            self.lock_ttl,
            self.config.cancel_claim_wait(),
        )
        .await?
        .ok_or_else(|| {
            EngineError::InvalidState(format!("order {} is being executed, retry later", order_id))
        })?;

        let result = {
            let gate = self.user_gate(&user_id);
            let _serial = gate.lock().await;
            retry_on_conflict(self.config.conflict_retries, || {
                self.try_cancel(user_id, order_id)
            })
            .await
        };
        if result.is_ok() {
            // Written before the claim is released, so the next holder sees it
            if let Err(e) = self
                .store
                .set_with_ttl(&keys::tombstone_key(&order_id), "1", self.tombstone_ttl)
                .await
            {
                warn!(%order_id, error = %e, "Failed to write cancellation tombstone");
            }
        }
        claim.release(self.store.as_ref()).await;
        let cancelled = result?;

        self.queue.remove(&order_id);
        self.unpark(&cancelled).await;

        let now = self.clock.now_nanos();
        self.notifier.publish(&OrderUpdate::deleted(&cancelled, now)).await;
        self.invalidate_view(&user_id).await;
        info!(%order_id, %user_id, "Order cancelled");
        Ok(cancelled)
    }

    async fn try_cancel(&self, user_id: UserId, order_id: OrderId) -> EngineResult<Order> {
        let order = self.owned_order(&user_id, &order_id).await?;
        order.ensure_open()?;

        let mut tx = LedgerTx::new().delete_order(&order);
        if order.side == Side::BUY {
            let mut account = self.account(&user_id).await?;
            accountant::reverse_buy_reservation(&mut account, order.target_price, order.quantity)?;
            tx = tx.update_account(account);
        }
        self.ledger.commit(tx).await?;
        Ok(order)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_order(&self, user_id: UserId, order_id: OrderId) -> EngineResult<Order> {
        self.owned_order(&user_id, &order_id).await
    }

    /// Account and OPEN orders, served from `view:portfolio:{user}` when cached.
    pub async fn portfolio_view(&self, user_id: UserId) -> EngineResult<PortfolioView> {
        let key = keys::portfolio_view_key(&user_id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(view) => return Ok(view),
                Err(e) => warn!(%user_id, error = %e, "Discarding undecodable portfolio view"),
            },
            Ok(None) => {}
            Err(e) => warn!(%user_id, error = %e, "Portfolio view cache unavailable"),
        }

        let account = self.account(&user_id).await?;
        let open_orders = self
            .ledger
            .orders_for_user(&user_id)
            .await?
            .into_iter()
            .filter(|o| o.is_open())
            .collect();
        let view = PortfolioView {
            account,
            open_orders,
            generated_at: self.clock.now_nanos(),
        };

        match serde_json::to_string(&view) {
            Ok(raw) => {
                let ttl = Duration::from_millis(self.config.portfolio_view_ttl_ms);
                if let Err(e) = self.store.set_with_ttl(&key, &raw, ttl).await {
                    warn!(%user_id, error = %e, "Failed to cache portfolio view");
                }
            }
            Err(e) => warn!(%user_id, error = %e, "Failed to encode portfolio view"),
        }
        Ok(view)
    }

    // ── Funding and prices ──────────────────────────────────────────

    /// Credit paper cash, opening the account on first deposit.
    pub async fn deposit(&self, user_id: UserId, amount: Decimal) -> EngineResult<UserAccount> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "deposit must be positive, got {}",
                amount
            )));
        }
        let account = {
            let gate = self.user_gate(&user_id);
            let _serial = gate.lock().await;
            retry_on_conflict(self.config.conflict_retries, || {
                self.try_deposit(user_id, amount)
            })
            .await?
        };
        self.invalidate_view(&user_id).await;
        info!(%user_id, %amount, available = %account.available, "Deposit credited");
        Ok(account)
    }

    async fn try_deposit(&self, user_id: UserId, amount: Decimal) -> EngineResult<UserAccount> {
        let now = self.clock.now_nanos();
        match self.ledger.find_account(&user_id).await? {
            Some(mut account) => {
                accountant::credit(&mut account, amount)?;
                account.updated_at = now;
                self.ledger
                    .commit(LedgerTx::new().update_account(account.clone()))
                    .await?;
                account.version += 1;
                Ok(account)
            }
            None => {
                let account = UserAccount::new(user_id, amount, now);
                self.ledger
                    .commit(LedgerTx::new().create_account(account.clone()))
                    .await?;
                Ok(account)
            }
        }
    }

    /// Relay an externally observed price into the store.
    pub async fn relay_price(&self, instrument: &str, price: Decimal) -> EngineResult<Price> {
        let instrument = parse_instrument(instrument)?;
        let price = parse_price(price)?;
        self.store
            .set_price(&instrument, price, self.clock.now_nanos())
            .await?;
        Ok(price)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn account(&self, user_id: &UserId) -> EngineResult<UserAccount> {
        self.ledger
            .find_account(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account for user {}", user_id)))
    }

    async fn owned_order(&self, user_id: &UserId, order_id: &OrderId) -> EngineResult<Order> {
        let order = self
            .ledger
            .find_order(order_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("order {}", order_id)))?;
        if &order.user_id != user_id {
            return Err(EngineError::Unauthorized(format!(
                "order {} belongs to another user",
                order_id
            )));
        }
        Ok(order)
    }

    async fn snapshot_price(&self, instrument: &InstrumentId) -> EngineResult<Price> {
        self.store.get_price(instrument).await?.ok_or_else(|| {
            EngineError::Validation(format!("no market price available for {}", instrument))
        })
    }

    /// Per-user mutex serializing this instance's balance mutations.
    fn user_gate(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.user_gates.entry(*user_id).or_default().clone()
    }

    async fn unpark(&self, order: &Order) {
        if let Err(e) = self.watchlist.remove(&order.instrument, &order.order_id).await {
            warn!(order_id = %order.order_id, error = %e, "Failed to clear watchlist entry");
        }
    }

    async fn invalidate_view(&self, user_id: &UserId) {
        if let Err(e) = self.store.delete(&keys::portfolio_view_key(user_id)).await {
            warn!(%user_id, error = %e, "Failed to invalidate portfolio view");
        }
    }
}

fn parse_instrument(raw: &str) -> EngineResult<InstrumentId> {
    InstrumentId::try_new(raw)
        .ok_or_else(|| EngineError::Validation(format!("invalid instrument symbol {:?}", raw)))
}

fn parse_quantity(raw: u64) -> EngineResult<Quantity> {
    Quantity::try_new(raw)
        .ok_or_else(|| EngineError::Validation("quantity must be a positive integer".into()))
}

fn parse_price(raw: Decimal) -> EngineResult<Price> {
    Price::try_new(raw)
        .ok_or_else(|| EngineError::Validation(format!("price must be positive, got {}", raw)))
}
