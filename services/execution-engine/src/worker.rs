//! Matching worker
//!
//! Evaluates one order per job:
//!
//! ```text
//! Claiming ──▶ Evaluating ──┬──▶ Executing   (trigger rule satisfied)
//!                           ├──▶ Waiting     (parked on the watchlist)
//!                           └──▶ Failing     (session closed / max wait)
//! ```
//!
//! The claim (`lock:order:{id}`) keeps two workers, or a worker and a
//! cancellation, off the same order at the same time. A delivery that finds
//! the order claimed is deferred rather than dropped, so a tick that lands
//! while another evaluation holds the claim is still acted on. Every terminal
//! write is also conditioned on the order and account versions just read and
//! re-checks that the order is still OPEN, so a duplicate or stale delivery
//! cannot settle twice.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use types::errors::{EngineError, EngineResult};
use types::ids::OrderId;
use types::notification::OrderUpdate;
use types::numeric::Price;
use types::order::{Order, Side};

use crate::accountant::{self, retry_on_conflict};
use crate::claim::OrderClaim;
use crate::config::WorkerConfig;
use crate::dispatch::{Job, JobHandler, JobOutcome};
use crate::dispatcher::DispatcherHandle;
use crate::keys;
use crate::ledger::{LedgerTx, OrderLedger};
use crate::notifier::Notifier;
use crate::price_store::PriceStore;
use crate::session::{Clock, MarketSession};
use crate::watchlist::Watchlist;

/// How an evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Cancelled, missing or already terminal
    Skipped,
    /// Claimed by another worker or a cancellation; deliver again later
    Claimed,
    Executed(Price),
    /// Parked on the watchlist until a triggering tick
    Waiting,
    Failed,
    /// No price yet; evaluate again later
    PriceRetry,
}

pub struct MatchingWorker {
    store: Arc<dyn PriceStore>,
    ledger: Arc<dyn OrderLedger>,
    watchlist: Watchlist,
    notifier: Notifier,
    dispatcher: DispatcherHandle,
    session: MarketSession,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl MatchingWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PriceStore>,
        ledger: Arc<dyn OrderLedger>,
        watchlist: Watchlist,
        notifier: Notifier,
        dispatcher: DispatcherHandle,
        session: MarketSession,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            watchlist,
            notifier,
            dispatcher,
            session,
            clock,
            config,
        }
    }

    /// Claim the order, evaluate it, release the claim.
    pub async fn process(&self, job: &Job) -> EngineResult<Evaluation> {
        let order_id = job.order_id;
        let Some(claim) =
            OrderClaim::try_acquire(self.store.as_ref(), order_id, self.config.lock_ttl()).await?
        else {
            debug!(%order_id, "Order claimed elsewhere");
            return Ok(Evaluation::Claimed);
        };

        let result = self.evaluate(job).await;
        claim.release(self.store.as_ref()).await;
        result
    }

    async fn evaluate(&self, job: &Job) -> EngineResult<Evaluation> {
        let order_id = job.order_id;
        if self.store.exists(&keys::tombstone_key(&order_id)).await? {
            debug!(%order_id, "Order cancelled, skipping");
            return Ok(Evaluation::Skipped);
        }

        let order = match self.ledger.find_order(&order_id).await? {
            Some(order) if order.is_open() => order,
            Some(order) => {
                debug!(%order_id, status = %order.status, "Order already terminal");
                return Ok(Evaluation::Skipped);
            }
            None => {
                debug!(%order_id, "Order no longer exists");
                return Ok(Evaluation::Skipped);
            }
        };

        match self.store.get_price(&order.instrument).await? {
            Some(price) if order.is_triggered_at(price) => self.execute(&order, price).await,
            Some(_) => self.wait_or_fail(&order).await,
            None if job.requeues < self.config.max_price_retries => {
                debug!(
                    %order_id,
                    instrument = %order.instrument,
                    attempt = job.requeues + 1,
                    "No price yet, retrying later"
                );
                Ok(Evaluation::PriceRetry)
            }
            None => self.wait_or_fail(&order).await,
        }
    }

    // ── Executing ───────────────────────────────────────────────────

    async fn execute(&self, order: &Order, price: Price) -> EngineResult<Evaluation> {
        let order_id = order.order_id;
        let result = retry_on_conflict(self.config.conflict_retries, || {
            self.try_execute(order_id, price)
        })
        .await;

        match result {
            Ok(Some(closed)) => {
                info!(
                    %order_id,
                    user_id = %closed.user_id,
                    instrument = %closed.instrument,
                    side = %closed.side,
                    quantity = closed.quantity.get(),
                    target = %closed.target_price,
                    executed_price = %price,
                    "Order executed"
                );
                let update = OrderUpdate::executed(&closed, closed.updated_at);
                self.finish(&closed, update).await;
                Ok(Evaluation::Executed(price))
            }
            Ok(None) | Err(EngineError::NotFound(_)) => {
                debug!(%order_id, "Order changed under evaluation, execution skipped");
                Ok(Evaluation::Skipped)
            }
            Err(EngineError::InsufficientHoldings {
                instrument,
                required,
                held,
            }) => {
                warn!(
                    %order_id,
                    %instrument,
                    required,
                    held,
                    "Holdings no longer cover the sale"
                );
                self.fail(order_id, "holdings no longer cover the sale").await
            }
            Err(EngineError::Validation(reason)) => {
                warn!(%order_id, %reason, "Settlement rejected");
                self.fail(order_id, "settlement out of range").await
            }
            Err(e) => Err(e),
        }
    }

    /// One version-conditioned settlement attempt. `None` if the order is no
    /// longer OPEN or no longer triggered at `price`.
    async fn try_execute(&self, order_id: OrderId, price: Price) -> EngineResult<Option<Order>> {
        let Some(order) = self.ledger.find_order(&order_id).await? else {
            return Ok(None);
        };
        if !order.is_open() || !order.is_triggered_at(price) {
            return Ok(None);
        }
        let mut account = self.ledger.find_account(&order.user_id).await?.ok_or_else(|| {
            EngineError::InvalidState(format!("order {} has no account", order_id))
        })?;

        let mut closed = order.clone();
        closed.close(price, self.clock.now_nanos())?;
        match order.side {
            Side::BUY => accountant::release_and_settle_buy(
                &mut account,
                &order.instrument,
                order.target_price,
                order.quantity,
                price,
            )?,
            Side::SELL => {
                accountant::settle_sell(&mut account, &order.instrument, order.quantity, price)?
            }
        }

        self.ledger
            .commit(LedgerTx::new().update_order(closed.clone()).update_account(account))
            .await?;
        closed.version += 1;
        Ok(Some(closed))
    }

    // ── Waiting / Failing ───────────────────────────────────────────

    async fn wait_or_fail(&self, order: &Order) -> EngineResult<Evaluation> {
        let now = self.clock.now_nanos();
        if !self.session.is_open(now) {
            return self.fail(order.order_id, "market session closed").await;
        }
        if now.saturating_sub(order.updated_at) >= self.config.max_wait_nanos() {
            return self.fail(order.order_id, "maximum wait elapsed").await;
        }

        self.watchlist.add(&order.instrument, &order.order_id).await?;
        self.dispatcher.ensure_subscribed(&order.instrument);

        // A tick that landed between the price read and parking would be missed
        if let Some(price) = self.store.get_price(&order.instrument).await? {
            if order.is_triggered_at(price) {
                return self.execute(order, price).await;
            }
        }

        debug!(
            order_id = %order.order_id,
            instrument = %order.instrument,
            target = %order.target_price,
            "Order waiting for trigger"
        );
        Ok(Evaluation::Waiting)
    }

    async fn fail(&self, order_id: OrderId, reason: &str) -> EngineResult<Evaluation> {
        let result =
            retry_on_conflict(self.config.conflict_retries, || self.try_fail(order_id)).await;

        match result {
            Ok(Some(failed)) => {
                let cause = EngineError::ExecutionTimeout(reason.to_string());
                info!(
                    %order_id,
                    user_id = %failed.user_id,
                    instrument = %failed.instrument,
                    cause = %cause,
                    "Order failed"
                );
                let update = OrderUpdate::failed(&failed, failed.updated_at);
                self.finish(&failed, update).await;
                Ok(Evaluation::Failed)
            }
            Ok(None) | Err(EngineError::NotFound(_)) => Ok(Evaluation::Skipped),
            Err(e) => Err(e),
        }
    }

    async fn try_fail(&self, order_id: OrderId) -> EngineResult<Option<Order>> {
        let Some(order) = self.ledger.find_order(&order_id).await? else {
            return Ok(None);
        };
        if !order.is_open() {
            return Ok(None);
        }

        let mut failed = order.clone();
        failed.fail(self.clock.now_nanos())?;
        let mut tx = LedgerTx::new().update_order(failed.clone());
        if order.side == Side::BUY {
            let mut account = self.ledger.find_account(&order.user_id).await?.ok_or_else(|| {
                EngineError::InvalidState(format!("order {} has no account", order_id))
            })?;
            accountant::reverse_buy_reservation(&mut account, order.target_price, order.quantity)?;
            tx = tx.update_account(account);
        }

        self.ledger.commit(tx).await?;
        failed.version += 1;
        Ok(Some(failed))
    }

    /// Side effects after a terminal commit. Failures here are logged only;
    /// the ledger already holds the outcome.
    async fn finish(&self, order: &Order, update: OrderUpdate) {
        self.notifier.publish(&update).await;
        if let Err(e) = self.watchlist.remove(&order.instrument, &order.order_id).await {
            warn!(order_id = %order.order_id, error = %e, "Failed to clear watchlist entry");
        }
        if let Err(e) = self.store.delete(&keys::portfolio_view_key(&order.user_id)).await {
            warn!(user_id = %order.user_id, error = %e, "Failed to invalidate portfolio view");
        }
    }
}

#[async_trait]
impl JobHandler for MatchingWorker {
    async fn handle(&self, job: &Job) -> EngineResult<JobOutcome> {
        match self.process(job).await? {
            Evaluation::PriceRetry => Ok(JobOutcome::Requeue {
                delay: self.config.price_retry_interval(),
            }),
            Evaluation::Claimed => Ok(JobOutcome::Defer {
                delay: self.config.claim_retry_interval(),
            }),
            _ => Ok(JobOutcome::Done),
        }
    }
}
