//! Order ledger: durable order and account records
//!
//! All writes go through [`LedgerTx`]. A transaction is a list of
//! version-conditioned writes that are validated together and applied
//! together: either every write lands or none does. Each applied write bumps
//! the record's `version` by one.
//!
//! [`InMemoryLedger`] keeps the records in memory and, when opened with a
//! journal, appends every committed transaction to it before applying it.
//! Reopening replays the journal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use persistence::{JournalConfig, JournalReader, JournalWriter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use types::account::UserAccount;
use types::errors::{EngineError, EngineResult};
use types::ids::{InstrumentId, OrderId, UserId};
use types::numeric::Price;
use types::order::Order;

use crate::config::JournalSettings;

const LEDGER_TX_RECORD: &str = "ledger_tx";

/// One version-conditioned write.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerWrite {
    /// Insert a new order. Fails with `Conflict` if the id exists.
    CreateOrder(Order),
    /// Replace an order whose stored version equals `order.version`.
    UpdateOrder(Order),
    DeleteOrder { order_id: OrderId, expected_version: u64 },
    CreateAccount(UserAccount),
    /// Replace an account whose stored version equals `account.version`.
    UpdateAccount(UserAccount),
}

/// An atomic batch of ledger writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerTx {
    writes: Vec<LedgerWrite>,
}

impl LedgerTx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_order(mut self, order: Order) -> Self {
        self.writes.push(LedgerWrite::CreateOrder(order));
        self
    }

    /// `order` carries the version it was read at.
    pub fn update_order(mut self, order: Order) -> Self {
        self.writes.push(LedgerWrite::UpdateOrder(order));
        self
    }

    pub fn delete_order(mut self, order: &Order) -> Self {
        self.writes.push(LedgerWrite::DeleteOrder {
            order_id: order.order_id,
            expected_version: order.version,
        });
        self
    }

    pub fn create_account(mut self, account: UserAccount) -> Self {
        self.writes.push(LedgerWrite::CreateAccount(account));
        self
    }

    /// `account` carries the version it was read at.
    pub fn update_account(mut self, account: UserAccount) -> Self {
        self.writes.push(LedgerWrite::UpdateAccount(account));
        self
    }

    pub fn writes(&self) -> &[LedgerWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[async_trait]
pub trait OrderLedger: Send + Sync {
    async fn find_order(&self, order_id: &OrderId) -> EngineResult<Option<Order>>;

    async fn find_account(&self, user_id: &UserId) -> EngineResult<Option<UserAccount>>;

    /// OPEN orders on `instrument` whose trigger rule is satisfied at `price`.
    async fn find_open_by_instrument_crossing(
        &self,
        instrument: &InstrumentId,
        price: Price,
    ) -> EngineResult<Vec<Order>>;

    /// Every OPEN order, oldest first.
    async fn open_orders(&self) -> EngineResult<Vec<Order>>;

    /// All orders owned by `user_id`, oldest first.
    async fn orders_for_user(&self, user_id: &UserId) -> EngineResult<Vec<Order>>;

    /// Apply `tx` atomically. Any version mismatch fails the whole
    /// transaction with `Conflict`; a missing record fails it with `NotFound`.
    async fn commit(&self, tx: LedgerTx) -> EngineResult<()>;

    /// Single-order update, conditioned on `order.version`.
    async fn save(&self, order: Order) -> EngineResult<()> {
        self.commit(LedgerTx::new().update_order(order)).await
    }

    /// Single-order delete, conditioned on `order.version`.
    async fn delete(&self, order: &Order) -> EngineResult<()> {
        self.commit(LedgerTx::new().delete_order(order)).await
    }

    /// Push committed writes to stable storage, where there is any.
    async fn flush(&self) -> EngineResult<()> {
        Ok(())
    }
}

// ── Journal records ─────────────────────────────────────────────────

/// A write as applied, with final versions. This is what the journal holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum AppliedWrite {
    PutOrder(Order),
    RemoveOrder(OrderId),
    PutAccount(UserAccount),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TxRecord {
    committed_at: i64,
    writes: Vec<AppliedWrite>,
}

// ── In-memory ledger ────────────────────────────────────────────────

#[derive(Default)]
struct LedgerState {
    orders: HashMap<OrderId, Order>,
    accounts: HashMap<UserId, UserAccount>,
    /// OPEN order ids per instrument
    open_by_instrument: HashMap<InstrumentId, BTreeSet<OrderId>>,
}

impl LedgerState {
    fn apply(&mut self, write: AppliedWrite) {
        match write {
            AppliedWrite::PutOrder(order) => {
                self.unindex(&order.order_id);
                if order.is_open() {
                    self.open_by_instrument
                        .entry(order.instrument.clone())
                        .or_default()
                        .insert(order.order_id);
                }
                self.orders.insert(order.order_id, order);
            }
            AppliedWrite::RemoveOrder(order_id) => {
                self.unindex(&order_id);
                self.orders.remove(&order_id);
            }
            AppliedWrite::PutAccount(account) => {
                self.accounts.insert(account.user_id, account);
            }
        }
    }

    fn unindex(&mut self, order_id: &OrderId) {
        if let Some(existing) = self.orders.get(order_id) {
            if let Some(ids) = self.open_by_instrument.get_mut(&existing.instrument) {
                ids.remove(order_id);
                if ids.is_empty() {
                    self.open_by_instrument.remove(&existing.instrument);
                }
            }
        }
    }

    /// Check every precondition and produce the writes to apply.
    fn prepare(&self, tx: LedgerTx) -> EngineResult<Vec<AppliedWrite>> {
        let mut touched_orders = HashSet::new();
        let mut touched_accounts = HashSet::new();
        let mut applied = Vec::with_capacity(tx.writes.len());

        for write in tx.writes {
            match write {
                LedgerWrite::CreateOrder(order) => {
                    Self::touch(&mut touched_orders, order.order_id)?;
                    if let Some(existing) = self.orders.get(&order.order_id) {
                        return Err(EngineError::Conflict {
                            entity: format!("order {}", order.order_id),
                            expected: 0,
                            found: existing.version,
                        });
                    }
                    applied.push(AppliedWrite::PutOrder(order));
                }
                LedgerWrite::UpdateOrder(mut order) => {
                    Self::touch(&mut touched_orders, order.order_id)?;
                    let stored = self
                        .orders
                        .get(&order.order_id)
                        .ok_or_else(|| EngineError::NotFound(format!("order {}", order.order_id)))?;
                    Self::check_version(format!("order {}", order.order_id), order.version, stored.version)?;
                    order.version += 1;
                    applied.push(AppliedWrite::PutOrder(order));
                }
                LedgerWrite::DeleteOrder {
                    order_id,
                    expected_version,
                } => {
                    Self::touch(&mut touched_orders, order_id)?;
                    let stored = self
                        .orders
                        .get(&order_id)
                        .ok_or_else(|| EngineError::NotFound(format!("order {}", order_id)))?;
                    Self::check_version(format!("order {}", order_id), expected_version, stored.version)?;
                    applied.push(AppliedWrite::RemoveOrder(order_id));
                }
                LedgerWrite::CreateAccount(account) => {
                    Self::touch(&mut touched_accounts, account.user_id)?;
                    if let Some(existing) = self.accounts.get(&account.user_id) {
                        return Err(EngineError::Conflict {
                            entity: format!("account {}", account.user_id),
                            expected: 0,
                            found: existing.version,
                        });
                    }
                    Self::check_account(&account)?;
                    applied.push(AppliedWrite::PutAccount(account));
                }
                LedgerWrite::UpdateAccount(mut account) => {
                    Self::touch(&mut touched_accounts, account.user_id)?;
                    let stored = self.accounts.get(&account.user_id).ok_or_else(|| {
                        EngineError::NotFound(format!("account {}", account.user_id))
                    })?;
                    Self::check_version(
                        format!("account {}", account.user_id),
                        account.version,
                        stored.version,
                    )?;
                    Self::check_account(&account)?;
                    account.version += 1;
                    applied.push(AppliedWrite::PutAccount(account));
                }
            }
        }
        Ok(applied)
    }

    fn touch<T: std::hash::Hash + Eq + std::fmt::Display>(
        seen: &mut HashSet<T>,
        id: T,
    ) -> EngineResult<()> {
        let label = id.to_string();
        if !seen.insert(id) {
            return Err(EngineError::Validation(format!(
                "transaction writes {} more than once",
                label
            )));
        }
        Ok(())
    }

    fn check_version(entity: String, expected: u64, found: u64) -> EngineResult<()> {
        if expected != found {
            return Err(EngineError::Conflict {
                entity,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn check_account(account: &UserAccount) -> EngineResult<()> {
        if !account.check_invariant() {
            return Err(EngineError::InvalidState(format!(
                "account {} would go negative (available {}, reserved {})",
                account.user_id, account.available, account.reserved
            )));
        }
        Ok(())
    }
}

struct Inner {
    state: LedgerState,
    journal: Option<JournalWriter>,
}

/// In-memory ledger, optionally journaled to disk.
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// A ledger without durability.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LedgerState::default(),
                journal: None,
            }),
        }
    }

    /// Open a journaled ledger in `dir`, replaying whatever is already there.
    pub fn open(dir: &Path) -> EngineResult<Self> {
        Self::open_with(&JournalSettings {
            dir: Some(dir.to_path_buf()),
            ..JournalSettings::default()
        })
    }

    /// Open from settings; without a directory this is [`InMemoryLedger::new`].
    pub fn open_with(settings: &JournalSettings) -> EngineResult<Self> {
        let Some(dir) = settings.dir.as_deref() else {
            return Ok(Self::new());
        };

        let mut state = LedgerState::default();
        let mut reader = JournalReader::open(dir)
            .map_err(|e| EngineError::TransientInfra(format!("open journal {}: {}", dir.display(), e)))?;
        let (records, corruption) = reader.replay::<TxRecord>(LEDGER_TX_RECORD);
        for record in corruption.iter() {
            warn!(
                file = %record.file.display(),
                offset = record.byte_offset,
                detail = %record.detail,
                "Skipped damaged journal entry"
            );
        }

        let replayed = records.len();
        for (_, record) in records {
            for write in record.writes {
                state.apply(write);
            }
        }

        let journal = JournalWriter::open(JournalConfig {
            dir: dir.to_path_buf(),
            max_file_size: settings.max_file_size_bytes,
            fsync_every_write: settings.fsync,
        })
        .map_err(|e| EngineError::TransientInfra(format!("open journal writer: {}", e)))?;

        info!(
            dir = %dir.display(),
            replayed,
            orders = state.orders.len(),
            accounts = state.accounts.len(),
            "Ledger recovered from journal"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                journal: Some(journal),
            }),
        })
    }

    /// Flush the journal to stable storage.
    pub fn sync(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if let Some(journal) = inner.journal.as_mut() {
            journal
                .sync()
                .map_err(|e| EngineError::TransientInfra(format!("journal sync: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for InMemoryLedger {
    async fn find_order(&self, order_id: &OrderId) -> EngineResult<Option<Order>> {
        Ok(self.inner.lock().state.orders.get(order_id).cloned())
    }

    async fn find_account(&self, user_id: &UserId) -> EngineResult<Option<UserAccount>> {
        Ok(self.inner.lock().state.accounts.get(user_id).cloned())
    }

    async fn find_open_by_instrument_crossing(
        &self,
        instrument: &InstrumentId,
        price: Price,
    ) -> EngineResult<Vec<Order>> {
        let inner = self.inner.lock();
        let state = &inner.state;
        let Some(ids) = state.open_by_instrument.get(instrument) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|order| order.is_open() && order.is_triggered_at(price))
            .cloned()
            .collect())
    }

    async fn open_orders(&self) -> EngineResult<Vec<Order>> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .state
            .orders
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.order_id));
        Ok(orders)
    }

    async fn orders_for_user(&self, user_id: &UserId) -> EngineResult<Vec<Order>> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .state
            .orders
            .values()
            .filter(|o| &o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.order_id));
        Ok(orders)
    }

    async fn commit(&self, tx: LedgerTx) -> EngineResult<()> {
        if tx.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let writes = inner.state.prepare(tx)?;

        if let Some(journal) = inner.journal.as_mut() {
            let record = TxRecord {
                committed_at: types::unix_nanos(),
                writes: writes.clone(),
            };
            let entry = journal
                .append_record(record.committed_at, LEDGER_TX_RECORD, &record)
                .map_err(|e| EngineError::TransientInfra(format!("journal append: {}", e)))?;
            debug!(sequence = entry.sequence, writes = writes.len(), "Ledger tx journaled");
        }

        for write in writes {
            inner.state.apply(write);
        }
        Ok(())
    }

    async fn flush(&self) -> EngineResult<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;
    use types::numeric::Quantity;
    use types::order::{OrderKind, Side};

    fn buy(user: UserId, target: u64) -> Order {
        Order::new(
            user,
            InstrumentId::new("RELIANCE"),
            Side::BUY,
            Quantity::new(10),
            OrderKind::LIMIT,
            Price::from_u64(target),
            1708123456789000000,
        )
    }

    #[tokio::test]
    async fn test_create_and_update_bumps_version() {
        let ledger = InMemoryLedger::new();
        let order = buy(UserId::new(), 100);
        ledger.commit(LedgerTx::new().create_order(order.clone())).await.unwrap();

        let mut stored = ledger.find_order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
        stored.close(Price::from_u64(95), 1).unwrap();
        ledger.save(stored).await.unwrap();

        let closed = ledger.find_order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(closed.version, 1);
        assert!(!closed.is_open());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_and_applies_nothing() {
        let ledger = InMemoryLedger::new();
        let user = UserId::new();
        let account = UserAccount::new(user, Decimal::from(10_000), 0);
        let order = buy(user, 100);
        ledger
            .commit(LedgerTx::new().create_account(account.clone()).create_order(order.clone()))
            .await
            .unwrap();

        // First writer wins
        let mut first = order.clone();
        first.fail(1).unwrap();
        ledger.save(first).await.unwrap();

        // Second writer read version 0 as well
        let mut second = order.clone();
        second.close(Price::from_u64(90), 2).unwrap();
        let mut richer = account.clone();
        richer.available = Decimal::from(1);
        let err = ledger
            .commit(LedgerTx::new().update_account(richer).update_order(second))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        // The account write in the same transaction did not land
        let stored = ledger.find_account(&user).await.unwrap().unwrap();
        assert_eq!(stored.available, Decimal::from(10_000));
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_update_of_deleted_order_is_not_found() {
        let ledger = InMemoryLedger::new();
        let order = buy(UserId::new(), 100);
        ledger.commit(LedgerTx::new().create_order(order.clone())).await.unwrap();
        ledger.delete(&order).await.unwrap();

        let err = ledger.save(order).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_negative_account() {
        let ledger = InMemoryLedger::new();
        let mut account = UserAccount::new(UserId::new(), Decimal::from(5), 0);
        ledger.commit(LedgerTx::new().create_account(account.clone())).await.unwrap();

        account.available = Decimal::from(-1);
        let err = ledger.commit(LedgerTx::new().update_account(account)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_crossing_query_uses_trigger_rule() {
        let ledger = InMemoryLedger::new();
        let user = UserId::new();
        let low = buy(user, 90);
        let high = buy(user, 110);
        let mut sell = buy(user, 100);
        sell.side = Side::SELL;
        ledger
            .commit(
                LedgerTx::new()
                    .create_order(low.clone())
                    .create_order(high.clone())
                    .create_order(sell.clone()),
            )
            .await
            .unwrap();

        let instrument = InstrumentId::new("RELIANCE");
        let crossing = ledger
            .find_open_by_instrument_crossing(&instrument, Price::from_u64(100))
            .await
            .unwrap();
        let ids: HashSet<OrderId> = crossing.iter().map(|o| o.order_id).collect();
        assert_eq!(ids, [high.order_id, sell.order_id].into_iter().collect());

        let other = ledger
            .find_open_by_instrument_crossing(&InstrumentId::new("TCS"), Price::from_u64(100))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_journal_replay_restores_state() {
        let tmp = TempDir::new().unwrap();
        let user = UserId::new();
        let order = buy(user, 100);
        {
            let ledger = InMemoryLedger::open(tmp.path()).unwrap();
            ledger
                .commit(
                    LedgerTx::new()
                        .create_account(UserAccount::new(user, Decimal::from(10_000), 0))
                        .create_order(order.clone()),
                )
                .await
                .unwrap();
            let mut closed = order.clone();
            closed.close(Price::from_u64(95), 5).unwrap();
            ledger.save(closed).await.unwrap();
        }

        let reopened = InMemoryLedger::open(tmp.path()).unwrap();
        let stored = reopened.find_order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.executed_price, Some(Price::from_u64(95)));
        assert!(reopened.open_orders().await.unwrap().is_empty());
        assert!(reopened.find_account(&user).await.unwrap().is_some());
    }
}
