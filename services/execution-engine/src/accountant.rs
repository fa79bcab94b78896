//! Reservation accountant
//!
//! Pure balance transitions on a [`UserAccount`]. Each function either
//! applies its change completely or returns an error and leaves the account
//! untouched. Callers commit the result in the same ledger transaction as the
//! order write it belongs to.
//!
//! Invariant maintained together with the ledger: `reserved` equals the sum
//! of `target × quantity` over the user's OPEN BUY orders.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use tracing::debug;
use types::account::{Holding, UserAccount};
use types::errors::{EngineError, EngineResult};
use types::ids::InstrumentId;
use types::numeric::{Price, Quantity};

/// Move `price × qty` from available to reserved.
pub fn reserve_for_buy(account: &mut UserAccount, price: Price, qty: Quantity) -> EngineResult<()> {
    let amount = price.notional(qty)?;
    if account.available < amount {
        return Err(insufficient(amount, account.available));
    }
    account.available -= amount;
    account.reserved += amount;
    Ok(())
}

/// Settle an executed BUY.
///
/// Releases the reservation made at `reserved_price`, refunds the price
/// improvement to available, and adds `qty` to the holding at a weighted
/// average cost.
pub fn release_and_settle_buy(
    account: &mut UserAccount,
    instrument: &InstrumentId,
    reserved_price: Price,
    qty: Quantity,
    executed_price: Price,
) -> EngineResult<()> {
    if executed_price > reserved_price {
        return Err(EngineError::InvalidState(format!(
            "BUY executed at {} above reserved price {}",
            executed_price, reserved_price
        )));
    }
    let reserved = reserved_price.notional(qty)?;
    if account.reserved < reserved {
        return Err(EngineError::InvalidState(format!(
            "reserved balance {} does not cover settlement of {}",
            account.reserved, reserved
        )));
    }
    let cost = executed_price.notional(qty)?;

    let (old_qty, old_avg) = account
        .holding(instrument)
        .map_or((0, Decimal::ZERO), |h| (h.quantity, h.average_cost));
    let new_qty = old_qty
        .checked_add(qty.get())
        .ok_or_else(|| out_of_range("holding quantity"))?;
    let average_cost = Decimal::from(old_qty)
        .checked_mul(old_avg)
        .and_then(|basis| basis.checked_add(cost))
        .and_then(|basis| basis.checked_div(Decimal::from(new_qty)))
        .ok_or_else(|| out_of_range("holding cost basis"))?;

    // Nothing above touched the account
    account.reserved -= reserved;
    account.available += reserved - cost;
    account.holdings.insert(
        instrument.clone(),
        Holding {
            quantity: new_qty,
            average_cost,
        },
    );
    Ok(())
}

/// Settle an executed SELL: credit proceeds, reduce the holding.
pub fn settle_sell(
    account: &mut UserAccount,
    instrument: &InstrumentId,
    qty: Quantity,
    executed_price: Price,
) -> EngineResult<()> {
    check_holdings(account, instrument, qty)?;
    let proceeds = executed_price.notional(qty)?;
    credit(account, proceeds)?;

    let remaining = account.held_quantity(instrument) - qty.get();
    if remaining == 0 {
        account.holdings.remove(instrument);
    } else if let Some(holding) = account.holdings.get_mut(instrument) {
        holding.quantity = remaining;
    }
    Ok(())
}

/// Undo a BUY reservation (cancel or failure).
pub fn reverse_buy_reservation(
    account: &mut UserAccount,
    price: Price,
    qty: Quantity,
) -> EngineResult<()> {
    let amount = price.notional(qty)?;
    if account.reserved < amount {
        return Err(EngineError::InvalidState(format!(
            "cannot release {} from reserved balance {}",
            amount, account.reserved
        )));
    }
    account.reserved -= amount;
    account.available += amount;
    Ok(())
}

/// Re-size a BUY reservation from `old_amount` to `new_amount`.
pub fn adjust_buy_reservation(
    account: &mut UserAccount,
    old_amount: Decimal,
    new_amount: Decimal,
) -> EngineResult<()> {
    let delta = new_amount - old_amount;
    if delta > account.available {
        return Err(insufficient(delta, account.available));
    }
    if -delta > account.reserved {
        return Err(EngineError::InvalidState(format!(
            "cannot release {} from reserved balance {}",
            -delta, account.reserved
        )));
    }
    account.available -= delta;
    account.reserved += delta;
    Ok(())
}

/// Add `amount` to available cash.
///
/// Fails, leaving the account untouched, when the new total cash
/// (`available + reserved`) would not fit in a `Decimal`.
pub fn credit(account: &mut UserAccount, amount: Decimal) -> EngineResult<()> {
    let available = account
        .available
        .checked_add(amount)
        .filter(|available| available.checked_add(account.reserved).is_some())
        .ok_or_else(|| out_of_range("cash balance"))?;
    account.available = available;
    Ok(())
}

/// SELL admission check.
pub fn check_holdings(
    account: &UserAccount,
    instrument: &InstrumentId,
    qty: Quantity,
) -> EngineResult<()> {
    let held = account.held_quantity(instrument);
    if held < qty.get() {
        return Err(EngineError::InsufficientHoldings {
            instrument: instrument.to_string(),
            required: qty.get(),
            held,
        });
    }
    Ok(())
}

fn out_of_range(what: &str) -> EngineError {
    EngineError::Validation(format!("{} would exceed the representable range", what))
}

fn insufficient(required: Decimal, available: Decimal) -> EngineError {
    EngineError::InsufficientFunds {
        required: required.to_string(),
        available: available.to_string(),
    }
}

/// Upper bound of the random pause between conflict retries.
const CONFLICT_JITTER_CAP: Duration = Duration::from_millis(20);

/// Run a read-validate-commit operation, retrying on version conflicts.
///
/// `op` must re-read everything it writes on each call. Retries are spaced
/// by a random pause that grows with the attempt number, so writers that
/// collided once do not collide again in lockstep. Non-conflict errors and
/// the final conflict are returned as-is.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(EngineError::Conflict {
                entity,
                expected,
                found,
            }) if attempt < max_attempts => {
                let pause = conflict_jitter(attempt);
                debug!(
                    attempt,
                    %entity,
                    expected,
                    found,
                    pause_us = pause.as_micros() as u64,
                    "Version conflict, retrying"
                );
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn conflict_jitter(attempt: u32) -> Duration {
    let ceiling = Duration::from_micros(250u64 << attempt.min(10)).min(CONFLICT_JITTER_CAP);
    let micros = rand::thread_rng().gen_range(0..=ceiling.as_micros() as u64);
    Duration::from_micros(micros)
}
