// The ledger engine - every balance change goes through here.
//
// Rules enforced by this file:
// - balances never go negative; a withdrawal or transfer that would overdraw
//   leaves storage untouched and reports `InsufficientFunds`
// - a transfer is written with one atomic `set_pair`, never two separate writes
// - read-modify-write sequences on an account run under that account's lock,
//   so two concurrent withdrawals can't both spend the same stale balance
// - business outcomes are values; only lookups return `Err`

use super::amount::Amount;
use super::balance_store::{BalanceKey, BalanceStore};
use super::currency_registry::CurrencyRegistry;
use super::economy_models::{
    AccountId, Currency, CurrencyId, EconomyError, FailureReason, OutcomeBuilder,
    TransactionKind, TransactionOutcome,
};
use super::observers::TransactionObserver;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ============================================================================
// ACCOUNT LOCKS
// ============================================================================

/// Table size at which idle entries are first swept.
const PRUNE_FLOOR: usize = 1024;

/// Per-account mutexes that serialize balance updates inside this process.
///
/// Entries for accounts nobody is holding or waiting on are swept whenever
/// the table doubles past its last swept size, so it stays proportional to
/// the number of accounts in use rather than every account ever touched.
#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    prune_at: AtomicUsize,
}

/// Guards held for the duration of a transfer.
pub struct PairGuard {
    _first: OwnedMutexGuard<()>,
    _second: Option<OwnedMutexGuard<()>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, account: &AccountId) -> Arc<Mutex<()>> {
        if self.locks.len() >= self.prune_at.load(Ordering::Relaxed) {
            self.prune();
            let next = (self.locks.len() * 2).max(PRUNE_FLOOR);
            self.prune_at.store(next, Ordering::Relaxed);
        }

        // Clone the Arc out so the map shard isn't held across the await.
        self.locks
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop entries that only the table itself references. A held guard or
    /// a pending `lock` call keeps its own clone of the `Arc`, so those stay.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub async fn lock(&self, account: &AccountId) -> OwnedMutexGuard<()> {
        self.handle(account).lock_owned().await
    }

    /// Lock two accounts in identifier order so opposite transfers can't deadlock.
    /// The same account is only locked once.
    pub async fn lock_pair(&self, a: &AccountId, b: &AccountId) -> PairGuard {
        if a == b {
            return PairGuard {
                _first: self.lock(a).await,
                _second: None,
            };
        }

        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        PairGuard {
            _first: first,
            _second: Some(second),
        }
    }
}

// ============================================================================
// LEDGER
// ============================================================================

/// One currency's balance as seen by `Ledger::balances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEntry {
    pub currency: Arc<Currency>,
    /// `None` when the account has no row for this currency yet.
    pub amount: Option<Amount>,
}

/// What a read-modify-write wants to do with the current balance.
enum Step {
    Write(Amount),
    InsufficientFunds,
    Overflow,
}

pub struct Ledger<S: BalanceStore> {
    store: Arc<S>,
    registry: Arc<CurrencyRegistry>,
    locks: AccountLocks,
    observers: Vec<Arc<dyn TransactionObserver>>,
}

impl<S: BalanceStore> Ledger<S> {
    pub fn new(store: Arc<S>, registry: Arc<CurrencyRegistry>) -> Self {
        Self {
            store,
            registry,
            locks: AccountLocks::new(),
            observers: Vec::new(),
        }
    }

    /// Register an observer that is told about every successful transaction.
    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CurrencyRegistry> {
        &self.registry
    }

    pub(crate) fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Current balance. A missing row is `AccountNotFound`, never zero.
    pub async fn get_balance(
        &self,
        account: &AccountId,
        currency: CurrencyId,
    ) -> Result<Amount, EconomyError> {
        self.read(account, currency)
            .await?
            .ok_or_else(|| EconomyError::account_not_found(account, currency))
    }

    /// Whether a row exists, regardless of its value.
    pub async fn has_balance(
        &self,
        account: &AccountId,
        currency: CurrencyId,
    ) -> Result<bool, EconomyError> {
        Ok(self.read(account, currency).await?.is_some())
    }

    /// One entry per currency in the registry right now.
    pub async fn balances(&self, account: &AccountId) -> Result<Vec<BalanceEntry>, EconomyError> {
        let stored = self.store.get_all(account).await.map_err(|e| {
            tracing::error!(account = %account, error = %e, "Failed to read balances");
            e
        })?;

        Ok(self
            .registry
            .all()
            .into_iter()
            .map(|currency| {
                let amount = stored
                    .iter()
                    .find(|(id, _)| *id == currency.id)
                    .map(|(_, amount)| *amount);
                BalanceEntry { currency, amount }
            })
            .collect())
    }

    async fn read(
        &self,
        account: &AccountId,
        currency: CurrencyId,
    ) -> Result<Option<Amount>, EconomyError> {
        let key = BalanceKey::new(account, currency);
        self.store.get(&key).await.map_err(|e| {
            tracing::error!(
                account = %account,
                currency = %currency,
                error = %e,
                "Failed to read balance"
            );
            e
        })
    }

    // ------------------------------------------------------------------------
    // Single-account operations
    // ------------------------------------------------------------------------

    pub async fn deposit(
        &self,
        account: &AccountId,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        self.modify(TransactionKind::Deposit, account, currency, amount, |current| {
            match current.checked_add(amount) {
                Some(updated) => Step::Write(updated),
                None => Step::Overflow,
            }
        })
        .await
    }

    /// All-or-nothing: an overdraw leaves the stored balance untouched.
    pub async fn withdraw(
        &self,
        account: &AccountId,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        self.modify(TransactionKind::Withdraw, account, currency, amount, |current| {
            match current.checked_sub(amount) {
                Some(updated) => Step::Write(updated),
                None => Step::InsufficientFunds,
            }
        })
        .await
    }

    pub async fn set_balance(
        &self,
        account: &AccountId,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        self.modify(TransactionKind::SetBalance, account, currency, amount, |_| {
            Step::Write(amount)
        })
        .await
    }

    /// Put the balance back to the currency's starting balance.
    pub async fn reset_balance(&self, account: &AccountId, currency: &Currency) -> TransactionOutcome {
        let starting = currency.starting_balance;
        self.modify(TransactionKind::Reset, account, currency, starting, |_| {
            Step::Write(starting)
        })
        .await
    }

    /// Reset every currency in the registry, one outcome per currency.
    pub async fn reset_balances(&self, account: &AccountId) -> Vec<TransactionOutcome> {
        let mut outcomes = Vec::new();
        for currency in self.registry.all() {
            outcomes.push(self.reset_balance(account, &currency).await);
        }
        outcomes
    }

    async fn modify<F>(
        &self,
        kind: TransactionKind,
        account: &AccountId,
        currency: &Currency,
        amount: Amount,
        step: F,
    ) -> TransactionOutcome
    where
        F: FnOnce(Amount) -> Step,
    {
        let outcome = TransactionOutcome::new(kind, account, None, currency.id, amount);

        if self.registry.get_by_id(currency.id).is_none() {
            return self.reject(&outcome, FailureReason::UnknownCurrency);
        }

        let _guard = self.locks.lock(account).await;

        let current = match self.read(account, currency.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return self.reject(&outcome, FailureReason::AccountNotFound),
            Err(e) => return self.reject(&outcome, FailureReason::Storage(e.to_string())),
        };

        let updated = match step(current) {
            Step::Write(updated) => updated,
            Step::InsufficientFunds => {
                tracing::debug!(
                    account = %account,
                    currency = %currency.id,
                    balance = %current,
                    amount = %amount,
                    "Insufficient funds"
                );
                return outcome.insufficient_funds();
            }
            Step::Overflow => return self.reject(&outcome, FailureReason::Overflow),
        };

        let key = BalanceKey::new(account, currency.id);
        if let Err(e) = self.store.set(&key, updated).await {
            tracing::error!(
                operation = ?kind,
                account = %account,
                currency = %currency.id,
                amount = %updated,
                error = %e,
                "Failed to write balance"
            );
            return self.reject(&outcome, FailureReason::Storage(e.to_string()));
        }

        self.complete(outcome.success())
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Move `amount` of `currency` from one account to another as one unit.
    ///
    /// The amount must already be validated and truncated by the caller.
    /// `from == to` is allowed here; policy upstream decides whether to permit it.
    pub async fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        let outcome =
            TransactionOutcome::new(TransactionKind::Transfer, from, Some(to), currency.id, amount);

        if !currency.is_transferable {
            return self.reject(&outcome, FailureReason::NonTransferableCurrency);
        }
        if self.registry.get_by_id(currency.id).is_none() {
            return self.reject(&outcome, FailureReason::UnknownCurrency);
        }

        let _guard = self.locks.lock_pair(from, to).await;

        let from_balance = match self.read(from, currency.id).await {
            Ok(Some(balance)) => balance,
            Ok(None) => return self.reject(&outcome, FailureReason::AccountNotFound),
            Err(e) => return self.reject(&outcome, FailureReason::Storage(e.to_string())),
        };

        let Some(from_new) = from_balance.checked_sub(amount) else {
            tracing::debug!(
                from = %from,
                to = %to,
                currency = %currency.id,
                balance = %from_balance,
                amount = %amount,
                "Transfer rejected: insufficient funds"
            );
            return outcome.insufficient_funds();
        };

        // Moving money to yourself changes nothing once the funds check passes.
        if from == to {
            return self.complete(outcome.success());
        }

        let to_balance = match self.read(to, currency.id).await {
            Ok(Some(balance)) => balance,
            Ok(None) => return self.reject(&outcome, FailureReason::DestinationNotInitialized),
            Err(e) => return self.reject(&outcome, FailureReason::Storage(e.to_string())),
        };

        let Some(to_new) = to_balance.checked_add(amount) else {
            return self.reject(&outcome, FailureReason::Overflow);
        };

        let from_key = BalanceKey::new(from, currency.id);
        let to_key = BalanceKey::new(to, currency.id);
        if let Err(e) = self
            .store
            .set_pair(&from_key, from_new, &to_key, to_new)
            .await
        {
            tracing::error!(
                from = %from,
                from_amount = %from_new,
                to = %to,
                to_amount = %to_new,
                currency = %currency.id,
                error = %e,
                "Transfer write failed, nothing applied"
            );
            return self.reject(&outcome, FailureReason::Storage(e.to_string()));
        }

        self.complete(outcome.success())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn reject(&self, outcome: &OutcomeBuilder, reason: FailureReason) -> TransactionOutcome {
        let failed = outcome.failed(reason);
        tracing::debug!(
            account = %failed.account,
            currency = %failed.currency,
            kind = ?failed.kind,
            reason = ?failed.failure,
            "Transaction failed"
        );
        failed
    }

    /// Tell observers about a committed transaction and hand it back.
    ///
    /// The write is already durable here, so a panicking observer is logged
    /// and skipped; the caller still gets its outcome.
    fn complete(&self, outcome: TransactionOutcome) -> TransactionOutcome {
        for observer in &self.observers {
            let notified = catch_unwind(AssertUnwindSafe(|| observer.on_transaction(&outcome)));
            if notified.is_err() {
                tracing::warn!(
                    account = %outcome.account,
                    kind = ?outcome.kind,
                    "Transaction observer panicked, notification skipped"
                );
            }
        }
        outcome
    }
}
