// Economy module - the multi-currency ledger

mod account;
mod amount;
mod balance_store;
mod currency_registry;
mod economy_models;
mod economy_service;
mod ledger;
mod observers;

pub use account::Account;
pub use amount::{Amount, AMOUNT_SCALE};
pub use balance_store::{BalanceKey, BalanceStore, CurrencyStore};
pub use currency_registry::{CurrencyRegistry, CurrencySnapshot};
pub use economy_models::{
    AccountId, AccountKind, AccountRecord, Currency, CurrencyId, EconomyError, FailureReason,
    ResultKind, TransactionKind, TransactionOutcome,
};
pub use economy_service::{BackfillPolicy, EconomyConfig, EconomyService, NewAccountBalances};
pub use ledger::{AccountLocks, BalanceEntry, Ledger, PairGuard};
pub use observers::{ChannelObserver, LogObserver, TransactionObserver};
