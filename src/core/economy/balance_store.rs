// Storage ports for the economy.
//
// The core says WHAT it needs from storage; `infra::economy` decides HOW.
// SQLite backs the bot, the in-memory store backs the tests.

use super::amount::Amount;
use super::economy_models::{AccountId, AccountRecord, Currency, CurrencyId, EconomyError};
use async_trait::async_trait;

/// One (account, currency) cell of the balance table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BalanceKey {
    pub account: AccountId,
    pub currency: CurrencyId,
}

impl BalanceKey {
    pub fn new(account: &AccountId, currency: CurrencyId) -> Self {
        Self {
            account: account.clone(),
            currency,
        }
    }
}

/// Source of persisted currency definitions, read by the registry.
#[async_trait]
pub trait CurrencyStore: Send + Sync {
    /// Every currency row, in any order.
    async fn load_currencies(&self) -> Result<Vec<Currency>, EconomyError>;
}

/// Persisted balances and the user rows they hang off.
///
/// No business rules live here: the ledger checks non-negativity before it
/// calls `set`/`set_pair`.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Returns `Ok(None)` when there is no row, which is not the same as zero.
    async fn get(&self, key: &BalanceKey) -> Result<Option<Amount>, EconomyError>;

    /// All balance rows for one account.
    async fn get_all(&self, account: &AccountId) -> Result<Vec<(CurrencyId, Amount)>, EconomyError>;

    /// Overwrite an existing row. Fails with `Storage` if the row is missing.
    async fn set(&self, key: &BalanceKey, amount: Amount) -> Result<(), EconomyError>;

    /// Overwrite two rows atomically: both writes land or neither does.
    async fn set_pair(
        &self,
        from: &BalanceKey,
        from_amount: Amount,
        to: &BalanceKey,
        to_amount: Amount,
    ) -> Result<(), EconomyError>;

    /// Insert the user row plus one balance row per entry in `balances`, as a
    /// single unit. Rows that already exist are left alone, so a second
    /// concurrent creator just ends up re-reading the first one's rows.
    async fn create_account(
        &self,
        account: &AccountRecord,
        balances: &[(CurrencyId, Amount)],
    ) -> Result<(), EconomyError>;

    async fn get_account(&self, account: &AccountId) -> Result<Option<AccountRecord>, EconomyError>;

    async fn set_display_name(
        &self,
        account: &AccountId,
        display_name: &str,
    ) -> Result<(), EconomyError>;
}
