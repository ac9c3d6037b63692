// Account - a per-identity view over the ledger.
//
// An `Account` is cheap to clone and carries no balances itself: every call
// goes to storage through the shared `Ledger`, so two handles for the same
// identity always agree.

use super::amount::Amount;
use super::balance_store::BalanceStore;
use super::economy_models::{AccountId, AccountKind, Currency, EconomyError, TransactionOutcome};
use super::ledger::{BalanceEntry, Ledger};
use std::sync::Arc;

pub struct Account<S: BalanceStore> {
    ledger: Arc<Ledger<S>>,
    kind: AccountKind,
    id: AccountId,
    display_name: String,
}

impl<S: BalanceStore> Clone for Account<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            kind: self.kind.clone(),
            id: self.id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

impl<S: BalanceStore> std::fmt::Debug for Account<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl<S: BalanceStore> Account<S> {
    pub(crate) fn new(ledger: Arc<Ledger<S>>, kind: AccountKind, display_name: String) -> Self {
        let id = kind.id();
        Self {
            ledger,
            kind,
            id,
            display_name,
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn kind(&self) -> &AccountKind {
        &self.kind
    }

    pub fn is_virtual(&self) -> bool {
        self.kind.is_virtual()
    }

    /// The stored display name. For players this is whatever name the player
    /// had when the account was created or last refreshed by the caller.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The balance a reset puts this account back to.
    pub fn default_balance(&self, currency: &Currency) -> Amount {
        currency.starting_balance
    }

    pub async fn get_balance(&self, currency: &Currency) -> Result<Amount, EconomyError> {
        self.ledger.get_balance(&self.id, currency.id).await
    }

    pub async fn has_balance(&self, currency: &Currency) -> Result<bool, EconomyError> {
        self.ledger.has_balance(&self.id, currency.id).await
    }

    pub async fn get_balances(&self) -> Result<Vec<BalanceEntry>, EconomyError> {
        self.ledger.balances(&self.id).await
    }

    pub async fn set_balance(&self, currency: &Currency, amount: Amount) -> TransactionOutcome {
        self.ledger.set_balance(&self.id, currency, amount).await
    }

    pub async fn deposit(&self, currency: &Currency, amount: Amount) -> TransactionOutcome {
        self.ledger.deposit(&self.id, currency, amount).await
    }

    pub async fn withdraw(&self, currency: &Currency, amount: Amount) -> TransactionOutcome {
        self.ledger.withdraw(&self.id, currency, amount).await
    }

    pub async fn reset_balance(&self, currency: &Currency) -> TransactionOutcome {
        self.ledger.reset_balance(&self.id, currency).await
    }

    pub async fn reset_balances(&self) -> Vec<TransactionOutcome> {
        self.ledger.reset_balances(&self.id).await
    }

    pub async fn transfer(
        &self,
        to: &Account<S>,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        self.ledger
            .transfer(&self.id, &to.id, currency, amount)
            .await
    }

    /// Rename a virtual account. Player accounts are named after the player
    /// and reject direct renames.
    pub async fn set_display_name(&mut self, name: &str) -> Result<(), EconomyError> {
        if !self.is_virtual() {
            return Err(EconomyError::RenameNotAllowed);
        }

        let name = name.trim();
        self.ledger
            .store()
            .set_display_name(&self.id, name)
            .await
            .map_err(|e| {
                tracing::error!(account = %self.id, error = %e, "Failed to rename account");
                e
            })?;
        self.display_name = name.to_string();
        Ok(())
    }
}
