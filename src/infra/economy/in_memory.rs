// In-memory implementation of the economy store traits.
//
// Used by the tests so the ledger logic can be exercised without a database.
// It also counts reads/writes and can be told to fail writes, which is how
// the tests prove that a failed transfer leaves nothing behind.

use crate::core::economy::{
    AccountId, AccountRecord, Amount, BalanceKey, BalanceStore, Currency, CurrencyId,
    CurrencyStore, EconomyError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct InMemoryEconomyStore {
    currencies: Mutex<Vec<Currency>>,
    users: DashMap<AccountId, String>,
    balances: DashMap<BalanceKey, Amount>,
    /// Serializes multi-row writes so they apply as one unit.
    write_gate: Mutex<()>,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for InMemoryEconomyStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl InMemoryEconomyStore {
    pub fn new(currencies: Vec<Currency>) -> Self {
        Self {
            currencies: Mutex::new(currencies),
            users: DashMap::new(),
            balances: DashMap::new(),
            write_gate: Mutex::new(()),
            fail_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Dollar (id 1, default), Euro (id 2) and Gems (id 3, not transferable,
    /// starting balance 5).
    pub fn with_standard_currencies() -> Self {
        let currency = |id: i64, singular: &str, plural: &str, symbol: &str| Currency {
            id: CurrencyId(id),
            name_singular: singular.to_string(),
            name_plural: plural.to_string(),
            symbol: symbol.to_string(),
            is_default: id == 1,
            is_transferable: id != 3,
            starting_balance: Amount::ZERO,
        };

        let mut gems = currency(3, "Gem", "Gems", "♦");
        gems.starting_balance = Amount::from_minor_units(500).unwrap_or(Amount::ZERO);

        Self::new(vec![
            currency(1, "Dollar", "Dollars", "$"),
            currency(2, "Euro", "Euros", "€"),
            gems,
        ])
    }

    pub fn add_currency(&self, currency: Currency) {
        self.currencies.lock().push(currency);
    }

    /// Write a balance row directly, bypassing the counters.
    pub fn seed_balance(&self, account: &AccountId, currency: CurrencyId, amount: Amount) {
        self.users
            .entry(account.clone())
            .or_insert_with(|| account.to_string());
        self.balances
            .insert(BalanceKey::new(account, currency), amount);
    }

    /// Make every subsequent write fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn balance_row_count(&self, account: &AccountId) -> usize {
        self.balances
            .iter()
            .filter(|entry| &entry.key().account == account)
            .count()
    }

    fn check_writable(&self) -> Result<(), EconomyError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EconomyError::Storage("injected write failure".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CurrencyStore for InMemoryEconomyStore {
    async fn load_currencies(&self) -> Result<Vec<Currency>, EconomyError> {
        Ok(self.currencies.lock().clone())
    }
}

#[async_trait]
impl BalanceStore for InMemoryEconomyStore {
    async fn get(&self, key: &BalanceKey) -> Result<Option<Amount>, EconomyError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.balances.get(key).map(|amount| *amount))
    }

    async fn get_all(&self, account: &AccountId) -> Result<Vec<(CurrencyId, Amount)>, EconomyError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut rows: Vec<_> = self
            .balances
            .iter()
            .filter(|entry| &entry.key().account == account)
            .map(|entry| (entry.key().currency, *entry.value()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        Ok(rows)
    }

    async fn set(&self, key: &BalanceKey, amount: Amount) -> Result<(), EconomyError> {
        let _gate = self.write_gate.lock();
        self.check_writable()?;

        match self.balances.get_mut(key) {
            Some(mut row) => {
                *row = amount;
                Ok(())
            }
            None => Err(EconomyError::Storage(format!(
                "no balance row for {} / {}",
                key.account, key.currency
            ))),
        }
    }

    async fn set_pair(
        &self,
        from: &BalanceKey,
        from_amount: Amount,
        to: &BalanceKey,
        to_amount: Amount,
    ) -> Result<(), EconomyError> {
        let _gate = self.write_gate.lock();
        self.check_writable()?;

        // Check both rows before touching either.
        if !self.balances.contains_key(from) || !self.balances.contains_key(to) {
            return Err(EconomyError::Storage(
                "transfer touched a missing balance row".to_string(),
            ));
        }

        self.balances.insert(from.clone(), from_amount);
        self.balances.insert(to.clone(), to_amount);
        Ok(())
    }

    async fn create_account(
        &self,
        account: &AccountRecord,
        balances: &[(CurrencyId, Amount)],
    ) -> Result<(), EconomyError> {
        let _gate = self.write_gate.lock();
        self.check_writable()?;

        self.users
            .entry(account.id.clone())
            .or_insert_with(|| account.display_name.clone());
        for (currency, amount) in balances {
            self.balances
                .entry(BalanceKey::new(&account.id, *currency))
                .or_insert(*amount);
        }
        Ok(())
    }

    async fn get_account(&self, account: &AccountId) -> Result<Option<AccountRecord>, EconomyError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.users.get(account).map(|name| AccountRecord {
            id: account.clone(),
            display_name: name.clone(),
        }))
    }

    async fn set_display_name(
        &self,
        account: &AccountId,
        display_name: &str,
    ) -> Result<(), EconomyError> {
        let _gate = self.write_gate.lock();
        self.check_writable()?;

        match self.users.get_mut(account) {
            Some(mut name) => {
                *name = display_name.to_string();
                Ok(())
            }
            None => Err(EconomyError::Storage(format!("no user row for {}", account))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(account: &str, currency: i64) -> BalanceKey {
        BalanceKey::new(&AccountId::from(account.to_string()), CurrencyId(currency))
    }

    #[tokio::test]
    async fn test_missing_row_is_none_not_zero() {
        let store = InMemoryEconomyStore::with_standard_currencies();
        store.seed_balance(&AccountId::from("a".to_string()), CurrencyId(1), Amount::ZERO);

        assert_eq!(store.get(&key("a", 1)).await.unwrap(), Some(Amount::ZERO));
        assert_eq!(store.get(&key("a", 2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_pair_with_missing_row_writes_nothing() {
        let store = InMemoryEconomyStore::with_standard_currencies();
        let ten = Amount::parse("10").unwrap();
        store.seed_balance(&AccountId::from("a".to_string()), CurrencyId(1), ten);

        let result = store
            .set_pair(&key("a", 1), Amount::ZERO, &key("b", 1), ten)
            .await;

        assert!(result.is_err());
        assert_eq!(store.get(&key("a", 1)).await.unwrap(), Some(ten));
    }

    #[tokio::test]
    async fn test_create_account_keeps_existing_rows() {
        let store = InMemoryEconomyStore::with_standard_currencies();
        let id = AccountId::from("a".to_string());
        let five = Amount::parse("5").unwrap();
        store.seed_balance(&id, CurrencyId(1), five);

        let record = AccountRecord {
            id: id.clone(),
            display_name: "A".to_string(),
        };
        store
            .create_account(&record, &[(CurrencyId(1), Amount::ZERO), (CurrencyId(2), Amount::ZERO)])
            .await
            .unwrap();

        assert_eq!(store.get(&key("a", 1)).await.unwrap(), Some(five));
        assert_eq!(store.balance_row_count(&id), 2);
    }
}
