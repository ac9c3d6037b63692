// Economy service - the entry point for everything outside the core.
//
// Commands and job payouts come here to resolve accounts and currencies and to
// move money. The service is constructed once at startup and shared through
// an `Arc`; there is no global lookup.

use super::account::Account;
use super::amount::Amount;
use super::balance_store::{BalanceStore, CurrencyStore};
use super::currency_registry::CurrencyRegistry;
use super::economy_models::{
    AccountKind, AccountRecord, Currency, CurrencyId, EconomyError, TransactionOutcome,
};
use super::ledger::Ledger;
use super::observers::TransactionObserver;
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// What balance a freshly created account starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewAccountBalances {
    /// Every row starts at 0; the starting balance is only used by resets.
    #[default]
    Zero,
    /// Every row starts at the currency's starting balance.
    StartingBalance,
}

impl FromStr for NewAccountBalances {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "zero" => Ok(Self::Zero),
            "starting" | "starting_balance" => Ok(Self::StartingBalance),
            other => Err(EconomyError::Configuration(format!(
                "unknown new-account balance policy {:?} (expected zero or starting)",
                other
            ))),
        }
    }
}

/// When accounts get rows for currencies added after they were created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillPolicy {
    /// Only when `EconomyService::backfill_balances` is called.
    #[default]
    Explicit,
    /// Every time the account is resolved through `get_or_create_account`.
    OnResolve,
}

impl FromStr for BackfillPolicy {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "explicit" => Ok(Self::Explicit),
            "on_resolve" => Ok(Self::OnResolve),
            other => Err(EconomyError::Configuration(format!(
                "unknown backfill policy {:?} (expected explicit or on_resolve)",
                other
            ))),
        }
    }
}

/// Configuration for the economy system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EconomyConfig {
    /// SQLite database file.
    pub database_path: String,

    /// Size of the storage connection pool.
    pub max_connections: u32,

    pub new_account_balances: NewAccountBalances,

    pub backfill: BackfillPolicy,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            database_path: "data/economy.db".to_string(),
            max_connections: 5,
            new_account_balances: NewAccountBalances::Zero,
            backfill: BackfillPolicy::Explicit,
        }
    }
}

impl EconomyConfig {
    /// Read `ECONOMY_*` variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, EconomyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EconomyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_connections = match lookup("ECONOMY_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                EconomyError::Configuration(format!("invalid ECONOMY_MAX_CONNECTIONS {:?}", raw))
            })?,
            None => defaults.max_connections,
        };

        Ok(Self {
            database_path: lookup("ECONOMY_DATABASE_PATH").unwrap_or(defaults.database_path),
            max_connections,
            new_account_balances: lookup("ECONOMY_NEW_ACCOUNT_BALANCES")
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or_default(),
            backfill: lookup("ECONOMY_BACKFILL")
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

// ============================================================================
// CORE SERVICE
// ============================================================================

/// The main service for economy operations.
///
/// Generic over the store so tests can run against the in-memory store and
/// the bot against SQLite.
pub struct EconomyService<S: BalanceStore + CurrencyStore> {
    store: Arc<S>,
    registry: Arc<CurrencyRegistry>,
    ledger: Arc<Ledger<S>>,
    config: EconomyConfig,
}

impl<S: BalanceStore + CurrencyStore> EconomyService<S> {
    /// Load currencies and wire up the ledger.
    ///
    /// Fails with `Configuration` when the stored currencies don't have exactly
    /// one default; the caller should refuse to start.
    pub async fn start(
        store: Arc<S>,
        config: EconomyConfig,
        observers: Vec<Arc<dyn TransactionObserver>>,
    ) -> Result<Self, EconomyError> {
        let registry = Arc::new(CurrencyRegistry::load_from(&*store).await?);

        let ledger = observers.into_iter().fold(
            Ledger::new(Arc::clone(&store), Arc::clone(&registry)),
            |ledger, observer| ledger.with_observer(observer),
        );

        Ok(Self {
            store,
            registry,
            ledger: Arc::new(ledger),
            config,
        })
    }

    pub fn config(&self) -> &EconomyConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger<S>> {
        &self.ledger
    }

    // ------------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------------

    pub async fn has_account(&self, identity: &AccountKind) -> Result<bool, EconomyError> {
        Ok(self.store.get_account(&identity.id()).await?.is_some())
    }

    /// Look up an existing account without creating it.
    pub async fn resolve_account(&self, identity: &AccountKind) -> Result<Account<S>, EconomyError> {
        let id = identity.id();
        match self.store.get_account(&id).await? {
            Some(record) => Ok(self.account_from(identity, record)),
            None => Err(EconomyError::AccountNotFound {
                account: id.to_string(),
                currency: "*".to_string(),
            }),
        }
    }

    /// Return the account for `identity`, creating it with one balance row per
    /// known currency if it doesn't exist yet.
    ///
    /// Safe to call concurrently for the same identity: creation runs under the
    /// identity's lock and the store ignores rows that already exist.
    pub async fn get_or_create_account(
        &self,
        identity: &AccountKind,
        display_name: &str,
    ) -> Result<Account<S>, EconomyError> {
        identity.validate()?;
        let id = identity.id();
        let _guard = self.ledger.locks().lock(&id).await;

        if let Some(record) = self.store.get_account(&id).await? {
            if self.config.backfill == BackfillPolicy::OnResolve {
                self.insert_missing_balances(&record).await?;
            }
            return Ok(self.account_from(identity, record));
        }

        let record = AccountRecord {
            id: id.clone(),
            display_name: display_name.trim().to_string(),
        };
        self.insert_missing_balances(&record).await?;

        // Re-read so a row created by another process wins over our guess.
        let record = self.store.get_account(&id).await?.ok_or_else(|| {
            EconomyError::Storage(format!("account {} missing right after creation", id))
        })?;

        tracing::info!(account = %id, display_name = %record.display_name, "Created economy account");
        Ok(self.account_from(identity, record))
    }

    /// Add rows for currencies the account doesn't have yet.
    ///
    /// This is the explicit migration step for currencies added after an
    /// account was created.
    pub async fn backfill_balances(&self, account: &Account<S>) -> Result<(), EconomyError> {
        let _guard = self.ledger.locks().lock(account.id()).await;
        let record = AccountRecord {
            id: account.id().clone(),
            display_name: account.display_name().to_string(),
        };
        self.insert_missing_balances(&record).await
    }

    async fn insert_missing_balances(&self, record: &AccountRecord) -> Result<(), EconomyError> {
        let balances: Vec<(CurrencyId, Amount)> = self
            .registry
            .all()
            .iter()
            .map(|currency| (currency.id, self.initial_balance(currency)))
            .collect();

        self.store
            .create_account(record, &balances)
            .await
            .map_err(|e| {
                tracing::error!(
                    account = %record.id,
                    currencies = balances.len(),
                    error = %e,
                    "Failed to create account rows"
                );
                e
            })
    }

    fn initial_balance(&self, currency: &Currency) -> Amount {
        match self.config.new_account_balances {
            NewAccountBalances::Zero => Amount::ZERO,
            NewAccountBalances::StartingBalance => currency.starting_balance,
        }
    }

    fn account_from(&self, identity: &AccountKind, record: AccountRecord) -> Account<S> {
        Account::new(Arc::clone(&self.ledger), identity.clone(), record.display_name)
    }

    // ------------------------------------------------------------------------
    // Currencies
    // ------------------------------------------------------------------------

    pub fn default_currency(&self) -> Result<Arc<Currency>, EconomyError> {
        self.registry.get_default()
    }

    pub fn get_currency_by_id(&self, id: CurrencyId) -> Option<Arc<Currency>> {
        self.registry.get_by_id(id)
    }

    pub fn get_currency_by_name(&self, name: &str) -> Option<Arc<Currency>> {
        self.registry.get_by_name(name)
    }

    /// Resolve a currency from user input: a numeric id or a name.
    pub fn resolve_currency(&self, name_or_id: &str) -> Result<Arc<Currency>, EconomyError> {
        let snapshot = self.registry.snapshot();
        let by_id = name_or_id
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|id| snapshot.get_by_id(CurrencyId(id)));

        by_id
            .or_else(|| snapshot.get_by_name(name_or_id))
            .ok_or_else(|| EconomyError::CurrencyNotFound(name_or_id.to_string()))
    }

    /// All currencies, ordered by id.
    pub fn currencies(&self) -> Vec<Arc<Currency>> {
        self.registry.all()
    }

    /// Re-read currency definitions. Readers keep seeing the old set until the
    /// new one is complete; an invalid new set is rejected and the old one kept.
    pub async fn reload_currencies(&self) -> Result<(), EconomyError> {
        self.registry.reload(&*self.store).await
    }

    // ------------------------------------------------------------------------
    // Money movement
    // ------------------------------------------------------------------------

    pub async fn transfer(
        &self,
        from: &Account<S>,
        to: &Account<S>,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        from.transfer(to, currency, amount).await
    }

    pub async fn deposit(
        &self,
        account: &Account<S>,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        account.deposit(currency, amount).await
    }

    pub async fn withdraw(
        &self,
        account: &Account<S>,
        currency: &Currency,
        amount: Amount,
    ) -> TransactionOutcome {
        account.withdraw(currency, amount).await
    }

    pub async fn reset(&self, account: &Account<S>, currency: &Currency) -> TransactionOutcome {
        account.reset_balance(currency).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::economy::{FailureReason, ResultKind};
    use crate::infra::economy::InMemoryEconomyStore;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn amount(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    fn player(n: u128) -> AccountKind {
        AccountKind::Player(Uuid::from_u128(n))
    }

    async fn service_with(
        config: EconomyConfig,
    ) -> (EconomyService<InMemoryEconomyStore>, Arc<InMemoryEconomyStore>) {
        let store = Arc::new(InMemoryEconomyStore::with_standard_currencies());
        let service = EconomyService::start(Arc::clone(&store), config, Vec::new())
            .await
            .unwrap();
        (service, store)
    }

    async fn service() -> (EconomyService<InMemoryEconomyStore>, Arc<InMemoryEconomyStore>) {
        service_with(EconomyConfig::default()).await
    }

    #[tokio::test]
    async fn test_create_account_initializes_every_currency_to_zero() {
        let (service, store) = service().await;

        let account = service
            .get_or_create_account(&player(1), "Steve")
            .await
            .unwrap();

        assert_eq!(account.display_name(), "Steve");
        assert_eq!(store.balance_row_count(account.id()), 3);
        for entry in account.get_balances().await.unwrap() {
            assert_eq!(entry.amount, Some(Amount::ZERO));
        }
    }

    #[tokio::test]
    async fn test_starting_balance_policy() {
        let config = EconomyConfig {
            new_account_balances: NewAccountBalances::StartingBalance,
            ..EconomyConfig::default()
        };
        let (service, _) = service_with(config).await;

        let account = service
            .get_or_create_account(&player(1), "Steve")
            .await
            .unwrap();
        let gems = service.resolve_currency("gems").unwrap();

        assert_eq!(account.get_balance(&gems).await.unwrap(), amount("5"));
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (service, store) = service().await;

        let first = service
            .get_or_create_account(&player(7), "Alex")
            .await
            .unwrap();
        let dollar = service.default_currency().unwrap();
        first.deposit(&dollar, amount("10")).await;

        let second = service
            .get_or_create_account(&player(7), "Someone else")
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.display_name(), "Alex");
        assert_eq!(second.get_balance(&dollar).await.unwrap(), amount("10"));
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.balance_row_count(first.id()), 3);
    }

    #[tokio::test]
    async fn test_concurrent_creation_makes_one_account() {
        let (service, store) = service().await;
        let service = Arc::new(service);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service
                    .get_or_create_account(&player(42), "Racer")
                    .await
                    .map(|account| account.id().clone())
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.balance_row_count(&ids[0]), 3);
    }

    #[tokio::test]
    async fn test_resolve_account_does_not_create() {
        let (service, store) = service().await;

        assert!(matches!(
            service.resolve_account(&player(3)).await,
            Err(EconomyError::AccountNotFound { .. })
        ));
        assert!(!service.has_account(&player(3)).await.unwrap());
        assert_eq!(store.user_count(), 0);
    }

    #[tokio::test]
    async fn test_pay_scenarios() {
        let (service, _) = service().await;
        let dollar = service.default_currency().unwrap();
        let a = service.get_or_create_account(&player(1), "A").await.unwrap();
        let b = service.get_or_create_account(&player(2), "B").await.unwrap();
        a.set_balance(&dollar, amount("50")).await;
        b.set_balance(&dollar, amount("100")).await;

        let rejected = service.transfer(&a, &b, &dollar, amount("75")).await;
        assert_eq!(rejected.result, ResultKind::InsufficientFunds);
        assert_eq!(a.get_balance(&dollar).await.unwrap(), amount("50"));
        assert_eq!(b.get_balance(&dollar).await.unwrap(), amount("100"));

        let paid = service.transfer(&a, &b, &dollar, amount("50")).await;
        assert_eq!(paid.result, ResultKind::Success);
        assert_eq!(a.get_balance(&dollar).await.unwrap(), amount("0.00"));
        assert_eq!(b.get_balance(&dollar).await.unwrap(), amount("150.00"));
    }

    #[tokio::test]
    async fn test_withdraw_scenario() {
        let (service, _) = service().await;
        let dollar = service.resolve_currency("Dollar").unwrap();
        let a = service.get_or_create_account(&player(1), "A").await.unwrap();
        service.deposit(&a, &dollar, amount("123.00")).await;

        let outcome = service.withdraw(&a, &dollar, amount("50.00")).await;

        assert_eq!(outcome.result, ResultKind::Success);
        assert_eq!(a.get_balance(&dollar).await.unwrap(), amount("73.00"));
    }

    #[tokio::test]
    async fn test_non_transferable_currency_never_moves() {
        let (service, _) = service().await;
        let gems = service.resolve_currency("3").unwrap();
        let a = service.get_or_create_account(&player(1), "A").await.unwrap();
        let b = service.get_or_create_account(&player(2), "B").await.unwrap();
        a.set_balance(&gems, amount("1000")).await;

        let outcome = service.transfer(&a, &b, &gems, amount("1")).await;

        assert_eq!(outcome.failure, Some(FailureReason::NonTransferableCurrency));
        assert_eq!(a.get_balance(&gems).await.unwrap(), amount("1000"));
    }

    #[tokio::test]
    async fn test_new_currency_needs_backfill() {
        let (service, store) = service().await;
        let a = service.get_or_create_account(&player(1), "A").await.unwrap();

        let mut gold = (*service.default_currency().unwrap()).clone();
        gold.id = CurrencyId(4);
        gold.name_singular = "Gold".to_string();
        gold.name_plural = "Gold".to_string();
        gold.is_default = false;
        store.add_currency(gold);
        service.reload_currencies().await.unwrap();

        let gold = service.resolve_currency("gold").unwrap();
        assert!(!a.has_balance(&gold).await.unwrap());
        assert_eq!(
            a.deposit(&gold, amount("1")).await.failure,
            Some(FailureReason::AccountNotFound)
        );

        service.backfill_balances(&a).await.unwrap();
        assert_eq!(a.get_balance(&gold).await.unwrap(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_backfill_on_resolve() {
        let config = EconomyConfig {
            backfill: BackfillPolicy::OnResolve,
            ..EconomyConfig::default()
        };
        let (service, store) = service_with(config).await;
        let a = service.get_or_create_account(&player(1), "A").await.unwrap();

        let mut gold = (*service.default_currency().unwrap()).clone();
        gold.id = CurrencyId(4);
        gold.name_singular = "Gold".to_string();
        gold.name_plural = "Gold".to_string();
        gold.is_default = false;
        store.add_currency(gold);
        service.reload_currencies().await.unwrap();

        service.get_or_create_account(&player(1), "A").await.unwrap();
        assert_eq!(store.balance_row_count(a.id()), 4);
    }

    #[tokio::test]
    async fn test_rename_only_for_virtual_accounts() {
        let (service, _) = service().await;
        let mut steve = service
            .get_or_create_account(&player(1), "Steve")
            .await
            .unwrap();
        assert_eq!(
            steve.set_display_name("Herobrine").await,
            Err(EconomyError::RenameNotAllowed)
        );

        let bank = AccountKind::virtual_account("town_bank").unwrap();
        let mut account = service.get_or_create_account(&bank, "Bank").await.unwrap();
        account.set_display_name("Town Bank").await.unwrap();

        let reread = service.resolve_account(&bank).await.unwrap();
        assert_eq!(reread.display_name(), "Town Bank");
    }

    #[tokio::test]
    async fn test_invalid_virtual_identity_is_rejected() {
        let (service, store) = service().await;
        let sneaky = AccountKind::Virtual(Uuid::from_u128(1).to_string());

        assert!(matches!(
            service.get_or_create_account(&sneaky, "x").await,
            Err(EconomyError::InvalidIdentity(_))
        ));
        assert_eq!(store.user_count(), 0);
    }

    #[tokio::test]
    async fn test_start_refuses_ambiguous_default() {
        let store = Arc::new(InMemoryEconomyStore::with_standard_currencies());
        let mut euro = store.load_currencies().await.unwrap()[1].clone();
        euro.id = CurrencyId(9);
        euro.is_default = true;
        store.add_currency(euro);

        let result = EconomyService::start(store, EconomyConfig::default(), Vec::new()).await;
        assert!(matches!(result, Err(EconomyError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unknown_currency_name() {
        let (service, _) = service().await;
        assert_eq!(
            service.resolve_currency("doubloons"),
            Err(EconomyError::CurrencyNotFound("doubloons".to_string()))
        );
        assert_eq!(service.currencies().len(), 3);
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ECONOMY_DATABASE_PATH", "/tmp/eco.db"),
            ("ECONOMY_NEW_ACCOUNT_BALANCES", "starting"),
            ("ECONOMY_BACKFILL", "on_resolve"),
            ("ECONOMY_MAX_CONNECTIONS", "2"),
        ]
        .into_iter()
        .collect();

        let config = EconomyConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.database_path, "/tmp/eco.db");
        assert_eq!(config.new_account_balances, NewAccountBalances::StartingBalance);
        assert_eq!(config.backfill, BackfillPolicy::OnResolve);
        assert_eq!(config.max_connections, 2);

        assert_eq!(EconomyConfig::from_lookup(|_| None).unwrap(), EconomyConfig::default());
    }

    #[test]
    fn test_config_rejects_unknown_policy() {
        let result = EconomyConfig::from_lookup(|k| {
            (k == "ECONOMY_BACKFILL").then(|| "sometimes".to_string())
        });
        assert!(matches!(result, Err(EconomyError::Configuration(_))));
    }
}
