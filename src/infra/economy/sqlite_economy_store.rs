// SQLite implementation of the economy store traits.
//
// Tables:
// - currency: currency definitions, read by the registry
// - user: one row per account (player uuid or virtual name)
// - balance: one row per (user, currency); amounts are integer hundredths
//
// Every statement binds its values. Multi-row writes run inside a single
// transaction that is rolled back on any failure.

use crate::core::economy::{
    AccountId, AccountRecord, Amount, BalanceKey, BalanceStore, Currency, CurrencyId,
    CurrencyStore, EconomyError,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub struct SqliteEconomyStore {
    pool: SqlitePool,
}

fn storage_error(e: sqlx::Error) -> EconomyError {
    EconomyError::Storage(e.to_string())
}

fn amount_from_row(units: i64) -> Result<Amount, EconomyError> {
    Amount::from_minor_units(units)
        .map_err(|_| EconomyError::Storage(format!("corrupt stored amount {}", units)))
}

impl SqliteEconomyStore {
    /// Open (or create) the database file and run migrations.
    pub async fn new(database_path: &str, max_connections: u32) -> anyhow::Result<Self> {
        let path_str = database_path.trim_start_matches("sqlite://");
        if let Some(parent) = Path::new(path_str).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The caller is responsible for `migrate`.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the tables if they don't exist yet.
    pub async fn migrate(&self) -> Result<(), EconomyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS currency (
                id INTEGER PRIMARY KEY,
                name_singular TEXT NOT NULL,
                name_plural TEXT NOT NULL,
                symbol TEXT NOT NULL,
                is_default BOOLEAN NOT NULL DEFAULT 0,
                is_transferable BOOLEAN NOT NULL DEFAULT 1,
                starting_balance INTEGER NOT NULL DEFAULT 0 CHECK (starting_balance >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance (
                user_id TEXT NOT NULL REFERENCES user(id),
                currency_id INTEGER NOT NULL REFERENCES currency(id),
                amount INTEGER NOT NULL DEFAULT 0 CHECK (amount >= 0),
                PRIMARY KEY (user_id, currency_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    /// Insert or update a currency definition.
    pub async fn upsert_currency(&self, currency: &Currency) -> Result<(), EconomyError> {
        sqlx::query(
            r#"
            INSERT INTO currency (id, name_singular, name_plural, symbol, is_default, is_transferable, starting_balance)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name_singular = excluded.name_singular,
                name_plural = excluded.name_plural,
                symbol = excluded.symbol,
                is_default = excluded.is_default,
                is_transferable = excluded.is_transferable,
                starting_balance = excluded.starting_balance
            "#,
        )
        .bind(currency.id.0)
        .bind(&currency.name_singular)
        .bind(&currency.name_plural)
        .bind(&currency.symbol)
        .bind(currency.is_default)
        .bind(currency.is_transferable)
        .bind(currency.starting_balance.to_minor_units()?)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    /// Insert `currency` only when the currency table is empty, so a fresh
    /// database has something to start with. Returns whether a row was added.
    pub async fn seed_currency_if_empty(&self, currency: &Currency) -> Result<bool, EconomyError> {
        let result = sqlx::query(
            r#"
            INSERT INTO currency (id, name_singular, name_plural, symbol, is_default, is_transferable, starting_balance)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM currency)
            "#,
        )
        .bind(currency.id.0)
        .bind(&currency.name_singular)
        .bind(&currency.name_plural)
        .bind(&currency.symbol)
        .bind(currency.is_default)
        .bind(currency.is_transferable)
        .bind(currency.starting_balance.to_minor_units()?)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CurrencyStore for SqliteEconomyStore {
    async fn load_currencies(&self) -> Result<Vec<Currency>, EconomyError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name_singular, name_plural, symbol, is_default, is_transferable, starting_balance
            FROM currency
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter()
            .map(|row| {
                Ok(Currency {
                    id: CurrencyId(row.get::<i64, _>("id")),
                    name_singular: row.get("name_singular"),
                    name_plural: row.get("name_plural"),
                    symbol: row.get("symbol"),
                    is_default: row.get("is_default"),
                    is_transferable: row.get("is_transferable"),
                    starting_balance: amount_from_row(row.get::<i64, _>("starting_balance"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl BalanceStore for SqliteEconomyStore {
    async fn get(&self, key: &BalanceKey) -> Result<Option<Amount>, EconomyError> {
        let row = sqlx::query("SELECT amount FROM balance WHERE user_id = ? AND currency_id = ?")
            .bind(key.account.as_str())
            .bind(key.currency.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.map(|row| amount_from_row(row.get::<i64, _>("amount")))
            .transpose()
    }

    async fn get_all(&self, account: &AccountId) -> Result<Vec<(CurrencyId, Amount)>, EconomyError> {
        let rows = sqlx::query(
            "SELECT currency_id, amount FROM balance WHERE user_id = ? ORDER BY currency_id",
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter()
            .map(|row| {
                Ok((
                    CurrencyId(row.get::<i64, _>("currency_id")),
                    amount_from_row(row.get::<i64, _>("amount"))?,
                ))
            })
            .collect()
    }

    async fn set(&self, key: &BalanceKey, amount: Amount) -> Result<(), EconomyError> {
        let result =
            sqlx::query("UPDATE balance SET amount = ? WHERE user_id = ? AND currency_id = ?")
                .bind(amount.to_minor_units()?)
                .bind(key.account.as_str())
                .bind(key.currency.0)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;

        if result.rows_affected() != 1 {
            return Err(EconomyError::Storage(format!(
                "no balance row for {} / {}",
                key.account, key.currency
            )));
        }
        Ok(())
    }

    async fn set_pair(
        &self,
        from: &BalanceKey,
        from_amount: Amount,
        to: &BalanceKey,
        to_amount: Amount,
    ) -> Result<(), EconomyError> {
        let from_units = from_amount.to_minor_units()?;
        let to_units = to_amount.to_minor_units()?;

        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        for (key, units) in [(from, from_units), (to, to_units)] {
            let result =
                sqlx::query("UPDATE balance SET amount = ? WHERE user_id = ? AND currency_id = ?")
                    .bind(units)
                    .bind(key.account.as_str())
                    .bind(key.currency.0)
                    .execute(&mut *tx)
                    .await;

            let updated = match result {
                Ok(done) => done.rows_affected(),
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(storage_error(e));
                }
            };

            if updated != 1 {
                let _ = tx.rollback().await;
                return Err(EconomyError::Storage(format!(
                    "transfer touched {} rows for {} / {}",
                    updated, key.account, key.currency
                )));
            }
        }

        tx.commit().await.map_err(storage_error)
    }

    async fn create_account(
        &self,
        account: &AccountRecord,
        balances: &[(CurrencyId, Amount)],
    ) -> Result<(), EconomyError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query("INSERT INTO user (id, display_name) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(account.id.as_str())
            .bind(&account.display_name)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        for (currency, amount) in balances {
            sqlx::query(
                r#"
                INSERT INTO balance (user_id, currency_id, amount)
                VALUES (?, ?, ?)
                ON CONFLICT(user_id, currency_id) DO NOTHING
                "#,
            )
            .bind(account.id.as_str())
            .bind(currency.0)
            .bind(amount.to_minor_units()?)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        // Returning early above drops `tx`, which rolls it back.
        tx.commit().await.map_err(storage_error)
    }

    async fn get_account(&self, account: &AccountId) -> Result<Option<AccountRecord>, EconomyError> {
        let row = sqlx::query("SELECT id, display_name FROM user WHERE id = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.map(|row| AccountRecord {
            id: AccountId::from(row.get::<String, _>("id")),
            display_name: row.get("display_name"),
        }))
    }

    async fn set_display_name(
        &self,
        account: &AccountId,
        display_name: &str,
    ) -> Result<(), EconomyError> {
        let result = sqlx::query("UPDATE user SET display_name = ? WHERE id = ?")
            .bind(display_name)
            .bind(account.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        if result.rows_affected() != 1 {
            return Err(EconomyError::Storage(format!("no user row for {}", account)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::economy::{
        AccountKind, EconomyConfig, EconomyService, FailureReason, ResultKind,
    };
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn amount(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    fn currency(id: i64, singular: &str, is_default: bool, is_transferable: bool) -> Currency {
        Currency {
            id: CurrencyId(id),
            name_singular: singular.to_string(),
            name_plural: format!("{}s", singular),
            symbol: "$".to_string(),
            is_default,
            is_transferable,
            starting_balance: Amount::ZERO,
        }
    }

    async fn open() -> (SqliteEconomyStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("economy.db");
        let store = SqliteEconomyStore::new(path.to_str().unwrap(), 5)
            .await
            .unwrap();
        store.upsert_currency(&currency(1, "Dollar", true, true)).await.unwrap();
        store.upsert_currency(&currency(2, "Euro", false, true)).await.unwrap();
        (store, dir)
    }

    fn record(id: &str, name: &str) -> AccountRecord {
        AccountRecord {
            id: AccountId::from(id.to_string()),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_migrate_is_repeatable_and_currencies_round_trip() {
        let (store, _dir) = open().await;
        store.migrate().await.unwrap();

        let mut gem = currency(3, "Gem", false, false);
        gem.starting_balance = amount("2.5");
        store.upsert_currency(&gem).await.unwrap();

        let currencies = store.load_currencies().await.unwrap();
        assert_eq!(currencies.len(), 3);
        assert_eq!(currencies[2], gem);
        assert!(!store
            .seed_currency_if_empty(&currency(9, "Yen", true, true))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_account_is_idempotent() {
        let (store, _dir) = open().await;
        let rec = record("alice", "Alice");
        let rows = [(CurrencyId(1), Amount::ZERO), (CurrencyId(2), Amount::ZERO)];

        store.create_account(&rec, &rows).await.unwrap();
        store
            .set(&BalanceKey::new(&rec.id, CurrencyId(1)), amount("9"))
            .await
            .unwrap();
        store.create_account(&record("alice", "Other"), &rows).await.unwrap();

        let stored = store.get_account(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.display_name, "Alice");
        assert_eq!(
            store.get_all(&rec.id).await.unwrap(),
            vec![(CurrencyId(1), amount("9")), (CurrencyId(2), Amount::ZERO)]
        );
    }

    #[tokio::test]
    async fn test_create_account_rolls_back_on_bad_currency() {
        let (store, _dir) = open().await;
        let rec = record("bob", "Bob");

        // Currency 99 doesn't exist, so the foreign key rejects the second row.
        let result = store
            .create_account(&rec, &[(CurrencyId(1), Amount::ZERO), (CurrencyId(99), Amount::ZERO)])
            .await;

        assert!(matches!(result, Err(EconomyError::Storage(_))));
        assert_eq!(store.get_account(&rec.id).await.unwrap(), None);
        assert!(store.get_all(&rec.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_row_is_none() {
        let (store, _dir) = open().await;
        let rec = record("carol", "Carol");
        store
            .create_account(&rec, &[(CurrencyId(1), Amount::ZERO)])
            .await
            .unwrap();

        assert_eq!(
            store.get(&BalanceKey::new(&rec.id, CurrencyId(1))).await.unwrap(),
            Some(Amount::ZERO)
        );
        assert_eq!(
            store.get(&BalanceKey::new(&rec.id, CurrencyId(2))).await.unwrap(),
            None
        );
        assert!(store
            .set(&BalanceKey::new(&rec.id, CurrencyId(2)), amount("1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_set_pair_rolls_back_when_second_row_is_missing() {
        let (store, _dir) = open().await;
        let rec = record("dave", "Dave");
        store
            .create_account(&rec, &[(CurrencyId(1), amount("50"))])
            .await
            .unwrap();

        let from = BalanceKey::new(&rec.id, CurrencyId(1));
        let to = BalanceKey::new(&AccountId::from("nobody".to_string()), CurrencyId(1));
        let result = store.set_pair(&from, Amount::ZERO, &to, amount("50")).await;

        assert!(matches!(result, Err(EconomyError::Storage(_))));
        assert_eq!(store.get(&from).await.unwrap(), Some(amount("50")));
    }

    #[tokio::test]
    async fn test_values_are_bound_not_spliced() {
        let (store, _dir) = open().await;
        let rec = record("x'); DROP TABLE balance; --", "Robert'); --");

        store
            .create_account(&rec, &[(CurrencyId(1), Amount::ZERO)])
            .await
            .unwrap();

        let stored = store.get_account(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.display_name, "Robert'); --");
        assert_eq!(store.get_all(&rec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_on_sqlite_transfers_and_conserves() {
        let (store, _dir) = open().await;
        let service = EconomyService::start(Arc::new(store), EconomyConfig::default(), Vec::new())
            .await
            .unwrap();
        let dollar = service.default_currency().unwrap();

        let a = service
            .get_or_create_account(&AccountKind::Player(Uuid::from_u128(1)), "A")
            .await
            .unwrap();
        let b = service
            .get_or_create_account(&AccountKind::Player(Uuid::from_u128(2)), "B")
            .await
            .unwrap();
        assert!(a.deposit(&dollar, amount("50")).await.is_success());
        assert!(b.deposit(&dollar, amount("100")).await.is_success());

        let rejected = a.transfer(&b, &dollar, amount("75")).await;
        assert_eq!(rejected.result, ResultKind::InsufficientFunds);

        let paid = a.transfer(&b, &dollar, amount("50")).await;
        assert_eq!(paid.result, ResultKind::Success);
        assert_eq!(a.get_balance(&dollar).await.unwrap(), Amount::ZERO);
        assert_eq!(b.get_balance(&dollar).await.unwrap(), amount("150"));
    }

    #[tokio::test]
    async fn test_largest_amount_round_trips_and_deposit_overflows() {
        let (store, _dir) = open().await;
        let service = EconomyService::start(Arc::new(store), EconomyConfig::default(), Vec::new())
            .await
            .unwrap();
        let dollar = service.default_currency().unwrap();
        let rich = service
            .get_or_create_account(&AccountKind::Player(Uuid::from_u128(9)), "Rich")
            .await
            .unwrap();

        assert!(rich.set_balance(&dollar, Amount::MAX).await.is_success());
        assert_eq!(rich.get_balance(&dollar).await.unwrap(), Amount::MAX);

        let outcome = rich.deposit(&dollar, amount("0.01")).await;
        assert_eq!(outcome.failure, Some(FailureReason::Overflow));
        assert_eq!(rich.get_balance(&dollar).await.unwrap(), Amount::MAX);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_on_sqlite() {
        let (store, _dir) = open().await;
        let store = Arc::new(store);
        let service = Arc::new(
            EconomyService::start(Arc::clone(&store), EconomyConfig::default(), Vec::new())
                .await
                .unwrap(),
        );
        let identity = AccountKind::Player(Uuid::from_u128(77));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = Arc::clone(&service);
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                service
                    .get_or_create_account(&identity, "Racer")
                    .await
                    .map(|account| account.id().clone())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), identity.id());
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get_all(&identity.id()).await.unwrap().len(), 2);
    }
}
