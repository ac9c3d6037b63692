// Currency registry - the cached set of currency definitions.
//
// Currencies are read from storage once at startup and then served from an
// immutable snapshot. `reload` builds a complete new snapshot before swapping
// it in, so readers see either the old set or the new one.

use super::balance_store::CurrencyStore;
use super::economy_models::{Currency, CurrencyId, EconomyError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An immutable view of all currencies.
#[derive(Debug, Default)]
pub struct CurrencySnapshot {
    by_id: BTreeMap<CurrencyId, Arc<Currency>>,
    by_name: HashMap<String, CurrencyId>,
    default_id: Option<CurrencyId>,
}

impl CurrencySnapshot {
    /// Build a snapshot and check the registry invariants: ids are unique and
    /// exactly one currency is the default.
    pub fn build(currencies: Vec<Currency>) -> Result<Self, EconomyError> {
        let mut snapshot = CurrencySnapshot::default();

        for currency in currencies {
            let id = currency.id;
            if snapshot.by_id.contains_key(&id) {
                return Err(EconomyError::Configuration(format!(
                    "duplicate currency id {}",
                    id
                )));
            }

            if currency.is_default {
                if let Some(existing) = snapshot.default_id {
                    return Err(EconomyError::Configuration(format!(
                        "currencies {} and {} are both marked default",
                        existing, id
                    )));
                }
                snapshot.default_id = Some(id);
            }

            // Both names resolve; the first currency to claim a name keeps it.
            for name in [&currency.name_singular, &currency.name_plural] {
                snapshot.by_name.entry(name.to_lowercase()).or_insert(id);
            }
            snapshot.by_id.insert(id, Arc::new(currency));
        }

        if snapshot.default_id.is_none() {
            return Err(EconomyError::Configuration(
                "no currency is marked default".to_string(),
            ));
        }

        Ok(snapshot)
    }

    pub fn get_by_id(&self, id: CurrencyId) -> Option<Arc<Currency>> {
        self.by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Currency>> {
        let id = self.by_name.get(&name.trim().to_lowercase())?;
        self.get_by_id(*id)
    }

    pub fn get_default(&self) -> Result<Arc<Currency>, EconomyError> {
        self.default_id
            .and_then(|id| self.get_by_id(id))
            .ok_or_else(|| EconomyError::Configuration("no default currency loaded".to_string()))
    }

    /// All currencies ordered by id.
    pub fn all(&self) -> Vec<Arc<Currency>> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Shared, reloadable holder of the current snapshot.
pub struct CurrencyRegistry {
    snapshot: RwLock<Arc<CurrencySnapshot>>,
}

impl CurrencyRegistry {
    /// An empty registry. Every lookup misses and `get_default` fails until
    /// `load` succeeds.
    pub fn empty() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CurrencySnapshot::default())),
        }
    }

    /// Create a registry and load it from `store` in one step.
    pub async fn load_from<C: CurrencyStore + ?Sized>(store: &C) -> Result<Self, EconomyError> {
        let registry = Self::empty();
        registry.load(store).await?;
        Ok(registry)
    }

    /// Read all currency rows and swap in a new snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn load<C: CurrencyStore + ?Sized>(&self, store: &C) -> Result<(), EconomyError> {
        let rows = store.load_currencies().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to read currencies from storage");
            e
        })?;

        let snapshot = CurrencySnapshot::build(rows)?;
        let count = snapshot.len();
        *self.snapshot.write() = Arc::new(snapshot);

        tracing::info!(currencies = count, "Currency registry loaded");
        Ok(())
    }

    pub async fn reload<C: CurrencyStore + ?Sized>(&self, store: &C) -> Result<(), EconomyError> {
        self.load(store).await
    }

    /// The current snapshot. Hold on to it to get a consistent view across
    /// several lookups.
    pub fn snapshot(&self) -> Arc<CurrencySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn get_default(&self) -> Result<Arc<Currency>, EconomyError> {
        self.snapshot().get_default()
    }

    pub fn get_by_id(&self, id: CurrencyId) -> Option<Arc<Currency>> {
        self.snapshot().get_by_id(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Currency>> {
        self.snapshot().get_by_name(name)
    }

    pub fn all(&self) -> Vec<Arc<Currency>> {
        self.snapshot().all()
    }
}
