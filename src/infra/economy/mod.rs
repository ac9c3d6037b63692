// Economy infrastructure - storage implementations

mod in_memory;
mod sqlite_economy_store;

pub use in_memory::InMemoryEconomyStore;
pub use sqlite_economy_store::SqliteEconomyStore;
