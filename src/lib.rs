// Multi-currency economy ledger.
//
// **Architecture Overview:**
// - `core/` = Business logic and storage traits (platform-agnostic)
// - `infra/` = Implementations of core traits (SQLite, in-memory)
//
// The Discord adapters live in the binary (`main.rs`) and only call into
// the types exported from here.

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with several mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
pub mod core;
#[path = "infra/infra_layer.rs"]
pub mod infra;
