//! Adapters layer for the chain sync subsystem.
//!
//! In-memory implementations of the outbound ports, used by the development
//! node and by the test suites.

pub mod in_memory_ledger;
pub mod in_memory_store;

pub use in_memory_ledger::InMemoryLedger;
pub use in_memory_store::InMemoryStore;
