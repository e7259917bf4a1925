//! # Matchmaker Types Crate
//!
//! Entity model for the matchmaker: the relational records mirrored from the
//! ledger, plus the chain-facing data transfer objects exchanged with the
//! ledger client.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: store adapters, the indexer and the REST
//!   layer all speak these types.
//! - **Ledger is authoritative**: once a record has been minted on-chain only
//!   the indexer mutates it; REST handlers create `pending`/`submitted` rows.
//! - **Explicit state machines**: every lifecycle is an enum, never a string.

pub mod chain;
pub mod entities;
pub mod errors;

pub use chain::*;
pub use entities::*;
pub use errors::*;
