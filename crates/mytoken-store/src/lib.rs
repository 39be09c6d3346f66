//! # mytoken store
//!
//! Storage abstraction for mytoken. Provides a trait-based interface for
//! mytokens, their restriction counters, the event ledger, and pending
//! exchanges, with a SQLite implementation.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`UsageClaim`] - A use of a restriction clause, recorded conditionally
//! - [`NewMytoken`] / [`StoredMytoken`] - Mytoken rows going in and coming out
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mytoken_store::{SqliteStore, Store};
//! use mytoken_core::MytokenId;
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("mytoken.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     let missing = store.get_mytoken(&MytokenId::generate()).await.unwrap();
//!     assert!(missing.is_none());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Hierarchy**: mytokens form an adjacency list over `parent_id`; subtree
//!   queries use a recursive CTE.
//! - **All-or-nothing**: each state change is one `IMMEDIATE` transaction.
//! - **Revocation is a flag**: rows are never deleted, so the ledger keeps
//!   referring to them.

pub mod error;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use traits::{
    AccessTokenRecord, MytokenEntry, MytokenTree, NewExchange, NewMytoken, ShortToken, Store,
    StoreExt, StoredExchange, StoredMytoken, UsageClaim,
};
