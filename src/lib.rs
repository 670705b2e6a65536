//! A concurrent, resizable hash table mapping string keys to values.
//!
//! The table is built from two layers of locking:
//!
//! - A table-wide readers-writer lock (`RwLock`). Ordinary operations take it in shared mode,
//!   resizing takes it exclusively.
//! - A mutex per bucket, serializing operations which touch the same chain.
//!
//! Operations on different buckets thus run in parallel, while a resize acts as a barrier against
//! every other access.
//!
//! # Example
//!
//! ```rust
//! use htable::HTable;
//!
//! let table = HTable::new(5, true).unwrap();
//! assert_eq!(table.size(), 7);
//!
//! table.insert("hello", 1).unwrap();
//! assert!(table.insert("hello", 2).is_err());
//! assert_eq!(table.lookup("hello"), Some(1));
//! assert_eq!(table.lookup("bye"), None);
//!
//! table.destroy();
//! ```
//!
//! # The lock
//!
//! `RwLock` is writer-preferring: once a writer waits, new readers queue up behind it. This
//! keeps a resize from starving under a steady stream of lookups.

extern crate parking_lot;
#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;

mod error;
mod config;
pub mod hash;
pub mod rwlock;
mod table;


pub use config::Config;
pub use error::Error;
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
pub use table::HTable;
