//! A single-file, mmap-backed B-tree storage engine.
//!
//! A [`Database`] owns one file on disk laid out as two redundant meta
//! pages, a freelist page, and a B+-tree of fixed-size pages. One writer
//! and any number of readers can hold transactions concurrently; readers
//! never block on or behind the writer, since they search a separate,
//! persistent memory mapping that is only replaced (under a short
//! exclusive lock) when a writer commits.

pub mod btree;
pub mod db;
pub mod error;
pub mod iter;
pub mod meta;
pub mod page;
pub mod pager;
pub mod reader;
pub mod transaction;

pub use db::{Database, Options};
pub use error::{ConfigError, Error, PagerError, TransactionError, TreeError};
pub use page::VALUE_SIZE;
pub use transaction::{Transaction, TxCursor};
