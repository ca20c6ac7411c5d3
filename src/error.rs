//! Crate-wide error taxonomy.
//!
//! Every fallible entry point returns [`Error`], grouped into the kinds a
//! caller actually needs to distinguish: bad configuration, pager-level I/O,
//! tree-level key conflicts, transaction misuse, and on-disk consistency
//! failures. Consistency failures and managed-transaction misuse are not
//! meant to be handled — they terminate the process with a diagnostic,
//! the same way a B-tree invariant violation does.

use std::io;

use thiserror::Error;

/// Top-level error type returned by every public operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("database is not open")]
    DatabaseNotOpen,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cells_max must be greater than 3 for page_size {page_size}")]
    CellsMaxTooSmall { page_size: u32 },
    #[error("cells_min must be greater than 1 for page_size {page_size}")]
    CellsMinTooSmall { page_size: u32 },
    #[error("max_pages {max_pages} is smaller than the persisted max_page {max_page}")]
    MaxPagesTooSmall { max_pages: u32, max_page: u32 },
    #[error("database was opened read-only")]
    ReadOnly,
    #[error("cannot close: {0} transaction(s) still open")]
    TransactionsStillOpen(usize),
}

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("page {0} not found")]
    PageNotFound(u32),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("key already exists")]
    DuplicateKey,
    #[error("key not found")]
    KeyNotFound,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("cannot commit a read-only transaction")]
    ReadOnlyCommit,
    #[error("database opened read-only, cannot begin a write transaction")]
    DatabaseReadOnly,
    #[error("both meta pages are invalid; database is unreadable")]
    MetaCorrupt,
}
