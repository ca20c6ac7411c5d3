//! Database façade: opens/creates the file, initializes a blank one,
//! and hands out transactions.
//!
//! The file layout and open sequence follow jammdb's `DBInner::open` /
//! `init_file` closely: an exclusive (or shared, for `read_only`) OS file
//! lock via `fs2`, meta-page selection on an existing file, or writing the
//! four initial pages (two meta copies, the freelist, the root leaf) on
//! an empty one.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fs2::FileExt;
use log::{debug, info};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};

use crate::error::{ConfigError, Error, TransactionError};
use crate::meta::{self, FREELIST_PAGE, INITIAL_ROOT_PAGE, META_PAGE_0, META_PAGE_1, Meta};
use crate::page::{LeafViewMut, internal_cells_max, internal_cells_min, leaf_cells_max, leaf_cells_min};
use crate::pager::Pager;
use crate::transaction::Transaction;

#[derive(Debug, Clone)]
pub struct Options {
    /// Used only when creating a fresh file; an existing file's meta
    /// overrides this.
    pub page_size: u32,
    /// Initial size of the persistent reader mmap.
    pub mmap_init_size: u64,
    pub read_only: bool,
    /// Init-time upper bound on the pager's slot table.
    pub max_pages: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: page_size::get() as u32,
            mmap_init_size: 1 << 20,
            read_only: false,
            max_pages: 1 << 20,
        }
    }
}

pub(crate) struct MetaState {
    pub current: Meta,
    /// The meta slot holding the *older* txid; the next commit writes
    /// here, per the alternating-slot protocol.
    pub older_slot: u32,
}

pub(crate) struct DbInner {
    pub(crate) pager: Arc<Mutex<Pager>>,
    pub(crate) meta: Mutex<MetaState>,
    pub(crate) mmap: Arc<RwLock<Mmap>>,
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) read_only: bool,
    pub(crate) open_transactions: AtomicUsize,
}

/// Handle to an open database file. Cheaply `Clone`-able; clones share
/// the same underlying locks and file handle.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self, Error> {
        let path = path.as_ref();
        validate_options(&options)?;

        let file = OpenOptions::new()
            .create(!options.read_only)
            .read(true)
            .write(!options.read_only)
            .open(path)?;

        if options.read_only {
            FileExt::lock_shared(&file)?;
        } else {
            FileExt::lock_exclusive(&file)?;
        }

        let is_new = file.metadata()?.len() == 0;
        let mut pager = Pager::open(path, options.page_size, options.max_pages)?;

        let meta_state = if is_new {
            info!("initializing new database at {}", path.display());
            init(&mut pager, options.page_size)?
        } else {
            debug!("opening existing database at {}", path.display());
            pager.mark_allocated(FREELIST_PAGE + 1);
            let page0 = { pager.page_by_idx(META_PAGE_0)?.to_vec() };
            let page1 = { pager.page_by_idx(META_PAGE_1)?.to_vec() };
            let (current, older_slot) = meta::select_meta(&page0, &page1)?;
            if current.max_page > options.max_pages {
                return Err(ConfigError::MaxPagesTooSmall {
                    max_pages: options.max_pages,
                    max_page: current.max_page,
                }
                .into());
            }
            pager.mark_allocated(current.max_page);
            MetaState {
                current,
                older_slot,
            }
        };

        if !options.read_only {
            let current_len = file.metadata()?.len();
            let target_len = current_len.max(options.mmap_init_size);
            if target_len > current_len {
                file.set_len(target_len)?;
            }
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let inner = DbInner {
            pager: Arc::new(Mutex::new(pager)),
            meta: Mutex::new(meta_state),
            mmap: Arc::new(RwLock::new(mmap)),
            file,
            path: path.to_path_buf(),
            read_only: options.read_only,
            open_transactions: AtomicUsize::new(0),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Begins a new transaction. Write transactions serialize on the
    /// writer lock; read transactions take a shared hold on the reader
    /// mmap for their whole lifetime.
    pub fn begin(&self, writable: bool) -> Result<Transaction, Error> {
        if writable && self.inner.read_only {
            return Err(TransactionError::DatabaseReadOnly.into());
        }

        self.inner.open_transactions.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.inner.meta.lock().current;

        if writable {
            let writer_guard = Arc::clone(&self.inner.pager).lock_arc();
            Ok(Transaction::new_writer(
                Arc::clone(&self.inner),
                snapshot,
                writer_guard,
            ))
        } else {
            let reader_guard = Arc::clone(&self.inner.mmap).read_arc();
            Ok(Transaction::new_reader(
                Arc::clone(&self.inner),
                snapshot,
                reader_guard,
            ))
        }
    }

    /// Runs `f` inside a managed, auto-rolled-back read transaction.
    pub fn view<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Transaction) -> Result<T, Error>,
    {
        let mut tx = self.begin(false)?;
        tx.mark_managed();
        let result = f(&mut tx);
        tx.finish_managed();
        result
    }

    pub fn close(self) -> Result<(), Error> {
        let open = self.inner.open_transactions.load(Ordering::SeqCst);
        if open > 0 {
            return Err(ConfigError::TransactionsStillOpen(open).into());
        }
        self.inner.pager.lock().close()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

fn validate_options(options: &Options) -> Result<(), Error> {
    if leaf_cells_max(options.page_size) <= 3 {
        return Err(ConfigError::CellsMaxTooSmall {
            page_size: options.page_size,
        }
        .into());
    }
    if leaf_cells_min(options.page_size) <= 1 {
        return Err(ConfigError::CellsMinTooSmall {
            page_size: options.page_size,
        }
        .into());
    }
    if internal_cells_max(options.page_size) <= 3 {
        return Err(ConfigError::CellsMaxTooSmall {
            page_size: options.page_size,
        }
        .into());
    }
    if internal_cells_min(options.page_size) <= 1 {
        return Err(ConfigError::CellsMinTooSmall {
            page_size: options.page_size,
        }
        .into());
    }
    Ok(())
}

/// Writes the four initial pages of a brand-new file: two meta copies
/// (txid 0 and 1, so the newer one is deterministic), a zeroed freelist
/// page, and an empty root leaf.
fn init(pager: &mut Pager, page_size: u32) -> Result<MetaState, Error> {
    let (idx0, buf0) = pager.next_empty_page()?;
    debug_assert_eq!(idx0, META_PAGE_0);
    let meta0 = Meta {
        page_size,
        root: INITIAL_ROOT_PAGE,
        freelist: FREELIST_PAGE,
        max_page: INITIAL_ROOT_PAGE + 1,
        txid: 0,
        checksum: 0,
    };
    meta0.write_to(buf0);
    pager.flush_page(idx0)?;

    let (idx1, buf1) = pager.next_empty_page()?;
    debug_assert_eq!(idx1, META_PAGE_1);
    let meta1 = Meta {
        txid: 1,
        ..meta0
    };
    meta1.write_to(buf1);
    pager.flush_page(idx1)?;

    let (idx2, _buf2) = pager.next_empty_page()?;
    debug_assert_eq!(idx2, FREELIST_PAGE);
    pager.flush_page(idx2)?;

    let (idx3, buf3) = pager.next_empty_page()?;
    debug_assert_eq!(idx3, INITIAL_ROOT_PAGE);
    LeafViewMut::init(buf3);
    pager.flush_page(idx3)?;

    Ok(MetaState {
        current: meta1,
        older_slot: META_PAGE_0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn open_creates_initial_layout() {
        let dir = TempDir::new("db").unwrap();
        let db = Database::open(dir.path().join("t.db"), Options::default()).unwrap();
        let meta = db.inner.meta.lock().current;
        assert_eq!(meta.root, INITIAL_ROOT_PAGE);
        assert_eq!(meta.freelist, FREELIST_PAGE);
        assert_eq!(meta.txid, 1);
    }

    #[test]
    fn rejects_tiny_page_size() {
        let dir = TempDir::new("db").unwrap();
        let options = Options {
            page_size: 16,
            ..Options::default()
        };
        let result = Database::open(dir.path().join("t.db"), options);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_reopen_with_smaller_max_pages_than_persisted() {
        let dir = TempDir::new("db").unwrap();
        let path = dir.path().join("t.db");
        {
            let _db = Database::open(&path, Options::default()).unwrap();
        }
        let options = Options {
            max_pages: 2,
            ..Options::default()
        };
        let result = Database::open(&path, options);
        assert!(matches!(
            result,
            Err(Error::Configuration(ConfigError::MaxPagesTooSmall { .. }))
        ));
    }

    #[test]
    fn reopen_reads_back_meta() {
        let dir = TempDir::new("db").unwrap();
        let path = dir.path().join("t.db");
        {
            let _db = Database::open(&path, Options::default()).unwrap();
        }
        let db = Database::open(&path, Options::default()).unwrap();
        let meta = db.inner.meta.lock().current;
        assert_eq!(meta.root, INITIAL_ROOT_PAGE);
    }
}
