//! Transaction scoping: one writer at a time, many concurrent readers.
//!
//! A write transaction holds the pager's writer lock (via `parking_lot`'s
//! `arc_lock` feature, so the guard can live inside this struct rather
//! than a call stack frame) for its whole lifetime and mutates pages
//! in place through the pager; a read transaction instead holds a shared
//! lock on the façade's persistent mmap and searches those bytes directly,
//! never touching the pager at all.

use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, trace};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{ArcMutexGuard, ArcRwLockReadGuard, RawMutex, RawRwLock};

use crate::btree::BTree;
use crate::db::DbInner;
use crate::error::{Error, TransactionError};
use crate::iter::Cursor;
use crate::meta::{META_PAGE_0, META_PAGE_1, Meta};
use crate::page::VALUE_SIZE;
use crate::pager::Pager;
use crate::reader::{MmapReader, ReadCursor};

/// A cursor over the current transaction's view of the tree, dispatching
/// to the writer's live pager or the reader's mmap snapshot.
pub enum TxCursor<'a> {
    Write(Cursor<'a>),
    Read(ReadCursor<'a>),
}

impl<'a> TxCursor<'a> {
    pub fn next(&mut self) -> Result<Option<(u64, [u8; VALUE_SIZE])>, Error> {
        match self {
            TxCursor::Write(c) => c.next(),
            TxCursor::Read(c) => Ok(c.next()),
        }
    }

    pub fn collect_all(mut self) -> Result<Vec<(u64, [u8; VALUE_SIZE])>, Error> {
        let mut out = Vec::new();
        while let Some(pair) = self.next()? {
            out.push(pair);
        }
        Ok(out)
    }
}

pub struct Transaction {
    inner: Arc<DbInner>,
    writable: bool,
    managed: bool,
    finished: bool,
    meta_snapshot: Meta,
    /// Root page as seen by this transaction; advances as writes split
    /// or shrink the root.
    root: u32,
    /// The meta slot this transaction will write on commit (only set for
    /// writers).
    write_slot: Option<u32>,
    writer_guard: Option<ArcMutexGuard<RawMutex, Pager>>,
    reader_guard: Option<ArcRwLockReadGuard<RawRwLock, Mmap>>,
}

impl Transaction {
    pub(crate) fn new_writer(
        inner: Arc<DbInner>,
        meta_snapshot: Meta,
        writer_guard: ArcMutexGuard<RawMutex, Pager>,
    ) -> Self {
        let write_slot = inner.meta.lock().older_slot;
        let root = meta_snapshot.root;
        Self {
            inner,
            writable: true,
            managed: false,
            finished: false,
            meta_snapshot,
            root,
            write_slot: Some(write_slot),
            writer_guard: Some(writer_guard),
            reader_guard: None,
        }
    }

    pub(crate) fn new_reader(
        inner: Arc<DbInner>,
        meta_snapshot: Meta,
        reader_guard: ArcRwLockReadGuard<RawRwLock, Mmap>,
    ) -> Self {
        let root = meta_snapshot.root;
        Self {
            inner,
            writable: false,
            managed: false,
            finished: false,
            meta_snapshot,
            root,
            write_slot: None,
            writer_guard: None,
            reader_guard: Some(reader_guard),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn mark_managed(&mut self) {
        self.managed = true;
    }

    fn pager_mut(&mut self) -> &mut Pager {
        self.writer_guard
            .as_mut()
            .expect("writer transaction")
            .deref_mut()
    }

    pub fn get(&mut self, key: u64) -> Result<Option<[u8; VALUE_SIZE]>, Error> {
        if self.writable {
            let root = self.root;
            BTree::new(self.pager_mut(), root).get(key)
        } else {
            let root = self.root;
            let page_size = self.meta_snapshot.page_size;
            let guard = self.reader_guard.as_ref().expect("reader transaction");
            Ok(MmapReader::new(&guard[..], page_size).get(root, key))
        }
    }

    pub fn exists(&mut self, key: u64) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    pub fn insert(&mut self, key: u64, value: [u8; VALUE_SIZE]) -> Result<(), Error> {
        self.require_writable()?;
        let root = self.root;
        let mut tree = BTree::new(self.pager_mut(), root);
        tree.insert(key, value)?;
        self.root = tree.root();
        Ok(())
    }

    pub fn delete(&mut self, key: u64) -> Result<(), Error> {
        self.require_writable()?;
        let root = self.root;
        let mut tree = BTree::new(self.pager_mut(), root);
        tree.delete(key)?;
        self.root = tree.root();
        Ok(())
    }

    pub fn iter(&mut self) -> Result<TxCursor<'_>, Error> {
        if self.writable {
            let root = self.root;
            Ok(TxCursor::Write(Cursor::new(self.pager_mut(), root)?))
        } else {
            let root = self.root;
            let page_size = self.meta_snapshot.page_size;
            let guard = self.reader_guard.as_ref().expect("reader transaction");
            Ok(TxCursor::Read(MmapReader::new(&guard[..], page_size).cursor(root)))
        }
    }

    fn require_writable(&self) -> Result<(), Error> {
        if !self.writable {
            return Err(TransactionError::ReadOnlyCommit.into());
        }
        Ok(())
    }

    /// Writes dirty pages, rotates the alternate meta slot, and remaps
    /// the reader mmap if the file grew.
    pub fn commit(mut self) -> Result<(), Error> {
        if !self.writable {
            return Err(TransactionError::ReadOnlyCommit.into());
        }

        let write_slot = self.write_slot.expect("writer transaction");
        let new_txid = self.meta_snapshot.txid + 1;
        let root = self.root;
        let page_size = self.meta_snapshot.page_size;
        let freelist = self.meta_snapshot.freelist;

        {
            let guard = self.writer_guard.as_mut().expect("writer transaction");
            guard.flush_all()?;

            let new_meta = Meta {
                page_size,
                root,
                freelist,
                max_page: guard.high_water_mark(),
                txid: new_txid,
                checksum: 0,
            };

            let buf = guard.page_by_idx(write_slot)?;
            new_meta.write_to(buf);
            guard.flush_page(write_slot)?;

            let mut meta_state = self.inner.meta.lock();
            meta_state.current = new_meta;
            meta_state.older_slot = if write_slot == META_PAGE_0 {
                META_PAGE_1
            } else {
                META_PAGE_0
            };
            debug!("committed txid {new_txid}, root now {root}");
        }

        {
            let mut mmap_guard = self.inner.mmap.write();
            let mmap = unsafe { MmapOptions::new().map(&self.inner.file)? };
            *mmap_guard = mmap;
        }

        self.finished = true;
        self.inner.open_transactions.fetch_sub(1, Ordering::SeqCst);
        self.writer_guard = None;
        Ok(())
    }

    /// Aborts this transaction. For a writer, any in-memory page
    /// mutations are discarded by reloading from disk (nothing was
    /// flushed before this point); for a reader, simply releases its
    /// hold on the mmap.
    pub fn rollback(mut self) {
        if self.managed {
            panic!("manual rollback() called on a managed transaction");
        }
        self.do_rollback();
    }

    fn do_rollback(&mut self) {
        if self.finished {
            return;
        }
        if self.writable {
            if let Some(guard) = self.writer_guard.as_mut() {
                guard.discard_cache();
                trace!("rolled back write transaction, discarded cached pages");
            }
        }
        self.finished = true;
        self.inner.open_transactions.fetch_sub(1, Ordering::SeqCst);
        self.writer_guard = None;
        self.reader_guard = None;
    }

    pub(crate) fn finish_managed(mut self) {
        self.do_rollback();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.do_rollback();
        }
    }
}
