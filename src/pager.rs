//! Disk-backed page management: turns a [`u32`] page index into a mutable
//! byte slice, backed by the file, using transient memory-mapped I/O.
//!
//! The mmap algorithm aligns the target offset down to the host's native
//! page granularity (via the `page_size` crate) and maps exactly enough
//! bytes to cover the requested page, copies in or out, and unmaps again —
//! there is no long-lived writable mapping. This mirrors jammdb's
//! platform `mmap()` helper and `DBInner::resize()`, adapted to a
//! per-call rather than whole-file mapping since this pager, unlike
//! jammdb's, serves the write path rather than the reader snapshot (see
//! `db.rs` for the persistent read-only mapping used by readers).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::slice;

use log::trace;
use memmap2::MmapOptions;

use crate::error::PagerError;

/// A page buffer backed by a `u64`-word allocation, so the start of the
/// buffer is always 8-byte aligned. `page.rs` reinterprets page bytes as
/// `NodeHeader`/`LeafCell`/`InternalCell` through a pointer cast, and those
/// types contain a `u64` — a plain `vec![0u8; n].into_boxed_slice()` gives
/// no such alignment guarantee from the global allocator.
#[derive(Debug, Clone)]
struct AlignedPage {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedPage {
    fn zeroed(len: usize) -> Self {
        let word_len = len.div_ceil(8);
        Self {
            words: vec![0u64; word_len].into_boxed_slice(),
            len,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    /// Never allocated, or freed by `reclaim_page`; available for reuse.
    Vacant,
    /// Allocated (known to exist on disk) but not yet read into memory.
    Unloaded,
    /// Cached in memory; this is the buffer operations mutate directly.
    Loaded(AlignedPage),
}

#[derive(Debug)]
pub struct Pager {
    file: File,
    page_size: u32,
    slots: Vec<Slot>,
}

impl Pager {
    /// Opens (creating if absent) a file-backed pager with `max_pages`
    /// slots. Callers that read an existing file's meta must follow up
    /// with [`Pager::mark_allocated`] to tell the pager which indices are
    /// already in use.
    pub fn open(path: &Path, page_size: u32, max_pages: u32) -> Result<Self, PagerError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        Ok(Self {
            file,
            page_size,
            slots: vec![Slot::Vacant; max_pages as usize],
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn max_pages(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Marks every index below `max_page` as allocated (but not yet
    /// cached), so `next_empty_page` will not hand out an index that
    /// already holds live data on disk.
    pub fn mark_allocated(&mut self, max_page: u32) {
        let bound = max_page.min(self.slots.len() as u32);
        for slot in self.slots.iter_mut().take(bound as usize) {
            if matches!(slot, Slot::Vacant) {
                *slot = Slot::Unloaded;
            }
        }
    }

    /// Returns a mutable view of page `idx`, loading it from disk on
    /// first access.
    pub fn page_by_idx(&mut self, idx: u32) -> Result<&mut [u8], PagerError> {
        let i = idx as usize;
        if i >= self.slots.len() {
            return Err(PagerError::PageNotFound(idx));
        }

        if matches!(self.slots[i], Slot::Vacant) {
            return Err(PagerError::PageNotFound(idx));
        }

        if matches!(self.slots[i], Slot::Unloaded) {
            let buf = self.mmap_read(idx)?;
            self.slots[i] = Slot::Loaded(buf);
        }

        match &mut self.slots[i] {
            Slot::Loaded(page) => Ok(page.as_bytes_mut()),
            _ => unreachable!("just loaded"),
        }
    }

    /// Scans the slot table for the first unoccupied slot and returns a
    /// fresh zeroed page there.
    pub fn next_empty_page(&mut self) -> Result<(u32, &mut [u8]), PagerError> {
        let pos = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Vacant))
            .ok_or(PagerError::PageNotFound(self.slots.len() as u32))?;

        let page = AlignedPage::zeroed(self.page_size as usize);
        self.slots[pos] = Slot::Loaded(page);
        trace!("allocated page {pos}");

        match &mut self.slots[pos] {
            Slot::Loaded(page) => Ok((pos as u32, page.as_bytes_mut())),
            _ => unreachable!("just set"),
        }
    }

    /// Writes the cached buffer for `idx` back to the file and msyncs.
    pub fn flush_page(&mut self, idx: u32) -> Result<(), PagerError> {
        let i = idx as usize;
        if let Some(Slot::Loaded(page)) = self.slots.get(i) {
            self.mmap_write(idx, page.as_bytes())?;
        }
        Ok(())
    }

    /// Zeroes, flushes, and frees page `idx`, making it available for
    /// reuse by a future `next_empty_page`.
    pub fn reclaim_page(&mut self, idx: u32) -> Result<(), PagerError> {
        let i = idx as usize;
        if i >= self.slots.len() {
            return Err(PagerError::PageNotFound(idx));
        }

        let zero = AlignedPage::zeroed(self.page_size as usize);
        self.mmap_write(idx, zero.as_bytes())?;
        self.slots[i] = Slot::Vacant;
        trace!("reclaimed page {idx}");
        Ok(())
    }

    /// Flushes every cached (loaded) page back to disk, without
    /// discarding the in-memory copies.
    pub fn flush_all(&mut self) -> Result<(), PagerError> {
        for i in 0..self.slots.len() {
            if matches!(self.slots[i], Slot::Loaded(_)) {
                self.flush_page(i as u32)?;
            }
        }
        Ok(())
    }

    /// One past the highest allocated page index; what a meta record's
    /// `max_page` field should hold after a commit.
    pub fn high_water_mark(&self) -> u32 {
        self.slots
            .iter()
            .rposition(|s| !matches!(s, Slot::Vacant))
            .map(|i| i as u32 + 1)
            .unwrap_or(0)
    }

    /// Drops every cached buffer, forcing the next access to reload from
    /// disk. Used to discard a rolled-back write transaction's in-memory
    /// mutations, since this pager applies writes directly to cached
    /// buffers rather than through a separate shadow-copy staging area.
    pub fn discard_cache(&mut self) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::Loaded(_)) {
                *slot = Slot::Unloaded;
            }
        }
    }

    /// Flushes every cached page. Used when finally closing the file.
    pub fn close(&mut self) -> Result<(), PagerError> {
        self.flush_all()
    }

    fn ensure_file_len(&self, needed: u64) -> io::Result<()> {
        let len = self.file.metadata()?.len();
        if len < needed {
            self.file.set_len(needed)?;
        }
        Ok(())
    }

    fn mmap_read(&self, idx: u32) -> Result<AlignedPage, PagerError> {
        let page_size = self.page_size as u64;
        let offset = idx as u64 * page_size;
        let granularity = host_granularity();
        let aligned = (offset / granularity) * granularity;
        let delta = (offset - aligned) as usize;
        let map_len = page_size as usize + delta;

        self.ensure_file_len(offset + page_size)?;
        let mmap = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(map_len)
                .map(&self.file)?
        };

        let mut page = AlignedPage::zeroed(page_size as usize);
        page.as_bytes_mut()
            .copy_from_slice(&mmap[delta..delta + page_size as usize]);
        Ok(page)
    }

    fn mmap_write(&self, idx: u32, data: &[u8]) -> Result<(), PagerError> {
        let page_size = self.page_size as u64;
        let offset = idx as u64 * page_size;
        let granularity = host_granularity();
        let aligned = (offset / granularity) * granularity;
        let delta = (offset - aligned) as usize;
        let map_len = page_size as usize + delta;

        self.ensure_file_len(offset + page_size)?;
        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(map_len)
                .map_mut(&self.file)?
        };
        mmap[delta..delta + page_size as usize].copy_from_slice(data);
        mmap.flush()?;
        Ok(())
    }
}

fn host_granularity() -> u64 {
    page_size::get() as u64
}
