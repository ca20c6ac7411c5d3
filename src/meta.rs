//! Dual redundant meta pages and the commit protocol built on them.
//!
//! Page 0 and page 1 each hold one [`Meta`] record. The commit protocol
//! always writes the *older* of the two slots, so a crash mid-write leaves
//! the other slot untouched and valid — this alternation is the engine's
//! only crash-safety mechanism, there is no write-ahead log.
//!
//! The selection algorithm (read both, validate by checksum, prefer the
//! higher `txid` among the valid ones) mirrors jammdb's `DBInner::meta()`.

use crc32fast::Hasher;

use crate::error::TransactionError;

pub const META_PAGE_0: u32 = 0;
pub const META_PAGE_1: u32 = 1;
pub const FREELIST_PAGE: u32 = 2;
pub const INITIAL_ROOT_PAGE: u32 = 3;

const META_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub root: u32,
    pub freelist: u32,
    pub max_page: u32,
    pub txid: u64,
    pub checksum: u32,
}

impl Meta {
    fn checksum_of(buf: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(buf);
        hasher.finalize()
    }

    /// Writes this meta (with a freshly computed checksum) to the start
    /// of `page`.
    pub fn write_to(&self, page: &mut [u8]) {
        page[0..4].copy_from_slice(&self.page_size.to_ne_bytes());
        page[4..8].copy_from_slice(&self.root.to_ne_bytes());
        page[8..12].copy_from_slice(&self.freelist.to_ne_bytes());
        page[12..16].copy_from_slice(&self.max_page.to_ne_bytes());
        page[16..24].copy_from_slice(&self.txid.to_ne_bytes());
        let checksum = Self::checksum_of(&page[0..24]);
        page[24..28].copy_from_slice(&checksum.to_ne_bytes());
    }

    /// Reads a meta record from `page`, reporting whether its checksum
    /// validates. An all-zero page (never written) is considered valid
    /// with `checksum == 0`, matching a freshly allocated file.
    pub fn read_from(page: &[u8]) -> (Self, bool) {
        let page_size = u32::from_ne_bytes(page[0..4].try_into().unwrap());
        let root = u32::from_ne_bytes(page[4..8].try_into().unwrap());
        let freelist = u32::from_ne_bytes(page[8..12].try_into().unwrap());
        let max_page = u32::from_ne_bytes(page[12..16].try_into().unwrap());
        let txid = u64::from_ne_bytes(page[16..24].try_into().unwrap());
        let checksum = u32::from_ne_bytes(page[24..28].try_into().unwrap());

        let meta = Self {
            page_size,
            root,
            freelist,
            max_page,
            txid,
            checksum,
        };

        if checksum == 0 && page[0..24].iter().all(|b| *b == 0) {
            return (meta, true);
        }

        let valid = checksum == Self::checksum_of(&page[0..24]);
        (meta, valid)
    }
}

/// Picks the authoritative meta among the two candidate pages, following
/// jammdb's `DBInner::meta()`: prefer the valid one with the higher
/// `txid`; if only one validates, use it; if neither does, the database
/// is unreadable.
pub fn select_meta(
    page0: &[u8],
    page1: &[u8],
) -> Result<(Meta, u32 /* slot holding the older txid */), TransactionError> {
    let (meta0, valid0) = Meta::read_from(page0);
    let (meta1, valid1) = Meta::read_from(page1);

    match (valid0, valid1) {
        (true, true) => {
            if meta0.txid >= meta1.txid {
                Ok((meta0, META_PAGE_1))
            } else {
                Ok((meta1, META_PAGE_0))
            }
        }
        (true, false) => Ok((meta0, META_PAGE_1)),
        (false, true) => Ok((meta1, META_PAGE_0)),
        (false, false) => Err(TransactionError::MetaCorrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = vec![0u8; META_LEN];
        let meta = Meta {
            page_size: 4096,
            root: 3,
            freelist: 2,
            max_page: 4,
            txid: 7,
            checksum: 0,
        };
        meta.write_to(&mut buf);
        let (decoded, valid) = Meta::read_from(&buf);
        assert!(valid);
        assert_eq!(decoded.root, 3);
        assert_eq!(decoded.txid, 7);
    }

    #[test]
    fn corruption_is_detected() {
        let mut buf = vec![0u8; META_LEN];
        let meta = Meta {
            page_size: 4096,
            root: 3,
            freelist: 2,
            max_page: 4,
            txid: 7,
            checksum: 0,
        };
        meta.write_to(&mut buf);
        buf[24] ^= 0xFF;
        let (_, valid) = Meta::read_from(&buf);
        assert!(!valid);
    }

    #[test]
    fn selects_higher_txid_among_valid() {
        let mut buf0 = vec![0u8; META_LEN];
        let mut buf1 = vec![0u8; META_LEN];
        Meta {
            page_size: 4096,
            root: 3,
            freelist: 2,
            max_page: 4,
            txid: 5,
            checksum: 0,
        }
        .write_to(&mut buf0);
        Meta {
            page_size: 4096,
            root: 9,
            freelist: 2,
            max_page: 10,
            txid: 6,
            checksum: 0,
        }
        .write_to(&mut buf1);

        let (selected, older_slot) = select_meta(&buf0, &buf1).unwrap();
        assert_eq!(selected.txid, 6);
        assert_eq!(older_slot, META_PAGE_0);
    }

    #[test]
    fn falls_back_to_valid_meta_when_other_corrupt() {
        let mut buf0 = vec![0u8; META_LEN];
        let mut buf1 = vec![0u8; META_LEN];
        Meta {
            page_size: 4096,
            root: 3,
            freelist: 2,
            max_page: 4,
            txid: 5,
            checksum: 0,
        }
        .write_to(&mut buf0);
        Meta {
            page_size: 4096,
            root: 9,
            freelist: 2,
            max_page: 10,
            txid: 6,
            checksum: 0,
        }
        .write_to(&mut buf1);
        buf1[24] ^= 0xFF;

        let (selected, older_slot) = select_meta(&buf0, &buf1).unwrap();
        assert_eq!(selected.txid, 5);
        assert_eq!(older_slot, META_PAGE_1);
    }

    #[test]
    fn both_invalid_is_fatal() {
        let mut buf0 = vec![0u8; META_LEN];
        let mut buf1 = vec![0u8; META_LEN];
        Meta {
            page_size: 4096,
            root: 3,
            freelist: 2,
            max_page: 4,
            txid: 5,
            checksum: 0,
        }
        .write_to(&mut buf0);
        buf0[24] ^= 0xFF;
        Meta {
            page_size: 4096,
            root: 9,
            freelist: 2,
            max_page: 10,
            txid: 6,
            checksum: 0,
        }
        .write_to(&mut buf1);
        buf1[24] ^= 0xFF;

        assert!(select_meta(&buf0, &buf1).is_err());
    }
}
