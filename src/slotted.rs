//! The variable-length key/value map embedded in a page's payload.
//!
//! Grounded in the teacher's two-region page layout (`pages::header::TwoArrayTrailer`,
//! `pages::mod::VarPageIter`/`FixedPageIter`): a small trailer at the end of the region records
//! the number of live entries and the high-water mark of the data area; a slot directory of
//! fixed-size descriptors grows backward from just before the trailer, while variable-length
//! key/value bytes grow forward from the front of the region. The teacher does this with raw
//! pointer iterators directly over mapped memory; here the region is addressed with ordinary
//! slice indexing, which is the appropriate adaptation once the header moved to the front of
//! the page and the slotted region became just one sub-slice of the payload rather than the
//! whole of it.

use crate::error::DbError;

/// Bytes per slot descriptor: `key_len: u16 | val_len: u16 | data_offset: u32`.
const SLOT_SIZE: usize = 8;
/// Bytes in the trailer: `entry_count: u16 | data_end: u16`.
const TRAILER_SIZE: usize = 4;

/// A view over a page sub-region implementing a small append-mostly key/value map.
///
/// Keys and values are arbitrary byte strings; callers that need to store nibble paths should
/// encode them with [`crate::nibble::NibblePath::encode_key`] first so that odd-length paths
/// aren't ambiguous with their packed byte representation.
pub struct SlottedArray<'a> {
    region: &'a mut [u8],
}

impl<'a> SlottedArray<'a> {
    /// Wrap a page sub-region. Does not reset its contents - call [`Self::init`] for a fresh
    /// region.
    ///
    /// # Panics
    /// Panics if `region` is too small to hold the trailer.
    pub fn new(region: &'a mut [u8]) -> Self {
        assert!(region.len() >= TRAILER_SIZE, "slotted array region too small");
        Self { region }
    }

    /// Reset the region to empty. Must be called once on a freshly allocated or cleared page
    /// before any other operation.
    pub fn init(&mut self) {
        self.set_trailer(0, 0);
    }

    fn trailer(&self) -> (u16, u16) {
        let l = self.region.len();
        let b = &self.region[l - TRAILER_SIZE..];
        let entry_count = u16::from_le_bytes([b[0], b[1]]);
        let data_end = u16::from_le_bytes([b[2], b[3]]);
        (entry_count, data_end)
    }

    fn set_trailer(&mut self, entry_count: u16, data_end: u16) {
        let l = self.region.len();
        let b = &mut self.region[l - TRAILER_SIZE..];
        b[0..2].copy_from_slice(&entry_count.to_le_bytes());
        b[2..4].copy_from_slice(&data_end.to_le_bytes());
    }

    fn slot_offset(&self, i: usize) -> usize {
        self.region.len() - TRAILER_SIZE - (i + 1) * SLOT_SIZE
    }

    fn read_slot(&self, i: usize) -> (u16, u16, u32) {
        let off = self.slot_offset(i);
        let b = &self.region[off..off + SLOT_SIZE];
        let key_len = u16::from_le_bytes([b[0], b[1]]);
        let val_len = u16::from_le_bytes([b[2], b[3]]);
        let data_offset = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
        (key_len, val_len, data_offset)
    }

    fn write_slot(&mut self, i: usize, key_len: u16, val_len: u16, data_offset: u32) {
        let off = self.slot_offset(i);
        let b = &mut self.region[off..off + SLOT_SIZE];
        b[0..2].copy_from_slice(&key_len.to_le_bytes());
        b[2..4].copy_from_slice(&val_len.to_le_bytes());
        b[4..8].copy_from_slice(&data_offset.to_le_bytes());
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.trailer().0 as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available for a new entry's key+value data plus its slot descriptor, assuming no
    /// existing entry is being overwritten in place.
    pub fn free_space(&self) -> usize {
        let (entry_count, data_end) = self.trailer();
        let slot_area_start = self.region.len() - TRAILER_SIZE - (entry_count as usize) * SLOT_SIZE;
        slot_area_start.saturating_sub(data_end as usize)
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        (0..self.len()).find(|&i| {
            let (key_len, _, data_offset) = self.read_slot(i);
            let start = data_offset as usize;
            &self.region[start..start + key_len as usize] == key
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let i = self.find(key)?;
        let (key_len, val_len, data_offset) = self.read_slot(i);
        let start = data_offset as usize + key_len as usize;
        Some(&self.region[start..start + val_len as usize])
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Insert or overwrite `key` with `value`.
    ///
    /// Overwriting an existing key discards its old data-area bytes rather than reusing them in
    /// place (the data area is append-only); repeated overwrites of the same key will eventually
    /// report [`DbError::CapacityExceeded`] even though the logical entry count didn't grow,
    /// which is by design - it's the signal the page layer uses to trigger promotion or a cache
    /// flush rather than attempting in-page compaction.
    pub fn try_set(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        if let Some(i) = self.find(key) {
            self.delete_at(i);
        }
        let needed = key.len() + value.len();
        if needed > u16::MAX as usize || self.free_space() < needed + SLOT_SIZE {
            return Err(DbError::CapacityExceeded { needed });
        }
        let (entry_count, data_end) = self.trailer();
        let data_offset = data_end as u32;
        let start = data_end as usize;
        self.region[start..start + key.len()].copy_from_slice(key);
        self.region[start + key.len()..start + key.len() + value.len()].copy_from_slice(value);
        self.write_slot(entry_count as usize, key.len() as u16, value.len() as u16, data_offset);
        self.set_trailer(entry_count + 1, data_end + needed as u16);
        Ok(())
    }

    fn delete_at(&mut self, i: usize) {
        let count = self.len();
        for j in i..count - 1 {
            let (kl, vl, off) = self.read_slot(j + 1);
            self.write_slot(j, kl, vl, off);
        }
        let (_, data_end) = self.trailer();
        self.set_trailer((count - 1) as u16, data_end);
    }

    /// Remove `key` if present. Returns whether it was found.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.find(key) {
            Some(i) => {
                self.delete_at(i);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.len()).map(move |i| {
            let (kl, vl, off) = self.read_slot(i);
            let start = off as usize;
            (&self.region[start..start + kl as usize], &self.region[start + kl as usize..start + kl as usize + vl as usize])
        })
    }

    /// Total bytes of key+value payload spanned by live entries (for deciding when it's worth
    /// rebuilding a fragmented region into a fresh one).
    pub fn live_data_bytes(&self) -> usize {
        self.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// Read-only counterpart to [`SlottedArray`], for lookups that only have an immutable borrow
/// of the page (e.g. reading through a shared [`crate::batch::PageSource`]).
pub struct SlottedArrayRef<'a> {
    region: &'a [u8],
}

impl<'a> SlottedArrayRef<'a> {
    pub fn new(region: &'a [u8]) -> Self {
        assert!(region.len() >= TRAILER_SIZE, "slotted array region too small");
        Self { region }
    }

    fn trailer(&self) -> (u16, u16) {
        let l = self.region.len();
        let b = &self.region[l - TRAILER_SIZE..];
        let entry_count = u16::from_le_bytes([b[0], b[1]]);
        let data_end = u16::from_le_bytes([b[2], b[3]]);
        (entry_count, data_end)
    }

    fn slot_offset(&self, i: usize) -> usize {
        self.region.len() - TRAILER_SIZE - (i + 1) * SLOT_SIZE
    }

    fn read_slot(&self, i: usize) -> (u16, u16, u32) {
        let off = self.slot_offset(i);
        let b = &self.region[off..off + SLOT_SIZE];
        let key_len = u16::from_le_bytes([b[0], b[1]]);
        let val_len = u16::from_le_bytes([b[2], b[3]]);
        let data_offset = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
        (key_len, val_len, data_offset)
    }

    pub fn len(&self) -> usize {
        self.trailer().0 as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        (0..self.len()).find(|&i| {
            let (key_len, _, data_offset) = self.read_slot(i);
            let start = data_offset as usize;
            &self.region[start..start + key_len as usize] == key
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let i = self.find(key)?;
        let (key_len, val_len, data_offset) = self.read_slot(i);
        let start = data_offset as usize + key_len as usize;
        Some(&self.region[start..start + val_len as usize])
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.len()).map(move |i| {
            let (kl, vl, off) = self.read_slot(i);
            let start = off as usize;
            (&self.region[start..start + kl as usize], &self.region[start + kl as usize..start + kl as usize + vl as usize])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn set_get_delete_round_trip() {
        let mut buf = region(512);
        let mut arr = SlottedArray::new(&mut buf);
        arr.init();
        arr.try_set(b"hello", b"world").unwrap();
        arr.try_set(b"foo", b"bar").unwrap();
        assert_eq!(arr.get(b"hello"), Some(&b"world"[..]));
        assert_eq!(arr.get(b"foo"), Some(&b"bar"[..]));
        assert_eq!(arr.get(b"missing"), None);
        assert!(arr.delete(b"hello"));
        assert_eq!(arr.get(b"hello"), None);
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let mut buf = region(512);
        let mut arr = SlottedArray::new(&mut buf);
        arr.init();
        arr.try_set(b"k", b"v1").unwrap();
        arr.try_set(b"k", b"v2").unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr.get(b"k"), Some(&b"v2"[..]));
    }

    #[test]
    fn capacity_exceeded_when_full() {
        let mut buf = region(64);
        let mut arr = SlottedArray::new(&mut buf);
        arr.init();
        let mut count = 0;
        loop {
            let key = format!("k{count}").into_bytes();
            match arr.try_set(&key, b"x") {
                Ok(()) => count += 1,
                Err(DbError::CapacityExceeded { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(count > 0);
    }
}
