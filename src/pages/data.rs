//! `Standard` (and `Identity`, which shares this layout) page type: a 256-entry radix fan-out
//! indexed by two nibbles, with the remainder of the payload used as a slotted-array cache for
//! keys too short to address a bucket.

use crate::address::{packed_bytes, DbAddressList, DbAddressListRef};
use crate::batch::{PageSource, WriteBatch};
use crate::error::{DbError, DbResult};
use crate::nibble::{self, NibblePath};
use crate::page::{Page, PageType, PAYLOAD_SIZE};
use crate::slotted::{SlottedArray, SlottedArrayRef};
use crate::DbAddress;

/// Nibbles consumed by one level of this page's fan-out table.
pub const CONSUMED_NIBBLES: usize = 2;
const FANOUT_ARITY: usize = 256;
const FANOUT_BYTES: usize = packed_bytes(FANOUT_ARITY);

fn bucket_index(path: &NibblePath) -> usize {
    (path.get_at(0) as usize) * 16 + path.get_at(1) as usize
}

fn fanout_bytes(page: &Page) -> &[u8] {
    &page.payload()[..FANOUT_BYTES]
}

fn fanout_bytes_mut(page: &mut Page) -> &mut [u8] {
    &mut page.payload_mut()[..FANOUT_BYTES]
}

fn cache_region(page: &Page) -> &[u8] {
    &page.payload()[FANOUT_BYTES..]
}

fn cache_region_mut(page: &mut Page) -> &mut [u8] {
    &mut page.payload_mut()[FANOUT_BYTES..]
}

pub fn init(page: &mut Page) {
    page.payload_mut()[..FANOUT_BYTES].fill(0);
    SlottedArray::new(cache_region_mut(page)).init();
}

pub fn get(source: &dyn PageSource, page: &Page, path: NibblePath) -> DbResult<Option<Vec<u8>>> {
    if path.len() < CONSUMED_NIBBLES {
        let cache = SlottedArrayRef::new(cache_region(page));
        return Ok(cache.get(&path.encode_key()).map(|v| v.to_vec()));
    }
    let fanout = DbAddressListRef::new(FANOUT_ARITY, fanout_bytes(page));
    let child_addr = fanout.get(bucket_index(&path));
    if child_addr.is_null() {
        return Ok(None);
    }
    let child = source.get_at(child_addr)?;
    super::dispatch_get(source, child_addr, &child, path.slice_from(CONSUMED_NIBBLES))
}

pub fn set(
    batch: &mut WriteBatch,
    addr: DbAddress,
    page: &Page,
    path: NibblePath,
    value: &[u8],
    level: u8,
) -> DbResult<DbAddress> {
    let (new_addr, mut page) = batch.get_writable_copy(addr, page)?;

    if path.len() < CONSUMED_NIBBLES {
        let key = path.encode_key();
        let mut cache = SlottedArray::new(cache_region_mut(&mut page));
        if value.is_empty() {
            cache.delete(&key);
        } else {
            // Precondition: keys shorter than the fan-out depth always fit locally.
            cache.try_set(&key, value)?;
        }
        batch.put(new_addr, page);
        return Ok(new_addr);
    }

    let index = bucket_index(&path);
    let sliced = path.slice_from(CONSUMED_NIBBLES);
    let child_level = level.saturating_add(CONSUMED_NIBBLES as u8);

    let mut fanout = DbAddressList::new(FANOUT_ARITY, fanout_bytes_mut(&mut page));
    let mut child_addr = fanout.get(index);
    drop(fanout);

    if child_addr.is_null() {
        // Deleting an absent key under an empty bucket is a no-op: don't allocate a leaf just
        // to immediately hold nothing.
        if value.is_empty() {
            batch.put(new_addr, page);
            return Ok(new_addr);
        }
        let (leaf_addr, mut leaf_page) = batch.get_new_page(PageType::Leaf, child_level)?;
        super::leaf::init(&mut leaf_page);
        batch.put(leaf_addr, leaf_page.clone());
        child_addr = super::leaf::set(batch, leaf_addr, &leaf_page, sliced, value, child_level)?;
    } else {
        let child_page = batch.get_at(child_addr)?;
        child_addr = super::dispatch_set(batch, child_addr, &child_page, sliced, value, child_level)?;
    }

    let mut fanout = DbAddressList::new(FANOUT_ARITY, fanout_bytes_mut(&mut page));
    fanout.set(index, child_addr);
    drop(fanout);

    batch.put(new_addr, page);
    Ok(new_addr)
}

pub fn delete_by_prefix(batch: &mut WriteBatch, addr: DbAddress, page: &Page, prefix: NibblePath) -> DbResult<DbAddress> {
    let (new_addr, mut page) = batch.get_writable_copy(addr, page)?;

    if prefix.len() < CONSUMED_NIBBLES {
        {
            let mut cache = SlottedArray::new(cache_region_mut(&mut page));
            let stale: Vec<Vec<u8>> = cache
                .iter()
                .filter(|(k, _)| starts_with_prefix(*k, &prefix))
                .map(|(k, _)| k.to_vec())
                .collect();
            for k in stale {
                cache.delete(&k);
            }
        }
        let (lo, hi) = bucket_range_for_prefix(&prefix);
        let mut fanout = DbAddressList::new(FANOUT_ARITY, fanout_bytes_mut(&mut page));
        let children: Vec<(usize, DbAddress)> = (lo..hi).map(|i| (i, fanout.get(i))).collect();
        drop(fanout);
        for (i, child_addr) in children {
            if child_addr.is_null() {
                continue;
            }
            let child_page = batch.get_at(child_addr)?;
            let empty_prefix = NibblePath::new(&[], 0, 0);
            let new_child = super::dispatch_delete_by_prefix(batch, child_addr, &child_page, empty_prefix)?;
            let mut fanout = DbAddressList::new(FANOUT_ARITY, fanout_bytes_mut(&mut page));
            fanout.set(i, new_child);
        }
        batch.put(new_addr, page);
        return Ok(new_addr);
    }

    let index = bucket_index(&prefix);
    let sliced = prefix.slice_from(CONSUMED_NIBBLES);
    let mut fanout = DbAddressList::new(FANOUT_ARITY, fanout_bytes_mut(&mut page));
    let child_addr = fanout.get(index);
    drop(fanout);
    if !child_addr.is_null() {
        let child_page = batch.get_at(child_addr)?;
        let new_child = super::dispatch_delete_by_prefix(batch, child_addr, &child_page, sliced)?;
        let mut fanout = DbAddressList::new(FANOUT_ARITY, fanout_bytes_mut(&mut page));
        fanout.set(index, new_child);
    }
    batch.put(new_addr, page);
    Ok(new_addr)
}

fn starts_with_prefix(encoded_key: &[u8], prefix: &NibblePath) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let decoded = nibble::decode_key(encoded_key);
    let path = decoded.as_path();
    if path.len() < prefix.len() {
        return false;
    }
    (0..prefix.len()).all(|i| path.get_at(i) == prefix.get_at(i))
}

/// Range of bucket indices whose keys share `prefix` (which is shorter than [`CONSUMED_NIBBLES`]).
fn bucket_range_for_prefix(prefix: &NibblePath) -> (usize, usize) {
    match prefix.len() {
        0 => (0, FANOUT_ARITY),
        1 => {
            let base = (prefix.get_at(0) as usize) * 16;
            (base, base + 16)
        }
        _ => unreachable!("prefix shorter than CONSUMED_NIBBLES"),
    }
}

const _: () = assert!(PAYLOAD_SIZE > FANOUT_BYTES);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemPageManager;
    use crate::page::PageHeader;
    use crate::root::AbandonedList;
    use std::sync::Arc;

    fn fresh_batch() -> WriteBatch {
        let manager: Arc<dyn crate::manager::PageManager> = Arc::new(MemPageManager::new(4));
        WriteBatch::new(1, 0, manager, DbAddress::new(2), AbandonedList::default())
    }

    #[test]
    fn set_get_through_fanout_and_cache() {
        let mut batch = fresh_batch();
        let (addr, mut page) = batch.get_new_page(PageType::Standard, 0).unwrap();
        init(&mut page);
        batch.put(addr, page.clone());

        let long_key = [0xAB, 0xCD];
        let path = NibblePath::from_bytes(&long_key);
        let new_addr = set(&mut batch, addr, &page, path, b"hello", 0).unwrap();

        let page = batch.get_at(new_addr).unwrap();
        let found = get(&batch, &page, NibblePath::from_bytes(&long_key)).unwrap();
        assert_eq!(found, Some(b"hello".to_vec()));
    }

    #[test]
    fn short_key_goes_to_local_cache() {
        let mut batch = fresh_batch();
        let (addr, mut page) = batch.get_new_page(PageType::Standard, 0).unwrap();
        init(&mut page);
        batch.put(addr, page.clone());

        let short = NibblePath::new(&[0xA0], 0, 1);
        let new_addr = set(&mut batch, addr, &page, short, b"v", 0).unwrap();
        let page = batch.get_at(new_addr).unwrap();
        let cache = SlottedArrayRef::new(cache_region(&page));
        assert_eq!(cache.len(), 1);
        let found = get(&batch, &page, NibblePath::new(&[0xA0], 0, 1)).unwrap();
        assert_eq!(found, Some(b"v".to_vec()));
    }

    #[test]
    fn dummy_header_roundtrip_sanity() {
        let header = PageHeader::new(1, PageType::Standard, 0);
        assert_eq!(header.page_type(), Some(PageType::Standard));
    }
}
