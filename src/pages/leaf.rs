//! `Leaf` and `LeafOverflow` page types: a flat slotted-array leaf that chains to at most one
//! sibling before promoting into a [`super::data`] radix page.
//!
//! Both page types share the same payload layout - a [`SlottedArray`] spanning all but the last
//! four bytes, which hold a `sibling: DbAddress` pointer (unused on a `LeafOverflow`, since a
//! leaf only ever grows one level of sibling before promoting). The routing predicate used to
//! decide which entries migrate to the sibling on a split is the XOR parity of every nibble in
//! the key; lookups don't trust that predicate exclusively, they check the primary page first
//! and only fall back to the sibling, which stays correct across the transient period before a
//! split has happened and every key still lives on the primary page.

use byteorder::{ByteOrder, LittleEndian};

use crate::batch::{PageSource, WriteBatch};
use crate::error::DbResult;
use crate::nibble::{self, NibblePath, OwnedNibblePath};
use crate::page::{Page, PageType, PAYLOAD_SIZE};
use crate::slotted::{SlottedArray, SlottedArrayRef};
use crate::DbAddress;

use super::data;

const SIBLING_OFFSET: usize = PAYLOAD_SIZE - 4;

fn leaf_region(page: &Page) -> &[u8] {
    &page.payload()[..SIBLING_OFFSET]
}

fn leaf_region_mut(page: &mut Page) -> &mut [u8] {
    &mut page.payload_mut()[..SIBLING_OFFSET]
}

fn sibling(page: &Page) -> DbAddress {
    DbAddress::new(LittleEndian::read_u32(&page.payload()[SIBLING_OFFSET..SIBLING_OFFSET + 4]))
}

fn set_sibling(page: &mut Page, addr: DbAddress) {
    LittleEndian::write_u32(&mut page.payload_mut()[SIBLING_OFFSET..SIBLING_OFFSET + 4], addr.raw());
}

pub fn init(page: &mut Page) {
    page.payload_mut().fill(0);
    SlottedArray::new(leaf_region_mut(page)).init();
}

/// `true` if `path` belongs on the primary page rather than its sibling.
fn belongs_here(path: &NibblePath) -> bool {
    let parity = (0..path.len()).fold(0u8, |acc, i| acc ^ path.get_at(i));
    parity & 1 == 0
}

pub fn get(source: &dyn PageSource, page: &Page, path: NibblePath) -> DbResult<Option<Vec<u8>>> {
    let key = path.encode_key();
    let arr = SlottedArrayRef::new(leaf_region(page));
    if let Some(v) = arr.get(&key) {
        return Ok(Some(v.to_vec()));
    }
    let sib = sibling(page);
    if sib.is_null() {
        return Ok(None);
    }
    let sib_page = source.get_at(sib)?;
    get_overflow(&sib_page, path)
}

pub fn get_overflow(page: &Page, path: NibblePath) -> DbResult<Option<Vec<u8>>> {
    let key = path.encode_key();
    let arr = SlottedArrayRef::new(leaf_region(page));
    Ok(arr.get(&key).map(|v| v.to_vec()))
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
    let key = path.encode_key();

    if value.is_empty() {
        let found_locally = {
            let mut arr = SlottedArray::new(leaf_region_mut(&mut page));
            arr.delete(&key)
        };
        if !found_locally {
            let sib = sibling(&page);
            if !sib.is_null() {
                let sib_page = batch.get_at(sib)?;
                let (new_sib, mut sib_page) = batch.get_writable_copy(sib, &sib_page)?;
                let mut arr = SlottedArray::new(leaf_region_mut(&mut sib_page));
                arr.delete(&key);
                let sib_empty = arr.is_empty();
                drop(arr);
                if sib_empty {
                    batch.register_for_future_reuse(new_sib, batch.was_written(new_sib));
                    set_sibling(&mut page, DbAddress::NULL);
                } else {
                    batch.put(new_sib, sib_page);
                    if new_sib != sib {
                        set_sibling(&mut page, new_sib);
                    }
                }
            }
        }
        let local_empty = SlottedArrayRef::new(leaf_region(&page)).is_empty();
        if local_empty && sibling(&page).is_null() {
            batch.register_for_future_reuse(new_addr, batch.was_written(new_addr));
            return Ok(DbAddress::NULL);
        }
        batch.put(new_addr, page);
        return Ok(new_addr);
    }

    if belongs_here(&path) {
        let result = {
            let mut arr = SlottedArray::new(leaf_region_mut(&mut page));
            arr.try_set(&key, value)
        };
        match result {
            Ok(()) => {
                batch.put(new_addr, page);
                Ok(new_addr)
            }
            Err(_capacity) => split_or_promote(batch, level, new_addr, page, path, value),
        }
    } else {
        let sib = sibling(&page);
        if sib.is_null() {
            // No split has happened yet; everything still lives on the primary page.
            let result = {
                let mut arr = SlottedArray::new(leaf_region_mut(&mut page));
                arr.try_set(&key, value)
            };
            match result {
                Ok(()) => {
                    batch.put(new_addr, page);
                    Ok(new_addr)
                }
                Err(_capacity) => split_or_promote(batch, level, new_addr, page, path, value),
            }
        } else {
            let sib_page = batch.get_at(sib)?;
            // Check capacity against a scratch copy first, so a doomed insert never burns a
            // freshly copy-on-written sibling page that would otherwise go unreferenced.
            let would_fit = {
                let mut scratch = sib_page.clone();
                SlottedArray::new(leaf_region_mut(&mut scratch)).try_set(&key, value).is_ok()
            };
            if would_fit {
                let (new_sib, mut sib_page_copy) = batch.get_writable_copy(sib, &sib_page)?;
                SlottedArray::new(leaf_region_mut(&mut sib_page_copy))
                    .try_set(&key, value)
                    .expect("capacity already checked against a scratch copy");
                batch.put(new_sib, sib_page_copy);
                if new_sib != sib {
                    set_sibling(&mut page, new_sib);
                    batch.put(new_addr, page);
                }
                Ok(new_addr)
            } else {
                promote_to_data_page(batch, level, new_addr, page, Some((sib, sib_page)), path, value)
            }
        }
    }
}

/// Called when `primary` (already a writable copy at `primary_addr`) rejected an insert. If it
/// has no sibling yet, split: allocate one, migrate every locally-held entry whose parity
/// chooses the sibling, and retry. If it already has a sibling, the split is exhausted and the
/// subtree promotes to a [`super::data`] page instead.
fn split_or_promote(
    batch: &mut WriteBatch,
    level: u8,
    primary_addr: DbAddress,
    mut primary: Page,
    path: NibblePath,
    value: &[u8],
) -> DbResult<DbAddress> {
    let existing_sib = sibling(&primary);
    if !existing_sib.is_null() {
        let sib_page = batch.get_at(existing_sib)?;
        return promote_to_data_page(batch, level, primary_addr, primary, Some((existing_sib, sib_page)), path, value);
    }

    let (sib_addr, mut sib_page) = batch.get_new_page(PageType::LeafOverflow, primary.header().level)?;
    init(&mut sib_page);

    let migrating: Vec<(Vec<u8>, Vec<u8>)> = {
        let arr = SlottedArrayRef::new(leaf_region(&primary));
        arr.iter()
            .filter(|(k, _)| {
                let decoded = nibble::decode_key(k);
                !belongs_here(&decoded.as_path())
            })
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    };
    {
        let mut primary_arr = SlottedArray::new(leaf_region_mut(&mut primary));
        let mut sib_arr = SlottedArray::new(leaf_region_mut(&mut sib_page));
        for (k, v) in &migrating {
            primary_arr.delete(k);
            // The sibling is a fresh page with the same capacity as the primary was, so a
            // strict subset of the primary's entries always fits.
            sib_arr.try_set(k, v).expect("migrated subset must fit a freshly allocated sibling");
        }
    }
    batch.put(sib_addr, sib_page.clone());

    if belongs_here(&path) {
        let key = path.encode_key();
        let mut arr = SlottedArray::new(leaf_region_mut(&mut primary));
        match arr.try_set(&key, value) {
            Ok(()) => {
                drop(arr);
                set_sibling(&mut primary, sib_addr);
                batch.put(primary_addr, primary);
                Ok(primary_addr)
            }
            Err(_) => {
                drop(arr);
                promote_to_data_page(batch, level, primary_addr, primary, Some((sib_addr, sib_page)), path, value)
            }
        }
    } else {
        let key = path.encode_key();
        let mut arr = SlottedArray::new(leaf_region_mut(&mut sib_page));
        match arr.try_set(&key, value) {
            Ok(()) => {
                drop(arr);
                set_sibling(&mut primary, sib_addr);
                batch.put(primary_addr, primary.clone());
                batch.put(sib_addr, sib_page);
                Ok(primary_addr)
            }
            Err(_) => {
                drop(arr);
                set_sibling(&mut primary, sib_addr);
                promote_to_data_page(batch, level, primary_addr, primary, Some((sib_addr, sib_page)), path, value)
            }
        }
    }
}

pub fn set_overflow(batch: &mut WriteBatch, addr: DbAddress, page: &Page, path: NibblePath, value: &[u8]) -> DbResult<DbAddress> {
    let (new_addr, mut page) = batch.get_writable_copy(addr, page)?;
    let key = path.encode_key();
    {
        let mut arr = SlottedArray::new(leaf_region_mut(&mut page));
        if value.is_empty() {
            arr.delete(&key);
        } else {
            arr.try_set(&key, value)?;
        }
    }
    batch.put(new_addr, page);
    Ok(new_addr)
}

fn collect_entries(page: &Page, out: &mut Vec<(OwnedNibblePath, Vec<u8>)>) {
    let arr = SlottedArrayRef::new(leaf_region(page));
    for (k, v) in arr.iter() {
        out.push((nibble::decode_key(k), v.to_vec()));
    }
}

fn promote_to_data_page(
    batch: &mut WriteBatch,
    level: u8,
    primary_addr: DbAddress,
    primary: Page,
    sibling: Option<(DbAddress, Page)>,
    extra_path: NibblePath,
    extra_value: &[u8],
) -> DbResult<DbAddress> {
    let (data_addr, mut data_page) = batch.get_new_page(PageType::Standard, level)?;
    data::init(&mut data_page);
    batch.put(data_addr, data_page.clone());

    let mut entries = Vec::new();
    collect_entries(&primary, &mut entries);
    if let Some((_, sib_page)) = &sibling {
        collect_entries(sib_page, &mut entries);
    }

    let mut current_addr = data_addr;
    for (owned_path, val) in &entries {
        let current_page = batch.get_at(current_addr)?;
        current_addr = data::set(batch, current_addr, &current_page, owned_path.as_path(), val, level)?;
    }
    let current_page = batch.get_at(current_addr)?;
    current_addr = data::set(batch, current_addr, &current_page, extra_path, extra_value, level)?;

    batch.register_for_future_reuse(primary_addr, batch.was_written(primary_addr));
    if let Some((sib_addr, _)) = sibling {
        batch.register_for_future_reuse(sib_addr, batch.was_written(sib_addr));
    }

    Ok(current_addr)
}

pub fn delete_by_prefix(batch: &mut WriteBatch, addr: DbAddress, page: &Page, prefix: NibblePath) -> DbResult<DbAddress> {
    let (new_addr, mut page) = batch.get_writable_copy(addr, page)?;
    delete_matching(&mut page, &prefix);

    let sib = sibling(&page);
    let mut new_sib = sib;
    if !sib.is_null() {
        let sib_page = batch.get_at(sib)?;
        let (sib_addr2, mut sib_page2) = batch.get_writable_copy(sib, &sib_page)?;
        delete_matching(&mut sib_page2, &prefix);
        let sib_arr = SlottedArrayRef::new(leaf_region(&sib_page2));
        if sib_arr.is_empty() {
            batch.register_for_future_reuse(sib_addr2, batch.was_written(sib_addr2));
            new_sib = DbAddress::NULL;
        } else {
            batch.put(sib_addr2, sib_page2);
            new_sib = sib_addr2;
        }
    }
    set_sibling(&mut page, new_sib);

    let local_arr = SlottedArrayRef::new(leaf_region(&page));
    if local_arr.is_empty() && new_sib.is_null() {
        batch.register_for_future_reuse(new_addr, batch.was_written(new_addr));
        return Ok(DbAddress::NULL);
    }
    batch.put(new_addr, page);
    Ok(new_addr)
}

pub fn delete_by_prefix_overflow(batch: &mut WriteBatch, addr: DbAddress, page: &Page, prefix: NibblePath) -> DbResult<DbAddress> {
    let (new_addr, mut page) = batch.get_writable_copy(addr, page)?;
    delete_matching(&mut page, &prefix);
    let arr = SlottedArrayRef::new(leaf_region(&page));
    if arr.is_empty() {
        batch.register_for_future_reuse(new_addr, batch.was_written(new_addr));
        return Ok(DbAddress::NULL);
    }
    batch.put(new_addr, page);
    Ok(new_addr)
}

fn delete_matching(page: &mut Page, prefix: &NibblePath) {
    let stale: Vec<Vec<u8>> = {
        let arr = SlottedArrayRef::new(leaf_region(page));
        arr.iter()
            .filter(|(k, _)| {
                if prefix.is_empty() {
                    return true;
                }
                let decoded = nibble::decode_key(k);
                let p = decoded.as_path();
                p.len() >= prefix.len() && (0..prefix.len()).all(|i| p.get_at(i) == prefix.get_at(i))
            })
            .map(|(k, _)| k.to_vec())
            .collect()
    };
    let mut arr = SlottedArray::new(leaf_region_mut(page));
    for k in stale {
        arr.delete(&k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemPageManager;
    use crate::root::AbandonedList;
    use std::sync::Arc;

    fn fresh_batch() -> WriteBatch {
        let manager: Arc<dyn crate::manager::PageManager> = Arc::new(MemPageManager::new(4));
        WriteBatch::new(1, 0, manager, DbAddress::new(2), AbandonedList::default())
    }

    #[test]
    fn set_get_round_trip() {
        let mut batch = fresh_batch();
        let (addr, mut page) = batch.get_new_page(PageType::Leaf, 0).unwrap();
        init(&mut page);
        batch.put(addr, page.clone());

        let key = [0x12, 0x34];
        let path = NibblePath::from_bytes(&key);
        let new_addr = set(&mut batch, addr, &page, path, b"value", 0).unwrap();
        let page = batch.get_at(new_addr).unwrap();
        assert_eq!(get(&batch, &page, NibblePath::from_bytes(&key)).unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn delete_removes_entry() {
        let mut batch = fresh_batch();
        let (addr, mut page) = batch.get_new_page(PageType::Leaf, 0).unwrap();
        init(&mut page);
        batch.put(addr, page.clone());

        let key = [0xAA];
        let path = NibblePath::from_bytes(&key);
        let addr = set(&mut batch, addr, &page, path, b"v", 0).unwrap();
        let page = batch.get_at(addr).unwrap();
        let addr = set(&mut batch, addr, &page, NibblePath::from_bytes(&key), b"", 0).unwrap();
        let page = batch.get_at(addr).unwrap();
        assert_eq!(get(&batch, &page, NibblePath::from_bytes(&key)).unwrap(), None);
    }
}
