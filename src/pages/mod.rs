//! Page-type dispatch: the single recursive tree-walk, re-architected as a tagged variant over
//! [`PageType`] rather than a trait-object hierarchy. Each page type module (`data`, `leaf`,
//! `merkle`, `abandoned`) implements the narrow operation set a page of that type supports; this
//! module is where the header's `page_type` decides which one runs.

pub mod abandoned;
pub mod data;
pub mod leaf;
pub mod merkle;

use crate::batch::{PageSource, WriteBatch};
use crate::error::{DbError, DbResult};
use crate::nibble::NibblePath;
use crate::page::{Page, PageType};
use crate::DbAddress;

/// Look up `path` starting from the page at `addr`. Works against either a
/// [`ReadBatch`](crate::batch::ReadBatch) or a [`WriteBatch`] via [`PageSource`].
pub fn get(source: &dyn PageSource, addr: DbAddress, path: NibblePath) -> DbResult<Option<Vec<u8>>> {
    if addr.is_null() {
        return Ok(None);
    }
    let page = source.get_at(addr)?;
    dispatch_get(source, addr, &page, path)
}

pub(crate) fn dispatch_get(source: &dyn PageSource, addr: DbAddress, page: &Page, path: NibblePath) -> DbResult<Option<Vec<u8>>> {
    match page.header().page_type() {
        // `Identity` (the contract-id map) and `FanOut` share the radix data page's layout
        // exactly; neither carries any structural difference from `Standard`.
        Some(PageType::Standard) | Some(PageType::Identity) | Some(PageType::FanOut) => data::get(source, page, path),
        Some(PageType::Leaf) => leaf::get(source, page, path),
        Some(PageType::LeafOverflow) => leaf::get_overflow(page, path),
        Some(PageType::MerkleFanOut) => merkle::get_fanout(source, page, path),
        Some(PageType::MerkleLeaf) => merkle::get_leaf(page, path),
        other => Err(DbError::CorruptedPage { addr, reason: page_type_reason(other) }),
    }
}

/// Insert or overwrite `value` at `path`, starting from the page at `*addr`. If `*addr` is
/// null, a fresh `Leaf` page is allocated. `*addr` is updated in place to the (possibly new)
/// address of the subtree root, which may change across a promotion or copy-on-write.
pub fn set(batch: &mut WriteBatch, addr: &mut DbAddress, level: u8, path: NibblePath, value: &[u8]) -> DbResult<()> {
    if addr.is_null() {
        // Deleting an absent key against an empty subtree is a no-op: don't allocate a leaf
        // just to immediately hold nothing.
        if value.is_empty() {
            return Ok(());
        }
        let (new_addr, mut page) = batch.get_new_page(PageType::Leaf, level)?;
        leaf::init(&mut page);
        batch.put(new_addr, page.clone());
        *addr = leaf::set(batch, new_addr, &page, path, value, level)?;
        return Ok(());
    }
    let page = batch.get_at(*addr)?;
    *addr = dispatch_set(batch, *addr, &page, path, value, level)?;
    Ok(())
}

pub(crate) fn dispatch_set(
    batch: &mut WriteBatch,
    addr: DbAddress,
    page: &Page,
    path: NibblePath,
    value: &[u8],
    level: u8,
) -> DbResult<DbAddress> {
    match page.header().page_type() {
        Some(PageType::Standard) | Some(PageType::Identity) | Some(PageType::FanOut) => {
            data::set(batch, addr, page, path, value, level)
        }
        Some(PageType::Leaf) => leaf::set(batch, addr, page, path, value, level),
        Some(PageType::LeafOverflow) => leaf::set_overflow(batch, addr, page, path, value),
        Some(PageType::MerkleFanOut) => merkle::set_fanout(batch, addr, page, path, value, level),
        Some(PageType::MerkleLeaf) => merkle::set_leaf(batch, addr, page, path, value),
        other => Err(DbError::CorruptedPage { addr, reason: page_type_reason(other) }),
    }
}

/// Remove every entry whose key starts with `prefix`, starting from the page at `*addr`.
/// Leaves `*addr` null if the subtree becomes empty.
pub fn delete_by_prefix(batch: &mut WriteBatch, addr: &mut DbAddress, prefix: NibblePath) -> DbResult<()> {
    if addr.is_null() {
        return Ok(());
    }
    let page = batch.get_at(*addr)?;
    *addr = dispatch_delete_by_prefix(batch, *addr, &page, prefix)?;
    Ok(())
}

pub(crate) fn dispatch_delete_by_prefix(
    batch: &mut WriteBatch,
    addr: DbAddress,
    page: &Page,
    prefix: NibblePath,
) -> DbResult<DbAddress> {
    match page.header().page_type() {
        Some(PageType::Standard) | Some(PageType::Identity) | Some(PageType::FanOut) => {
            data::delete_by_prefix(batch, addr, page, prefix)
        }
        Some(PageType::Leaf) => leaf::delete_by_prefix(batch, addr, page, prefix),
        Some(PageType::LeafOverflow) => leaf::delete_by_prefix_overflow(batch, addr, page, prefix),
        Some(PageType::MerkleFanOut) => merkle::delete_by_prefix_fanout(batch, addr, page, prefix),
        Some(PageType::MerkleLeaf) => merkle::delete_by_prefix_leaf(batch, addr, page, prefix),
        other => Err(DbError::CorruptedPage { addr, reason: page_type_reason(other) }),
    }
}

fn page_type_reason(found: Option<PageType>) -> &'static str {
    match found {
        None => "unrecognized page type tag",
        Some(_) => "page type not valid at this tree position",
    }
}
