use thiserror::Error;

use crate::address::DbAddress;

/// Errors surfaced by the storage engine.
///
/// Most variants are fatal to the batch that raised them: a [`DbError::StaleRead`] or
/// [`DbError::CorruptedPage`] means the in-memory state can no longer be trusted, and the
/// caller should discard the offending batch. [`DbError::CapacityExceeded`] is the one
/// exception - it is used internally as a promotion signal and should never escape a fully
/// implemented page type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// A page's header `batch_id` is newer than the reading batch's own id.
    #[error("stale read: page at {addr:?} has batch_id {page_batch_id}, reader batch_id is {reader_batch_id}")]
    StaleRead {
        addr: DbAddress,
        page_batch_id: u32,
        reader_batch_id: u32,
    },

    /// A page's header carries an unrecognized version or type, or an invariant was found
    /// violated while traversing it (e.g. a null bucket reached after a non-null check).
    #[error("corrupted page at {addr:?}: {reason}")]
    CorruptedPage { addr: DbAddress, reason: &'static str },

    /// The allocation frontier has run out of addressable pages.
    #[error("out of address space: allocation frontier reached {0}")]
    OutOfAddressSpace(u32),

    /// A slotted map could not absorb a write even after every local promotion was
    /// exhausted. Should only ever be observed internally during a promotion cascade.
    #[error("capacity exceeded: could not fit {needed} bytes even after promotion")]
    CapacityExceeded { needed: usize },

    /// `begin(hash)` was called with a hash that is neither in the proposed-batch chain nor
    /// the committed on-disk root.
    #[error("snapshot not found for state hash {0:x?}")]
    SnapshotNotFound([u8; 32]),

    /// A key's nibble path is longer than [`crate::nibble::NibblePath::encode_key`] can encode.
    #[error("key too long: {nibbles} nibbles exceeds the {max} nibble limit")]
    KeyTooLong { nibbles: usize, max: usize },

    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),

    /// Couldn't lock the backing file for exclusive access.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),

    /// Couldn't synchronize the backing file or memory map to disk.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),

    /// Couldn't resize the backing file to grow the address space.
    #[error("can't resize the backing file: have {size} bytes, wanted {requested} bytes")]
    ResizeFailed {
        size: u64,
        requested: u64,
        #[source]
        source: std::io::Error,
    },

    /// Couldn't extend the memory map.
    #[error("can't map additional space, tried to get {requested} bytes")]
    MapFailed {
        requested: usize,
        #[source]
        source: std::io::Error,
    },

    /// Root page failed its integrity hash check on load.
    #[error("root page at offset {offset:#x} failed its integrity hash check")]
    HashFailed { offset: u64 },

    /// Other, miscellaneous errors that don't warrant their own variant.
    #[error("{0}")]
    Other(&'static str),
}

pub type DbResult<T> = Result<T, DbError>;
