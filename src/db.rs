//! The top-level `Database` handle: wires the page-type dispatch in [`crate::pages`] to the
//! commit chain in [`crate::root`], routing every key through the root's 16-way top-level
//! account fan-out before handing off to the radix trie underneath it.
//!
//! Grounded in the teacher's own `OpenOptions` (`lib.rs`): a small builder with `open_anon` and
//! `open` entry points, extended here with the `flush_depth`/`flush_options` knobs this engine's
//! commit chain needs that the teacher's flat allocator had no equivalent for.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{DbError, DbResult};
use crate::manager::{FlushOptions, MemPageManager, MmapPageManager, PageManager};
use crate::nibble::NibblePath;
use crate::pages;
use crate::root::{Chain, Snapshot, ROOT_FANOUT};

/// Default number of batches the commit chain keeps proposed in memory before forcing the
/// oldest one's root onto disk.
pub const DEFAULT_FLUSH_DEPTH: usize = 2;

/// Configuration for opening a [`Database`].
#[derive(Clone, Debug)]
pub struct OpenOptions {
    flush_depth: usize,
    flush_options: FlushOptions,
    initial_pages: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { flush_depth: DEFAULT_FLUSH_DEPTH, flush_options: FlushOptions::FlushDataOnly, initial_pages: 2 }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many proposed batches the chain keeps in memory before flushing the oldest root.
    pub fn flush_depth(mut self, depth: usize) -> Self {
        self.flush_depth = depth;
        self
    }

    /// Durability level requested of each commit.
    pub fn flush_options(mut self, options: FlushOptions) -> Self {
        self.flush_options = options;
        self
    }

    /// Initial page count for an anonymous in-memory database; ignored by [`Self::open`].
    pub fn initial_pages(mut self, pages: usize) -> Self {
        self.initial_pages = pages;
        self
    }

    /// Open an anonymous, purely in-memory database. Useful for tests and ephemeral state.
    pub fn open_anon(self) -> DbResult<Database> {
        let manager: Arc<dyn PageManager> = Arc::new(MemPageManager::new(self.initial_pages));
        Database::from_manager(manager, self.flush_depth, self.flush_options)
    }

    /// Open (creating if necessary) an on-disk database file at `path`.
    pub fn open<P: AsRef<Path>>(self, path: P) -> DbResult<Database> {
        let manager: Arc<dyn PageManager> = Arc::new(MmapPageManager::open(path, 2)?);
        Database::from_manager(manager, self.flush_depth, self.flush_options)
    }
}

/// A versioned, nibble-path-keyed key/value store. Every key is routed through the root's
/// top-level 16-way fan-out (by its first nibble) into the radix trie proper; see
/// [`crate::pages`] for what happens from there.
pub struct Database {
    chain: Chain,
    flush_options: FlushOptions,
}

impl Database {
    fn from_manager(manager: Arc<dyn PageManager>, flush_depth: usize, flush_options: FlushOptions) -> DbResult<Self> {
        let chain = if manager.uses_persistent_paging() {
            Chain::open(manager, flush_depth)?
        } else {
            Chain::fresh(manager, flush_depth)?
        };
        Ok(Self { chain, flush_options })
    }

    /// Open an anonymous, purely in-memory database with default options.
    pub fn open_anon() -> DbResult<Self> {
        OpenOptions::default().open_anon()
    }

    /// Open (creating if necessary) an on-disk database file with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        OpenOptions::default().open(path)
    }

    /// The state hash of the latest state visible to new reads and writes.
    pub fn current_state_hash(&self) -> [u8; 32] {
        self.chain.snapshot_latest().state_hash
    }

    /// Look up `key` as of the latest state.
    #[instrument(skip(self, key), fields(key_len = key.len()))]
    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let snapshot = self.chain.snapshot_latest();
        get_in_snapshot(&snapshot, key)
    }

    /// Look up `key` as of a specific previously-committed state hash.
    pub fn get_at(&self, state_hash: [u8; 32], key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let snapshot = self.chain.snapshot_at(state_hash)?;
        get_in_snapshot(&snapshot, key)
    }

    /// Begin a new write transaction against the latest state, or a specific earlier state hash
    /// if `from` is given. Only one write transaction can be open at a time; this blocks until
    /// any other writer finishes.
    pub fn begin_write(&self, from: Option<[u8; 32]>) -> DbResult<WriteTransaction<'_>> {
        let handle = self.chain.begin(from)?;
        Ok(WriteTransaction { handle, flush_options: self.flush_options })
    }
}

/// Longest nibble path [`crate::nibble::NibblePath::encode_key`] can encode (its one-byte
/// length prefix tops out at `u8::MAX`). Keys are checked against this at every public entry
/// point rather than left to panic wherever a leaf or cache first tries to encode them.
const MAX_KEY_NIBBLES: usize = u8::MAX as usize;

fn check_key_len(path: &NibblePath<'_>) -> DbResult<()> {
    if path.len() > MAX_KEY_NIBBLES {
        return Err(DbError::KeyTooLong { nibbles: path.len(), max: MAX_KEY_NIBBLES });
    }
    Ok(())
}

fn root_nibble(key: &[u8]) -> DbResult<(u8, NibblePath<'_>)> {
    let path = NibblePath::from_bytes(key);
    check_key_len(&path)?;
    if path.is_empty() {
        return Err(DbError::Other("key must contain at least one nibble"));
    }
    let nibble = path.first_nibble();
    Ok((nibble, path.slice_from(1)))
}

fn get_in_snapshot(snapshot: &Snapshot, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
    let (nibble, rest) = root_nibble(key)?;
    let addr = snapshot.account_page(nibble as usize);
    pages::get(&snapshot.batch, addr, rest)
}

/// An in-flight write. Holds the chain's writer lock for as long as it's alive; drop it without
/// calling [`Self::commit`] to discard every change made through it.
pub struct WriteTransaction<'a> {
    handle: crate::root::WriteHandle<'a>,
    flush_options: FlushOptions,
}

impl<'a> WriteTransaction<'a> {
    /// Insert or overwrite `value` at `key`.
    #[instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> DbResult<()> {
        let (nibble, rest) = root_nibble(key)?;
        let mut addr = self.handle.account_page(nibble as usize);
        pages::set(&mut self.handle.batch, &mut addr, 0, rest, value)?;
        self.handle.set_account_page(nibble as usize, addr);
        Ok(())
    }

    /// Remove `key`. Equivalent to `set(key, &[])`.
    pub fn delete(&mut self, key: &[u8]) -> DbResult<()> {
        self.set(key, &[])
    }

    /// Remove every key starting with `prefix` (a nibble path, not necessarily byte-aligned).
    pub fn delete_by_prefix(&mut self, prefix: &[u8]) -> DbResult<()> {
        let path = NibblePath::from_bytes(prefix);
        check_key_len(&path)?;
        if path.is_empty() {
            for nibble in 0..ROOT_FANOUT {
                let mut addr = self.handle.account_page(nibble);
                pages::delete_by_prefix(&mut self.handle.batch, &mut addr, NibblePath::new(&[], 0, 0))?;
                self.handle.set_account_page(nibble, addr);
            }
            return Ok(());
        }
        let nibble = path.first_nibble() as usize;
        let mut addr = self.handle.account_page(nibble);
        pages::delete_by_prefix(&mut self.handle.batch, &mut addr, path.slice_from(1))?;
        self.handle.set_account_page(nibble, addr);
        Ok(())
    }

    /// Read back a value written earlier in this same transaction (or inherited from the base
    /// snapshot it started from).
    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let (nibble, rest) = root_nibble(key)?;
        let addr = self.handle.account_page(nibble as usize);
        pages::get(&self.handle.batch, addr, rest)
    }

    /// Commit this transaction, making it visible as a new proposed state keyed by
    /// `new_state_hash`.
    #[instrument(skip(self, new_state_hash), fields(batch_id = self.handle.batch.batch_id()))]
    pub fn commit(self, new_state_hash: [u8; 32]) -> DbResult<()> {
        debug!("committing batch");
        self.handle.commit(new_state_hash, self.flush_options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_hash(tag: u8) -> [u8; 32] {
        [tag; 32]
    }

    #[test]
    fn fresh_db_round_trips_a_single_key() {
        let db = Database::open_anon().unwrap();
        let mut txn = db.begin_write(None).unwrap();
        txn.set(b"hello", b"world").unwrap();
        assert_eq!(txn.get(b"hello").unwrap(), Some(b"world".to_vec()));
        txn.commit(state_hash(1)).unwrap();

        assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(db.get(b"missing").unwrap(), None);
    }

    #[test]
    fn snapshot_isolation_across_commits() {
        let db = Database::open_anon().unwrap();
        let mut txn = db.begin_write(None).unwrap();
        txn.set(b"a", b"1").unwrap();
        txn.commit(state_hash(1)).unwrap();
        let snap1 = db.current_state_hash();

        let mut txn = db.begin_write(None).unwrap();
        txn.set(b"a", b"2").unwrap();
        txn.commit(state_hash(2)).unwrap();

        assert_eq!(db.get_at(snap1, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn promotion_survives_many_keys_under_one_bucket() {
        let db = Database::open_anon().unwrap();
        let mut txn = db.begin_write(None).unwrap();
        for i in 0u32..512 {
            let key = i.to_be_bytes();
            txn.set(&key, &key).unwrap();
        }
        txn.commit(state_hash(9)).unwrap();

        for i in 0u32..512 {
            let key = i.to_be_bytes();
            assert_eq!(db.get(&key).unwrap(), Some(key.to_vec()));
        }
    }

    #[test]
    fn delete_removes_a_key() {
        let db = Database::open_anon().unwrap();
        let mut txn = db.begin_write(None).unwrap();
        txn.set(b"gone", b"x").unwrap();
        txn.commit(state_hash(1)).unwrap();
        assert_eq!(db.get(b"gone").unwrap(), Some(b"x".to_vec()));

        let mut txn = db.begin_write(None).unwrap();
        txn.delete(b"gone").unwrap();
        txn.commit(state_hash(2)).unwrap();
        assert_eq!(db.get(b"gone").unwrap(), None);
    }

    #[test]
    fn delete_by_prefix_clears_matching_keys() {
        let db = Database::open_anon().unwrap();
        let mut txn = db.begin_write(None).unwrap();
        txn.set(&[0xAB, 0x01], b"1").unwrap();
        txn.set(&[0xAB, 0x02], b"2").unwrap();
        txn.set(&[0xCD, 0x03], b"3").unwrap();
        txn.commit(state_hash(1)).unwrap();

        let mut txn = db.begin_write(None).unwrap();
        txn.delete_by_prefix(&[0xAB]).unwrap();
        txn.commit(state_hash(2)).unwrap();

        assert_eq!(db.get(&[0xAB, 0x01]).unwrap(), None);
        assert_eq!(db.get(&[0xAB, 0x02]).unwrap(), None);
        assert_eq!(db.get(&[0xCD, 0x03]).unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn empty_key_is_rejected() {
        let db = Database::open_anon().unwrap();
        assert!(matches!(db.get(b""), Err(DbError::Other(_))));
    }

    #[test]
    fn overlong_key_is_rejected() {
        let db = Database::open_anon().unwrap();
        let key = vec![0xAB; 128];
        assert!(matches!(db.get(&key), Err(DbError::KeyTooLong { .. })));

        let mut txn = db.begin_write(None).unwrap();
        assert!(matches!(txn.set(&key, b"v"), Err(DbError::KeyTooLong { .. })));
        assert!(matches!(txn.delete_by_prefix(&key), Err(DbError::KeyTooLong { .. })));
    }

    #[test]
    fn deleting_absent_key_is_a_no_op() {
        let db = Database::open_anon().unwrap();
        let mut txn = db.begin_write(None).unwrap();
        txn.delete(&[0x01, 0x02]).unwrap();
        txn.commit(state_hash(1)).unwrap();
        assert_eq!(db.get(&[0x01, 0x02]).unwrap(), None);
    }
}
