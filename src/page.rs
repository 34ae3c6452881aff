//! The 4 KiB page: a typed header plus an opaque payload.
//!
//! Every page the engine hands around is a boxed, fixed-size byte buffer. The header is
//! interpreted with `bytemuck`, the same way the teacher crate interprets its `RootHeader` and
//! `LeafHeader` - no hand-rolled `unsafe` transmutes.

use bytemuck::{Pod, Zeroable};

use crate::{address::DbAddress, PAGE_SIZE};

/// Size of the fixed header at the front of every page, in bytes.
pub const HEADER_SIZE: usize = 8;

/// Size of the typed payload following the header.
pub const PAYLOAD_SIZE: usize = PAGE_SIZE - HEADER_SIZE;

/// The mandatory, immutable-for-life type tag stored in every page's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    None = 0,
    Standard = 1,
    Identity = 2,
    Abandoned = 3,
    Leaf = 4,
    LeafOverflow = 5,
    FanOut = 6,
    MerkleFanOut = 7,
    MerkleLeaf = 8,
}

impl PageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PageType::None,
            1 => PageType::Standard,
            2 => PageType::Identity,
            3 => PageType::Abandoned,
            4 => PageType::Leaf,
            5 => PageType::LeafOverflow,
            6 => PageType::FanOut,
            7 => PageType::MerkleFanOut,
            8 => PageType::MerkleLeaf,
            _ => return None,
        })
    }
}

/// Current on-disk header version.
pub const HEADER_VERSION: u8 = 1;

/// The 8-byte header every page begins with: `batch_id | version | page_type | level | metadata`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PageHeader {
    pub batch_id: u32,
    pub version: u8,
    pub page_type: u8,
    pub level: u8,
    pub metadata: u8,
}

impl PageHeader {
    pub fn new(batch_id: u32, page_type: PageType, level: u8) -> Self {
        Self { batch_id, version: HEADER_VERSION, page_type: page_type as u8, level, metadata: 0 }
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.page_type)
    }
}

/// A 4 KiB frame: an 8-byte [`PageHeader`] followed by a typed payload.
///
/// `Page` owns its bytes. Pages are cheap to clone by design: cloning a `Page` is exactly the
/// byte-copy a copy-on-write requires.
#[derive(Clone)]
pub struct Page {
    bytes: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// A fresh, zeroed page (type `None`, batch id 0).
    pub fn zeroed() -> Self {
        Self { bytes: Box::new([0u8; PAGE_SIZE]) }
    }

    /// Wrap an existing 4 KiB buffer as a page.
    pub fn from_bytes(bytes: Box<[u8; PAGE_SIZE]>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.bytes
    }

    pub fn header(&self) -> PageHeader {
        *bytemuck::from_bytes(&self.bytes[..HEADER_SIZE])
    }

    pub fn set_header(&mut self, header: PageHeader) {
        self.bytes[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[HEADER_SIZE..]
    }

    /// Zero out the payload, leaving the header untouched.
    pub fn clear_payload(&mut self) {
        self.bytes[HEADER_SIZE..].fill(0);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = self.header();
        f.debug_struct("Page")
            .field("batch_id", &header.batch_id)
            .field("page_type", &header.page_type())
            .field("level", &header.level)
            .finish()
    }
}

/// A page together with the address it's reachable at, the unit most of the tree-walking code
/// actually operates on.
#[derive(Clone, Debug)]
pub struct AddressedPage {
    pub addr: DbAddress,
    pub page: Page,
}
