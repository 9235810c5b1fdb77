//! Memory collaborators.
//!
//! The physical and virtual allocators and the page mapper live outside
//! this crate; drivers and the loader program against these traits and
//! never assume anything about the implementations behind them.

use cinder::addressing::{Pa, Va};

bitflags::bitflags! {
    /// Page protection attributes, supplied by the caller of a mapping.
    pub struct MapFlags: u8 {
        /// Translation is valid.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITE = 1 << 1;
        /// User-mode accesses are allowed.
        const USER = 1 << 2;
    }
}

/// A page table operation failed.
#[derive(Debug, PartialEq, Eq)]
pub struct MapError;

/// A physically contiguous block together with its kernel-visible view.
///
/// The handle is a plain resource token: nothing is freed when it drops,
/// the owner must hand it back to the allocator explicitly.
#[derive(Debug)]
pub struct PhysBlock {
    pa: Pa,
    va: Va,
    len: usize,
}

impl PhysBlock {
    /// Build a handle; allocator implementations call this.
    pub const fn new(pa: Pa, va: Va, len: usize) -> Self {
        PhysBlock { pa, va, len }
    }

    /// Physical base of the block.
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Kernel-visible base of the block.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Physically contiguous allocation.
pub trait PhysAllocator {
    /// Allocate at least `bytes` bytes. The start need not be page-aligned,
    /// but whole-page requests come back page-aligned.
    fn allocate(&self, bytes: usize) -> Option<PhysBlock>;

    /// Return a block obtained from [`allocate`].
    ///
    /// [`allocate`]: Self::allocate
    fn release(&self, block: PhysBlock);
}

/// Virtual address range reservation.
pub trait VirtAllocator {
    /// Reserve `pages` consecutive virtual pages, returning the base.
    fn reserve(&self, pages: usize) -> Option<Va>;
}

/// Page table manipulation.
pub trait PageMapper {
    /// Map `pages` pages starting at `va` onto the physical range starting
    /// at `pa`. All-or-nothing: on failure no page of the range is mapped.
    fn map(&self, va: Va, pa: Pa, pages: usize, flags: MapFlags) -> Result<(), MapError>;

    /// Drop the translations for `pages` pages starting at `va`.
    fn unmap(&self, va: Va, pages: usize) -> Result<(), MapError>;

    /// Whether `va`'s page currently has a translation.
    fn is_mapped(&self, va: Va) -> bool;
}
