//! Backing memory for one region of a program's address space.

use super::LoadError;
use crate::mm::{MapFlags, PageMapper, PhysAllocator, PhysBlock};
use cinder::addressing::{Va, PAGE_SIZE};

/// Layout request for one region.
pub(super) struct Region {
    /// Where the region starts in the target address space.
    pub vaddr: usize,
    /// Bytes the region occupies there.
    pub mem_size: usize,
}

/// What to put into a freshly mapped region.
pub(super) enum Fill<'a> {
    /// Copy these bytes to the region start; anything beyond them up to
    /// `mem_size` keeps whatever the allocator handed out.
    Bytes(&'a [u8]),
    /// Clear all `mem_size` bytes.
    Zero,
}

/// Backing allocation and mapping for one program-header entry.
///
/// A record owns its physical block until [`release`] runs. Entries that
/// were not loadable hold no block and release is a no-op for them; a
/// released record stays empty forever, so releasing twice cannot free or
/// unmap twice.
///
/// [`release`]: Self::release
#[derive(Debug)]
pub struct SegmentAllocation {
    block: Option<PhysBlock>,
    first_page: Va,
    pages: usize,
}

impl SegmentAllocation {
    /// A record with nothing behind it.
    pub(super) const fn empty() -> Self {
        SegmentAllocation {
            block: None,
            first_page: Va::ZERO,
            pages: 0,
        }
    }

    /// Whether this record still holds memory.
    pub fn is_live(&self) -> bool {
        self.block.is_some()
    }

    /// Unmap the region's pages, then hand the block back.
    ///
    /// A failed unmap is reported and the block is still freed; stopping
    /// here would leak everything the remaining records hold.
    pub fn release<P: PhysAllocator, M: PageMapper>(&mut self, palloc: &P, mapper: &M) {
        if let Some(block) = self.block.take() {
            if mapper.unmap(self.first_page, self.pages).is_err() {
                warning!(
                    "release of {:?} ({} pages): unmap failed, translations may be stale",
                    self.first_page,
                    self.pages
                );
            }
            palloc.release(block);
        }
    }
}

/// Give `region` backing memory: find free pages, allocate, map with
/// `flags`, then populate per `fill`.
///
/// Any failure leaves the address space untouched apart from what the
/// caller already materialized; a block allocated here is handed back
/// before the error goes up.
pub(super) fn materialize<P: PhysAllocator, M: PageMapper>(
    region: Region,
    fill: Fill<'_>,
    palloc: &P,
    mapper: &M,
    flags: MapFlags,
) -> Result<SegmentAllocation, LoadError> {
    let first_page = Va::new(region.vaddr)
        .ok_or(LoadError::BadImage)?
        .page_align_down();
    let left_padding = region.vaddr - unsafe { first_page.into_usize() };
    // A page of headroom on top of the padding keeps the aligned window
    // inside the block even when the allocation starts mid-page.
    let total = left_padding + PAGE_SIZE + region.mem_size;
    let pages = total / PAGE_SIZE + 1;

    for i in 0..pages {
        if mapper.is_mapped(first_page + i * PAGE_SIZE) {
            return Err(LoadError::PagesBusy);
        }
    }

    let block = palloc.allocate(total).ok_or(LoadError::OutOfMemory)?;

    // First page boundary inside the block; the raw allocation may start
    // anywhere.
    let aligned = block.pa().page_align_up();
    let window = aligned.offset_from(block.pa());

    if mapper.map(first_page, aligned, pages, flags).is_err() {
        palloc.release(block);
        return Err(LoadError::MapFailed);
    }

    // The region's true start, seen through the kernel window.
    let start = unsafe { (block.va() + window + left_padding).into_usize() as *mut u8 };
    match fill {
        Fill::Bytes(bytes) => unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), start, bytes.len());
        },
        Fill::Zero => unsafe {
            core::ptr::write_bytes(start, 0, region.mem_size);
        },
    }

    Ok(SegmentAllocation {
        block: Some(block),
        first_page,
        pages,
    })
}
