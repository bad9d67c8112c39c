//! Fixed-size block allocator.
//!
//! The slab hands out blocks of a single size recorded at init time and never
//! splits or coalesces. It owns no memory of its own: callers donate buffers
//! with [`grow`], each of which becomes a *region* carrying a small header at
//! its start and a singly-linked free list threaded through the unused blocks
//! themselves. The PMM uses one of these to allocate its block descriptors,
//! seeding it from a statically reserved buffer and topping it up with whole
//! pages once it is running.
//!
//! There is no alignment guarantee beyond the block size, and a double free
//! is undefined behavior (not checked).
//!
//! [`grow`]: self::SlabAllocator::grow

use core::mem::size_of;
use core::ptr::null_mut;

use crate::error::{ErrorCode, KResult};

/// The free-list link stored in the first bytes of every unused block.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Header placed at the start of every donated buffer.
#[repr(C)]
struct RegionHeader {
    next: *mut RegionHeader,
    total: usize,
    free: usize,
    blocks: *mut FreeBlock,
}

/// The effective block size for a requested size: at least one machine
/// pointer, so the free-list link fits in an unused block.
#[inline(always)]
pub const fn block_size(requested: usize) -> usize {
    if requested > size_of::<*mut u8>() {
        requested
    } else {
        size_of::<*mut u8>()
    }
}

/// The buffer size needed to hold a region with `blocks` blocks of
/// (requested) size `blocksize`. Used to size static seed buffers.
#[inline(always)]
pub const fn region_size(blocks: usize, blocksize: usize) -> usize {
    size_of::<RegionHeader>() + blocks * block_size(blocksize)
}

pub struct SlabAllocator {
    /// Effective block size. Constant after [`init`](Self::init).
    blocksize: usize,
    regions: *mut RegionHeader,
    total: usize,
    free: usize,
}

impl SlabAllocator {
    pub const fn new() -> Self {
        SlabAllocator {
            blocksize: 0,
            regions: null_mut(),
            total: 0,
            free: 0,
        }
    }

    /// Record the block size and reset the region list.
    pub fn init(&mut self, blocksize: usize) {
        self.blocksize = block_size(blocksize);
        self.regions = null_mut();
        self.total = 0;
        self.free = 0;
    }

    /// Donate `len` bytes at `buf` to the allocator. The buffer must stay
    /// valid for the allocator's lifetime and must be at least pointer
    /// aligned (the region header lands at its start).
    ///
    /// # Safety
    ///
    /// `buf` must point to `len` writable bytes owned by the caller for the
    /// rest of the allocator's lifetime, not overlapping any region already
    /// donated.
    pub unsafe fn grow(&mut self, buf: *mut u8, len: usize) -> KResult<()> {
        if buf.is_null() {
            return Err(ErrorCode::NullArgument.into());
        }
        // The region must fit its header plus at least one block.
        if len < region_size(1, self.blocksize) {
            return Err(ErrorCode::SlabRegionTooSmall.into());
        }
        debug_assert!(buf as usize % size_of::<*mut u8>() == 0);

        let region = buf as *mut RegionHeader;
        let data = buf.add(size_of::<RegionHeader>());
        let count = (len - size_of::<RegionHeader>()) / self.blocksize;

        (*region).total = count;
        (*region).free = count;
        (*region).blocks = data as *mut FreeBlock;

        // Thread the free list through the blocks. Blocks are only
        // blocksize-aligned, so the links are stored unaligned.
        let mut cursor = data;
        for _ in 1..count {
            let next = cursor.add(self.blocksize);
            (cursor as *mut FreeBlock).write_unaligned(FreeBlock { next: next as *mut FreeBlock });
            cursor = next;
        }
        (cursor as *mut FreeBlock).write_unaligned(FreeBlock { next: null_mut() });

        (*region).next = self.regions;
        self.regions = region;
        self.total += count;
        self.free += count;
        Ok(())
    }

    /// Unlink and return the first block of the first region with a free
    /// block. Returns null when no block is available; callers must handle
    /// null, this is never an error code.
    pub fn alloc(&mut self) -> *mut u8 {
        if self.free == 0 {
            return null_mut();
        }

        unsafe {
            let mut region = self.regions;
            while !region.is_null() && (*region).free == 0 {
                region = (*region).next;
            }
            if region.is_null() {
                return null_mut();
            }

            let block = (*region).blocks;
            (*region).blocks = block.read_unaligned().next;
            (*region).free -= 1;
            self.free -= 1;
            block as *mut u8
        }
    }

    /// Return `block` to the region whose data interval contains it.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`alloc`](Self::alloc) on this
    /// allocator and must not be freed twice.
    pub unsafe fn free(&mut self, block: *mut u8) -> KResult<()> {
        if block.is_null() {
            return Err(ErrorCode::NullArgument.into());
        }

        let addr = block as usize;
        let mut region = self.regions;
        while !region.is_null() {
            let data_start = region as usize + size_of::<RegionHeader>();
            let data_end = data_start + (*region).total * self.blocksize;
            if data_start <= addr && addr < data_end {
                break;
            }
            region = (*region).next;
        }
        if region.is_null() {
            return Err(ErrorCode::SlabForeignBlock.into());
        }

        let freed = block as *mut FreeBlock;
        freed.write_unaligned(FreeBlock { next: (*region).blocks });
        (*region).blocks = freed;
        (*region).free += 1;
        self.free += 1;
        Ok(())
    }

    /// Aggregate free block count.
    #[inline(always)]
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Aggregate block count.
    #[inline(always)]
    pub fn total_count(&self) -> usize {
        self.total
    }

    /// The effective block size.
    #[inline(always)]
    pub fn block_len(&self) -> usize {
        self.blocksize
    }

    /// Walk every region and verify the counters against the free lists:
    /// the aggregate counts match the per-region sums and each free list
    /// holds exactly `region.free` links, all inside the region's bounds.
    pub fn check_consistency(&self) -> bool {
        let mut total = 0;
        let mut free = 0;

        unsafe {
            let mut region = self.regions;
            while !region.is_null() {
                let data_start = region as usize + size_of::<RegionHeader>();
                let data_end = data_start + (*region).total * self.blocksize;

                let mut chained = 0;
                let mut block = (*region).blocks;
                while !block.is_null() {
                    let addr = block as usize;
                    if addr < data_start || addr >= data_end {
                        return false;
                    }
                    chained += 1;
                    if chained > (*region).total {
                        return false;
                    }
                    block = block.read_unaligned().next;
                }
                if chained != (*region).free {
                    return false;
                }

                total += (*region).total;
                free += (*region).free;
                region = (*region).next;
            }
        }

        total == self.total && free == self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKSIZE: usize = 64;

    /// Pointer-aligned backing buffer of at least `bytes` bytes.
    fn aligned_buf(bytes: usize) -> Vec<u64> {
        vec![0u64; (bytes + 7) / 8]
    }

    fn grown_slab(buf: &mut [u64], bytes: usize) -> SlabAllocator {
        let mut slab = SlabAllocator::new();
        slab.init(BLOCKSIZE);
        unsafe { slab.grow(buf.as_mut_ptr() as *mut u8, bytes).unwrap() };
        slab
    }

    #[test]
    fn region_too_small() {
        let mut slab = SlabAllocator::new();
        slab.init(BLOCKSIZE);
        // One byte short of a header plus a single block.
        let bytes = region_size(1, BLOCKSIZE) - 1;
        let mut buf = aligned_buf(bytes);
        let err =
            unsafe { slab.grow(buf.as_mut_ptr() as *mut u8, bytes).unwrap_err() };
        assert_eq!(err.top(), ErrorCode::SlabRegionTooSmall);
        assert_eq!(slab.free_count(), 0);
    }

    #[test]
    fn grow_carves_blocks() {
        let bytes = region_size(16, BLOCKSIZE);
        let mut buf = aligned_buf(bytes);
        let slab = grown_slab(&mut buf, bytes);
        assert_eq!(slab.total_count(), 16);
        assert_eq!(slab.free_count(), 16);
        assert!(slab.check_consistency());
    }

    #[test]
    fn alloc_until_exhausted() {
        let bytes = region_size(4, BLOCKSIZE);
        let mut buf = aligned_buf(bytes);
        let mut slab = grown_slab(&mut buf, bytes);

        let mut blocks = Vec::new();
        for _ in 0..4 {
            let b = slab.alloc();
            assert!(!b.is_null());
            // Distinct blocks.
            assert!(!blocks.contains(&b));
            blocks.push(b);
        }
        assert_eq!(slab.free_count(), 0);
        assert!(slab.alloc().is_null());

        for b in blocks {
            unsafe { slab.free(b).unwrap() };
        }
        assert_eq!(slab.free_count(), 4);
        assert!(slab.check_consistency());
    }

    #[test]
    fn free_foreign_block() {
        let bytes = region_size(4, BLOCKSIZE);
        let mut buf = aligned_buf(bytes);
        let mut slab = grown_slab(&mut buf, bytes);

        let mut other = vec![0u8; 64];
        let err = unsafe { slab.free(other.as_mut_ptr()).unwrap_err() };
        assert_eq!(err.top(), ErrorCode::SlabForeignBlock);
    }

    #[test]
    fn multiple_regions() {
        let a_bytes = region_size(2, BLOCKSIZE);
        let b_bytes = region_size(3, BLOCKSIZE);
        let mut a = aligned_buf(a_bytes);
        let mut b = aligned_buf(b_bytes);
        let mut slab = SlabAllocator::new();
        slab.init(BLOCKSIZE);
        unsafe {
            slab.grow(a.as_mut_ptr() as *mut u8, a_bytes).unwrap();
            slab.grow(b.as_mut_ptr() as *mut u8, b_bytes).unwrap();
        }
        assert_eq!(slab.total_count(), 5);

        // Drain everything, then return one block; it must land in the
        // region that contains it.
        let blocks: Vec<_> = (0..5).map(|_| slab.alloc()).collect();
        assert!(blocks.iter().all(|b| !b.is_null()));
        assert_eq!(slab.free_count(), 0);
        unsafe { slab.free(blocks[4]).unwrap() };
        assert_eq!(slab.free_count(), 1);
        assert!(slab.check_consistency());
    }

    #[test]
    fn blocksize_rounds_up_to_pointer() {
        let mut slab = SlabAllocator::new();
        slab.init(1);
        assert_eq!(slab.block_len(), core::mem::size_of::<*mut u8>());
    }
}
