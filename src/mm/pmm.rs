//! Page-granular physical memory allocation.
//!
//! The physical memory is managed as up to 16 contiguous **regions**, each
//! carrying a free list of **block descriptors**. Descriptors never live
//! inside the memory they describe (so managed regions may be read-only or
//! device memory); they come from a dedicated [`SlabAllocator`] seeded with a
//! buffer embedded in the [`Pmm`] itself.
//!
//! ## Allocation API
//!
//! | API | Description |
//! | --- | ----------- |
//! | `alloc(size)` | Allocate `size` bytes (rounded up to pages), page aligned |
//! | `alloc_aligned(size, alignment)` | Same with an explicit power-of-two alignment |
//! | `free(addr, size)` | Return an interval to its region, coalescing neighbors |
//! | `add_region(base, size)` | Donate a physical interval to the allocator |
//! | `remove_region(base, size)` | Exclude an interval from management |
//! | `total_mem()` / `free_mem()` | O(1) usage accessors |
//!
//! The allocation policy is first-fit: regions in insertion order, blocks in
//! list order. Best-fit and worst-fit are declared but not implemented.
//!
//! ## Self-refill
//!
//! Splitting a free block can require a fresh descriptor, and the descriptor
//! slab is finite. Every `alloc_aligned` entry therefore checks the slab's
//! free count first and, below the low-water mark, feeds it a page allocated
//! from the regions before the walk that satisfies the caller. A failed
//! refill halts the kernel.
//!
//! All functions must run either with paging off or under an identity mapping
//! covering the managed regions, since allocation zero-fills through the
//! physical address.

use core::mem::size_of;
use core::ptr::null_mut;

use crate::error::{ErrorCode, KResult};
use crate::mm::slab::{self, SlabAllocator};
use crate::mm::{PhysAddr, PAGE_SIZE};
use crate::util::align::{align_down, align_up, is_aligned, is_power_of_two};

/// Capacity of the region array.
pub const PMM_REGION_COUNT: usize = 16;

/// Descriptors carved from the embedded seed buffer.
const SEED_DESCRIPTORS: usize = 64;

/// Low-water mark of the descriptor slab; below this, `alloc_aligned`
/// replenishes the slab before walking the free lists.
const SLAB_REFILL_THRESHOLD: usize = 16;

const SEED_SLAB_SIZE: usize = slab::region_size(SEED_DESCRIPTORS, size_of::<Block>());

/// A free interval inside a region. Always page-aligned and page-multiple.
#[repr(C)]
struct Block {
    base: PhysAddr,
    size: usize,
    next: *mut Block,
}

sa::const_assert_eq!(size_of::<Block>(), 24);

/// A contiguous physical interval under management.
struct Region {
    base: PhysAddr,
    size: usize,
    /// Bytes currently free. The free list covers exactly this many bytes.
    free: usize,
    blocks: *mut Block,
}

impl Region {
    const fn empty() -> Self {
        Region { base: 0, size: 0, free: 0, blocks: null_mut() }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Policy {
    FirstFit,
    BestFit,
    WorstFit,
}

#[repr(align(16))]
struct SeedBuffer([u8; SEED_SLAB_SIZE]);

pub struct Pmm {
    regions: [Region; PMM_REGION_COUNT],
    region_count: usize,
    /// Slab allocator for [`Block`] descriptors.
    block_slab: SlabAllocator,
    /// Total bytes under management.
    total: usize,
    /// Free bytes under management.
    free: usize,
    policy: Policy,
    initialized: bool,
    /// Seed buffer for the descriptor slab. Threading the slab free list
    /// through this buffer makes the value address-sensitive: a `Pmm` must
    /// not move after [`initialize`](Self::initialize).
    seed: SeedBuffer,
}

impl Pmm {
    pub const fn new() -> Self {
        const EMPTY: Region = Region::empty();
        Pmm {
            regions: [EMPTY; PMM_REGION_COUNT],
            region_count: 0,
            block_slab: SlabAllocator::new(),
            total: 0,
            free: 0,
            policy: Policy::FirstFit,
            initialized: false,
            seed: SeedBuffer([0; SEED_SLAB_SIZE]),
        }
    }

    /// Create the descriptor slab from the embedded seed buffer and reset
    /// the region table. The value must not move afterwards.
    pub fn initialize(&mut self) -> KResult<()> {
        self.block_slab.init(size_of::<Block>());
        let seed = self.seed.0.as_mut_ptr();
        unsafe {
            self.block_slab
                .grow(seed, SEED_SLAB_SIZE)
                .map_err(|e| e.push(ErrorCode::PmmInit))?;
        }

        self.region_count = 0;
        self.total = 0;
        self.free = 0;
        self.policy = Policy::FirstFit;
        self.initialized = true;
        Ok(())
    }

    /// Donate the physical interval `[base, base + size)`. The interval is
    /// shrunk inward to page boundaries; the shrunk interval becomes a new
    /// region with a single free block covering all of it.
    pub fn add_region(&mut self, base: PhysAddr, size: usize) -> KResult<()> {
        if base == 0 {
            return Err(ErrorCode::NullArgument.into());
        }

        let aligned_base = align_up(base, PAGE_SIZE);
        if aligned_base - base >= size {
            return Err(ErrorCode::PmmAddRegionTooSmall.into());
        }
        let aligned_size = align_down(size - (aligned_base - base), PAGE_SIZE);
        let fits = aligned_base + aligned_size <= base + size;
        if !fits || aligned_size < PAGE_SIZE {
            return Err(ErrorCode::PmmAddRegionTooSmall.into());
        }

        if self.region_count >= PMM_REGION_COUNT {
            return Err(ErrorCode::PmmRegionListFull.into());
        }
        for region in &self.regions[..self.region_count] {
            let contained = aligned_base >= region.base
                && aligned_base + aligned_size <= region.base + region.size;
            if contained {
                return Err(ErrorCode::PmmAddManagedRegion.into());
            }
        }

        let block = self.block_slab.alloc() as *mut Block;
        if block.is_null() {
            return Err(ErrorCode::PmmSlabAllocFailed.into());
        }
        unsafe {
            (*block).base = aligned_base;
            (*block).size = aligned_size;
            (*block).next = null_mut();
        }

        let region = &mut self.regions[self.region_count];
        region.base = aligned_base;
        region.size = aligned_size;
        region.free = aligned_size;
        region.blocks = block;
        self.region_count += 1;

        self.total += aligned_size;
        self.free += aligned_size;
        Ok(())
    }

    /// Exclude `[base, base + size)` from management, growing the interval
    /// outward to page boundaries. An exact whole-region match removes the
    /// region (only while it has no outstanding allocations); otherwise the
    /// interval is carved out of a free block of the enclosing region.
    pub fn remove_region(&mut self, base: PhysAddr, size: usize) -> KResult<()> {
        let aligned_base = align_down(base, PAGE_SIZE);
        let aligned_size = align_up(base + size, PAGE_SIZE) - aligned_base;
        if aligned_size == 0 {
            return Ok(());
        }

        for i in 0..self.region_count {
            let region = &self.regions[i];
            if aligned_base == region.base && aligned_size == region.size {
                if region.free != region.size {
                    return Err(ErrorCode::PmmRegionAllocatedFrom.into());
                }

                // Return every descriptor before closing the array gap.
                let mut block = region.blocks;
                while !block.is_null() {
                    let next = unsafe { (*block).next };
                    let freed = unsafe { self.block_slab.free(block as *mut u8) };
                    debug_assert!(freed.is_ok());
                    block = next;
                }

                self.free -= aligned_size;
                self.total -= aligned_size;
                for j in i..self.region_count - 1 {
                    self.regions.swap(j, j + 1);
                }
                self.regions[self.region_count - 1] = Region::empty();
                self.region_count -= 1;
                return Ok(());
            }

            let inside = aligned_base >= region.base
                && aligned_base + aligned_size <= region.base + region.size;
            if inside {
                return self.carve_out(i, aligned_base, aligned_size);
            }
        }

        Err(ErrorCode::PmmRegionNotManaged.into())
    }

    /// Split the free block of region `i` that contains the interval,
    /// marking the interval permanently used.
    fn carve_out(&mut self, i: usize, base: PhysAddr, size: usize) -> KResult<()> {
        let region = &mut self.regions[i];
        let mut prev: *mut Block = null_mut();
        let mut block = region.blocks;

        unsafe {
            while !block.is_null() {
                let block_base = (*block).base;
                let block_size = (*block).size;
                let contained =
                    base >= block_base && base + size <= block_base + block_size;
                if contained {
                    let preceding = block_base != base;
                    let trailing = block_base + block_size > base + size;
                    if preceding && trailing {
                        (*block).size = base - block_base;
                        let extra = self.block_slab.alloc() as *mut Block;
                        if extra.is_null() {
                            return Err(ErrorCode::PmmSlabAllocFailed.into());
                        }
                        (*extra).base = base + size;
                        (*extra).size = block_base + block_size - (base + size);
                        (*extra).next = (*block).next;
                        (*block).next = extra;
                    } else if preceding {
                        (*block).size = base - block_base;
                    } else if trailing {
                        (*block).base = base + size;
                        (*block).size = block_base + block_size - (base + size);
                    } else {
                        if prev.is_null() {
                            region.blocks = (*block).next;
                        } else {
                            (*prev).next = (*block).next;
                        }
                        let freed = self.block_slab.free(block as *mut u8);
                        debug_assert!(freed.is_ok());
                    }

                    region.free -= size;
                    self.free -= size;
                    return Ok(());
                }

                prev = block;
                block = (*block).next;
            }
        }

        // Inside the region but not inside any free block.
        Err(ErrorCode::PmmRegionAllocatedFrom.into())
    }

    /// Allocate `size` bytes aligned to `alignment`. `size` is rounded up to
    /// a page multiple (at least one page); `alignment` must be a power of
    /// two and at least the page size. The returned memory is zero-filled.
    pub fn alloc_aligned(&mut self, size: usize, alignment: usize) -> KResult<PhysAddr> {
        if alignment < PAGE_SIZE || !is_power_of_two(alignment) {
            return Err(ErrorCode::PmmBadAlignment.into());
        }

        let size = align_up(size.max(1), PAGE_SIZE);
        if self.free < size {
            return Err(ErrorCode::PmmOutOfMemory.into());
        }

        // Refill before the walk below can consume the descriptors the
        // refill itself would need.
        if self.block_slab.free_count() < SLAB_REFILL_THRESHOLD {
            self.refill_block_slab();
        }

        match self.policy {
            Policy::FirstFit => {}
            Policy::BestFit | Policy::WorstFit => {
                return Err(ErrorCode::NotImplemented.into());
            }
        }

        match self.alloc_from_regions(size, alignment) {
            Some(addr) => {
                // Zero the memory being handed out. Doubleword stores;
                // size is a page multiple so there is no tail.
                unsafe {
                    (addr as *mut u64).write_bytes(0, size / 8);
                }
                Ok(addr)
            }
            None => Err(ErrorCode::PmmOutOfMemory.into()),
        }
    }

    /// Allocate `size` bytes with the default page alignment.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> KResult<PhysAddr> {
        self.alloc_aligned(size, PAGE_SIZE)
    }

    /// First-fit walk over regions in insertion order and blocks in list
    /// order. Performs the split and the usage bookkeeping but not the
    /// zero-fill.
    fn alloc_from_regions(&mut self, size: usize, alignment: usize) -> Option<PhysAddr> {
        for i in 0..self.region_count {
            let region = &mut self.regions[i];
            if region.free < size {
                continue;
            }

            let mut prev: *mut Block = null_mut();
            let mut block = region.blocks;
            unsafe {
                while !block.is_null() {
                    let block_base = (*block).base;
                    let block_size = (*block).size;
                    let aligned_base = align_up(block_base, alignment);
                    if block_base + block_size >= aligned_base + size {
                        let preceding = block_base != aligned_base;
                        let trailing = block_base + block_size > aligned_base + size;
                        if preceding && trailing {
                            (*block).size = aligned_base - block_base;
                            let extra = self.block_slab.alloc() as *mut Block;
                            assert!(
                                !extra.is_null(),
                                "pmm: block descriptor pool exhausted"
                            );
                            (*extra).base = aligned_base + size;
                            (*extra).size = block_base + block_size - (aligned_base + size);
                            (*extra).next = (*block).next;
                            (*block).next = extra;
                        } else if preceding {
                            (*block).size = aligned_base - block_base;
                        } else if trailing {
                            (*block).base = aligned_base + size;
                            (*block).size = block_base + block_size - (aligned_base + size);
                        } else {
                            if prev.is_null() {
                                region.blocks = (*block).next;
                            } else {
                                (*prev).next = (*block).next;
                            }
                            let freed = self.block_slab.free(block as *mut u8);
                            debug_assert!(freed.is_ok());
                        }

                        region.free -= size;
                        self.free -= size;
                        return Some(aligned_base);
                    }

                    prev = block;
                    block = (*block).next;
                }
            }
        }

        None
    }

    /// Feed the descriptor slab one page from our own regions. Must run in
    /// the same non-preemptible context as the allocation that triggered it.
    fn refill_block_slab(&mut self) {
        let page = match self.alloc_from_regions(PAGE_SIZE, PAGE_SIZE) {
            Some(page) => page,
            None => panic!("pmm: descriptor slab refill failed: out of memory"),
        };
        let grown = unsafe { self.block_slab.grow(page as *mut u8, PAGE_SIZE) };
        if let Err(err) = grown {
            panic!("pmm: descriptor slab refill failed: {}", err);
        }
    }

    /// Return `[addr, addr + size)` to its owning region, merging with any
    /// free block immediately adjacent on either side. Blocks carry no
    /// headers, so the caller passes back the size it allocated. Freeing an
    /// interval that is already free is undefined behavior (not checked).
    pub fn free(&mut self, addr: PhysAddr, size: usize) -> KResult<()> {
        if addr == 0 {
            return Err(ErrorCode::NullArgument.into());
        }
        if !is_aligned(addr, PAGE_SIZE) {
            return Err(ErrorCode::PmmBadAlignment.into());
        }
        let size = align_up(size, PAGE_SIZE);
        if size == 0 {
            return Ok(());
        }

        let region = match self
            .regions[..self.region_count]
            .iter_mut()
            .find(|r| addr >= r.base && addr + size <= r.base + r.size)
        {
            Some(region) => region,
            None => return Err(ErrorCode::PmmRegionNotManaged.into()),
        };

        // Locate free blocks bordering the interval. The free list is not
        // sorted, so both neighbors have to be searched for.
        let mut before: *mut Block = null_mut();
        let mut after: *mut Block = null_mut();
        let mut after_prev: *mut Block = null_mut();
        unsafe {
            let mut prev: *mut Block = null_mut();
            let mut block = region.blocks;
            while !block.is_null() {
                if (*block).base + (*block).size == addr {
                    before = block;
                } else if addr + size == (*block).base {
                    after = block;
                    after_prev = prev;
                }
                prev = block;
                block = (*block).next;
            }

            if !before.is_null() && !after.is_null() {
                // The freed interval bridges two blocks; the first swallows
                // everything and the second's descriptor goes back.
                (*before).size += size + (*after).size;
                if after_prev.is_null() {
                    region.blocks = (*after).next;
                } else {
                    (*after_prev).next = (*after).next;
                }
                let freed = self.block_slab.free(after as *mut u8);
                debug_assert!(freed.is_ok());
            } else if !before.is_null() {
                (*before).size += size;
            } else if !after.is_null() {
                (*after).base = addr;
                (*after).size += size;
            } else {
                let block = self.block_slab.alloc() as *mut Block;
                if block.is_null() {
                    return Err(ErrorCode::PmmSlabAllocFailed.into());
                }
                (*block).base = addr;
                (*block).size = size;
                (*block).next = region.blocks;
                region.blocks = block;
            }
        }

        region.free += size;
        self.free += size;
        debug_assert!(region.free <= region.size);
        Ok(())
    }

    /// Total bytes under management.
    #[inline(always)]
    pub fn total_mem(&self) -> usize {
        self.total
    }

    /// Free bytes under management.
    #[inline(always)]
    pub fn free_mem(&self) -> usize {
        self.free
    }

    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    /// Free descriptor count of the backing slab. Exposed for tests and the
    /// debug dump.
    pub fn descriptor_count(&self) -> usize {
        self.block_slab.free_count()
    }

    /// Verify the usage counters against the free lists: the aggregate free
    /// count matches the per-region sums, every block lies inside its region,
    /// blocks are page-aligned, disjoint, and sum to `region.free`.
    pub fn check_consistency(&self) -> bool {
        if self.free > self.total {
            return false;
        }

        let mut free_sum = 0;
        for region in &self.regions[..self.region_count] {
            let mut region_free = 0;
            unsafe {
                let mut block = region.blocks;
                while !block.is_null() {
                    let base = (*block).base;
                    let size = (*block).size;
                    if !is_aligned(base, PAGE_SIZE) || !is_aligned(size, PAGE_SIZE) {
                        return false;
                    }
                    if base < region.base || base + size > region.base + region.size {
                        return false;
                    }

                    // Disjoint from every other block of this region.
                    let mut other = region.blocks;
                    while !other.is_null() {
                        if other != block {
                            let o_base = (*other).base;
                            let o_size = (*other).size;
                            if base < o_base + o_size && o_base < base + size {
                                return false;
                            }
                        }
                        other = (*other).next;
                    }

                    region_free += size;
                    block = (*block).next;
                }
            }
            if region_free != region.free {
                return false;
            }
            free_sum += region_free;
        }

        free_sum == self.free && self.block_slab.check_consistency()
    }

    /// Print the region table. Mainly used for debugging.
    pub fn dump(&self) {
        println_k!();
        println_k!("PMM REGION TABLE ({} region(s))", self.region_count);
        println_k!("~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~");
        for (i, region) in self.regions[..self.region_count].iter().enumerate() {
            println_k!(
                "Region[{}]: {:#x} -> {:#x}, free {:#x} bytes",
                i,
                region.base,
                region.base + region.size,
                region.free
            );
            unsafe {
                let mut block = region.blocks;
                while !block.is_null() {
                    println_k!(
                        "  block {:#x} -> {:#x} ({} page(s))",
                        (*block).base,
                        (*block).base + (*block).size,
                        (*block).size / PAGE_SIZE
                    );
                    block = (*block).next;
                }
            }
        }
        println_k!("~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~");
        println_k!(
            "Total: {:>10} bytes. Free: {:>10} bytes. Descriptors: {}.",
            self.total,
            self.free,
            self.descriptor_count()
        );
        println_k!();
    }
}

////////////////////// Kernel singleton /////////////////////////////

static mut PMM: Pmm = Pmm::new();

/// The process-wide physical memory manager. Initialized once by the boot
/// path; effectively uncontended during bring-up (single hart, no
/// preemption).
pub fn pmm() -> &'static mut Pmm {
    unsafe { &mut *core::ptr::addr_of_mut!(PMM) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support::{pmm_with_heap, TestHeap};

    #[test]
    fn alignment_rejection() {
        let (mut pmm, _heap) = pmm_with_heap(8);
        // Under a page.
        let err = pmm.alloc_aligned(PAGE_SIZE, 2048).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmBadAlignment);
        // Not a power of two.
        let err = pmm.alloc_aligned(PAGE_SIZE, 6144).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmBadAlignment);
    }

    #[test]
    fn first_fit_split() {
        // A single 32 KiB region: the first allocation takes the lowest
        // page, the second takes the next one.
        let (mut pmm, heap) = pmm_with_heap(8);
        assert_eq!(pmm.total_mem(), 8 * PAGE_SIZE);

        let a = pmm.alloc(PAGE_SIZE).unwrap();
        assert_eq!(a, heap.base());
        let b = pmm.alloc(PAGE_SIZE).unwrap();
        assert_eq!(b, heap.base() + PAGE_SIZE);
        assert_eq!(pmm.free_mem(), 6 * PAGE_SIZE);
        assert!(pmm.check_consistency());
    }

    #[test]
    fn alloc_is_zero_filled() {
        let (mut pmm, _heap) = pmm_with_heap(4);
        let addr = pmm.alloc(PAGE_SIZE).unwrap();
        unsafe {
            let page = core::slice::from_raw_parts_mut(addr as *mut u8, PAGE_SIZE);
            page.fill(0xa5);
        }
        pmm.free(addr, PAGE_SIZE).unwrap();
        let again = pmm.alloc(PAGE_SIZE).unwrap();
        assert_eq!(again, addr);
        let page = unsafe { core::slice::from_raw_parts(again as *const u8, PAGE_SIZE) };
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_allocation_skips_unaligned_prefix() {
        let (mut pmm, heap) = pmm_with_heap(64);
        // Burn one page so the block base is (most likely) not 8-page
        // aligned anymore.
        let _ = pmm.alloc(PAGE_SIZE).unwrap();
        let alignment = 8 * PAGE_SIZE;
        let addr = pmm.alloc_aligned(2 * PAGE_SIZE, alignment).unwrap();
        assert!(is_aligned(addr, alignment));
        assert!(heap.contains(addr));
        assert!(pmm.check_consistency());
    }

    #[test]
    fn out_of_memory() {
        let (mut pmm, _heap) = pmm_with_heap(4);
        let err = pmm.alloc(5 * PAGE_SIZE).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmOutOfMemory);
    }

    #[test]
    fn add_region_too_small() {
        let mut pmm = Box::new(Pmm::new());
        pmm.initialize().unwrap();
        let heap = TestHeap::new(2);
        // An interval that shrinks to nothing once aligned inward.
        let err = pmm.add_region(heap.base() + 8, PAGE_SIZE).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmAddRegionTooSmall);
    }

    #[test]
    fn add_region_already_managed() {
        let (mut pmm, heap) = pmm_with_heap(8);
        let err = pmm
            .add_region(heap.base() + PAGE_SIZE, 2 * PAGE_SIZE)
            .unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmAddManagedRegion);
    }

    #[test]
    fn region_list_full() {
        let mut pmm = Box::new(Pmm::new());
        pmm.initialize().unwrap();
        let heaps: Vec<TestHeap> = (0..17).map(|_| TestHeap::new(1)).collect();
        for heap in &heaps[..16] {
            pmm.add_region(heap.base(), heap.size()).unwrap();
        }
        let err = pmm.add_region(heaps[16].base(), heaps[16].size()).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmRegionListFull);
    }

    #[test]
    fn free_restores_and_coalesces() {
        let (mut pmm, _heap) = pmm_with_heap(8);
        let before = pmm.free_mem();

        let a = pmm.alloc(2 * PAGE_SIZE).unwrap();
        let b = pmm.alloc(PAGE_SIZE).unwrap();
        pmm.free(a, 2 * PAGE_SIZE).unwrap();
        pmm.free(b, PAGE_SIZE).unwrap();
        assert_eq!(pmm.free_mem(), before);
        assert!(pmm.check_consistency());

        // No fragmentation left: the whole region is allocatable again.
        let whole = pmm.alloc(8 * PAGE_SIZE).unwrap();
        assert_eq!(pmm.free_mem(), 0);
        pmm.free(whole, 8 * PAGE_SIZE).unwrap();
        assert_eq!(pmm.free_mem(), before);
    }

    #[test]
    fn free_merges_bridging_interval() {
        let (mut pmm, _heap) = pmm_with_heap(8);
        let a = pmm.alloc(PAGE_SIZE).unwrap();
        let b = pmm.alloc(PAGE_SIZE).unwrap();
        let c = pmm.alloc(PAGE_SIZE).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        assert_eq!(c, b + PAGE_SIZE);

        pmm.free(a, PAGE_SIZE).unwrap();
        pmm.free(c, PAGE_SIZE).unwrap();
        // Freeing b bridges the two isolated blocks into one.
        pmm.free(b, PAGE_SIZE).unwrap();
        assert!(pmm.check_consistency());
        let again = pmm.alloc(3 * PAGE_SIZE).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn free_unmanaged_interval() {
        let (mut pmm, _heap) = pmm_with_heap(4);
        let err = pmm.free(0xdead_0000, PAGE_SIZE).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmRegionNotManaged);
    }

    #[test]
    fn remove_whole_region() {
        let (mut pmm, heap) = pmm_with_heap(8);
        let extra = TestHeap::new(4);
        pmm.add_region(extra.base(), extra.size()).unwrap();
        assert_eq!(pmm.total_mem(), 12 * PAGE_SIZE);

        pmm.remove_region(extra.base(), extra.size()).unwrap();
        assert_eq!(pmm.total_mem(), 8 * PAGE_SIZE);
        assert!(pmm.check_consistency());

        // The remaining region still works.
        let addr = pmm.alloc(PAGE_SIZE).unwrap();
        assert!(heap.contains(addr));
    }

    #[test]
    fn remove_whole_region_with_allocations() {
        let (mut pmm, heap) = pmm_with_heap(8);
        let _ = pmm.alloc(PAGE_SIZE).unwrap();
        let err = pmm.remove_region(heap.base(), heap.size()).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmRegionAllocatedFrom);
    }

    #[test]
    fn remove_partial_interval() {
        let (mut pmm, heap) = pmm_with_heap(8);
        let before = pmm.free_mem();
        // Punch two pages out of the middle.
        pmm.remove_region(heap.base() + 2 * PAGE_SIZE, 2 * PAGE_SIZE)
            .unwrap();
        assert_eq!(pmm.free_mem(), before - 2 * PAGE_SIZE);
        assert!(pmm.check_consistency());

        // The punched-out pages are never handed out.
        let mut seen = Vec::new();
        while let Ok(addr) = pmm.alloc(PAGE_SIZE) {
            seen.push(addr);
        }
        assert!(!seen.contains(&(heap.base() + 2 * PAGE_SIZE)));
        assert!(!seen.contains(&(heap.base() + 3 * PAGE_SIZE)));
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn remove_allocated_interval() {
        let (mut pmm, _heap) = pmm_with_heap(8);
        let addr = pmm.alloc(2 * PAGE_SIZE).unwrap();
        let err = pmm.remove_region(addr, PAGE_SIZE).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmRegionAllocatedFrom);
    }

    #[test]
    fn remove_unmanaged_region() {
        let (mut pmm, _heap) = pmm_with_heap(4);
        let err = pmm.remove_region(0xdead_0000, PAGE_SIZE).unwrap_err();
        assert_eq!(err.top(), ErrorCode::PmmRegionNotManaged);
    }

    #[test]
    fn best_fit_not_implemented() {
        let (mut pmm, _heap) = pmm_with_heap(4);
        pmm.set_policy(Policy::BestFit);
        let err = pmm.alloc(PAGE_SIZE).unwrap_err();
        assert_eq!(err.top(), ErrorCode::NotImplemented);
    }

    #[test]
    fn descriptor_slab_self_refill() {
        let (mut pmm, _heap) = pmm_with_heap(128);

        // Allocate every page individually, then free alternating pages to
        // fragment the region into many isolated free blocks, each of which
        // pins a descriptor.
        let pages: Vec<_> = (0..128).map(|_| pmm.alloc(PAGE_SIZE).unwrap()).collect();
        for chunk in pages.chunks(2) {
            pmm.free(chunk[0], PAGE_SIZE).unwrap();
            if pmm.descriptor_count() < SLAB_REFILL_THRESHOLD {
                break;
            }
        }
        assert!(pmm.descriptor_count() < SLAB_REFILL_THRESHOLD);

        // The next allocation must refill the slab before serving.
        let _ = pmm.alloc(PAGE_SIZE).unwrap();
        assert!(pmm.descriptor_count() >= SLAB_REFILL_THRESHOLD);
        assert!(pmm.check_consistency());
    }
}
