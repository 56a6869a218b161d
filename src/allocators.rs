//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`KnrAlloc`](struct.KnrAlloc.html)
//!
//! A `KnrAlloc` is a single-threaded heap and freed memory manager: the K&R
//! storage allocator, with next-fit search, tail splitting and coalescing on
//! free. Every call takes `&mut self`, so it cannot be shared between threads
//! as is.
//!
//! ### [`LockedAlloc`](struct.LockedAlloc.html)
//!
//! A `LockedAlloc` wraps `KnrAlloc` with a spin lock, held for the whole of
//! every call, and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `LockedAlloc` over an `MmapHeap`, with a `const`
//! constructor so it can be used as the `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{null_mut, NonNull};

use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use crate::align::{is_aligned, is_power_of_two, padding_needed, unit_count};
use crate::freelist::{
    block_units, header_of, is_allocated, mark_allocated, payload_of, write_allocated, FreeList,
    Header, Stats, Validity, HEADER_ALIGNMENT, UNIT,
};
#[cfg(feature = "use_libc")]
use crate::heap::MmapHeap;
use crate::heap::{FixedHeap, HeapGrower};

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// The free list, and its sentinel, are created on the first allocation: the
/// sentinel takes the first unit the grower hands over. Memory is never
/// returned to the grower.
///
/// A request for 0 bytes, or for a size that overflows once rounded to
/// units, returns `None`. So does any request the grower can't make room for.
pub struct KnrAlloc<G> {
    pub grower: G,
    blocks: Option<FreeList>,
}

impl<G: HeapGrower + Default> Default for KnrAlloc<G> {
    fn default() -> Self {
        KnrAlloc::new(G::default())
    }
}

impl<G> KnrAlloc<G> {
    pub const fn new(grower: G) -> Self {
        KnrAlloc {
            grower,
            blocks: None,
        }
    }

    /// Number of units, header included, in the block for a `size` byte
    /// request. `None` if that overflows.
    pub fn units_for(size: usize) -> Option<usize> {
        unit_count(size, UNIT, HEADER_ALIGNMENT)?.checked_add(1)
    }

    /// The free list, if anything has been allocated yet.
    pub fn blocks(&self) -> Option<&FreeList> {
        self.blocks.as_ref()
    }

    /// Get statistics on this allocator, and verify validity of the free list.
    pub fn stats(&self) -> (Validity, Stats) {
        match self.blocks {
            None => (Validity::default(), Stats::default()),
            Some(ref blocks) => blocks.stats(),
        }
    }

    /// Write every block on the free list, from the sentinel round to the
    /// sentinel.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        match self.blocks {
            None => write!(out, "FreeList(uninitialized)"),
            Some(ref blocks) => write!(out, "{}", blocks),
        }
    }

    /// Payload bytes available at `ptr`, which may be more than were asked
    /// for.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        (block_units(header_of(ptr)) - 1) * UNIT
    }

    /// Return a block to the free list. `None` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and not been freed since.
    /// Anything else is undefined behavior; debug builds catch most double
    /// frees and foreign pointers.
    pub unsafe fn deallocate(&mut self, ptr: impl Into<Option<NonNull<u8>>>) {
        let ptr = match ptr.into() {
            None => return,
            Some(p) => p,
        };
        let blocks = match self.blocks {
            Some(ref mut blocks) => blocks,
            None => {
                debug_assert!(false, "Freed {:?} before anything was allocated", ptr);
                return;
            }
        };

        let block = header_of(ptr);
        debug_assert!(
            is_allocated(block),
            "Freed {:?}, which is not allocated",
            ptr
        );
        trace!("Freeing {:?}: {} units", ptr, block_units(block));
        blocks.insert(block);
    }
}

impl<G: HeapGrower> KnrAlloc<G> {
    // Ask the grower for at least `units` units, logging any failure.
    fn grow(grower: &mut G, units: usize) -> Option<(NonNull<Header>, usize)> {
        match unsafe { grower.grow_heap(units) } {
            Ok((ptr, got)) => {
                debug!("Grew heap by {} units at {:?} ({} requested)", got, ptr, units);
                debug_assert!(got >= units, "Grower returned too little memory");
                Some((ptr, got))
            }
            Err(err) => {
                debug!("Failed to grow heap by {} units: {:?}", units, err);
                None
            }
        }
    }

    // Carve the sentinel from the first unit of the heap, and free the rest
    // of that growth.
    fn start(grower: &mut G) -> Option<FreeList> {
        let (ptr, units) = Self::grow(grower, 1)?;
        unsafe {
            let mut blocks = FreeList::new(ptr);
            if units > 1 {
                let rest = NonNull::new_unchecked(ptr.as_ptr().add(1));
                blocks.add_region(rest, units - 1);
            }
            Some(blocks)
        }
    }

    // Take a block of exactly `units` units off the list, growing the heap
    // when nothing fits. The header's size is set; its `next` is stale.
    fn take(&mut self, units: usize) -> Option<NonNull<Header>> {
        if self.blocks.is_none() {
            self.blocks = Some(Self::start(&mut self.grower)?);
        }
        let blocks = self.blocks.as_mut()?;

        loop {
            if let Some(block) = blocks.pop_units(units) {
                return Some(block);
            }

            // A full circuit found nothing. A successful growth is at least
            // as large as the request, so the next pass can't miss.
            let (ptr, got) = Self::grow(&mut self.grower, units)?;
            unsafe { blocks.add_region(ptr, got) };
        }
    }

    /// Allocate at least `size` bytes, aligned to `HEADER_ALIGNMENT`.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            trace!("Refusing to allocate 0 bytes");
            return None;
        }
        let units = match Self::units_for(size) {
            Some(units) => units,
            None => {
                debug!("Allocation of {} bytes is too large", size);
                return None;
            }
        };

        let block = self.take(units)?;
        unsafe { mark_allocated(block) };
        let ptr = payload_of(block);
        trace!("Allocated {} bytes ({} units) at {:?}", size, units, ptr);
        Some(ptr)
    }

    /// Allocate at least `size` bytes at a multiple of `align`.
    ///
    /// Alignments up to `HEADER_ALIGNMENT` are a plain `allocate`. Larger ones
    /// take a block with enough spare units to reach an aligned payload, and
    /// hand the spare units on either side back to the free list.
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(
            is_power_of_two(align),
            "alignment {} is not a power of two",
            align
        );
        if align <= HEADER_ALIGNMENT {
            return self.allocate(size);
        }
        if size == 0 {
            trace!("Refusing to allocate 0 bytes");
            return None;
        }

        // Payloads are always HEADER_ALIGNMENT aligned, so an aligned one is
        // at most `slack` units past the start of any block's payload.
        let slack = align / UNIT - 1;
        let (units, total) = match Self::units_for(size)
            .and_then(|units| Some((units, units.checked_add(slack)?)))
        {
            Some(pair) => pair,
            None => {
                debug!(
                    "Allocation of {} bytes aligned to {} is too large",
                    size, align
                );
                return None;
            }
        };

        let block = self.take(total)?;
        let lead = padding_needed(payload_of(block).as_ptr() as usize, align) / UNIT;
        let trail = total - lead - units;
        let blocks = self.blocks.as_mut()?;
        unsafe {
            let header = NonNull::new_unchecked(block.as_ptr().add(lead));
            write_allocated(header, units);
            if lead > 0 {
                blocks.add_region(block, lead);
            }
            if trail > 0 {
                blocks.add_region(NonNull::new_unchecked(header.as_ptr().add(units)), trail);
            }

            let ptr = payload_of(header);
            trace!(
                "Allocated {} bytes ({} units) at {:?}, aligned to {}",
                size,
                units,
                ptr,
                align
            );
            Some(ptr)
        }
    }

    /// Allocate at least `size` bytes, the first `size` of them zeroed.
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Some(ptr)
    }

    // Cut a live block down to `units` units, freeing the rest of it.
    unsafe fn shrink(&mut self, block: NonNull<Header>, units: usize) {
        let surplus = block_units(block) - units;
        if surplus == 0 {
            return;
        }
        if let Some(ref mut blocks) = self.blocks {
            write_allocated(block, units);
            blocks.add_region(NonNull::new_unchecked(block.as_ptr().add(units)), surplus);
            trace!("Shrank {:?} to {} units", block, units);
        }
    }

    /// Resize an allocation, moving it if it no longer fits.
    ///
    /// A `None` pointer is a plain allocation, and a `new_size` of 0 frees
    /// `ptr` and returns `None`. Shrinking keeps the pointer and frees the
    /// units no longer needed. If a move is needed and fails, `None` is
    /// returned and `ptr` is left as it was.
    ///
    /// # Safety
    ///
    /// `ptr`, if given, must be a live allocation from this allocator.
    pub unsafe fn reallocate(
        &mut self,
        ptr: impl Into<Option<NonNull<u8>>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        self.reallocate_aligned(ptr, new_size, HEADER_ALIGNMENT)
    }

    /// Like [`reallocate`](KnrAlloc::reallocate), keeping the payload at a
    /// multiple of `align`.
    ///
    /// # Safety
    ///
    /// `ptr`, if given, must be a live allocation from this allocator.
    pub unsafe fn reallocate_aligned(
        &mut self,
        ptr: impl Into<Option<NonNull<u8>>>,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr.into() {
            None => return self.allocate_aligned(new_size, align),
            Some(p) => p,
        };
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let needed = Self::units_for(new_size)?;
        let block = header_of(ptr);
        let units = block_units(block);
        if needed <= units && is_aligned(ptr.as_ptr() as usize, align) {
            self.shrink(block, needed);
            return Some(ptr);
        }

        let moved = self.allocate_aligned(new_size, align)?;
        let keep = core::cmp::min((units - 1) * UNIT, new_size);
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), keep);
        self.deallocate(ptr);
        Some(moved)
    }
}

impl<'a> KnrAlloc<FixedHeap<'a>> {
    /// The largest `size` that can be allocated from a fresh allocator over
    /// this heap: the whole buffer, less the sentinel's unit and the block's
    /// own header.
    pub fn max_alloc(&self) -> usize {
        self.grower.capacity().saturating_sub(2) * UNIT
    }
}

/// A thread-safe allocator, using a spin lock around a KnrAlloc.
///
/// Thread-safety is required for an allocator to be used as a global allocator.
/// Layouts aligned to more than `HEADER_ALIGNMENT` go through
/// [`KnrAlloc::allocate_aligned`].
pub struct LockedAlloc<G> {
    raw: Mutex<KnrAlloc<G>>,
}

impl<G: HeapGrower + Default> Default for LockedAlloc<G> {
    fn default() -> Self {
        LockedAlloc::new(G::default())
    }
}

impl<G> LockedAlloc<G> {
    pub const fn new(grower: G) -> Self {
        LockedAlloc {
            raw: Mutex::new(KnrAlloc::new(grower)),
        }
    }

    /// Get a reference to the underlying KnrAlloc.
    ///
    /// Allocation through this `LockedAlloc` blocks while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, KnrAlloc<G>> {
        self.raw.lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().stats()
    }
}

unsafe impl<G: HeapGrower + Send> GlobalAlloc for LockedAlloc<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.lock()
            .allocate_aligned(layout.size(), layout.align())
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.lock().deallocate(NonNull::new(ptr))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.lock()
            .reallocate_aligned(NonNull::new(ptr), new_size, layout.align())
            .map_or(null_mut(), NonNull::as_ptr)
    }
}

/// A `LockedAlloc` growing into anonymous memory maps, for use as the global
/// allocator.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: LockedAlloc<MmapHeap>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: LockedAlloc::new(MmapHeap::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, KnrAlloc<MmapHeap>> {
        self.alloc.lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}
