//! Backing stores that the allocator grows into.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS (or to a fixed buffer) to expand the heap. It deals in header-units,
//! never bytes.
//!
//! ### [`FixedHeap`](struct.FixedHeap.html)
//!
//! `FixedHeap` hands out a borrowed buffer of headers front to back, and fails
//! once the buffer is used up. It is useful for constrained environments and
//! for testing.
//!
//! ### [`MmapHeap`](struct.MmapHeap.html)
//!
//! `MmapHeap` maps fresh anonymous pages on every growth. Only available with
//! the `use_libc` feature.

use core::fmt;
use core::marker::PhantomData;
#[cfg(feature = "use_libc")]
use core::ptr::null_mut;
use core::ptr::NonNull;

#[cfg(feature = "use_libc")]
use errno::Errno;

#[cfg(feature = "use_libc")]
use crate::align::round_up;
use crate::freelist::{Header, UNIT};

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by at least `units` header-units. Returns a pointer and
    /// the number of units available at that pointer.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this crate:
    ///
    /// - On success, the returned memory holds at least `units` units, is
    ///   aligned for `Header`, and is untracked by any other rust code,
    ///   including the allocator itself.
    /// - The caller takes ownership of that memory for as long as the grower
    ///   lives.
    unsafe fn grow_heap(&mut self, units: usize) -> Result<(NonNull<Header>, usize), Self::Err>;
}

/// A heap carved front to back from a fixed buffer of headers.
///
/// The cursor only moves forward; memory given out is never taken back.
pub struct FixedHeap<'a> {
    base: NonNull<Header>,
    capacity: usize,
    used: usize,
    _buffer: PhantomData<&'a mut [Header]>,
}

// FixedHeap has exclusive use of its buffer.
unsafe impl<'a> Send for FixedHeap<'a> {}

impl<'a> FixedHeap<'a> {
    pub fn new(buffer: &'a mut [Header]) -> Self {
        FixedHeap {
            capacity: buffer.len(),
            base: NonNull::from(buffer).cast(),
            used: 0,
            _buffer: PhantomData,
        }
    }

    /// Total size of the buffer, in units.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    /// Whether `ptr` falls inside the buffer.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.capacity * UNIT;
        (start..end).contains(&(ptr as usize))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeapExhausted {
    pub requested: usize,
    pub remaining: usize,
}

impl fmt::Display for FixedHeapExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fixed heap exhausted: requested {} units, {} remaining",
            self.requested, self.remaining
        )
    }
}

impl<'a> HeapGrower for FixedHeap<'a> {
    type Err = FixedHeapExhausted;

    unsafe fn grow_heap(&mut self, units: usize) -> Result<(NonNull<Header>, usize), Self::Err> {
        debug_assert!(units > 0, "Can't grow a heap by 0 units");
        if units > self.remaining() {
            return Err(FixedHeapExhausted {
                requested: units,
                remaining: self.remaining(),
            });
        }

        let ptr = NonNull::new_unchecked(self.base.as_ptr().add(self.used));
        self.used += units;
        Ok((ptr, units))
    }
}

#[cfg(feature = "use_libc")]
#[derive(Debug)]
pub enum MmapError {
    /// `mmap` failed, with this errno.
    Errno(Errno),
    /// `mmap` succeeded but returned a null mapping.
    NullMapping,
    /// The request does not fit in a `usize` once converted to bytes.
    Overflow,
}

#[cfg(feature = "use_libc")]
impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmapError::Errno(errno) => write!(f, "mmap failed: {}", errno),
            MmapError::NullMapping => write!(f, "mmap returned a null mapping"),
            MmapError::Overflow => write!(f, "requested size overflows"),
        }
    }
}

/// MmapHeap uses virtual memory to grow the heap upon request.
///
/// Each growth maps a new, page-rounded anonymous region. Regions are never
/// unmapped.
#[cfg(feature = "use_libc")]
#[derive(Debug)]
pub struct MmapHeap {
    min_pages: usize,
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl Default for MmapHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "use_libc")]
impl MmapHeap {
    pub const fn new() -> Self {
        Self::with_min_pages(1)
    }

    /// Map at least `min_pages` pages per growth, to make fewer, larger
    /// mappings.
    ///
    /// Panics if `min_pages` is 0.
    pub const fn with_min_pages(min_pages: usize) -> Self {
        assert!(min_pages > 0, "MmapHeap needs to grow by at least one page");
        MmapHeap {
            min_pages,
            pages: 0,
            growths: 0,
        }
    }

    pub fn page_size() -> usize {
        sysconf::page::pagesize()
    }

    /// Pages mapped so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of successful growths.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

#[cfg(feature = "use_libc")]
impl HeapGrower for MmapHeap {
    type Err = MmapError;

    unsafe fn grow_heap(&mut self, units: usize) -> Result<(NonNull<Header>, usize), MmapError> {
        let pagesize = Self::page_size();
        let bytes = units.checked_mul(UNIT).ok_or(MmapError::Overflow)?;
        let min_bytes = self
            .min_pages
            .checked_mul(pagesize)
            .ok_or(MmapError::Overflow)?;
        let to_allocate = round_up(bytes.max(min_bytes), pagesize).ok_or(MmapError::Overflow)?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // No file backs an anonymous mapping.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(MmapError::Errno(errno::errno()));
        }
        let ptr = NonNull::new(ptr as *mut Header).ok_or(MmapError::NullMapping)?;

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((ptr, to_allocate / UNIT))
    }
}
