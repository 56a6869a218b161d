#![cfg_attr(not(test), no_std)]

//! A K&R-style free-list allocator.
//!
//! Memory is handed out in whole header-units, taken from a circular free
//! list of blocks that is searched next-fit, starting where the last search
//! stopped. Larger blocks are split from their top end; freed blocks are put
//! back in address order and merged with any physically adjacent neighbour.
//! When the list has nothing big enough, the allocator asks a
//! [`HeapGrower`](heap::HeapGrower) for more memory and tries again.
//!
//! ```
//! use knr_allocator::{FixedHeap, Header, KnrAlloc};
//!
//! let mut buffer = [Header::ZERO; 64];
//! let mut allocator = KnrAlloc::new(FixedHeap::new(&mut buffer));
//!
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe { allocator.deallocate(ptr) };
//! ```
//!
//! To use it as the global allocator (requires the `use_libc` feature):
//!
//! ```ignore
//! use knr_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! `KnrAlloc` itself is single-threaded. The allocator never returns memory
//! to the system, and freeing a pointer twice, or one it did not hand out,
//! is undefined behavior.

pub mod align;
pub mod allocators;
pub mod freelist;
pub mod heap;

#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
pub use allocators::{KnrAlloc, LockedAlloc};
pub use freelist::{Header, Stats, Validity, HEADER_ALIGNMENT, UNIT};
#[cfg(feature = "use_libc")]
pub use heap::MmapHeap;
pub use heap::{FixedHeap, HeapGrower};
