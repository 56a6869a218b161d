use core::fmt;
use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

use crate::align::is_power_of_two;

/// The header at the start of every block, free or handed out.
///
/// While the block is free, `next` links to the following block of the
/// circular free list. While it is handed out, `next` holds `ALLOCATED_TAG`
/// and only `size` is meaningful.
///
/// The header is also the allocation unit: every block is a whole number of
/// headers, so aligning the header to 16 bytes aligns every payload to 16
/// bytes too. Backing buffers for [`FixedHeap`](crate::heap::FixedHeap) are
/// plain arrays of headers for the same reason.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct Header {
    next: *mut Header,
    // Size of the block in units, including this header.
    size: usize,
}

/// Size of one header-unit, in bytes.
pub const UNIT: usize = core::mem::size_of::<Header>();

/// Alignment of every header, and so of every payload handed out.
pub const HEADER_ALIGNMENT: usize = core::mem::align_of::<Header>();

const_assert!(UNIT == HEADER_ALIGNMENT);
const_assert!(is_power_of_two(UNIT));
const_assert!(HEADER_ALIGNMENT >= core::mem::align_of::<u128>());
const_assert!(HEADER_ALIGNMENT >= core::mem::align_of::<f64>());

// Never a valid header address: headers are 16-byte aligned and this is not.
const ALLOCATED_TAG: usize = 0xA110_CA7E;
const_assert!(ALLOCATED_TAG % HEADER_ALIGNMENT != 0);

impl Header {
    /// An empty header, for initializing backing buffers.
    pub const ZERO: Header = Header {
        next: null_mut(),
        size: 0,
    };
}

/// A handle to a header known to be part of this module's bookkeeping.
///
/// All the raw reads and writes of headers go through here. A `Block` is only
/// ever built from a pointer that the free list owns, or one that is being
/// handed to it, so the accessors are safe to call within this module.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Block(NonNull<Header>);

impl Block {
    fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).size = size }
    }

    fn next(self) -> Block {
        unsafe { Block(NonNull::new_unchecked((*self.0.as_ptr()).next)) }
    }

    fn set_next(self, next: Block) {
        unsafe { (*self.0.as_ptr()).next = next.0.as_ptr() }
    }

    // The header `units` units above this one.
    fn offset(self, units: usize) -> Block {
        unsafe { Block(NonNull::new_unchecked(self.0.as_ptr().add(units))) }
    }

    // One past the last unit of this block.
    fn end(self) -> *mut Header {
        self.0.as_ptr().wrapping_add(self.size())
    }

    fn is_adjacent_to(self, other: Block) -> bool {
        self.end() == other.0.as_ptr()
    }
}

/// Mark a block as handed out.
///
/// # Safety
///
/// `block` must point to a header that has just left the free list.
pub(crate) unsafe fn mark_allocated(block: NonNull<Header>) {
    (*block.as_ptr()).next = ALLOCATED_TAG as *mut Header;
}

/// Write a fresh handed-out header of `units` units at `block`.
///
/// # Safety
///
/// `block` must point to `units` units that no one else uses, and that are
/// not on the free list.
pub(crate) unsafe fn write_allocated(block: NonNull<Header>, units: usize) {
    block.as_ptr().write(Header {
        next: ALLOCATED_TAG as *mut Header,
        size: units,
    });
}

/// Whether a header carries the tag written by `mark_allocated`.
///
/// # Safety
///
/// `block` must point to readable memory of at least one unit.
pub(crate) unsafe fn is_allocated(block: NonNull<Header>) -> bool {
    (*block.as_ptr()).next as usize == ALLOCATED_TAG
}

/// The size in units of a block that is not on the free list.
///
/// # Safety
///
/// `block` must point to a header produced by this allocator.
pub(crate) unsafe fn block_units(block: NonNull<Header>) -> usize {
    (*block.as_ptr()).size
}

/// The payload handed to the caller for a block: the unit after the header.
pub(crate) fn payload_of(block: NonNull<Header>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(block.as_ptr().add(1) as *mut u8) }
}

/// Recover the header from a payload pointer.
///
/// # Safety
///
/// `payload` must have been produced by `payload_of`.
#[allow(clippy::cast_ptr_alignment)]
pub(crate) unsafe fn header_of(payload: NonNull<u8>) -> NonNull<Header> {
    NonNull::new_unchecked((payload.as_ptr() as *mut Header).sub(1))
}

/// A circular, singly-linked list of free blocks, threaded through the block
/// headers and kept in address order (with a single wrap-around point).
///
/// The list is anchored by a sentinel header of size zero, which is never
/// handed out and never merged with a neighbour. A `FreeList` can only be
/// built from its sentinel, so the list is never empty.
///
/// The rover remembers where the last search or insertion stopped, and the
/// next search resumes there (next-fit).
pub struct FreeList {
    sentinel: Block,
    rover: Block,
}

/// Counts of invalid states found in a `FreeList`.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of neighbouring blocks that claim the same memory.
    ///
    /// This indicates corruption.
    pub overlaps: usize,
    /// Number of neighbouring blocks that are physically adjacent but were not
    /// merged. Adjacency with the sentinel is not counted.
    pub adjacents: usize,
    /// Number of times the address goes down while walking the circle.
    ///
    /// The walk wraps around exactly once in a healthy list.
    pub descents: usize,
}

impl Validity {
    /// Whether every count above is within bounds for a sound list.
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.descents <= 1
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Totals over the free blocks, sentinel excluded.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub length: usize,
    pub units: usize,
}

impl Stats {
    /// Free bytes, headers included.
    pub fn bytes(&self) -> usize {
        self.units * UNIT
    }
}

/// A free block as seen by [`FreeList::iter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub header: NonNull<Header>,
    pub units: usize,
}

impl FreeBlock {
    pub fn bytes(&self) -> usize {
        self.units * UNIT
    }
}

/// Iterator over the free blocks of a [`FreeList`], in list order from the
/// sentinel.
pub struct Blocks<'list> {
    sentinel: Block,
    next: Block,
    _list: core::marker::PhantomData<&'list FreeList>,
}

impl<'list> Iterator for Blocks<'list> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let block = self.next;
        if block == self.sentinel {
            return None;
        }
        self.next = block.next();
        Some(FreeBlock {
            header: block.0,
            units: block.size(),
        })
    }
}

// The list only holds raw pointers into memory it exclusively owns.
unsafe impl Send for FreeList {}

impl FreeList {
    /// Start a list whose only member is the sentinel at `sentinel`.
    ///
    /// # Safety
    ///
    /// `sentinel` must point to one unused unit that stays valid, and is not
    /// used for anything else, for as long as the list lives.
    pub unsafe fn new(sentinel: NonNull<Header>) -> FreeList {
        sentinel.as_ptr().write(Header {
            next: sentinel.as_ptr(),
            size: 0,
        });
        let sentinel = Block(sentinel);
        FreeList {
            sentinel,
            rover: sentinel,
        }
    }

    pub fn sentinel(&self) -> NonNull<Header> {
        self.sentinel.0
    }

    pub fn iter(&self) -> Blocks<'_> {
        Blocks {
            sentinel: self.sentinel,
            next: self.sentinel.next(),
            _list: core::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.sentinel.next() == self.sentinel
    }

    /// Find a block of at least `units` units, starting at the rover and
    /// going round the circle once.
    ///
    /// An exact fit is unlinked whole. A larger block gives up its top
    /// `units` units and stays where it is in the list, so its predecessor
    /// never needs relinking. The returned header has its size set to
    /// `units`; its `next` is stale.
    ///
    /// Returns `None` when no block is large enough.
    pub fn pop_units(&mut self, units: usize) -> Option<NonNull<Header>> {
        // The sentinel has size 0, and must never be handed out.
        debug_assert!(units > 0, "Can't hand out a block of 0 units");

        let mut previous = self.rover;
        loop {
            let current = previous.next();

            if current.size() >= units {
                let taken = if current.size() == units {
                    previous.set_next(current.next());
                    current
                } else {
                    let remaining = current.size() - units;
                    current.set_size(remaining);
                    let tail = current.offset(remaining);
                    tail.set_size(units);
                    tail
                };
                self.rover = previous;
                return Some(taken.0);
            }

            if current == self.rover {
                return None;
            }
            previous = current;
        }
    }

    /// Put a block back on the list, merging it with its neighbours in
    /// address order when they are physically adjacent.
    ///
    /// # Safety
    ///
    /// `block` must point to a header whose `size` is set, covering memory
    /// that no one else uses, and that is not already on the list.
    pub unsafe fn insert(&mut self, block: NonNull<Header>) {
        let block = Block(block);
        debug_assert!(block.size() > 0, "Can't insert a block of size 0");

        // Find `current` such that block lies between current and
        // current.next, allowing for the one place the circle wraps from the
        // highest address back to the lowest.
        let mut current = self.rover;
        loop {
            let next = current.next();
            debug_assert!(
                block != current && block != next,
                "Block {:?} is already free",
                block.0
            );
            if block > current && block < next {
                break;
            }
            if current >= next && (block > current || block < next) {
                break;
            }
            current = next;
        }

        let next = current.next();
        if next != self.sentinel && block.is_adjacent_to(next) {
            block.set_size(block.size() + next.size());
            block.set_next(next.next());
        } else {
            block.set_next(next);
        }

        if current.is_adjacent_to(block) {
            current.set_size(current.size() + block.size());
            current.set_next(block.next());
        } else {
            current.set_next(block);
        }

        self.rover = current;
    }

    /// Add fresh memory of `units` units at `ptr` to the list.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `units` unused units that are handed over to the
    /// list for good.
    pub unsafe fn add_region(&mut self, ptr: NonNull<Header>, units: usize) {
        ptr.as_ptr().write(Header {
            next: null_mut(),
            size: units,
        });
        self.insert(ptr);
    }

    /// Walk the list once, counting blocks and checking ordering.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let mut previous = self.sentinel;
        loop {
            let next = previous.next();

            if next <= previous {
                validity.descents += 1;
            } else if previous.end() > next.0.as_ptr() {
                validity.overlaps += 1;
            } else if previous.is_adjacent_to(next)
                && previous != self.sentinel
                && next != self.sentinel
            {
                validity.adjacents += 1;
            }

            if next == self.sentinel {
                break;
            }
            stats.length += 1;
            stats.units += next.size();
            previous = next;
        }

        (validity, stats)
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(sentinel {:?}", self.sentinel.0)?;
        for block in self.iter() {
            write!(
                f,
                ", FreeBlock({:?}, {} units, {} bytes)",
                block.header,
                block.units,
                block.bytes()
            )?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    // Hands out pieces of a buffer by unit index.
    struct Units {
        base: *mut Header,
        len: usize,
    }

    impl Units {
        fn new(buffer: &mut [Header]) -> Units {
            Units {
                base: buffer.as_mut_ptr(),
                len: buffer.len(),
            }
        }

        fn at(&self, index: usize) -> NonNull<Header> {
            assert!(index < self.len);
            unsafe { NonNull::new_unchecked(self.base.add(index)) }
        }
    }

    fn blocks(list: &FreeList) -> Vec<(NonNull<Header>, usize)> {
        list.iter().map(|b| (b.header, b.units)).collect()
    }

    #[test]
    fn test_sentinel_only() {
        let mut buffer = [Header::ZERO; 4];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };

        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert_eq!(list.pop_units(1), None);

        let (validity, stats) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn test_exact_fit_and_tail_split() {
        let mut buffer = [Header::ZERO; 16];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };
        unsafe { list.add_region(units.at(1), 10) };
        log::info!("start: {}", list);

        // The top of the block is handed out, the bottom stays free
        let tail = list.pop_units(4).unwrap();
        assert_eq!(tail, units.at(7));
        assert_eq!(unsafe { block_units(tail) }, 4);
        assert_eq!(blocks(&list), [(units.at(1), 6)]);

        // Exact fit takes the whole block
        let whole = list.pop_units(6).unwrap();
        assert_eq!(whole, units.at(1));
        assert!(list.is_empty());
        assert_eq!(list.pop_units(1), None);
    }

    #[test]
    fn test_split_leaves_header_only_block() {
        let mut buffer = [Header::ZERO; 8];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };
        unsafe { list.add_region(units.at(1), 3) };

        let taken = list.pop_units(2).unwrap();
        assert_eq!(taken, units.at(2));
        assert_eq!(blocks(&list), [(units.at(1), 1)]);
        assert_eq!(list.pop_units(2), None);
    }

    #[test]
    fn test_insert_keeps_address_order() {
        let mut buffer = [Header::ZERO; 32];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };

        // Non-adjacent blocks, inserted out of order
        unsafe {
            units.at(20).as_ptr().write(Header { next: null_mut(), size: 2 });
            list.insert(units.at(20));
            units.at(4).as_ptr().write(Header { next: null_mut(), size: 2 });
            list.insert(units.at(4));
            units.at(12).as_ptr().write(Header { next: null_mut(), size: 3 });
            list.insert(units.at(12));
        }
        log::info!("ordered: {}", list);

        assert_eq!(
            blocks(&list),
            [(units.at(4), 2), (units.at(12), 3), (units.at(20), 2)]
        );
        let (validity, stats) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.length, 3);
        assert_eq!(stats.units, 7);
        assert_eq!(stats.bytes(), 7 * UNIT);
    }

    #[test]
    fn test_insert_merges_both_neighbours() {
        let mut buffer = [Header::ZERO; 16];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };

        unsafe {
            list.add_region(units.at(1), 2);
            list.add_region(units.at(5), 2);
        }
        assert_eq!(list.len(), 2);

        // Fills the gap between the two
        unsafe { list.add_region(units.at(3), 2) };
        assert_eq!(blocks(&list), [(units.at(1), 6)]);

        // Adjacent above
        unsafe { list.add_region(units.at(7), 3) };
        assert_eq!(blocks(&list), [(units.at(1), 9)]);

        let (validity, _) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    fn test_never_merges_sentinel() {
        let mut buffer = [Header::ZERO; 8];
        let units = Units::new(&mut buffer);
        // The sentinel sits above a block that ends right where it starts
        let mut list = unsafe { FreeList::new(units.at(4)) };
        unsafe { list.add_region(units.at(1), 3) };
        unsafe { list.add_region(units.at(5), 2) };

        assert_eq!(list.sentinel(), units.at(4));
        assert_eq!(blocks(&list), [(units.at(5), 2), (units.at(1), 3)]);
        let (validity, stats) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.units, 5);
    }

    #[test]
    fn test_next_fit_resumes_at_rover() {
        let mut buffer = [Header::ZERO; 32];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };
        unsafe {
            list.add_region(units.at(2), 4);
            list.add_region(units.at(10), 4);
            list.add_region(units.at(20), 4);
        }

        // Insertion left the rover at the block before 20, so the search
        // starts at 20
        let first = list.pop_units(4).unwrap();
        assert_eq!(first, units.at(20));
        // ...and resumes from there, wrapping past the sentinel to 2
        let second = list.pop_units(4).unwrap();
        assert_eq!(second, units.at(2));
        let third = list.pop_units(4).unwrap();
        assert_eq!(third, units.at(10));
        assert!(list.is_empty());
    }

    #[test]
    fn test_display() {
        let mut buffer = [Header::ZERO; 8];
        let units = Units::new(&mut buffer);
        let mut list = unsafe { FreeList::new(units.at(0)) };
        unsafe { list.add_region(units.at(2), 3) };

        let shown = format!("{}", list);
        assert!(shown.starts_with("FreeList(sentinel "));
        assert!(shown.contains(&format!("3 units, {} bytes", 3 * UNIT)));
        assert!(shown.ends_with(')'));
    }

    #[test]
    fn test_tags() {
        let mut buffer = [Header::ZERO; 2];
        let units = Units::new(&mut buffer);
        let block = units.at(0);
        unsafe {
            assert!(!is_allocated(block));
            mark_allocated(block);
            assert!(is_allocated(block));
            assert_eq!(header_of(payload_of(block)), block);
        }
        assert_eq!(payload_of(block).as_ptr() as usize, block.as_ptr() as usize + UNIT);
    }
}
