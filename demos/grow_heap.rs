//! This is a very minimal example to show using a HeapGrower directly.

use knr_allocator::{HeapGrower, MmapHeap, UNIT};

fn main() {
    let mut heap = MmapHeap::default();
    println!("Page size: {}, unit size: {}", MmapHeap::page_size(), UNIT);

    for &units in [1usize, 8, 1000].iter() {
        // The heap rounds requests up to whole pages, so it may hand back more
        // units than were asked for
        let (p, got) = unsafe { heap.grow_heap(units).unwrap() };
        println!(
            "Asked for {} units; returned: ({:p}={}, {} units)",
            units,
            p,
            p.as_ptr() as usize,
            got
        );
    }
    println!("Mapped {} pages in {} growths", heap.pages(), heap.growths());
}
