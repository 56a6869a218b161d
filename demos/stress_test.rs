//! Runs a long random sequence of allocations and frees through the global
//! allocator, checking after every step that the free list is still sound and
//! that no live object was overwritten.

use knr_allocator::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Objects created before the first one is destroyed
const WARMUP: usize = 1024;
// Total number of steps
const STEPS: usize = 64 * 1024;
// Largest object, in u64s
const MAX_LEN: usize = 4096;

struct Object {
    stamp: u64,
    values: Vec<u64>,
}

impl Object {
    fn new(stamp: u64, len: usize) -> Self {
        let values = (0..len as u64).map(|i| i ^ stamp).collect();
        Object { stamp, values }
    }

    fn intact(&self) -> bool {
        self.values
            .iter()
            .enumerate()
            .all(|(i, &v)| v == i as u64 ^ self.stamp)
    }
}

struct Objects {
    live: Vec<Object>,
    lengths: Uniform<usize>,
    created: u64,
}

impl Objects {
    fn new(max_len: usize) -> Self {
        Objects {
            live: Vec::new(),
            lengths: Uniform::new_inclusive(1, max_len.max(1)),
            created: 0,
        }
    }

    fn create<R: Rng>(&mut self, rng: &mut R) {
        self.created += 1;
        let len = self.lengths.sample(rng);
        self.live.push(Object::new(self.created, len));
    }

    fn destroy<R: Rng>(&mut self, rng: &mut R) {
        if self.live.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.live.len()).sample(rng);
        let obj = self.live.swap_remove(ix);
        assert!(obj.intact(), "object {} was overwritten", obj.stamp);
    }
}

fn check(step: usize) {
    let (validity, stats) = ALLOCATOR.stats();
    assert!(
        validity.is_valid(),
        "step {}: {:?} {:?}",
        step,
        validity,
        stats
    );
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help") {
        println!("USAGE: {} [STEPS] [WARMUP] [MAX_LEN]", args[0]);
        return;
    }
    let arg = |ix: usize, default: usize| -> usize {
        args.get(ix)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };
    let warmup = arg(2, WARMUP);
    let steps = arg(1, STEPS).max(warmup);
    let max_len = arg(3, MAX_LEN);

    // No logger here: a logger that allocates would re-enter the allocator
    // while it holds its lock.
    let seed: u64 = rand::thread_rng().next_u64();
    println!(
        "Stress test: {} steps, {} warmup, objects up to {} u64s, seed {}",
        steps, warmup, max_len, seed
    );
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects = Objects::new(max_len);
    for step in 0..warmup {
        objects.create(&mut rng);
        check(step);
    }

    for step in warmup..steps {
        // Bias towards keeping the population near its warmup size
        if rng.gen_ratio(warmup as u32, (warmup + objects.live.len()).max(1) as u32) {
            objects.create(&mut rng);
        } else {
            objects.destroy(&mut rng);
        }
        check(step);

        if step % 4096 == 0 {
            let (_, stats) = ALLOCATOR.stats();
            println!(
                "Step {:>6}: {} live objects, {} free blocks, {} free bytes",
                step,
                objects.live.len(),
                stats.length,
                stats.bytes()
            );
        }
    }

    while !objects.live.is_empty() {
        objects.destroy(&mut rng);
        check(steps);
    }

    let (_, stats) = ALLOCATOR.stats();
    let pages = ALLOCATOR.lock().grower.pages();
    println!("Finished: {:?}, {} pages mapped", stats, pages);
}
