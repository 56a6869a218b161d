use knr_allocator::UnixAllocator;

#[global_allocator]
static A: UnixAllocator = UnixAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);
}
