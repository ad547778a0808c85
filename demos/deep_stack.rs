use leakwatch::{Config, Engine, LeakwatchAllocator};

#[global_allocator]
static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
static ENGINE: Engine = Engine::new();

const DEPTH: usize = 300;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default()
        .with_max_trace_frames(512)
        .with_ignored_function("deep_stack::ignored");
    let _session = ENGINE.attach(&HEAP, config)?;
    ENGINE.mark_all_reported();

    let leaked = recurse(DEPTH);
    println!("leaked {} bytes at the bottom of {DEPTH} frames", leaked.len());
    ignored();

    // `_session` reports the leaks on drop
    Ok(())
}

#[inline(never)]
fn recurse(depth: usize) -> &'static mut [u8] {
    if depth == 0 {
        return vec![0xCDu8; 64].leak();
    }
    std::hint::black_box(recurse(depth - 1))
}

/// Leaks too, but is on the ignore list.
#[inline(never)]
fn ignored() {
    std::mem::forget(String::from("not reported"));
}
