mod common;

use leakwatch::Config;

use self::common::{ENGINE, setup, take_output};

const DEPTH: usize = 300;

#[inline(never)]
fn recurse(depth: usize) -> usize {
    if depth == 0 {
        return vec![9u8; 48].leak().as_ptr() as usize;
    }
    std::hint::black_box(recurse(depth - 1))
}

#[test]
fn test_should_capture_deep_stacks() {
    let _serial = setup(Config::default().with_max_trace_frames(1024));

    let address = recurse(DEPTH);
    let leaks = ENGINE.leaks();
    let leak = leaks
        .iter()
        .find(|leak| leak.address == address)
        .expect("leak not tracked");
    assert!(leak.stack.len() > DEPTH);

    ENGINE.report_leaks();
    let text = take_output();
    assert!(text.matches("deep_stack::recurse").count() > DEPTH);
}
