mod common;

use leakwatch::Config;

use self::common::{ENGINE, setup};

#[inline(never)]
fn ignored_allocation() -> usize {
    vec![7u8; 64].leak().as_ptr() as usize
}

#[inline(never)]
fn tracked_allocation() -> usize {
    vec![7u8; 65].leak().as_ptr() as usize
}

/// Ignored, but not the immediate caller of the allocation.
#[inline(never)]
fn ignored_wrapper() -> usize {
    tracked_allocation()
}

fn config() -> Config {
    Config::default()
        .with_ignored_function("ignore_list::ignored_allocation")
        .with_ignored_function("ignore_list::ignored_wrapper")
}

#[test]
fn test_should_skip_allocations_of_ignored_function() {
    let _serial = setup(config());

    let ignored = ignored_allocation();
    let tracked = tracked_allocation();

    let leaks = ENGINE.leaks();
    assert!(leaks.iter().any(|leak| leak.address == tracked));
    assert!(leaks.iter().all(|leak| leak.address != ignored));
}

#[test]
fn test_should_only_match_immediate_caller() {
    let _serial = setup(config());

    let tracked = ignored_wrapper();
    assert!(ENGINE.leaks().iter().any(|leak| leak.address == tracked));
}

#[test]
fn test_should_track_exactly_the_unignored_allocations() {
    let _serial = setup(config());

    let mut ours = Vec::new();
    let mut tracked = Vec::new();
    for round in 0..4 {
        // alternate which allocation comes first
        let (first, second) = if round % 2 == 0 {
            (ignored_allocation(), tracked_allocation())
        } else {
            let tracked = tracked_allocation();
            (tracked, ignored_allocation())
        };
        let kept = if round % 2 == 0 { second } else { first };
        tracked.push(kept);
        ours.extend([first, second]);
    }
    let wrapped = ignored_wrapper();
    tracked.push(wrapped);
    ours.push(wrapped);

    let leaks: Vec<usize> = ENGINE
        .leaks()
        .iter()
        .map(|leak| leak.address)
        .filter(|address| ours.contains(address))
        .collect();
    assert_eq!(leaks, tracked);
}
