use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::callstack::CallStack;
use crate::config::Config;
use crate::hook::{EventKind, Forward, HeapEvent};
use crate::ledger::{BlockLedger, BlockRecord};
use crate::report::noise;
use crate::stack::StackWalker;
use crate::symbols::SymbolResolver;
use crate::thread_state::{EngineGuard, ThreadLocalState};

/// Observes heap events and keeps the [`BlockLedger`] in sync with them.
///
/// Events raised while the current thread is already inside detector code,
/// or for blocks the detector allocated for itself, are forwarded untouched.
/// The dispatcher never vetoes the hooks installed after it.
pub struct Dispatcher {
    threads: ThreadLocalState,
    ledger: BlockLedger,
    walker: StackWalker,
    max_frames: AtomicUsize,
    ignore: RwLock<BTreeSet<String>>,
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self {
            threads: ThreadLocalState::new(),
            ledger: BlockLedger::new(),
            walker: StackWalker::new(),
            max_frames: AtomicUsize::new(64),
            ignore: RwLock::new(BTreeSet::new()),
        }
    }

    /// Takes the frame limit and the ignore list from `config`.
    pub fn configure(&self, config: &Config) {
        self.max_frames
            .store(config.max_trace_frames, Ordering::Relaxed);
        *self.ignore.write() = config.ignore_functions.clone();
    }

    pub fn ledger(&self) -> &BlockLedger {
        &self.ledger
    }

    pub fn threads(&'static self) -> &'static ThreadLocalState {
        &self.threads
    }

    /// Stack pointer of the caller; frames at or below it are never captured.
    #[inline(always)]
    pub fn anchor(&self) -> usize {
        self.walker.anchor()
    }

    /// Handles one heap event.
    #[inline(never)]
    pub fn handle(&'static self, event: &HeapEvent, resolver: &SymbolResolver) -> Forward {
        let anchor = self.walker.anchor();
        self.handle_from(anchor, event, resolver)
    }

    /// Handles one heap event, capturing the frames above `anchor`.
    pub fn handle_from(
        &'static self,
        anchor: usize,
        event: &HeapEvent,
        resolver: &SymbolResolver,
    ) -> Forward {
        if event.internal {
            return Forward::Continue;
        }
        let Some(guard) = self.threads.enter() else {
            return Forward::Continue;
        };

        match event.kind {
            EventKind::Alloc => self.track(&guard, anchor, event, resolver),
            EventKind::Free => {
                self.ledger.erase(event.request);
            }
            EventKind::Realloc => {
                self.ledger.erase(event.request);
                self.track(&guard, anchor, event, resolver);
            }
        }
        Forward::Continue
    }

    fn track(
        &self,
        guard: &EngineGuard,
        anchor: usize,
        event: &HeapEvent,
        resolver: &SymbolResolver,
    ) {
        let Ok(mut frames) = guard.record().frames().try_borrow_mut() else {
            return;
        };
        self.walker
            .capture_from(anchor, self.max_frames.load(Ordering::Relaxed), &mut frames);

        if self.is_ignored(&frames, resolver) {
            return;
        }

        self.ledger.insert(BlockRecord {
            request: event.request,
            address: event.address,
            size: event.size,
            stack: CallStack::from(frames.as_slice()),
        });
    }

    /// Whether the immediate caller in `frames` is on the ignore list.
    ///
    /// The immediate caller is the first symbol that is not noise. Symbols are only resolved when the list is not empty.
    fn is_ignored(&self, frames: &[usize], resolver: &SymbolResolver) -> bool {
        let ignore = self.ignore.read();
        if ignore.is_empty() {
            return false;
        }

        for pc in frames {
            let frame = resolver.resolve(*pc);
            for symbol in frame.iter() {
                if noise::is_noise(symbol) {
                    continue;
                }
                return symbol
                    .function
                    .as_deref()
                    .is_some_and(|function| ignore.contains(function));
            }
        }
        false
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::hook::RequestId;

    static RESOLVER: SymbolResolver = SymbolResolver::new();

    fn event(kind: EventKind, request: u64, internal: bool) -> HeapEvent {
        HeapEvent {
            kind,
            request: RequestId(request),
            address: 0x1000 * request as usize,
            size: 24,
            internal,
        }
    }

    #[test]
    fn test_should_track_and_forget_blocks() {
        static DISPATCHER: Dispatcher = Dispatcher::new();

        assert_eq!(
            DISPATCHER.handle(&event(EventKind::Alloc, 1, false), &RESOLVER),
            Forward::Continue
        );
        DISPATCHER.handle(&event(EventKind::Alloc, 2, false), &RESOLVER);
        let record = DISPATCHER.ledger().get(RequestId(1)).unwrap();
        assert_eq!(record.size, 24);
        assert!(!record.stack.is_empty());

        DISPATCHER.handle(&event(EventKind::Free, 1, false), &RESOLVER);
        // untracked frees are ignored
        DISPATCHER.handle(&event(EventKind::Free, 99, false), &RESOLVER);
        assert_eq!(DISPATCHER.ledger().requests(), vec![RequestId(2)]);
    }

    #[test]
    fn test_should_skip_internal_events() {
        static DISPATCHER: Dispatcher = Dispatcher::new();

        DISPATCHER.handle(&event(EventKind::Alloc, 1, true), &RESOLVER);
        assert!(DISPATCHER.ledger().is_empty());
    }

    #[test]
    fn test_should_skip_events_raised_inside_engine() {
        static DISPATCHER: Dispatcher = Dispatcher::new();

        let guard = DISPATCHER.threads().enter().unwrap();
        DISPATCHER.handle(&event(EventKind::Alloc, 1, false), &RESOLVER);
        drop(guard);
        assert!(DISPATCHER.ledger().is_empty());
    }

    #[test]
    fn test_should_keep_request_on_realloc() {
        static DISPATCHER: Dispatcher = Dispatcher::new();

        DISPATCHER.handle(&event(EventKind::Alloc, 7, false), &RESOLVER);
        let mut grown = event(EventKind::Realloc, 7, false);
        grown.size = 4096;
        grown.address = 0xbeef0;
        DISPATCHER.handle(&grown, &RESOLVER);

        let record = DISPATCHER.ledger().get(RequestId(7)).unwrap();
        assert_eq!(record.size, 4096);
        assert_eq!(record.address, 0xbeef0);
        assert_eq!(DISPATCHER.ledger().len(), 1);
    }

    #[test]
    fn test_should_bound_stack_depth() {
        static DISPATCHER: Dispatcher = Dispatcher::new();

        DISPATCHER.configure(&Config::default().with_max_trace_frames(2));
        DISPATCHER.handle(&event(EventKind::Alloc, 1, false), &RESOLVER);
        assert_eq!(DISPATCHER.ledger().get(RequestId(1)).unwrap().stack.len(), 2);
    }
}
