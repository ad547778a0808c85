use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Maximum number of hooks a [`HookChain`] can hold.
pub const MAX_HOOKS: usize = 8;

/// Identifier the heap assigns to every allocation request.
///
/// Identifiers are handed out in increasing order and survive a `realloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of heap operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Alloc,
    Realloc,
    Free,
}

/// A single heap operation, as seen by the hooks of a [`HookChain`].
#[derive(Debug, Clone, Copy)]
pub struct HeapEvent {
    pub kind: EventKind,
    pub request: RequestId,
    /// Address of the user data. For `Realloc` this is the new address.
    pub address: usize,
    pub size: usize,
    /// The block belongs to the detector's own bookkeeping.
    pub internal: bool,
}

/// What a hook wants the chain to do with the remaining hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    Continue,
    Stop,
}

/// Signature of an allocation hook.
pub type AllocHook = fn(&HeapEvent) -> Forward;

/// Handle returned by [`HookChain::install`], needed to uninstall the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    slot: usize,
    hook: usize,
}

impl HookHandle {
    /// Slot of the chain the hook was installed into.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("the hook chain is full ({MAX_HOOKS} hooks)")]
    ChainFull,

    #[error("hook slot {0} was replaced before it was uninstalled")]
    Replaced(usize),
}

/// An ordered list of allocation hooks.
///
/// Hooks are called in registration order. Slots are plain atomics holding
/// function pointers, so dispatching never locks nor allocates.
pub struct HookChain {
    slots: [AtomicUsize; MAX_HOOKS],
    len: AtomicUsize,
}

impl HookChain {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicUsize::new(0) }; MAX_HOOKS],
            len: AtomicUsize::new(0),
        }
    }

    /// Appends `hook` to the chain.
    pub fn install(&self, hook: AllocHook) -> Result<HookHandle, HookError> {
        let slot = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < MAX_HOOKS).then_some(len + 1)
            })
            .map_err(|_| HookError::ChainFull)?;

        let raw = hook as usize;
        self.slots[slot].store(raw, Ordering::Release);
        Ok(HookHandle { slot, hook: raw })
    }

    /// Overwrites the hook stored in `slot`, returning the previous one.
    ///
    /// This is what a third party calling a "set hook" API does to the chain.
    pub fn replace(&self, slot: usize, hook: Option<AllocHook>) -> Option<AllocHook> {
        let raw = hook.map_or(0, |hook| hook as usize);
        let previous = self.slots.get(slot)?.swap(raw, Ordering::AcqRel);
        Self::decode(previous)
    }

    /// Removes the hook identified by `handle`.
    ///
    /// If the slot no longer holds the hook, the slot is left untouched and
    /// [`HookError::Replaced`] is returned.
    pub fn uninstall(&self, handle: HookHandle) -> Result<(), HookError> {
        self.slots[handle.slot]
            .compare_exchange(handle.hook, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| HookError::Replaced(handle.slot))
    }

    /// Number of occupied slots.
    pub fn installed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Calls every hook in order until one of them stops the chain.
    pub fn dispatch(&self, event: &HeapEvent) {
        let len = self.len.load(Ordering::Acquire);
        for slot in &self.slots[..len] {
            let Some(hook) = Self::decode(slot.load(Ordering::Acquire)) else {
                continue;
            };
            if hook(event) == Forward::Stop {
                break;
            }
        }
    }

    fn decode(raw: usize) -> Option<AllocHook> {
        if raw == 0 {
            return None;
        }
        // SAFETY: non-zero slot values are only ever written from `AllocHook`s.
        Some(unsafe { std::mem::transmute::<usize, AllocHook>(raw) })
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new()
    }
}
