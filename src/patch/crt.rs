//! C runtime allocation functions backed by the debug heap.
//!
//! Patching a module's `malloc` family to these makes its C allocations
//! flow through the heap's hook chain like Rust allocations do. Pointers the
//! heap does not own, such as blocks allocated before the patch, are handed
//! to the real C runtime function.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::alloc::LeakwatchAllocator;
use crate::config::PatchEntry;

/// Alignment `malloc` guarantees.
const MALLOC_ALIGN: usize = 2 * size_of::<usize>();

static HEAP: AtomicPtr<LeakwatchAllocator> = AtomicPtr::new(ptr::null_mut());

static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_MSIZE: AtomicUsize = AtomicUsize::new(0);

type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type MsizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

/// Makes the replacements allocate from `heap`.
pub fn register_heap(heap: &'static LeakwatchAllocator) {
    HEAP.store(ptr::from_ref(heap).cast_mut(), Ordering::Release);
}

/// Records the real address of `import_name`, used for foreign pointers.
pub fn remember_real(import_name: &str, address: usize) {
    let slot = match import_name {
        "realloc" => &REAL_REALLOC,
        "free" => &REAL_FREE,
        "_msize" => &REAL_MSIZE,
        _ => return,
    };
    slot.store(address, Ordering::Release);
}

/// Patch entries redirecting the `malloc` family exported by `export_module`
/// to the replacements in this module.
pub fn entries(export_module: &str) -> Vec<PatchEntry> {
    [
        ("malloc", malloc as *const () as usize),
        ("calloc", calloc as *const () as usize),
        ("realloc", realloc as *const () as usize),
        ("free", free as *const () as usize),
        ("_msize", _msize as *const () as usize),
    ]
    .into_iter()
    .map(|(name, replacement)| PatchEntry::new(export_module, name, replacement))
    .collect()
}

fn heap() -> Option<&'static LeakwatchAllocator> {
    // SAFETY: only ever set from a `&'static LeakwatchAllocator`.
    unsafe { HEAP.load(Ordering::Acquire).as_ref() }
}

fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size.max(1), MALLOC_ALIGN).ok()
}

fn real<F: Copy>(slot: &AtomicUsize) -> Option<F> {
    let address = slot.load(Ordering::Acquire);
    if address == 0 {
        return None;
    }
    debug_assert_eq!(size_of::<F>(), size_of::<usize>());
    // SAFETY: the slot holds the address of a C runtime function of type `F`.
    Some(unsafe { std::mem::transmute_copy::<usize, F>(&address) })
}

pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let (Some(heap), Some(layout)) = (heap(), layout_for(size)) else {
        return ptr::null_mut();
    };
    unsafe { heap.alloc(layout).cast() }
}

pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    let Some(total) = count.checked_mul(size) else {
        return ptr::null_mut();
    };
    let (Some(heap), Some(layout)) = (heap(), layout_for(total)) else {
        return ptr::null_mut();
    };
    unsafe { heap.alloc_zeroed(layout).cast() }
}

pub unsafe extern "C" fn realloc(block: *mut c_void, size: usize) -> *mut c_void {
    if block.is_null() {
        return unsafe { malloc(size) };
    }
    let Some(heap) = heap().filter(|heap| heap.owns(block.cast())) else {
        return match real::<ReallocFn>(&REAL_REALLOC) {
            Some(real) => unsafe { real(block, size) },
            None => ptr::null_mut(),
        };
    };
    if size == 0 {
        unsafe { free(block) };
        return ptr::null_mut();
    }

    let layout = unsafe { heap.block_layout(block.cast()) };
    unsafe { heap.realloc(block.cast(), layout, size).cast() }
}

pub unsafe extern "C" fn free(block: *mut c_void) {
    if block.is_null() {
        return;
    }
    match heap().filter(|heap| heap.owns(block.cast())) {
        Some(heap) => unsafe {
            let layout = heap.block_layout(block.cast());
            heap.dealloc(block.cast(), layout);
        },
        None => {
            if let Some(real) = real::<FreeFn>(&REAL_FREE) {
                unsafe { real(block) };
            }
        }
    }
}

pub unsafe extern "C" fn _msize(block: *mut c_void) -> usize {
    match heap().filter(|heap| heap.owns(block.cast())) {
        Some(heap) => unsafe { heap.block_size(block.cast()) },
        None => match real::<MsizeFn>(&REAL_MSIZE) {
            Some(real) => unsafe { real(block) },
            None => usize::MAX,
        },
    }
}
