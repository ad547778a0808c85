use crate::symbols::SymbolInfo;

/// Source files whose frames are internal to the heap or to the detector.
const NOISE_FILES: &[&str] = &[
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/"),
    "library/alloc/src/",
    "library/core/src/alloc/",
    "library/std/src/alloc.rs",
    "library/std/src/sys/alloc/",
    "library/std/src/panic.rs",
    "library/std/src/panicking.rs",
    "library/core/src/panic/unwind_safe.rs",
    "afxmem.cpp",
    "dbgheap.c",
    "new.cpp",
];

/// Symbols the compiler generates to route allocations to the global
/// allocator. Their debug info points at the `#[global_allocator]` item.
const ALLOCATOR_SHIMS: &[&str] = &[
    "__rust_alloc",
    "__rust_alloc_zeroed",
    "__rust_realloc",
    "__rust_dealloc",
    "__rg_alloc",
    "__rg_alloc_zeroed",
    "__rg_realloc",
    "__rg_dealloc",
];

/// Whether `file` is one of the noise files. `\` and `/` compare equal.
pub fn is_noise_file(file: &str) -> bool {
    NOISE_FILES
        .iter()
        .any(|noise| contains_path(file.as_bytes(), noise.as_bytes()))
}

pub fn is_allocator_shim(function: &str) -> bool {
    let last = function.rsplit("::").next().unwrap_or(function);
    ALLOCATOR_SHIMS.contains(&last)
}

/// Whether a resolved frame is noise.
///
/// Without a source file nothing can be said, so the frame is not noise.
pub fn is_noise(symbol: &SymbolInfo) -> bool {
    let Some(file) = symbol.file.as_deref() else {
        return false;
    };
    is_noise_file(file) || symbol.function.as_deref().is_some_and(is_allocator_shim)
}

fn contains_path(haystack: &[u8], needle: &[u8]) -> bool {
    let same = |a: u8, b: u8| a == b || (matches!(a, b'/' | b'\\') && matches!(b, b'/' | b'\\'));
    haystack
        .windows(needle.len())
        .any(|window| window.iter().zip(needle).all(|(a, b)| same(*a, *b)))
}
