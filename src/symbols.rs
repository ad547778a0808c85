pub mod demangle;
mod search_path;

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

pub use self::search_path::{build_search_path, process_command_line};
use crate::error::EngineError;
use crate::stack::pc_to_ptr;

const UNINITIALIZED: u8 = 0;
const READY: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// What the symbol service knows about one (possibly inlined) function at a
/// program counter. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Source file, with `/` as separator.
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Demangled function name, without the hash suffix.
    pub function: Option<String>,
}

/// Symbols of a program counter, innermost inlined function first.
///
/// Never empty: an address the service knows nothing about resolves to a
/// single [`SymbolInfo::default`].
pub type ResolvedFrame = Arc<[SymbolInfo]>;

type FrameCache = HashMap<usize, ResolvedFrame, BuildHasherDefault<DefaultHasher>>;

/// Maps program counters to file, line and function name.
///
/// Resolution goes through `backtrace`, which drives the platform symbol
/// service (`dbghelp` on Windows). Results are cached per program counter.
pub struct SymbolResolver {
    state: AtomicU8,
    cache: Mutex<FrameCache>,
}

impl SymbolResolver {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            cache: Mutex::new(HashMap::with_hasher(BuildHasherDefault::new())),
        }
    }

    /// Prepares the symbol service, telling it to look for symbols in
    /// `search_path`.
    ///
    /// On failure the resolver still works, with whatever the service finds
    /// on its own.
    pub fn initialize(&self, search_path: &str) -> Result<(), EngineError> {
        self.state.store(READY, Ordering::Release);
        set_search_path(search_path)
    }

    /// Resolves `pc`. Never fails; unknown fields are `None`.
    pub fn resolve(&self, pc: usize) -> ResolvedFrame {
        if let Some(frame) = self.cache.lock().get(&pc) {
            return Arc::clone(frame);
        }

        let mut symbols = Vec::new();
        backtrace::resolve(pc_to_ptr(pc), |symbol| {
            symbols.push(SymbolInfo {
                file: symbol
                    .filename()
                    .map(|path| path.to_string_lossy().replace('\\', "/")),
                line: symbol.lineno(),
                function: demangle::function_name(symbol),
            });
        });
        if symbols.is_empty() {
            symbols.push(SymbolInfo::default());
        }

        let frame: ResolvedFrame = symbols.into();
        self.cache.lock().insert(pc, Arc::clone(&frame));
        frame
    }

    /// Releases cached symbol data. Only the first call does anything;
    /// returns whether this call was it.
    pub fn shutdown(&self) -> bool {
        let previous = self.state.swap(SHUT_DOWN, Ordering::AcqRel);
        if previous == SHUT_DOWN {
            return false;
        }
        let cache = std::mem::take(&mut *self.cache.lock());
        drop(cache);
        true
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
fn set_search_path(search_path: &str) -> Result<(), EngineError> {
    use std::ffi::CString;

    use windows::Win32::System::Diagnostics::Debug::SymSetSearchPath;
    use windows::Win32::System::Threading::GetCurrentProcess;
    use windows::core::PCSTR;

    // resolving any address makes `backtrace` initialize dbghelp first
    backtrace::resolve(pc_to_ptr(set_search_path as *const () as usize), |_| {});

    let path = CString::new(search_path)
        .map_err(|err| EngineError::Initialization(err.to_string()))?;
    // SAFETY: `path` is NUL terminated and outlives the call.
    unsafe { SymSetSearchPath(GetCurrentProcess(), PCSTR(path.as_ptr().cast())) }
        .map_err(|err| EngineError::Initialization(err.to_string()))
}

#[cfg(not(windows))]
fn set_search_path(search_path: &str) -> Result<(), EngineError> {
    tracing::trace!("symbols are located by the unwinder, search path unused: {search_path}");
    Ok(())
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::stack::StackWalker;

    #[inline(never)]
    fn resolve_here(resolver: &SymbolResolver) -> ResolvedFrame {
        let stack = StackWalker::new().capture(1);
        resolver.resolve(stack[0])
    }

    #[test]
    fn test_should_resolve_file_line_and_function() {
        let resolver = SymbolResolver::new();
        resolver.initialize(".").unwrap();

        let frame = resolve_here(&resolver);
        let here = frame
            .iter()
            .find(|symbol| {
                symbol
                    .function
                    .as_deref()
                    .is_some_and(|name| name.ends_with("resolve_here"))
            })
            .expect("resolve_here frame");
        assert!(here.file.as_deref().is_some_and(|file| file.ends_with("src/symbols.rs")));
        assert!(here.line.is_some());
    }

    #[test]
    fn test_should_degrade_on_unknown_address() {
        let resolver = SymbolResolver::new();
        let frame = resolver.resolve(0x10);
        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0], SymbolInfo::default());
    }

    #[test]
    fn test_should_shutdown_once() {
        let resolver = SymbolResolver::new();
        resolver.initialize(".").unwrap();
        resolver.resolve(0x10);
        assert!(resolver.shutdown());
        assert!(!resolver.shutdown());
    }
}
