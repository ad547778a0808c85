//! Win32 bindings of the import patcher.

use std::ffi::{CString, c_void};

use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress, LoadLibraryA};
use windows::Win32::System::Memory::{PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualProtect};
use windows::core::PCSTR;

use super::{ExportResolver, ImportPatcher, MemoryProtection};
use crate::error::PatchError;

/// Resolves exports with `GetProcAddress`, loading the module if needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Exports;

impl ExportResolver for Win32Exports {
    fn resolve_export(&self, module: &str, symbol: &str) -> Result<usize, PatchError> {
        let handle = load_module(module)?;
        let symbol_name = CString::new(symbol).map_err(|_| PatchError::ExportNotFound {
            module: module.to_string(),
            symbol: symbol.to_string(),
        })?;
        // SAFETY: `symbol_name` is NUL terminated and `handle` is loaded.
        let address = unsafe { GetProcAddress(handle, PCSTR(symbol_name.as_ptr().cast())) };
        address
            .map(|function| function as usize)
            .ok_or_else(|| PatchError::ExportNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })
    }
}

/// Changes protection with `VirtualProtect`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualMemory;

impl MemoryProtection for VirtualMemory {
    fn unprotect(&self, address: usize, len: usize) -> Result<u32, PatchError> {
        let mut previous = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: `address` is an import address table slot of a loaded module.
        unsafe { VirtualProtect(address as *const c_void, len, PAGE_READWRITE, &mut previous) }
            .map_err(|_| PatchError::Protect(address))?;
        Ok(previous.0)
    }

    fn restore(&self, address: usize, len: usize, previous: u32) {
        let mut ignored = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: same range as the matching `unprotect`.
        let result = unsafe {
            VirtualProtect(
                address as *const c_void,
                len,
                PAGE_PROTECTION_FLAGS(previous),
                &mut ignored,
            )
        };
        if let Err(err) = result {
            tracing::warn!("failed to restore protection at 0x{address:X}: {err}");
        }
    }
}

/// The import patcher of the running process.
pub type ProcessPatcher = ImportPatcher<Win32Exports, VirtualMemory>;

pub fn process_patcher() -> ProcessPatcher {
    ImportPatcher::new(Win32Exports, VirtualMemory)
}

/// Base address of a loaded module; `None` is the main executable.
pub fn module_base(module: Option<&str>) -> Result<usize, PatchError> {
    let handle = match module {
        None => unsafe { GetModuleHandleA(PCSTR::null()) }
            .map_err(|_| PatchError::ModuleNotFound("<main executable>".to_string()))?,
        Some(name) => {
            let name_c =
                CString::new(name).map_err(|_| PatchError::ModuleNotFound(name.to_string()))?;
            // SAFETY: `name_c` is NUL terminated.
            unsafe { GetModuleHandleA(PCSTR(name_c.as_ptr().cast())) }
                .map_err(|_| PatchError::ModuleNotFound(name.to_string()))?
        }
    };
    Ok(handle.0 as usize)
}

fn load_module(module: &str) -> Result<HMODULE, PatchError> {
    let name_c =
        CString::new(module).map_err(|_| PatchError::ModuleNotFound(module.to_string()))?;
    let name = PCSTR(name_c.as_ptr().cast());
    // SAFETY: `name` is NUL terminated and outlives both calls.
    unsafe { GetModuleHandleA(name).or_else(|_| LoadLibraryA(name)) }
        .map_err(|_| PatchError::ModuleNotFound(module.to_string()))
}
