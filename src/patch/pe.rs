//! Just enough of the PE format to walk a mapped image's import table.
//!
//! Every read goes through `read_unaligned` at an offset from the image
//! base; nothing here assumes the image was produced by a particular linker.

use std::ffi::CStr;
use std::ptr;

use crate::error::PatchError;

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const E_LFANEW: usize = 0x3C;
/// Farthest the NT headers may sit from the image base.
const MAX_NT_OFFSET: usize = 0x1000;
const OPTIONAL_HEADER: usize = 24;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const IMPORT_DIRECTORY: usize = 1;
const DESCRIPTOR_SIZE: usize = 20;

/// One entry of the import directory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub name: u32,
    pub first_thunk: u32,
}

/// A PE image mapped at `base`.
#[derive(Debug, Clone, Copy)]
pub struct PeImage {
    base: usize,
    pe32_plus: bool,
    imports_rva: u32,
    imports_size: u32,
}

impl PeImage {
    /// Reads the headers of the image mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to readable memory holding at least the image
    /// headers.
    pub unsafe fn parse(base: usize) -> Result<Self, PatchError> {
        if base == 0 {
            return Err(PatchError::NotAnImage(base));
        }
        let read_u16 = |offset: usize| unsafe { read::<u16>(base, offset) };
        let read_u32 = |offset: usize| unsafe { read::<u32>(base, offset) };

        if read_u16(0) != DOS_MAGIC {
            return Err(PatchError::NotAnImage(base));
        }
        let nt = read_u32(E_LFANEW) as usize;
        if nt > MAX_NT_OFFSET {
            return Err(PatchError::NotAnImage(base));
        }
        if read_u32(nt) != NT_SIGNATURE {
            return Err(PatchError::NotAnImage(base));
        }

        let optional = nt + OPTIONAL_HEADER;
        let (pe32_plus, directories, count) = match read_u16(optional) {
            PE32_MAGIC => (false, optional + 96, read_u32(optional + 92)),
            PE32_PLUS_MAGIC => (true, optional + 112, read_u32(optional + 108)),
            _ => return Err(PatchError::NotAnImage(base)),
        };

        let (imports_rva, imports_size) = if (count as usize) > IMPORT_DIRECTORY {
            let entry = directories + IMPORT_DIRECTORY * 8;
            (read_u32(entry), read_u32(entry + 4))
        } else {
            (0, 0)
        };

        Ok(Self {
            base,
            pe32_plus,
            imports_rva,
            imports_size,
        })
    }

    /// Width in bytes of an import address table slot.
    pub fn thunk_size(&self) -> usize {
        if self.pe32_plus { 8 } else { 4 }
    }

    /// Import descriptors, up to the terminating empty one.
    ///
    /// # Safety
    ///
    /// The image must be fully mapped.
    pub unsafe fn import_descriptors(&self) -> Vec<ImportDescriptor> {
        let mut descriptors = Vec::new();
        if self.imports_rva == 0 {
            return descriptors;
        }
        let capacity = (self.imports_size as usize / DESCRIPTOR_SIZE).max(1);
        let mut offset = self.imports_rva as usize;
        for _ in 0..capacity {
            // SAFETY: the descriptor lies in the import directory.
            let descriptor = unsafe {
                ImportDescriptor {
                    original_first_thunk: read(self.base, offset),
                    name: read(self.base, offset + 12),
                    first_thunk: read(self.base, offset + 16),
                }
            };
            if descriptor.name == 0 || descriptor.first_thunk == 0 {
                break;
            }
            descriptors.push(descriptor);
            offset += DESCRIPTOR_SIZE;
        }
        descriptors
    }

    /// Name of the module `descriptor` imports from.
    ///
    /// # Safety
    ///
    /// The image must be fully mapped.
    pub unsafe fn module_name(&self, descriptor: &ImportDescriptor) -> &CStr {
        // SAFETY: names are NUL-terminated strings inside the image.
        unsafe { CStr::from_ptr((self.base + descriptor.name as usize) as *const _) }
    }

    /// The descriptor of the imports from `module`, compared
    /// case-insensitively.
    ///
    /// # Safety
    ///
    /// The image must be fully mapped.
    pub unsafe fn find_import(&self, module: &str) -> Option<ImportDescriptor> {
        unsafe { self.import_descriptors() }
            .into_iter()
            .find(|descriptor| {
                let name = unsafe { self.module_name(descriptor) };
                name.to_bytes().eq_ignore_ascii_case(module.as_bytes())
            })
    }

    /// Addresses of the import address table slots of `descriptor`, up to
    /// the terminating null slot.
    ///
    /// # Safety
    ///
    /// The image must be fully mapped.
    pub unsafe fn iat_slots(&self, descriptor: &ImportDescriptor) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut slot = self.base + descriptor.first_thunk as usize;
        // SAFETY: the table is terminated by a null slot.
        while unsafe { self.read_slot(slot) } != 0 {
            slots.push(slot);
            slot += self.thunk_size();
        }
        slots
    }

    /// Reads the address stored in an import address table slot.
    ///
    /// # Safety
    ///
    /// `slot` must be a slot of this image.
    pub unsafe fn read_slot(&self, slot: usize) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe {
            if self.pe32_plus {
                read::<u64>(slot, 0) as usize
            } else {
                read::<u32>(slot, 0) as usize
            }
        }
    }

    /// Stores `address` into an import address table slot.
    ///
    /// # Safety
    ///
    /// `slot` must be a writable slot of this image.
    pub unsafe fn write_slot(&self, slot: usize, address: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            if self.pe32_plus {
                ptr::write_unaligned(slot as *mut u64, address as u64);
            } else {
                ptr::write_unaligned(slot as *mut u32, address as u32);
            }
        }
    }
}

unsafe fn read<T: Copy>(base: usize, offset: usize) -> T {
    unsafe { ptr::read_unaligned((base + offset) as *const T) }
}


#[cfg(test)]
mod test {

    use super::fixture::{KERNEL32_IAT, MSVCRT_IAT, SyntheticImage};
    use super::*;

    #[test]
    fn test_should_parse_import_table() {
        let mut image = SyntheticImage::new([0x1000, 0x1008], [0x2000, 0x2008]);
        let pe = unsafe { PeImage::parse(image.base()) }.unwrap();
        assert_eq!(pe.thunk_size(), std::mem::size_of::<usize>());

        let descriptors = unsafe { pe.import_descriptors() };
        assert_eq!(descriptors.len(), 2);
        assert_eq!(unsafe { pe.module_name(&descriptors[1]) }.to_bytes(), b"MSVCRT.dll");

        let msvcrt = unsafe { pe.find_import("msvcrt.DLL") }.unwrap();
        assert_eq!(msvcrt.first_thunk as usize, MSVCRT_IAT);
        let slots = unsafe { pe.iat_slots(&msvcrt) };
        assert_eq!(slots.len(), 2);
        assert_eq!(unsafe { pe.read_slot(slots[1]) }, 0x2008);
        assert!(unsafe { pe.find_import("user32.dll") }.is_none());
        assert_eq!(image.slot(KERNEL32_IAT, 0), 0x1000);
    }

    #[test]
    fn test_should_reject_non_images() {
        let mut junk = vec![0u8; 0x200];
        let base = junk.as_mut_ptr() as usize;
        assert_eq!(
            unsafe { PeImage::parse(base) }.unwrap_err(),
            PatchError::NotAnImage(base)
        );
        assert_eq!(unsafe { PeImage::parse(0) }.unwrap_err(), PatchError::NotAnImage(0));
    }

    #[test]
    fn test_should_reject_far_nt_headers() {
        let mut junk = vec![0u8; 0x200];
        junk[..2].copy_from_slice(&0x5A4Du16.to_le_bytes());
        junk[E_LFANEW..E_LFANEW + 4].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        let base = junk.as_mut_ptr() as usize;
        assert_eq!(
            unsafe { PeImage::parse(base) }.unwrap_err(),
            PatchError::NotAnImage(base)
        );
    }
}
