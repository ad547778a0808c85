pub mod crt;
pub mod pe;
#[cfg(windows)]
pub mod win;

use crate::config::PatchEntry;
use crate::error::PatchError;

use self::pe::PeImage;

/// Looks up the real address of an exported symbol.
pub trait ExportResolver {
    fn resolve_export(&self, module: &str, symbol: &str) -> Result<usize, PatchError>;
}

/// Changes the protection of memory holding an import address table.
pub trait MemoryProtection {
    /// Makes `len` bytes at `address` writable and returns the protection to
    /// restore afterwards.
    fn unprotect(&self, address: usize, len: usize) -> Result<u32, PatchError>;

    fn restore(&self, address: usize, len: usize, previous: u32);
}

/// Keeps a memory range writable until dropped.
pub struct WritableGuard<'a, M: MemoryProtection + ?Sized> {
    memory: &'a M,
    address: usize,
    len: usize,
    previous: u32,
}

impl<'a, M: MemoryProtection + ?Sized> WritableGuard<'a, M> {
    pub fn acquire(memory: &'a M, address: usize, len: usize) -> Result<Self, PatchError> {
        let previous = memory.unprotect(address, len)?;
        Ok(Self {
            memory,
            address,
            len,
            previous,
        })
    }
}

impl<M: MemoryProtection + ?Sized> Drop for WritableGuard<'_, M> {
    fn drop(&mut self) {
        self.memory.restore(self.address, self.len, self.previous);
    }
}

/// Outcome of patching or restoring a table on one module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Import address table slots rewritten.
    pub patched: usize,
    /// Entries the module does not import, or already in the wanted state.
    pub skipped: usize,
}

impl std::ops::AddAssign for PatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.patched += other.patched;
        self.skipped += other.skipped;
    }
}

/// Redirects imports of a mapped module to replacement functions.
pub struct ImportPatcher<R: ExportResolver, M: MemoryProtection> {
    exports: R,
    memory: M,
}

impl<R: ExportResolver, M: MemoryProtection> ImportPatcher<R, M> {
    pub fn new(exports: R, memory: M) -> Self {
        Self { exports, memory }
    }

    pub fn exports(&self) -> &R {
        &self.exports
    }

    /// Points every import of `module` listed in `table` at its replacement.
    ///
    /// Entries the module does not import are skipped. Patching twice is
    /// harmless: the second time the real address is no longer found.
    ///
    /// # Safety
    ///
    /// `module` must be the base of a mapped PE image, and no other thread
    /// may be rewriting its import address table.
    pub unsafe fn patch(
        &self,
        module: usize,
        table: &[PatchEntry],
    ) -> Result<PatchOutcome, PatchError> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.rewrite(module, table, Direction::Patch) }
    }

    /// Puts back the real address of every import of `module` listed in
    /// `table`.
    ///
    /// # Safety
    ///
    /// Same as [`ImportPatcher::patch`].
    pub unsafe fn restore(
        &self,
        module: usize,
        table: &[PatchEntry],
    ) -> Result<PatchOutcome, PatchError> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.rewrite(module, table, Direction::Restore) }
    }

    /// Rewrites every listed slot, or none: on failure the slots already
    /// written are put back before the error is returned.
    unsafe fn rewrite(
        &self,
        module: usize,
        table: &[PatchEntry],
        direction: Direction,
    ) -> Result<PatchOutcome, PatchError> {
        // SAFETY: guaranteed by the caller.
        let image = unsafe { PeImage::parse(module)? };
        let mut written = Vec::with_capacity(table.len());

        // SAFETY: guaranteed by the caller.
        match unsafe { self.rewrite_entries(&image, table, direction, &mut written) } {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::warn!(
                    "{direction:?} of module 0x{module:X} failed, rolling back {} slots: {err}",
                    written.len()
                );
                for (slot, previous) in written.into_iter().rev() {
                    match WritableGuard::acquire(&self.memory, slot, image.thunk_size()) {
                        // SAFETY: the slot was written above and is writable
                        // while the guard lives.
                        Ok(_writable) => unsafe { image.write_slot(slot, previous) },
                        Err(err) => tracing::error!("cannot roll back slot 0x{slot:X}: {err}"),
                    }
                }
                Err(err)
            }
        }
    }

    unsafe fn rewrite_entries(
        &self,
        image: &PeImage,
        table: &[PatchEntry],
        direction: Direction,
        written: &mut Vec<(usize, usize)>,
    ) -> Result<PatchOutcome, PatchError> {
        let mut outcome = PatchOutcome::default();

        for entry in table {
            let Some(descriptor) = (unsafe { image.find_import(&entry.export_module) }) else {
                tracing::trace!(
                    "module imports nothing from {}, skipping {}",
                    entry.export_module,
                    entry.import_name
                );
                outcome.skipped += 1;
                continue;
            };

            let real = self
                .exports
                .resolve_export(&entry.export_module, &entry.import_name)?;
            let (search, value) = match direction {
                Direction::Patch => (real, entry.replacement),
                Direction::Restore => (entry.replacement, real),
            };

            let slot = unsafe { image.iat_slots(&descriptor) }
                .into_iter()
                .find(|slot| unsafe { image.read_slot(*slot) } == search);
            let Some(slot) = slot else {
                outcome.skipped += 1;
                continue;
            };

            let _writable = WritableGuard::acquire(&self.memory, slot, image.thunk_size())?;
            // SAFETY: the slot belongs to the image and is writable while
            // the guard lives.
            unsafe { image.write_slot(slot, value) };
            written.push((slot, search));
            tracing::trace!(
                "{direction:?} {}!{} at 0x{slot:X}: 0x{search:X} -> 0x{value:X}",
                entry.export_module,
                entry.import_name
            );
            outcome.patched += 1;
        }

        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Patch,
    Restore,
}

#[cfg(test)]
mod test {

    use std::cell::Cell;
    use std::collections::HashMap;

    use super::pe::fixture::{KERNEL32_IAT, MSVCRT_IAT, SyntheticImage};
    use super::*;

    const MALLOC: usize = 0x7100;
    const FREE: usize = 0x7200;
    const HEAP_ALLOC: usize = 0x7300;
    const MY_MALLOC: usize = 0xA100;
    const MY_FREE: usize = 0xA200;

    struct FakeExports(HashMap<(String, String), usize>);

    impl FakeExports {
        fn new() -> Self {
            let exports = [
                ("msvcrt.dll", "malloc", MALLOC),
                ("msvcrt.dll", "free", FREE),
                ("msvcrt.dll", "calloc", 0x7400),
                ("kernel32.dll", "HeapAlloc", HEAP_ALLOC),
            ];
            Self(
                exports
                    .into_iter()
                    .map(|(module, symbol, address)| ((module.to_string(), symbol.to_string()), address))
                    .collect(),
            )
        }
    }

    impl ExportResolver for FakeExports {
        fn resolve_export(&self, module: &str, symbol: &str) -> Result<usize, PatchError> {
            self.0
                .get(&(module.to_lowercase(), symbol.to_string()))
                .copied()
                .ok_or_else(|| PatchError::ExportNotFound {
                    module: module.to_string(),
                    symbol: symbol.to_string(),
                })
        }
    }

    #[derive(Default)]
    struct CountingProtection {
        unprotected: Cell<usize>,
        restored: Cell<usize>,
    }

    impl MemoryProtection for CountingProtection {
        fn unprotect(&self, _address: usize, _len: usize) -> Result<u32, PatchError> {
            self.unprotected.set(self.unprotected.get() + 1);
            Ok(0x02)
        }

        fn restore(&self, _address: usize, _len: usize, previous: u32) {
            assert_eq!(previous, 0x02);
            self.restored.set(self.restored.get() + 1);
        }
    }

    fn table() -> Vec<PatchEntry> {
        vec![
            PatchEntry::new("MSVCRT.DLL", "malloc", MY_MALLOC),
            PatchEntry::new("msvcrt.dll", "free", MY_FREE),
            // imported module, but this symbol is not imported
            PatchEntry::new("msvcrt.dll", "calloc", 0xA300),
            // module not imported at all
            PatchEntry::new("user32.dll", "MessageBoxA", 0xA400),
        ]
    }

    #[test]
    fn test_should_patch_and_restore_imports() {
        let mut image = SyntheticImage::new([HEAP_ALLOC, 0x7500], [MALLOC, FREE]);
        let patcher = ImportPatcher::new(FakeExports::new(), CountingProtection::default());
        let base = image.base();

        let outcome = unsafe { patcher.patch(base, &table()) }.unwrap();
        assert_eq!(outcome, PatchOutcome { patched: 2, skipped: 2 });
        assert_eq!(image.slot(MSVCRT_IAT, 0), MY_MALLOC);
        assert_eq!(image.slot(MSVCRT_IAT, 1), MY_FREE);
        assert_eq!(image.slot(KERNEL32_IAT, 0), HEAP_ALLOC);

        let outcome = unsafe { patcher.restore(base, &table()) }.unwrap();
        assert_eq!(outcome.patched, 2);
        assert_eq!(image.slot(MSVCRT_IAT, 0), MALLOC);
        assert_eq!(image.slot(MSVCRT_IAT, 1), FREE);

        // every write was bracketed
        assert_eq!(patcher.memory.unprotected.get(), 4);
        assert_eq!(patcher.memory.restored.get(), 4);
    }

    #[test]
    fn test_should_patch_idempotently() {
        let mut image = SyntheticImage::new([HEAP_ALLOC, 0x7500], [MALLOC, FREE]);
        let patcher = ImportPatcher::new(FakeExports::new(), CountingProtection::default());
        let base = image.base();

        unsafe { patcher.patch(base, &table()) }.unwrap();
        let again = unsafe { patcher.patch(base, &table()) }.unwrap();
        assert_eq!(again, PatchOutcome { patched: 0, skipped: 4 });
        assert_eq!(image.slot(MSVCRT_IAT, 0), MY_MALLOC);
    }

    #[test]
    fn test_should_fail_on_unknown_export() {
        let mut image = SyntheticImage::new([HEAP_ALLOC, 0x7500], [MALLOC, FREE]);
        let patcher = ImportPatcher::new(FakeExports::new(), CountingProtection::default());
        let table = [PatchEntry::new("msvcrt.dll", "_msize", 0xA500)];

        let err = unsafe { patcher.patch(image.base(), &table) }.unwrap_err();
        assert!(matches!(err, PatchError::ExportNotFound { .. }));
    }

    #[test]
    fn test_should_roll_back_batch_on_unknown_export() {
        let mut image = SyntheticImage::new([HEAP_ALLOC, 0x7500], [MALLOC, FREE]);
        let patcher = ImportPatcher::new(FakeExports::new(), CountingProtection::default());
        let table = [
            PatchEntry::new("msvcrt.dll", "malloc", MY_MALLOC),
            PatchEntry::new("msvcrt.dll", "_msize", 0xA500),
        ];

        let err = unsafe { patcher.patch(image.base(), &table) }.unwrap_err();
        assert!(matches!(err, PatchError::ExportNotFound { .. }));
        assert_eq!(image.slot(MSVCRT_IAT, 0), MALLOC);
        assert_eq!(image.slot(MSVCRT_IAT, 1), FREE);
        // the write and its rollback were both bracketed
        assert_eq!(patcher.memory.unprotected.get(), 2);
        assert_eq!(patcher.memory.restored.get(), 2);
    }
}
