use thiserror::Error;

use crate::hook::HookError;

/// Errors returned by the [`crate::Engine`] lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("symbol service initialization failed: {0}")]
    Initialization(String),

    #[error("could not link into the heap's hook chain: {0}")]
    Linking(#[from] HookError),

    #[error("hook slot {0} was replaced by a third party")]
    HookConflict(usize),

    #[error("another engine is already active in this process")]
    AlreadyActive,

    #[error("import patching failed: {0}")]
    Patch(#[from] PatchError),

    #[error("report output error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while rewriting a module's import table.
///
/// A module that simply does not import a symbol is not an error: it is
/// counted as skipped in [`crate::PatchOutcome`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("no valid PE image at 0x{0:X}")]
    NotAnImage(usize),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("export '{symbol}' not found in '{module}'")]
    ExportNotFound { module: String, symbol: String },

    #[error("could not change memory protection at 0x{0:X}")]
    Protect(usize),
}
