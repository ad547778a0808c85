#![crate_name = "leakwatch"]
#![crate_type = "lib"]

//! # Leakwatch
//!
//! An in-process memory leak detector: a debug heap that remembers the call stack of every live
//! block, and reports the blocks still alive when the program shuts down.
//!
//! ## Introduction
//!
//! Leakwatch is made of two pieces:
//!
//! - the [`LeakwatchAllocator`], a global allocator which keeps every live block in a list,
//!   numbers each allocation with a request id and notifies a chain of hooks on every
//!   allocation, reallocation and free;
//! - the [`Engine`], which hooks into that heap, records the call stack of every block the
//!   program allocates, and at shutdown writes a report of the blocks nobody freed, with
//!   their call stack and the first bytes of their content.
//!
//! It's designed to be **plug-and-play**: set the allocator, attach the engine at the top of
//! `main`, and read the report when the program exits.
//!
//! ### Why do I need this?
//!
//! Even in Rust memory leaks happen: `Box::leak`, `mem::forget`, reference cycles, caches and maps
//! which only ever grow. Leakwatch tells you *which* allocations are never given back, and where
//! they were made.
//!
//! ## Usage
//!
//! ### Cargo.toml
//!
//! Add the following to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! leakwatch = "0.1"
//! ```
//!
//! ### Setup
//!
//! Set the **global allocator** to [`LeakwatchAllocator`] and declare an [`Engine`]:
//!
//! ```rust
//! use leakwatch::{Engine, LeakwatchAllocator};
//!
//! #[global_allocator]
//! static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
//! static ENGINE: Engine = Engine::new();
//! ```
//!
//! then attach the engine at the beginning of your `main` function. The returned [`Session`]
//! reports the leaks when dropped:
//!
//! ```rust,no_run
//! # use leakwatch::{Config, Engine, LeakwatchAllocator};
//! # #[global_allocator]
//! # static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
//! # static ENGINE: Engine = Engine::new();
//! fn main() {
//!     let _session = ENGINE
//!         .attach(&HEAP, Config::default().with_report_file("leaks.txt"))
//!         .expect("failed to install leakwatch");
//!
//!     let forgotten = Box::new([0u8; 100]);
//!     std::mem::forget(forgotten);
//! }
//! ```
//!
//! The report looks like this:
//!
//! ```text
//! WARNING: Detected memory leaks!
//! ---------- Block 1042 at 0x000055D0C1A2B3C0: 100 bytes ----------
//!   Call Stack:
//!     /home/me/app/src/main.rs (14): app::main
//!     ...
//!   Data:
//!     00 00 00 00    00 00 00 00    00 00 00 00    00 00 00 00     ........ ........
//!
//! Detected 1 memory leak.
//! ```
//!
//! ### Configuration
//!
//! See [`Config`]: stack depth, how many bytes of every block are dumped, functions whose
//! allocations are never tracked, a report file and its encoding, and the imports to redirect
//! to the debug heap on Windows (see [`patch::crt`]).
//!
//! ### Querying at runtime
//!
//! Leaks can be inspected before shutdown with [`Engine::leak_count`], [`Engine::leaks`] and
//! [`Engine::report_leaks`]; [`Engine::mark_all_reported`] sets a baseline, so that only the
//! blocks allocated afterwards are reported.
//!
//! ## Debug only
//!
//! Capturing a call stack on every allocation is slow. Leakwatch is meant for debug and test
//! builds, not for production.
//!

#![doc(html_playground_url = "https://play.rust-lang.org")]

mod alloc;
mod callstack;
mod config;
mod dispatcher;
mod engine;
mod error;
mod hook;
mod ledger;
pub mod patch;
pub mod report;
mod stack;
mod symbols;
mod thread_state;

pub use self::alloc::{BlockContents, BlockInfo, LeakwatchAllocator};
pub use self::callstack::CallStack;
pub use self::config::{Config, PatchEntry, ReportEncoding};
pub use self::engine::{Engine, Session};
pub use self::error::{EngineError, PatchError};
pub use self::hook::{
    AllocHook, EventKind, Forward, HeapEvent, HookChain, HookError, HookHandle, MAX_HOOKS,
    RequestId,
};
pub use self::patch::PatchOutcome;
pub use self::report::Leak;
pub use self::symbols::SymbolInfo;
pub use self::thread_state::in_engine;
