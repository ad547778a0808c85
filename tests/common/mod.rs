#![allow(dead_code)]

use std::io::Write;

use leakwatch::{Config, Engine, LeakwatchAllocator};
use parking_lot::{Mutex, MutexGuard, Once};

#[global_allocator]
pub static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
pub static ENGINE: Engine = Engine::new();

static SERIAL: Mutex<()> = Mutex::new(());
static INSTALL: Once = Once::new();
static OUTPUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());

/// Report writer collecting into [`OUTPUT`].
struct Output;

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        OUTPUT.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Installs the engine the first time, then starts a test from a clean
/// baseline: nothing tracked so far is reported, and the output is empty.
///
/// Tests of a binary share the engine, so the returned guard serializes them.
pub fn setup(config: Config) -> MutexGuard<'static, ()> {
    let serial = SERIAL.lock();
    INSTALL.call_once(|| {
        ENGINE.set_report_writer(Box::new(Output));
        ENGINE
            .initialize(&HEAP, config.with_report_to_debugger(false))
            .expect("failed to install leakwatch");
    });
    ENGINE.mark_all_reported();
    OUTPUT.lock().clear();
    serial
}

/// Takes the report text written so far.
pub fn take_output() -> String {
    let bytes = std::mem::take(&mut *OUTPUT.lock());
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Formats `address` the way the report does.
pub fn report_address(address: usize) -> String {
    format!("0x{address:0width$X}", width = 2 * std::mem::size_of::<usize>())
}
