use std::io::Write;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::alloc::LeakwatchAllocator;
use crate::config::{Config, PatchEntry};
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::hook::{Forward, HeapEvent, HookError, HookHandle};
use crate::patch::crt;
use crate::report::sink::ReportSink;
use crate::report::{Leak, LeakReporter, ReportOptions};
use crate::symbols::{SymbolResolver, build_search_path, process_command_line};

/// The engine whose dispatcher the installed hook calls into.
static ACTIVE: AtomicPtr<Engine> = AtomicPtr::new(ptr::null_mut());

/// The leak detector.
///
/// An `Engine` lives in a `static` next to the [`LeakwatchAllocator`] it
/// watches. [`Engine::initialize`] must run before the allocations to watch
/// and [`Engine::shutdown`] after them; [`Engine::attach`] ties the latter
/// to a guard.
///
/// ```rust,no_run
/// use leakwatch::{Config, Engine, LeakwatchAllocator};
///
/// #[global_allocator]
/// static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
/// static ENGINE: Engine = Engine::new();
///
/// fn main() {
///     let _session = ENGINE.attach(&HEAP, Config::default()).expect("leakwatch");
///     // ...
/// }
/// ```
pub struct Engine {
    dispatcher: Dispatcher,
    resolver: SymbolResolver,
    state: Mutex<EngineState>,
}

struct EngineState {
    heap: Option<&'static LeakwatchAllocator>,
    hook: Option<HookHandle>,
    options: ReportOptions,
    sink: Option<ReportSink>,
    pending_writer: Option<Box<dyn Write + Send>>,
    patched: Vec<(usize, PatchEntry)>,
}

impl Engine {
    pub const fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            resolver: SymbolResolver::new(),
            state: Mutex::new(EngineState {
                heap: None,
                hook: None,
                options: ReportOptions {
                    max_data_dump: 256,
                    show_noise_frames: false,
                },
                sink: None,
                pending_writer: None,
                patched: Vec::new(),
            }),
        }
    }

    /// Starts watching `heap`.
    ///
    /// A symbol service that fails to start only degrades the report. If the
    /// engine cannot hook into `heap`, it reports that it is not installed
    /// and returns the error; the program keeps running unobserved.
    pub fn initialize(
        &'static self,
        heap: &'static LeakwatchAllocator,
        config: Config,
    ) -> Result<(), EngineError> {
        let _inside = self.dispatcher.threads().enter();
        let mut state = self.state.lock();

        let mut sink = ReportSink::from_config(&config).unwrap_or_else(|err| {
            tracing::warn!("cannot open the report file, reporting to the debugger only: {err}");
            ReportSink::new(true, config.report_encoding)
        });
        if let Some(writer) = state.pending_writer.take() {
            sink.set_writer(writer);
        }

        if state.hook.is_some()
            || ACTIVE
                .compare_exchange(
                    ptr::null_mut(),
                    ptr::from_ref(self).cast_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            sink.report(format_args!("Leakwatch IS NOT installed!\n"));
            tracing::warn!("another leakwatch engine is already active");
            return Err(EngineError::AlreadyActive);
        }

        let cwd = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        let search_path = build_search_path(&process_command_line(), &cwd, |key| {
            std::env::var(key).ok()
        });
        tracing::debug!("symbol search path: {search_path}");
        if let Err(err) = self.resolver.initialize(&search_path) {
            tracing::warn!("{err}");
            sink.report(format_args!(
                "WARNING: Leakwatch: The symbol handler failed to initialize ({err}).\n    Stack traces will probably not be available for leaked blocks.\n"
            ));
        }

        self.dispatcher.configure(&config);
        match heap.hooks().install(engine_hook) {
            Ok(handle) => state.hook = Some(handle),
            Err(err) => {
                ACTIVE.store(ptr::null_mut(), Ordering::Release);
                sink.report(format_args!("Leakwatch IS NOT installed!\n"));
                tracing::warn!("cannot hook into the heap: {err}");
                return Err(EngineError::Linking(err));
            }
        }

        crt::register_heap(heap);
        state.patched = apply_patches(&config.patches);
        state.heap = Some(heap);
        state.options = ReportOptions::from(&config);
        sink.report(format_args!("Leakwatch installed.\n"));
        state.sink = Some(sink);
        tracing::debug!(
            "leakwatch installed: {} frames per stack, {} ignored functions, {} imports patched",
            config.max_trace_frames,
            config.ignore_functions.len(),
            state.patched.len()
        );
        Ok(())
    }

    /// [`Engine::initialize`], returning a guard that shuts the engine down
    /// when dropped.
    pub fn attach(
        &'static self,
        heap: &'static LeakwatchAllocator,
        config: Config,
    ) -> Result<Session, EngineError> {
        self.initialize(heap, config)?;
        Ok(Session { engine: self })
    }

    /// Stops watching, restores patched imports and reports the leaks.
    ///
    /// Returns the number of leaks reported. Calling it again, or on an
    /// engine that was never initialized, does nothing and returns 0.
    pub fn shutdown(&'static self) -> usize {
        let _inside = self.dispatcher.threads().enter();
        let mut state = self.state.lock();
        let Some(heap) = state.heap.take() else {
            return 0;
        };
        let mut sink = state
            .sink
            .take()
            .unwrap_or_else(|| ReportSink::new(true, Default::default()));

        if let Some(handle) = state.hook.take() {
            match heap.hooks().uninstall(handle) {
                Ok(()) => {}
                Err(HookError::Replaced(slot)) => {
                    tracing::warn!(
                        "{}, leaving the new hook in place",
                        EngineError::HookConflict(slot)
                    );
                    sink.report(format_args!(
                        "WARNING: Leakwatch: The allocation hook function was unhooked prematurely!\n    Some memory leaks may not have been detected.\n"
                    ));
                }
                Err(err) => tracing::warn!("cannot uninstall the hook: {err}"),
            }
        }
        let _ = ACTIVE.compare_exchange(
            ptr::from_ref(self).cast_mut(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        restore_patches(&std::mem::take(&mut state.patched));

        let leaks = self.reporter(heap, state.options).report(&mut sink);
        if self.resolver.shutdown() {
            tracing::debug!("symbol resolver released");
        }
        sink.report(format_args!("Leakwatch is now exiting.\n"));
        sink.flush();
        tracing::debug!("leakwatch shut down, {leaks} leaks reported");
        leaks
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().hook.is_some()
    }

    /// Number of tracked blocks that are still alive.
    pub fn leak_count(&'static self) -> usize {
        self.with_reporter(|reporter| reporter.count())
            .unwrap_or(0)
    }

    /// The current leaks, with the leading bytes of each block.
    pub fn leaks(&'static self) -> Vec<Leak> {
        self.with_reporter(|reporter| reporter.leaks_with_data())
            .unwrap_or_default()
    }

    /// Resolves the call stack of every current leak. Returns the number of
    /// frames without a function name.
    pub fn resolve_callstacks(&'static self) -> usize {
        self.with_reporter(|reporter| reporter.resolve_callstacks())
            .unwrap_or(0)
    }

    /// Stops tracking the current leaks, so later reports skip them.
    pub fn mark_all_reported(&'static self) -> usize {
        self.with_reporter(|reporter| reporter.mark_all_reported())
            .unwrap_or(0)
    }

    /// Reports the current leaks now. Reported leaks are not reported again.
    pub fn report_leaks(&'static self) -> usize {
        let _inside = self.dispatcher.threads().enter();
        let mut state = self.state.lock();
        let Some(heap) = state.heap else {
            return 0;
        };
        let options = state.options;
        let Some(sink) = state.sink.as_mut() else {
            return 0;
        };
        self.reporter(heap, options).report(sink)
    }

    /// Number of per-thread records created so far, one per thread that
    /// allocated while the engine was installed.
    pub fn thread_records(&'static self) -> usize {
        self.dispatcher.threads().records_created()
    }

    /// Sends report text to `writer`, in addition to the debugger if enabled.
    pub fn set_report_writer(&'static self, writer: Box<dyn Write + Send>) {
        let _inside = self.dispatcher.threads().enter();
        let mut state = self.state.lock();
        match state.sink.as_mut() {
            Some(sink) => sink.set_writer(writer),
            None => state.pending_writer = Some(writer),
        }
    }

    fn with_reporter<T>(&'static self, f: impl FnOnce(&LeakReporter<'_>) -> T) -> Option<T> {
        let _inside = self.dispatcher.threads().enter();
        let (heap, options) = {
            let state = self.state.lock();
            (state.heap?, state.options)
        };
        Some(f(&self.reporter(heap, options)))
    }

    fn reporter<'a>(
        &'a self,
        heap: &'a LeakwatchAllocator,
        options: ReportOptions,
    ) -> LeakReporter<'a> {
        LeakReporter::new(heap, self.dispatcher.ledger(), &self.resolver, options)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps an [`Engine`] installed; shuts it down when dropped.
#[must_use = "dropping the session shuts the engine down"]
pub struct Session {
    engine: &'static Engine,
}

impl Session {
    pub fn engine(&self) -> &'static Engine {
        self.engine
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

/// The hook installed into the heap's chain.
fn engine_hook(event: &HeapEvent) -> Forward {
    if event.internal {
        return Forward::Continue;
    }
    // SAFETY: only ever set from a `&'static Engine`.
    let Some(engine) = (unsafe { ACTIVE.load(Ordering::Acquire).as_ref() }) else {
        return Forward::Continue;
    };
    // read here, so the unwinding machinery below is never captured
    let anchor = engine.dispatcher.anchor();
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        engine
            .dispatcher
            .handle_from(anchor, event, &engine.resolver)
    }))
    .unwrap_or(Forward::Continue)
}

#[cfg(windows)]
fn apply_patches(entries: &[PatchEntry]) -> Vec<(usize, PatchEntry)> {
    use crate::patch::ExportResolver;
    use crate::patch::win;

    let patcher = win::process_patcher();
    let mut patched = Vec::new();
    for entry in entries {
        let module = match win::module_base(entry.importing_module.as_deref()) {
            Ok(module) => module,
            Err(err) => {
                tracing::warn!("not patching {}: {err}", entry.import_name);
                continue;
            }
        };
        if let Ok(real) = patcher
            .exports()
            .resolve_export(&entry.export_module, &entry.import_name)
        {
            crt::remember_real(&entry.import_name, real);
        }
        // SAFETY: `module` is a module loaded in this process.
        match unsafe { patcher.patch(module, std::slice::from_ref(entry)) } {
            Ok(outcome) if outcome.patched > 0 => patched.push((module, entry.clone())),
            Ok(_) => tracing::trace!(
                "{} does not import {}!{}",
                entry.importing_module.as_deref().unwrap_or("<main executable>"),
                entry.export_module,
                entry.import_name
            ),
            Err(err) => tracing::warn!("cannot patch {}: {err}", entry.import_name),
        }
    }
    patched
}

#[cfg(not(windows))]
fn apply_patches(entries: &[PatchEntry]) -> Vec<(usize, PatchEntry)> {
    if !entries.is_empty() {
        tracing::warn!(
            "import patching needs a PE process image, {} entries ignored",
            entries.len()
        );
    }
    Vec::new()
}

#[cfg(windows)]
fn restore_patches(patched: &[(usize, PatchEntry)]) {
    use crate::patch::win;

    let patcher = win::process_patcher();
    for (module, entry) in patched {
        // SAFETY: the module was patched by `apply_patches` and is still loaded.
        if let Err(err) = unsafe { patcher.restore(*module, std::slice::from_ref(entry)) } {
            tracing::warn!("cannot restore {}: {err}", entry.import_name);
        }
    }
}

#[cfg(not(windows))]
fn restore_patches(_patched: &[(usize, PatchEntry)]) {}

#[cfg(test)]
mod test {

    use std::alloc::{GlobalAlloc, Layout};
    use std::sync::Arc;

    use super::*;
    use crate::hook::EventKind;

    /// Tests share the process-wide active engine.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn config() -> Config {
        Config::default().with_report_to_debugger(false)
    }

    fn third_party(_: &HeapEvent) -> Forward {
        Forward::Continue
    }

    fn layout() -> Layout {
        Layout::from_size_align(48, 8).unwrap()
    }

    #[test]
    fn test_should_track_heap_through_hook() {
        static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
        static ENGINE: Engine = Engine::new();
        let _serial = SERIAL.lock();

        let captured = Captured::default();
        ENGINE.set_report_writer(Box::new(captured.clone()));
        ENGINE.initialize(&HEAP, config()).unwrap();
        assert!(ENGINE.is_installed());
        assert!(captured.text().starts_with("Leakwatch installed.\n"));

        let freed = unsafe { HEAP.alloc(layout()) };
        let leaked = unsafe { HEAP.alloc(layout()) };
        unsafe { HEAP.dealloc(freed, layout()) };
        assert_eq!(ENGINE.leak_count(), 1);
        assert_eq!(ENGINE.leaks()[0].address, leaked as usize);

        assert_eq!(ENGINE.shutdown(), 1);
        assert!(!ENGINE.is_installed());
        assert_eq!(ENGINE.shutdown(), 0);
        let text = captured.text();
        assert!(text.contains("---------- Block 2 at 0x"));
        assert!(text.contains("Detected 1 memory leak.\n"));
        assert!(text.ends_with("Leakwatch is now exiting.\n"));

        unsafe { HEAP.dealloc(leaked, layout()) };
    }

    #[test]
    fn test_should_refuse_second_engine() {
        static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
        static FIRST: Engine = Engine::new();
        static SECOND: Engine = Engine::new();
        let _serial = SERIAL.lock();

        FIRST.initialize(&HEAP, config()).unwrap();
        let err = SECOND.initialize(&HEAP, config()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActive));
        assert!(!SECOND.is_installed());
        assert_eq!(SECOND.shutdown(), 0);
        FIRST.shutdown();
    }

    #[test]
    fn test_should_report_linking_failure_on_full_chain() {
        static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
        static ENGINE: Engine = Engine::new();
        let _serial = SERIAL.lock();

        for _ in 0..crate::hook::MAX_HOOKS {
            HEAP.hooks().install(third_party).unwrap();
        }
        let captured = Captured::default();
        ENGINE.set_report_writer(Box::new(captured.clone()));
        let err = ENGINE.initialize(&HEAP, config()).unwrap_err();
        assert!(matches!(err, EngineError::Linking(HookError::ChainFull)));
        assert_eq!(captured.text(), "Leakwatch IS NOT installed!\n");
        assert!(ACTIVE.load(Ordering::Acquire).is_null());
    }

    #[test]
    fn test_should_survive_hook_conflict() {
        static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
        static ENGINE: Engine = Engine::new();
        let _serial = SERIAL.lock();

        let captured = Captured::default();
        ENGINE.set_report_writer(Box::new(captured.clone()));
        ENGINE.initialize(&HEAP, config()).unwrap();
        let slot = ENGINE.state.lock().hook.unwrap().slot();
        HEAP.hooks().replace(slot, Some(third_party));

        assert_eq!(ENGINE.shutdown(), 0);
        assert!(captured.text().contains("unhooked prematurely"));
        // the third party's hook is still there
        assert_eq!(HEAP.hooks().installed(), 1);
    }

    #[test]
    fn test_should_forward_without_active_engine() {
        let _serial = SERIAL.lock();
        let event = HeapEvent {
            kind: EventKind::Free,
            request: crate::hook::RequestId(1),
            address: 0,
            size: 0,
            internal: false,
        };
        assert_eq!(engine_hook(&event), Forward::Continue);
    }

    #[test]
    fn test_should_shutdown_on_session_drop() {
        static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
        static ENGINE: Engine = Engine::new();
        let _serial = SERIAL.lock();

        let session = ENGINE.attach(&HEAP, config()).unwrap();
        assert!(session.engine().is_installed());
        drop(session);
        assert!(!ENGINE.is_installed());
        assert_eq!(HEAP.hooks().installed(), 0);
    }
}
