use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::ReentrantMutex;

thread_local! {
    /// Set while the current thread runs detector code. Const-initialized and
    /// without a destructor, so reading it can never allocate.
    static IN_ENGINE: Cell<bool> = const { Cell::new(false) };
    static RECORDS: RecordSlot = const { RecordSlot(Cell::new(ptr::null_mut())) };
}

/// Returns whether the current thread is inside detector code.
///
/// The heap uses this to tag the blocks the detector allocates for itself.
pub fn in_engine() -> bool {
    IN_ENGINE.try_with(Cell::get).unwrap_or(true)
}

/// Per-thread bookkeeping, created on the first event a state sees on a
/// thread.
pub struct ThreadLocalRecord {
    owner: &'static ThreadLocalState,
    /// Record of another state on the same thread.
    next: *mut ThreadLocalRecord,
    thread: ThreadId,
    depth: Cell<usize>,
    frames: RefCell<Vec<usize>>,
}

impl ThreadLocalRecord {
    /// Thread this record belongs to.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Current reentrancy depth.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Scratch buffer for stack captures, reused across events.
    pub fn frames(&self) -> &RefCell<Vec<usize>> {
        &self.frames
    }
}

/// Head of the thread's records, one per state.
struct RecordSlot(Cell<*mut ThreadLocalRecord>);

impl RecordSlot {
    fn find(&self, owner: &ThreadLocalState) -> Option<*mut ThreadLocalRecord> {
        let mut node = self.0.get();
        while !node.is_null() {
            // SAFETY: records stay alive until the slot is dropped.
            let record = unsafe { &*node };
            if ptr::eq(record.owner, owner) {
                return Some(node);
            }
            node = record.next;
        }
        None
    }
}

impl Drop for RecordSlot {
    fn drop(&mut self) {
        let mut node = self.0.replace(ptr::null_mut());
        if node.is_null() {
            return;
        }
        let _ = IN_ENGINE.try_with(|flag| flag.set(true));
        while !node.is_null() {
            // SAFETY: the pointer comes from `Box::into_raw` in `create_record`
            // and is only ever reclaimed here.
            let record = unsafe { Box::from_raw(node) };
            node = record.next;
            record.owner.retired.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Lazily creates one [`ThreadLocalRecord`] per thread.
///
/// Every state counts its own records: a thread seen by two states has one
/// record in each.
///
/// Creation is serialized across threads by a reentrant mutex, so a thread
/// whose record creation triggers nested detector code on that same thread
/// does not deadlock.
pub struct ThreadLocalState {
    creation: ReentrantMutex<()>,
    created: AtomicUsize,
    retired: AtomicUsize,
}

impl ThreadLocalState {
    pub const fn new() -> Self {
        Self {
            creation: ReentrantMutex::new(()),
            created: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        }
    }

    /// Enters detector code on the current thread.
    ///
    /// Returns `None` when the thread is already inside. The in-engine flag is
    /// raised before the record is looked up or created, so every allocation
    /// made while creating it is seen as internal.
    pub fn enter(&'static self) -> Option<EngineGuard> {
        let entered = IN_ENGINE
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false);
        if !entered {
            return None;
        }

        let Some(record) = self.record() else {
            // thread-local storage is being torn down
            let _ = IN_ENGINE.try_with(|flag| flag.set(false));
            return None;
        };
        // SAFETY: the record lives until the thread exits and is only touched
        // from its own thread.
        let depth = unsafe { &(*record).depth };
        depth.set(depth.get() + 1);

        Some(EngineGuard {
            record,
            _not_send: std::marker::PhantomData,
        })
    }

    /// Number of records created by this state.
    pub fn records_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Number of records released because their thread exited.
    pub fn records_retired(&self) -> usize {
        self.retired.load(Ordering::Acquire)
    }

    fn record(&'static self) -> Option<*mut ThreadLocalRecord> {
        if let Some(existing) = RECORDS.try_with(|slot| slot.find(self)).ok()? {
            return Some(existing);
        }

        let _creation = self.creation.lock();
        RECORDS
            .try_with(|slot| {
                // a nested call on this thread may have won while we waited
                if let Some(current) = slot.find(self) {
                    return current;
                }
                let record = self.create_record(slot.0.get());
                slot.0.set(record);
                record
            })
            .ok()
    }

    fn create_record(&'static self, next: *mut ThreadLocalRecord) -> *mut ThreadLocalRecord {
        let record = Box::new(ThreadLocalRecord {
            owner: self,
            next,
            thread: std::thread::current().id(),
            depth: Cell::new(0),
            frames: RefCell::new(Vec::new()),
        });
        self.created.fetch_add(1, Ordering::AcqRel);
        Box::into_raw(record)
    }
}

impl Default for ThreadLocalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the current thread as running detector code until dropped.
pub struct EngineGuard {
    record: *mut ThreadLocalRecord,
    _not_send: std::marker::PhantomData<*mut ()>,
}

impl EngineGuard {
    pub fn record(&self) -> &ThreadLocalRecord {
        // SAFETY: see `ThreadLocalState::enter`.
        unsafe { &*self.record }
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        let depth = &self.record().depth;
        depth.set(depth.get().saturating_sub(1));
        let _ = IN_ENGINE.try_with(|flag| flag.set(false));
    }
}
