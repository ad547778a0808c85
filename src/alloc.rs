use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::hook::{EventKind, HeapEvent, HookChain, RequestId};
use crate::thread_state;

const COOKIE_MAGIC: usize = 0x1EAF_C0DE;
const PAGE_SIZE: usize = 4096;

/// Whether a block belongs to the program or to the detector's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Normal,
    Internal,
}

/// Header placed right before the user data of every block.
#[repr(C)]
struct BlockHeader {
    newer: *mut BlockHeader,
    older: *mut BlockHeader,
    request: u64,
    size: usize,
    align: usize,
    kind: BlockKind,
    cookie: usize,
}

/// Metadata of a live block, as copied out by [`LeakwatchAllocator::live_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub request: RequestId,
    pub address: usize,
    pub size: usize,
}

/// Destination buffer for [`LeakwatchAllocator::copy_contents`].
#[derive(Debug, Clone)]
pub struct BlockContents {
    pub request: RequestId,
    limit: usize,
    bytes: Vec<u8>,
}

impl BlockContents {
    /// Reserves room for up to `limit` bytes of the block `request`.
    pub fn new(request: RequestId, limit: usize) -> Self {
        Self {
            request,
            limit,
            bytes: Vec::with_capacity(limit),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A debug heap ([`GlobalAlloc`]) that keeps every live block in a list and
/// reports each heap operation to a [`HookChain`].
///
/// Each block is prefixed by a header holding its request id, size and list
/// links. The most recently allocated block is at the head of the list.
///
/// ## Example
///
/// ```rust
/// use leakwatch::LeakwatchAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: LeakwatchAllocator = LeakwatchAllocator::init();
/// ```
pub struct LeakwatchAllocator {
    allocated: AtomicUsize,
    live: AtomicUsize,
    next_request: AtomicU64,
    list_locked: AtomicBool,
    head: UnsafeCell<*mut BlockHeader>,
    hooks: HookChain,
}

// SAFETY: `head` and the links of every header are only touched while
// `list_locked` is held.
unsafe impl Sync for LeakwatchAllocator {}
unsafe impl Send for LeakwatchAllocator {}

impl LeakwatchAllocator {
    /// Creates a new instance of the [`LeakwatchAllocator`].
    pub const fn init() -> Self {
        LeakwatchAllocator {
            allocated: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            next_request: AtomicU64::new(1),
            list_locked: AtomicBool::new(false),
            head: UnsafeCell::new(ptr::null_mut()),
            hooks: HookChain::new(),
        }
    }

    /// Returns the number of bytes currently allocated by the allocator.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of live blocks, internal ones included.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// The hooks called on every heap operation.
    pub fn hooks(&self) -> &HookChain {
        &self.hooks
    }

    /// Copies the metadata of every live [`BlockKind::Normal`] block into
    /// `out`, newest first.
    ///
    /// `out` is sized before the list lock is taken; if blocks were added in
    /// the meantime the copy is retried with more room.
    pub fn live_blocks(&self, out: &mut Vec<BlockInfo>) {
        loop {
            out.clear();
            out.reserve(self.live_count() + 16);

            let complete = {
                let _list = self.lock_list();
                // SAFETY: the list is locked.
                let mut node = unsafe { *self.head.get() };
                let mut complete = true;
                while !node.is_null() {
                    // SAFETY: every node in the list is a live header.
                    let header = unsafe { &*node };
                    if header.kind == BlockKind::Normal {
                        if out.len() == out.capacity() {
                            complete = false;
                            break;
                        }
                        out.push(BlockInfo {
                            request: RequestId(header.request),
                            address: user_of(node) as usize,
                            size: header.size,
                        });
                    }
                    node = header.older;
                }
                complete
            };

            if complete {
                return;
            }
        }
    }

    /// Fills each of `blocks` with the first bytes of the live block carrying
    /// the same request id. Blocks no longer alive are left empty.
    pub fn copy_contents(&self, blocks: &mut [BlockContents]) {
        blocks.sort_unstable_by_key(|block| block.request);
        for block in blocks.iter_mut() {
            block.bytes.clear();
        }

        let _list = self.lock_list();
        // SAFETY: the list is locked.
        let mut node = unsafe { *self.head.get() };
        while !node.is_null() {
            // SAFETY: every node in the list is a live header.
            let header = unsafe { &*node };
            if let Ok(index) =
                blocks.binary_search_by_key(&RequestId(header.request), |block| block.request)
            {
                let block = &mut blocks[index];
                let len = header.size.min(block.limit);
                // SAFETY: the user data holds `header.size` initialized-or-not
                // bytes owned by the heap; they are only read.
                let data = unsafe { std::slice::from_raw_parts(user_of(node), len) };
                // capacity was reserved up front, so this never allocates
                block.bytes.extend_from_slice(data);
            }
            node = header.older;
        }
    }

    /// Returns whether `ptr` is the user pointer of a live block of this heap.
    pub fn owns(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let address = ptr as usize;
        let header_size = size_of::<BlockHeader>();

        // the cookie can only be read when the header shares the page of `ptr`
        if address % PAGE_SIZE >= header_size && address % align_of::<BlockHeader>() == 0 {
            let header = address - header_size;
            // SAFETY: the header lies in the same page as `ptr`, which the
            // caller handed out as a heap pointer, so it is mapped.
            let cookie = unsafe {
                ptr::read_unaligned(ptr::addr_of!((*(header as *const BlockHeader)).cookie))
            };
            if cookie != cookie_for(header as *const BlockHeader) {
                return false;
            }
        }

        let _list = self.lock_list();
        // SAFETY: the list is locked.
        let mut node = unsafe { *self.head.get() };
        while !node.is_null() {
            if user_of(node) as usize == address {
                return true;
            }
            // SAFETY: every node in the list is a live header.
            node = unsafe { (*node).older };
        }
        false
    }

    /// Size of the live block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn block_size(&self, ptr: *const u8) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe { (*header_of(ptr.cast_mut())).size }
    }

    /// Layout the block at `ptr` was allocated with.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn block_layout(&self, ptr: *const u8) -> Layout {
        // SAFETY: guaranteed by the caller.
        let header = unsafe { &*header_of(ptr.cast_mut()) };
        // SAFETY: size and align were taken from a valid layout.
        unsafe { Layout::from_size_align_unchecked(header.size, header.align) }
    }

    unsafe fn allocate(&self, layout: Layout, zeroed: bool) -> *mut u8 {
        let Some((outer, offset)) = outer_layout(layout) else {
            return ptr::null_mut();
        };
        // SAFETY: `outer` has a non-zero size, it always includes the header.
        let base = unsafe {
            if zeroed {
                System.alloc_zeroed(outer)
            } else {
                System.alloc(outer)
            }
        };
        if base.is_null() {
            return base;
        }

        // SAFETY: `offset` is within the block.
        let user = unsafe { base.add(offset) };
        let header = header_of(user);
        let kind = if thread_state::in_engine() {
            BlockKind::Internal
        } else {
            BlockKind::Normal
        };
        // SAFETY: the header slot is inside the block and suitably aligned.
        unsafe {
            header.write(BlockHeader {
                newer: ptr::null_mut(),
                older: ptr::null_mut(),
                request: self.next_request.fetch_add(1, Ordering::Relaxed),
                size: layout.size(),
                align: layout.align(),
                kind,
                cookie: cookie_for(header),
            });
            self.link(header);
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(layout.size(), Ordering::Relaxed);

        // SAFETY: the header was just written.
        unsafe { self.dispatch(EventKind::Alloc, header) };
        user
    }

    /// Links `header` at the head of the list.
    unsafe fn link(&self, header: *mut BlockHeader) {
        let _list = self.lock_list();
        // SAFETY: the list is locked and `header` is not in it.
        unsafe {
            let head = self.head.get();
            (*header).newer = ptr::null_mut();
            (*header).older = *head;
            if !(*head).is_null() {
                (**head).newer = header;
            }
            *head = header;
        }
    }

    unsafe fn unlink(&self, header: *mut BlockHeader) {
        let _list = self.lock_list();
        // SAFETY: the list is locked and `header` is in it.
        unsafe {
            let newer = (*header).newer;
            let older = (*header).older;
            if newer.is_null() {
                *self.head.get() = older;
            } else {
                (*newer).older = older;
            }
            if !older.is_null() {
                (*older).newer = newer;
            }
            (*header).newer = ptr::null_mut();
            (*header).older = ptr::null_mut();
        }
    }

    unsafe fn dispatch(&self, kind: EventKind, header: *const BlockHeader) {
        // SAFETY: guaranteed by the caller.
        let block = unsafe { &*header };
        let event = HeapEvent {
            kind,
            request: RequestId(block.request),
            address: user_of(header.cast_mut()) as usize,
            size: block.size,
            internal: block.kind == BlockKind::Internal,
        };
        self.hooks.dispatch(&event);
    }

    fn lock_list(&self) -> ListGuard<'_> {
        while self
            .list_locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        ListGuard {
            locked: &self.list_locked,
        }
    }
}

unsafe impl GlobalAlloc for LeakwatchAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { self.allocate(layout, false) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { self.allocate(layout, true) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        let Some((outer, offset)) = outer_layout(layout) else {
            return;
        };
        let header = header_of(ptr);
        unsafe {
            self.dispatch(EventKind::Free, header);
            self.unlink(header);
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        unsafe { System.dealloc(ptr.sub(offset), outer) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let (Some((outer, offset)), Some((new_outer, _))) =
            (outer_layout(layout), outer_layout(new_layout))
        else {
            return ptr::null_mut();
        };

        let header = header_of(ptr);
        unsafe { self.unlink(header) };
        let base = unsafe { System.realloc(ptr.sub(offset), outer, new_outer.size()) };
        if base.is_null() {
            // the old block is untouched
            unsafe { self.link(header) };
            return base;
        }

        let user = unsafe { base.add(offset) };
        let header = header_of(user);
        unsafe {
            (*header).size = new_size;
            (*header).cookie = cookie_for(header);
            self.link(header);
        }
        if new_size >= layout.size() {
            self.allocated
                .fetch_add(new_size - layout.size(), Ordering::Relaxed);
        } else {
            self.allocated
                .fetch_sub(layout.size() - new_size, Ordering::Relaxed);
        }

        unsafe { self.dispatch(EventKind::Realloc, header) };
        user
    }
}

struct ListGuard<'a> {
    locked: &'a AtomicBool,
}

impl Drop for ListGuard<'_> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Layout of the whole block and offset of the user data within it.
fn outer_layout(layout: Layout) -> Option<(Layout, usize)> {
    let align = layout.align().max(align_of::<BlockHeader>());
    let offset = size_of::<BlockHeader>().next_multiple_of(align);
    let size = offset.checked_add(layout.size())?;
    let outer = Layout::from_size_align(size, align).ok()?;
    Some((outer, offset))
}

fn header_of(user: *mut u8) -> *mut BlockHeader {
    user.wrapping_sub(size_of::<BlockHeader>()).cast()
}

fn user_of(header: *mut BlockHeader) -> *mut u8 {
    header.cast::<u8>().wrapping_add(size_of::<BlockHeader>())
}

fn cookie_for(header: *const BlockHeader) -> usize {
    header as usize ^ COOKIE_MAGIC
}
