//! Semispace heap: one anonymous mapping split into two halves, bump
//! allocation in the active half under a lock. The collector copies live
//! objects into the inactive half and flips.

use std::{
    alloc::Layout,
    cell::Cell,
    collections::HashSet,
    fmt, mem, ptr,
    ptr::NonNull,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::{
    Value, Visitable, Visitor, map_memory, unmap_memory, visitor::visit_edge,
};

pub const ROOT_SET_SIZE: usize = 32;

thread_local! {
    static UNINTERRUPTABLE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
pub struct HeapCreateInfo {
    pub size: usize,
    pub page_size: Option<usize>,
    // size of a dirty line, default 512
    pub dirty_line_size: Option<usize>,
}

#[derive(Debug)]
pub struct HeapSettings {
    pub page_size: usize,
    pub dirty_line_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            page_size: 32768,
            dirty_line_size: 512,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone)]
    pub struct PageFlags: u8 {
        const Used = 1 << 0;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageMeta {
    bytes_used: u32,
    flags: PageFlags,
}

impl PageMeta {
    pub fn empty() -> Self {
        Self {
            bytes_used: 0,
            flags: PageFlags::empty(),
        }
    }

    #[inline]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used as usize
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags.contains(PageFlags::Used)
    }
}

/// Allocation failed because the active semispace is exhausted. The
/// caller decides whether to collect and retry.
pub struct OutOfSpace {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Debug for OutOfSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out of space: requested {} bytes, {} available",
            self.requested, self.available
        )
    }
}

#[derive(Debug)]
struct AllocState {
    /// index of the active semispace
    active: usize,
    bump: usize,
    pages: Box<[PageMeta]>,
}

#[derive(Debug)]
pub struct Heap {
    start: NonNull<u8>,
    total_size: usize,
    space_size: usize,
    spaces: [NonNull<u8>; 2],
    settings: HeapSettings,
    state: Mutex<AllocState>,
    /// nonzero while some thread constructs an object; a collection pause
    /// may not begin until this drops to zero
    uninterruptable: AtomicUsize,
    barrier: WriteBarrier,
    roots: RwLock<HashSet<NonNull<RootSet>>>,
}

// SAFETY: all interior mutability goes through the state lock, the
// atomics, or the root set lock
unsafe impl Send for Heap {}
// SAFETY: see above
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(info: HeapCreateInfo) -> Self {
        let mut settings = HeapSettings::default();
        info.page_size.inspect(|&val| settings.page_size = val);
        info.dirty_line_size
            .inspect(|&val| settings.dirty_line_size = val);

        let space_size = (info.size / 2) & !(mem::size_of::<u64>() - 1);
        assert!(
            space_size >= settings.page_size,
            "heap too small for even one page per semispace"
        );
        let total_size = space_size * 2;

        let start = map_memory(total_size).expect("map memory for heap");
        // SAFETY: inside the fresh mapping
        let upper = unsafe { start.as_ptr().add(space_size) };
        // SAFETY: nonnull since start is
        let upper = unsafe { NonNull::new_unchecked(upper) };

        let page_count = space_size / settings.page_size;
        let pages: Box<[PageMeta]> =
            vec![PageMeta::empty(); page_count].into();

        let barrier = WriteBarrier::new(
            start.as_ptr() as usize,
            total_size,
            settings.dirty_line_size,
        );

        Self {
            start,
            total_size,
            space_size,
            spaces: [start, upper],
            settings,
            state: Mutex::new(AllocState {
                active: 0,
                bump: 0,
                pages,
            }),
            uninterruptable: AtomicUsize::new(0),
            barrier,
            roots: RwLock::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn barrier(&self) -> &WriteBarrier {
        &self.barrier
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.start.as_ptr() as usize;
        addr >= start && addr < start + self.total_size
    }

    /// Reserve zeroed, word-aligned storage for one whole object. The full
    /// size (header, fixed, indexable, trailing bytes) must be requested
    /// at once; there is no way to grow an allocation.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, OutOfSpace> {
        debug_assert!(layout.align() <= mem::size_of::<u64>() * 2);
        let size = align_word(layout.size());

        let mut state = self.state.lock();
        if state.bump + size > self.space_size {
            return Err(OutOfSpace {
                requested: size,
                available: self.space_size - state.bump,
            });
        }

        let offset = state.bump;
        state.bump += size;
        self.account_pages(&mut state, offset, size);

        let base = self.spaces[state.active];
        drop(state);

        // SAFETY: offset + size fits inside the active semispace
        let ptr = unsafe { base.as_ptr().add(offset) };
        // to-space contents are stale after a flip
        // SAFETY: ptr covers size writable bytes
        unsafe { ptr::write_bytes(ptr, 0, size) };
        // SAFETY: nonnull inside the mapping
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    fn account_pages(&self, state: &mut AllocState, offset: usize, size: usize) {
        let page_size = self.settings.page_size;
        let first = offset / page_size;
        let last = (offset + size - 1) / page_size;
        let mut remaining = size;
        for idx in first..=last {
            let page_end = (idx + 1) * page_size;
            let chunk = remaining.min(page_end - (offset.max(idx * page_size)));
            let page = &mut state.pages[idx];
            page.flags.insert(PageFlags::Used);
            page.bytes_used += chunk as u32;
            remaining -= chunk;
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.state.lock().bump
    }

    pub fn page_meta(&self, index: usize) -> PageMeta {
        self.state.lock().pages[index]
    }

    /// Bracket object construction. While the count is nonzero a
    /// collection pause may not begin.
    pub fn begin_uninterruptable(&self) {
        self.uninterruptable.fetch_add(1, Ordering::SeqCst);
        UNINTERRUPTABLE_DEPTH.with(|d| d.set(d.get() + 1));
    }

    pub fn end_uninterruptable(&self) {
        UNINTERRUPTABLE_DEPTH.with(|d| {
            debug_assert!(d.get() > 0, "unbalanced end_uninterruptable");
            d.set(d.get() - 1);
        });
        let prev = self.uninterruptable.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unbalanced end_uninterruptable");
    }

    pub fn uninterruptable_count(&self) -> usize {
        self.uninterruptable.load(Ordering::SeqCst)
    }

    /// Whether the calling thread is inside an uninterruptable scope.
    pub fn in_uninterruptable() -> bool {
        UNINTERRUPTABLE_DEPTH.with(|d| d.get()) > 0
    }

    pub fn register_root_set(&self, set: &RootSet) {
        let mut roots = self.roots.write();
        roots.insert(NonNull::from_ref(set));
    }

    pub fn unregister_root_set(&self, set: &RootSet) {
        let mut roots = self.roots.write();
        roots.remove(&NonNull::from_ref(set));
    }

    /// Walk every registered root set. Only the collector calls this,
    /// with the world stopped.
    pub(crate) fn walk_roots(&self, visitor: &mut impl Visitor) {
        let roots = self.roots.read();
        for &set in roots.iter() {
            // SAFETY: registered sets outlive their registration, and the
            // owning mutators are parked
            let set = unsafe { &mut *set.as_ptr() };
            set.walk(visitor);
        }
    }

    /// Base and capacity of the inactive semispace. Collector only, with
    /// the world stopped.
    pub(crate) fn inactive_space(&self) -> (NonNull<u8>, usize) {
        let state = self.state.lock();
        (self.spaces[1 - state.active], self.space_size)
    }

    /// Make the inactive space active with `used` bytes already occupied
    /// by relocated objects.
    pub(crate) fn flip(&self, used: usize) {
        let mut state = self.state.lock();
        state.active = 1 - state.active;
        state.bump = used;
        for page in state.pages.iter_mut() {
            *page = PageMeta::empty();
        }
        if used > 0 {
            self.account_pages(&mut state, 0, used);
        }
        self.barrier.clear();
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: mapped with this exact length in new()
        unsafe { unmap_memory(self.start, self.total_size) };
    }
}

pub(crate) fn align_word(size: usize) -> usize {
    (size + mem::size_of::<u64>() - 1) & !(mem::size_of::<u64>() - 1)
}

/// Dirty-line card table over the heap range. Every store that can
/// introduce a new inter-object reference goes through [`record`]; setters
/// take the barrier as an argument so there is no silent bypass.
///
/// [`record`]: WriteBarrier::record
#[derive(Debug)]
pub struct WriteBarrier {
    start: usize,
    len: usize,
    line_size: usize,
    lines: Box<[AtomicU8]>,
}

impl WriteBarrier {
    pub fn new(start: usize, len: usize, line_size: usize) -> Self {
        assert!(line_size > 0, "dirty line size must be nonzero");
        let count = len.div_ceil(line_size);
        let mut lines = Vec::with_capacity(count);
        lines.resize_with(count, || AtomicU8::new(0));
        Self {
            start,
            len,
            line_size,
            lines: lines.into(),
        }
    }

    /// A barrier covering no addresses; every record is a no-op. For
    /// objects that live outside a managed heap.
    pub fn unmapped() -> Self {
        Self::new(0, 0, HeapSettings::default().dirty_line_size)
    }

    /// Note a reference store into `slot`. Fixnum and nil stores never
    /// dirty a line, neither do slots outside the covered range.
    #[inline]
    pub fn record(&self, slot: *const Value, value: Value) {
        if !value.is_heap_object() {
            return;
        }
        let addr = slot as usize;
        if addr < self.start || addr >= self.start + self.len {
            return;
        }
        let line = (addr - self.start) / self.line_size;
        self.lines[line].store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        if addr < self.start || addr >= self.start + self.len {
            return false;
        }
        let line = (addr - self.start) / self.line_size;
        self.lines[line].load(Ordering::Relaxed) != 0
    }

    pub fn clear(&self) {
        for line in self.lines.iter() {
            line.store(0, Ordering::Relaxed);
        }
    }
}

/// Fixed-capacity set of values a mutator needs to survive relocation.
/// Registered with the heap; every collection walks and rewrites the
/// occupied slots.
#[derive(Debug)]
pub struct RootSet {
    bump: usize,
    roots: [Value; ROOT_SET_SIZE],
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RootSet {
    pub fn new() -> Self {
        Self {
            bump: 0,
            roots: [Value::nil(); ROOT_SET_SIZE],
        }
    }

    /// Pin a value, returning its slot index.
    pub fn push(&mut self, value: Value) -> usize {
        assert!(self.bump < ROOT_SET_SIZE, "root set full");
        self.roots[self.bump] = value;
        self.bump += 1;
        self.bump - 1
    }

    #[inline]
    pub fn get(&self, index: usize) -> Value {
        assert!(index < self.bump, "root slot out of range");
        self.roots[index]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bump
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bump == 0
    }

    pub fn clear(&mut self) {
        self.bump = 0;
    }
}

impl Visitable for RootSet {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        for slot in self.roots[0..self.bump].iter_mut() {
            visit_edge(slot, visitor);
        }
    }
}
