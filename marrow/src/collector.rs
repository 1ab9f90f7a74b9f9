//! Semispace copying collection, driven entirely through the walk and
//! clone protocol: pause the world, relocate everything reachable from
//! the thread registry and the registered root sets into the inactive
//! space, Cheney-scan the copied region, flip, resume.

use std::time::{Duration, Instant};

use crate::{
    Heap, HeapObject, HeapValue, Safepoint, ThreadRegistry, Value, Visitable,
    Visitor, heap::align_word,
};

#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    pub objects_copied: usize,
    pub bytes_copied: usize,
    pub duration: Duration,
}

/// Relocating visitor. Copies an object on first visit, installs the
/// forwarding pointer, and resolves every later visit through it.
struct Forwarder {
    to_base: *mut u8,
    bump: usize,
    objects: usize,
}

impl Visitor for Forwarder {
    fn visit(&mut self, value: Value) -> Value {
        let Some(obj) = value.as_object::<HeapValue>() else {
            return value;
        };
        // SAFETY: the world is stopped, the old space is intact
        let old = unsafe { obj.as_ref() };
        if old.header().is_forwarded() {
            return old.header().forwarding();
        }

        let size = align_word(old.heap_size());
        // SAFETY: bump stays within the inactive space; live data never
        // exceeds one semispace
        let dst = unsafe { self.to_base.add(self.bump) };
        // SAFETY: dst covers size bytes of fresh to-space storage
        let copied = unsafe { old.clone_into(dst) };
        self.bump += size;
        self.objects += 1;

        // SAFETY: exclusive access to the old object during the pause
        unsafe { obj.as_mut() }
            .header_mut()
            .forward_to(copied.as_value());
        copied.as_value()
    }
}

/// Run one full collection. The calling thread must be a registered
/// mutator; it acts as the collector for the duration of the pause.
pub fn collect(
    heap: &Heap,
    registry: &ThreadRegistry,
    safepoint: &Safepoint,
) -> GcStats {
    let start = Instant::now();
    safepoint.begin_pause();
    // let in-flight object construction drain before touching the heap
    while heap.uninterruptable_count() != 0 {
        std::hint::spin_loop();
    }

    let (to_base, _capacity) = heap.inactive_space();
    let mut forwarder = Forwarder {
        to_base: to_base.as_ptr(),
        bump: 0,
        objects: 0,
    };

    registry.walk_globals(&mut forwarder);
    heap.walk_roots(&mut forwarder);

    // Cheney scan: every copied object's own references get relocated,
    // appending further copies until the region is closed
    let mut scan = 0;
    while scan < forwarder.bump {
        // SAFETY: scan points at a copied object inside to-space
        let obj = unsafe {
            &mut *forwarder.to_base.add(scan).cast::<HeapValue>()
        };
        let size = align_word(obj.heap_size());
        obj.walk(&mut forwarder);
        scan += size;
    }

    let stats = GcStats {
        objects_copied: forwarder.objects,
        bytes_copied: forwarder.bump,
        duration: start.elapsed(),
    };
    heap.flip(forwarder.bump);
    safepoint.end_pause();

    log::debug!(
        "collection copied {} objects ({} bytes) in {:?}",
        stats.objects_copied,
        stats.bytes_copied,
        stats.duration
    );
    stats
}
