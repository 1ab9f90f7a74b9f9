//! The Vm facade: wires heap, safepoint coordinator, and thread registry
//! together and offers the object construction entry points. Every
//! construction runs inside an uninterruptable scope, so a collection can
//! happen before the storage is reserved but never in the middle of
//! initialization.
//!
//! Reference arguments that must survive a collection belong in a
//! registered root set; this module only resolves forwarding installed by
//! a collection that ran during its own allocation request.

use std::{alloc::Layout, ptr::NonNull, sync::Arc};

use crate::{
    Array, ByteArray, GcStats, Heap, HeapCreateInfo, HeapObject, HeapValue,
    KindDescriptor, LayoutConfig, Method, ObjectKind, Ref, Safepoint,
    SlotObject, ThreadObject, ThreadRegistry, Value, collector,
};

#[derive(Debug, Default)]
pub struct VmCreateInfo {
    pub heap: HeapCreateInfo,
    pub layout: LayoutConfig,
    /// share a coordinator with another Vm instead of creating one
    pub safepoint: Option<Arc<Safepoint>>,
}

#[derive(Debug)]
pub struct VmShared {
    pub heap: Heap,
    pub safepoint: Arc<Safepoint>,
    pub threads: ThreadRegistry,
    pub layout: LayoutConfig,
    method_descriptor: KindDescriptor,
    thread_descriptor: KindDescriptor,
}

#[derive(Debug, Clone)]
pub struct Vm {
    inner: Arc<VmShared>,
}

impl std::ops::Deref for Vm {
    type Target = VmShared;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Vm {
    pub fn new(info: VmCreateInfo) -> Self {
        let heap = Heap::new(info.heap);
        let safepoint = info.safepoint.unwrap_or_default();
        let threads = ThreadRegistry::new(safepoint.clone());
        let method_descriptor = KindDescriptor::method(&info.layout);
        let thread_descriptor = KindDescriptor::thread(&info.layout);

        Self {
            inner: Arc::new(VmShared {
                heap,
                safepoint,
                threads,
                layout: info.layout,
                method_descriptor,
                thread_descriptor,
            }),
        }
    }

    pub fn method_descriptor(&self) -> &KindDescriptor {
        &self.method_descriptor
    }

    /// Periodic mutator poll. Calling it while constructing an object
    /// would let the world stop with a half-built object visible, so that
    /// is fatal.
    pub fn safepoint_check(&self) {
        if Heap::in_uninterruptable() {
            log::error!(
                "safepoint poll inside an uninterruptable allocation scope"
            );
            panic!("safepoint poll during object construction");
        }
        self.safepoint.check();
    }

    /// Run a collection. The calling thread must be a registered mutator.
    pub fn collect(&self) -> GcStats {
        collector::collect(&self.heap, &self.threads, &self.safepoint)
    }

    pub fn allocate_slot_object(
        &self,
        class: Value,
        fixed_fields: usize,
    ) -> Ref<SlotObject> {
        self.heap.begin_uninterruptable();
        let storage =
            self.allocate_or_collect(SlotObject::required_layout(fixed_fields));
        let class = resolve_forwarding(class);
        let obj = storage.as_ptr() as *mut SlotObject;
        // SAFETY: fresh zeroed storage of the requested layout
        unsafe { (*obj).init(class, fixed_fields) };
        self.heap.end_uninterruptable();
        Ref::new(obj)
    }

    pub fn allocate_array(&self, class: Value, size: usize) -> Ref<Array> {
        self.heap.begin_uninterruptable();
        let storage = self.allocate_or_collect(Array::required_layout(size));
        let class = resolve_forwarding(class);
        let obj = storage.as_ptr() as *mut Array;
        // SAFETY: fresh zeroed storage of the requested layout
        unsafe { (*obj).init(class, size) };
        self.heap.end_uninterruptable();
        Ref::new(obj)
    }

    pub fn allocate_byte_array(
        &self,
        class: Value,
        size: usize,
    ) -> Ref<ByteArray> {
        self.heap.begin_uninterruptable();
        let storage =
            self.allocate_or_collect(ByteArray::required_layout(size));
        let class = resolve_forwarding(class);
        let obj = storage.as_ptr() as *mut ByteArray;
        // SAFETY: fresh zeroed storage of the requested layout
        unsafe { (*obj).init(class, size) };
        self.heap.end_uninterruptable();
        Ref::new(obj)
    }

    pub fn allocate_byte_array_data(
        &self,
        class: Value,
        data: &[u8],
    ) -> Ref<ByteArray> {
        self.heap.begin_uninterruptable();
        let storage =
            self.allocate_or_collect(ByteArray::required_layout(data.len()));
        let class = resolve_forwarding(class);
        let obj = storage.as_ptr() as *mut ByteArray;
        // SAFETY: fresh zeroed storage of the requested layout
        unsafe { (*obj).init_with_data(class, data) };
        self.heap.end_uninterruptable();
        Ref::new(obj)
    }

    pub fn allocate_method(
        &self,
        class: Value,
        bytecode_count: usize,
        num_locals: usize,
        max_stack: usize,
        num_arguments: usize,
        num_literals: usize,
    ) -> Ref<Method> {
        let descriptor = self.method_descriptor;
        self.heap.begin_uninterruptable();
        let storage = self.allocate_or_collect(Method::required_layout(
            &descriptor,
            num_literals,
            bytecode_count,
        ));
        let class = resolve_forwarding(class);
        let obj = storage.as_ptr() as *mut Method;
        // SAFETY: fresh zeroed storage of the requested layout
        unsafe {
            (*obj).init(
                class,
                &descriptor,
                bytecode_count,
                num_locals,
                max_stack,
                num_arguments,
                num_literals,
            );
        }
        self.heap.end_uninterruptable();
        Ref::new(obj)
    }

    pub fn allocate_thread_object(
        &self,
        class: Value,
        name: Value,
    ) -> Ref<ThreadObject> {
        debug_assert_eq!(self.thread_descriptor.kind, ObjectKind::Thread);
        self.heap.begin_uninterruptable();
        let storage =
            self.allocate_or_collect(ThreadObject::required_layout());
        let class = resolve_forwarding(class);
        let name = resolve_forwarding(name);
        let obj = storage.as_ptr() as *mut ThreadObject;
        // SAFETY: fresh zeroed storage of the requested layout
        unsafe { (*obj).init(class, name) };
        self.heap.end_uninterruptable();
        Ref::new(obj)
    }

    /// Reserve storage, collecting and retrying once on exhaustion.
    /// Failure after the retry does not return. The uninterruptable scope
    /// is opened by the caller and released around the collection.
    fn allocate_or_collect(&self, layout: Layout) -> NonNull<u8> {
        match self.heap.allocate(layout) {
            Ok(storage) => storage,
            Err(_) => {
                self.heap.end_uninterruptable();
                let stats = self.collect();
                self.heap.begin_uninterruptable();
                match self.heap.allocate(layout) {
                    Ok(storage) => storage,
                    Err(err) => {
                        log::error!(
                            "allocation of {} bytes failed after a \
                             collection that kept {} bytes live",
                            layout.size(),
                            stats.bytes_copied
                        );
                        panic!("{err:?}");
                    }
                }
            }
        }
    }
}

/// Follow a forwarding pointer installed by a collection that ran while
/// the caller was allocating. The old space stays mapped until the next
/// flip, so the old header is still readable.
fn resolve_forwarding(value: Value) -> Value {
    let Some(obj) = value.as_object::<HeapValue>() else {
        return value;
    };
    // SAFETY: old-space headers stay readable until the next collection
    let header = unsafe { obj.as_ref() }.header();
    if header.is_forwarded() {
        header.forwarding()
    } else {
        value
    }
}
