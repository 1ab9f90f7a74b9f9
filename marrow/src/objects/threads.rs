use std::{
    alloc::Layout,
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    Header, HeapObject, ObjectKind, Value, Visitable, Visitor, WriteBarrier,
    visitor::visit_edge,
};

/// The managed thread object. Holds only data the managed side needs; the
/// native handle lives outside the heap in [`NativeThread`].
#[repr(C)]
#[derive(Debug)]
pub struct ThreadObject {
    pub header: Header,
    /// thread name, a ByteArray reference or nil
    pub name: Value,
}

impl ThreadObject {
    pub const FIXED_FIELDS: usize = 1;

    /// # Safety
    /// `self` must point to zeroed storage of `required_layout()`
    pub unsafe fn init(&mut self, class: Value, name: Value) {
        self.header =
            Header::new(ObjectKind::Thread, class, Self::FIXED_FIELDS);
        self.name = name;
    }

    #[inline]
    pub fn name(&self) -> Value {
        self.name
    }

    #[inline]
    pub fn set_name(&mut self, name: Value, barrier: &WriteBarrier) {
        self.name = name;
        barrier.record(&raw const self.name, name);
    }

    pub fn required_layout() -> Layout {
        Layout::new::<Self>()
    }
}

impl HeapObject for ThreadObject {
    fn heap_size(&self) -> usize {
        mem::size_of::<Self>()
    }
}

impl Visitable for ThreadObject {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        self.header.walk(visitor);
        visit_edge(&mut self.name, visitor);
    }
}

/// A spawned native thread that can be joined from more than one place and
/// outlives its `JoinHandle`. The first joiner takes the handle; everyone
/// else waits on the done flag.
pub struct NativeThread {
    handle: Mutex<Option<JoinHandle<()>>>,
    done: (Mutex<bool>, Condvar),
}

impl NativeThread {
    pub fn spawn<F>(f: F) -> Arc<Self>
    where
        F: FnOnce(),
        F: Send + 'static,
    {
        let nt = Arc::new(Self {
            handle: Mutex::new(None),
            done: (Mutex::new(false), Condvar::new()),
        });

        let nt2 = Arc::clone(&nt);
        let h = thread::spawn(move || {
            f();
            let (ref mx, ref cv) = nt2.done;
            *mx.lock() = true;
            cv.notify_all();
        });

        *nt.handle.lock() = Some(h);
        nt
    }

    /// Wait for the thread to finish. The panic payload of a thread that
    /// died is returned to the first joiner; later joiners get `Ok`.
    pub fn join(&self) -> thread::Result<()> {
        let taken = self.handle.lock().take();
        if let Some(h) = taken {
            let res = h.join();
            let (ref mx, ref cv) = self.done;
            *mx.lock() = true;
            cv.notify_all();
            return res;
        }

        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        while !*done {
            cv.wait(&mut done);
        }
        Ok(())
    }

    /// Returns true if the thread finished within `dur`.
    pub fn join_timeout(&self, dur: Duration) -> bool {
        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        if *done {
            return true;
        }
        let _ = cv.wait_for(&mut done, dur);
        *done
    }

    pub fn thread(&self) -> Option<thread::Thread> {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| handle.thread().clone())
    }
}
