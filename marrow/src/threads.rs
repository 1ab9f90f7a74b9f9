//! The thread registry: maps native thread identities to their managed
//! thread objects. Doubles as a GC root set; every collection rewrites
//! its entries.

use std::{collections::HashMap, sync::Arc, thread, thread::ThreadId};

use parking_lot::Mutex;

use crate::{
    NativeThread, Safepoint, Value, Visitor, WriteBarrier,
    visitor::visit_edge,
};

#[derive(Debug)]
pub struct ThreadRegistry {
    safepoint: Arc<Safepoint>,
    /// the lock is held for map operations only; safepoint notifications
    /// happen outside it
    threads: Mutex<HashMap<ThreadId, Value>>,
}

impl ThreadRegistry {
    pub fn new(safepoint: Arc<Safepoint>) -> Self {
        Self {
            safepoint,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the calling native thread to its managed thread object and
    /// register it as a mutator. Registering an already-bound thread means
    /// bookkeeping is corrupt, so it does not return.
    pub fn register(&self, obj: Value) {
        self.safepoint.register_mutator();
        let id = thread::current().id();
        let previous = {
            let mut threads = self.threads.lock();
            threads.insert(id, obj)
        };
        if previous.is_some() {
            log::error!("native thread {id:?} is already registered");
            panic!("thread already registered");
        }
    }

    /// Remove the calling thread's binding. Unregistering a thread that
    /// was never registered does not return.
    pub fn unregister(&self) {
        let id = thread::current().id();
        let removed = {
            let mut threads = self.threads.lock();
            threads.remove(&id)
        };
        if removed.is_none() {
            log::error!("native thread {id:?} was never registered");
            panic!("thread not registered");
        }
        self.safepoint.unregister_mutator();
    }

    /// The managed thread object of the calling native thread.
    pub fn current(&self) -> Value {
        let id = thread::current().id();
        let found = self.threads.lock().get(&id).copied();
        match found {
            Some(obj) => obj,
            None => {
                log::error!("no managed thread for native thread {id:?}");
                panic!("current thread not registered");
            }
        }
    }

    /// Rebind the calling thread's entry, once its managed object exists.
    pub fn set_current(&self, obj: Value, barrier: &WriteBarrier) {
        let id = thread::current().id();
        {
            let mut threads = self.threads.lock();
            if let Some(slot) = threads.get_mut(&id) {
                *slot = obj;
                barrier.record(slot, obj);
                return;
            }
        }
        log::error!("no managed thread for native thread {id:?}");
        panic!("current thread not registered");
    }

    /// Join a native thread, announced as blocking so a collection can
    /// proceed while the caller waits. A failed join is logged and
    /// execution continues.
    pub fn join(&self, native: &NativeThread) {
        self.safepoint.announce_blocking_mutator();
        let result = native.join();
        self.safepoint.return_from_blocking_mutator();
        if let Err(payload) = result {
            log::error!("failed to join native thread: {payload:?}");
        }
    }

    pub fn yield_now(&self) {
        thread::yield_now();
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// The registry is itself a root set; the collector rewrites every
    /// entry through the visitor.
    pub fn walk_globals(&self, visitor: &mut impl Visitor) {
        let mut threads = self.threads.lock();
        for slot in threads.values_mut() {
            visit_edge(slot, visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ref;
    use crate::objects::slots::SlotObject;
    use std::{alloc, time::Duration};

    fn registry() -> ThreadRegistry {
        ThreadRegistry::new(Arc::new(Safepoint::new()))
    }

    #[test]
    fn register_current_unregister_roundtrip() {
        let reg = registry();
        assert!(reg.is_empty());

        reg.register(Value::from_fixnum(1));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.current().as_fixnum(), Some(1));

        reg.set_current(Value::from_fixnum(2), &WriteBarrier::unmapped());
        assert_eq!(reg.current().as_fixnum(), Some(2));

        reg.unregister();
        assert!(reg.is_empty());
    }

    #[test]
    fn each_thread_sees_its_own_binding() {
        let reg = Arc::new(registry());
        reg.register(Value::from_fixnum(10));

        let reg2 = reg.clone();
        let worker = std::thread::spawn(move || {
            reg2.register(Value::from_fixnum(20));
            let mine = reg2.current();
            reg2.unregister();
            mine
        });

        let theirs = worker.join().expect("worker finished");
        assert_eq!(theirs.as_fixnum(), Some(20));
        assert_eq!(reg.current().as_fixnum(), Some(10));
        reg.unregister();
    }

    #[test]
    #[should_panic(expected = "thread already registered")]
    fn double_registration_is_fatal() {
        let reg = registry();
        reg.register(Value::from_fixnum(1));
        reg.register(Value::from_fixnum(2));
    }

    #[test]
    #[should_panic(expected = "thread not registered")]
    fn unregistering_an_unknown_thread_is_fatal() {
        let reg = registry();
        reg.unregister();
    }

    #[test]
    #[should_panic(expected = "current thread not registered")]
    fn current_without_registration_is_fatal() {
        let reg = registry();
        let _ = reg.current();
    }

    #[test]
    #[should_panic(expected = "current thread not registered")]
    fn current_after_unregister_is_fatal() {
        let reg = registry();
        reg.register(Value::from_fixnum(1));
        reg.unregister();
        let _ = reg.current();
    }

    #[test]
    fn join_survives_a_panicking_thread() {
        let reg = registry();
        reg.register(Value::nil());
        let native = NativeThread::spawn(|| panic!("worker died"));
        // must come back without propagating the panic
        reg.join(&native);
        assert!(native.join_timeout(Duration::from_millis(1)));
        reg.unregister();
    }

    #[test]
    fn walk_globals_rewrites_entries() {
        struct Redirect {
            to: Value,
        }
        impl Visitor for Redirect {
            fn visit(&mut self, _value: Value) -> Value {
                self.to
            }
        }

        let layout = SlotObject::required_layout(0);
        // SAFETY: layout is nonzero
        let old = unsafe { alloc::alloc_zeroed(layout) } as *mut SlotObject;
        // SAFETY: layout is nonzero
        let new = unsafe { alloc::alloc_zeroed(layout) } as *mut SlotObject;
        // SAFETY: freshly allocated, correctly sized
        unsafe {
            (*old).init(Value::nil(), 0);
            (*new).init(Value::nil(), 0);
        }

        let reg = registry();
        reg.register(Ref::new(old).as_value());

        let mut redirect = Redirect {
            to: Ref::new(new).as_value(),
        };
        reg.walk_globals(&mut redirect);
        assert_eq!(reg.current(), Ref::new(new).as_value());

        reg.unregister();
        // SAFETY: same layouts
        unsafe {
            alloc::dealloc(old as *mut u8, layout);
            alloc::dealloc(new as *mut u8, layout);
        }
    }
}
