//! The relocation protocol: `walk` hands every internal reference of an
//! object to a visitor, `clone_into` produces a bytewise copy. Together
//! they are everything a moving collector needs from the object layer.

use std::{mem, ptr};

use crate::{
    HeapObject, HeapValue, ObjectKind, Ref, Value,
    objects::{
        arrays::Array, bytearrays::ByteArray, method::Method,
        slots::SlotObject, threads::ThreadObject,
    },
};

pub trait Visitor {
    /// Visit one reference slot; the return value replaces the slot.
    fn visit(&mut self, value: Value) -> Value;
}

pub trait Visitable {
    /// Call the visitor on every internal reference, the header's class
    /// slot included. Fixnum and nil slots never reach the visitor.
    fn walk(&mut self, visitor: &mut impl Visitor);
}

#[inline]
pub(crate) fn visit_edge(slot: &mut Value, visitor: &mut impl Visitor) {
    if slot.is_heap_object() {
        *slot = visitor.visit(*slot);
    }
}

impl Visitable for HeapValue {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        match self.header.kind() {
            ObjectKind::Slot => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&mut HeapValue, &mut SlotObject>(self)
                };
                obj.walk(visitor);
            }
            ObjectKind::Array => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&mut HeapValue, &mut Array>(self)
                };
                obj.walk(visitor);
            }
            ObjectKind::ByteArray => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&mut HeapValue, &mut ByteArray>(self)
                };
                obj.walk(visitor);
            }
            ObjectKind::Method => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&mut HeapValue, &mut Method>(self)
                };
                obj.walk(visitor);
            }
            ObjectKind::Thread => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&mut HeapValue, &mut ThreadObject>(self)
                };
                obj.walk(visitor);
            }
        }
    }
}

impl HeapValue {
    /// Relocation copy: header through trailing bytes, byte-identical.
    /// Region bases inside an object are offsets recomputed from stored
    /// counts, so nothing in the copy points back into the old storage.
    /// # Safety
    /// `dst` must be word-aligned writable storage of at least
    /// `heap_size()` bytes, disjoint from `self`
    pub unsafe fn clone_into(&self, dst: *mut u8) -> Ref<HeapValue> {
        let size = self.heap_size();
        // SAFETY: by contract dst covers size bytes and does not overlap
        unsafe {
            ptr::copy_nonoverlapping(
                (self as *const HeapValue).cast::<u8>(),
                dst,
                size,
            );
        }
        Ref::new(dst.cast::<HeapValue>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KindDescriptor, LayoutConfig, WriteBarrier};
    use std::alloc;

    /// counts visited slots and leaves them unchanged
    struct CountingVisitor {
        visited: Vec<Value>,
    }

    impl Visitor for CountingVisitor {
        fn visit(&mut self, value: Value) -> Value {
            self.visited.push(value);
            value
        }
    }

    /// rewrites every visited reference to `replacement`
    struct RewritingVisitor {
        replacement: Value,
    }

    impl Visitor for RewritingVisitor {
        fn visit(&mut self, _value: Value) -> Value {
            self.replacement
        }
    }

    fn alloc_zeroed(layout: alloc::Layout) -> *mut u8 {
        // SAFETY: layout is nonzero
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        ptr
    }

    #[test]
    fn walk_skips_nil_and_fixnum_slots() {
        let layout = Array::required_layout(4);
        let ptr = alloc_zeroed(layout) as *mut Array;
        let barrier = WriteBarrier::unmapped();
        // SAFETY: freshly allocated, correctly sized
        let arr = unsafe {
            (*ptr).init(Value::nil(), 4);
            &mut *ptr
        };

        let target_layout = SlotObject::required_layout(0);
        let target = alloc_zeroed(target_layout) as *mut SlotObject;
        // SAFETY: freshly allocated, correctly sized
        unsafe { (*target).init(Value::nil(), 0) };
        let target_ref = Ref::new(target).as_value();

        arr.set(0, Value::from_fixnum(10), &barrier);
        arr.set(2, target_ref, &barrier);
        // slots 1 and 3 stay nil

        let mut v = CountingVisitor {
            visited: Vec::new(),
        };
        arr.walk(&mut v);
        assert_eq!(v.visited, vec![target_ref], "only the one real reference");

        // walking twice visits the same set again, nothing accumulates
        let mut v2 = CountingVisitor {
            visited: Vec::new(),
        };
        arr.walk(&mut v2);
        assert_eq!(v2.visited, vec![target_ref]);

        // SAFETY: same layouts
        unsafe {
            alloc::dealloc(ptr as *mut u8, layout);
            alloc::dealloc(target as *mut u8, target_layout);
        }
    }

    #[test]
    fn walk_rewrites_through_the_visitor_return_value() {
        let layout = SlotObject::required_layout(2);
        let ptr = alloc_zeroed(layout) as *mut SlotObject;
        let barrier = WriteBarrier::unmapped();
        // SAFETY: freshly allocated, correctly sized
        let obj = unsafe {
            (*ptr).init(Value::nil(), 2);
            &mut *ptr
        };

        let old_layout = SlotObject::required_layout(0);
        let old = alloc_zeroed(old_layout) as *mut SlotObject;
        let new = alloc_zeroed(old_layout) as *mut SlotObject;
        // SAFETY: freshly allocated, correctly sized
        unsafe {
            (*old).init(Value::nil(), 0);
            (*new).init(Value::nil(), 0);
        }

        obj.set_field(0, Ref::new(old).as_value(), &barrier);
        let mut v = RewritingVisitor {
            replacement: Ref::new(new).as_value(),
        };
        obj.walk(&mut v);
        assert_eq!(obj.field(0), Ref::new(new).as_value());
        assert!(obj.field(1).is_nil(), "nil slot untouched by the rewrite");

        // SAFETY: same layouts
        unsafe {
            alloc::dealloc(ptr as *mut u8, layout);
            alloc::dealloc(old as *mut u8, old_layout);
            alloc::dealloc(new as *mut u8, old_layout);
        }
    }

    #[test]
    fn method_clone_preserves_every_region() {
        let config = LayoutConfig::default();
        let descriptor = KindDescriptor::method(&config);
        let layout = Method::required_layout(&descriptor, 3, 6);
        let src = alloc_zeroed(layout) as *mut Method;
        let barrier = WriteBarrier::unmapped();
        // SAFETY: freshly allocated, correctly sized
        let m = unsafe {
            (*src).init(Value::nil(), &descriptor, 6, 3, 9, 2, 3);
            &mut *src
        };

        let boxed_layout = SlotObject::required_layout(0);
        let boxed = alloc_zeroed(boxed_layout) as *mut SlotObject;
        // SAFETY: freshly allocated, correctly sized
        unsafe { (*boxed).init(Value::nil(), 0) };

        m.set_literal(0, Value::from_fixnum(41), &barrier);
        m.set_literal(1, Value::from_fixnum(42), &barrier);
        m.set_literal(2, Ref::new(boxed).as_value(), &barrier);
        for i in 0..6 {
            m.set_bytecode(i, i as u8 + 1);
        }

        let dst = alloc_zeroed(layout);
        // SAFETY: dst is a fresh allocation of the same layout
        let copied = unsafe {
            (*src.cast::<HeapValue>()).clone_into(dst)
        };
        // SAFETY: clone_into produced a live method
        let clone = unsafe { copied.cast::<Method>().as_mut() };

        assert_eq!(clone.bytecode_count(), 6);
        assert_eq!(clone.num_locals(), 3);
        assert_eq!(clone.max_stack_depth(), 9);
        assert_eq!(clone.num_arguments(), 2);
        assert_eq!(clone.num_literals(), 3);
        assert_eq!(clone.literal(0).as_fixnum(), Some(41));
        assert_eq!(clone.literal(1).as_fixnum(), Some(42));
        assert_eq!(clone.bytecodes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(clone.heap_size(), m.heap_size());

        // the clone walks the same references in the same order
        let mut original_walk = CountingVisitor {
            visited: Vec::new(),
        };
        m.walk(&mut original_walk);
        let mut clone_walk = CountingVisitor {
            visited: Vec::new(),
        };
        clone.walk(&mut clone_walk);
        assert_eq!(original_walk.visited, vec![Ref::new(boxed).as_value()]);
        assert_eq!(original_walk.visited, clone_walk.visited);

        // SAFETY: same layouts
        unsafe {
            alloc::dealloc(src as *mut u8, layout);
            alloc::dealloc(dst, layout);
            alloc::dealloc(boxed as *mut u8, boxed_layout);
        }
    }

    #[test]
    fn heap_value_walk_dispatches_on_the_kind_bits() {
        let layout = ThreadObject::required_layout();
        let ptr = alloc_zeroed(layout) as *mut ThreadObject;
        let barrier = WriteBarrier::unmapped();

        let name_layout = ByteArray::required_layout(4);
        let name = alloc_zeroed(name_layout) as *mut ByteArray;
        // SAFETY: freshly allocated, correctly sized
        unsafe {
            (*name).init_with_data(Value::nil(), b"main");
            (*ptr).init(Value::nil(), Value::nil());
        }
        // SAFETY: live allocation
        let obj = unsafe { &mut *ptr };
        obj.set_name(Ref::new(name).as_value(), &barrier);

        let mut v = CountingVisitor {
            visited: Vec::new(),
        };
        // SAFETY: ThreadObject starts with a header
        let hv = unsafe {
            &mut *(ptr as *mut HeapValue)
        };
        hv.walk(&mut v);
        assert_eq!(v.visited, vec![Ref::new(name).as_value()]);

        // SAFETY: same layouts
        unsafe {
            alloc::dealloc(ptr as *mut u8, layout);
            alloc::dealloc(name as *mut u8, name_layout);
        }
    }
}
