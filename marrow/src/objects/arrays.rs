use std::{alloc::Layout, mem};

use crate::{
    Header, HeapObject, ObjectKind, Value, Visitable, Visitor, WriteBarrier,
    objects::field_index_fatal, visitor::visit_edge,
};

/// Reference array: header, boxed-fixnum length, then that many slots.
#[repr(C)]
#[derive(Debug)]
pub struct Array {
    pub header: Header,
    pub size: Value,
    pub fields: [Value; 0],
}

impl Array {
    /// Initialize a freshly allocated array, nil-filling every element.
    /// # Safety
    /// `self` must point to zeroed storage of `required_layout(size)`
    pub unsafe fn init(&mut self, class: Value, size: usize) {
        self.header = Header::new(ObjectKind::Array, class, 1);
        self.size = Value::from_fixnum(size as i64);
        for i in 0..size {
            // SAFETY: storage covers `size` slots
            unsafe { self.fields.as_mut_ptr().add(i).write(Value::nil()) };
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        let Some(n) = self.size.as_fixnum() else {
            unreachable!("array length field holds a non-fixnum");
        };
        n.cast_unsigned() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Value {
        let count = self.size();
        if index >= count {
            field_index_fatal("array element", index, count);
        }
        // SAFETY: checked
        unsafe { self.fields.as_ptr().add(index).read() }
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value, barrier: &WriteBarrier) {
        let count = self.size();
        if index >= count {
            field_index_fatal("array element", index, count);
        }
        // SAFETY: checked
        let slot = unsafe { self.fields.as_mut_ptr().add(index) };
        // SAFETY: slot is in bounds
        unsafe { slot.write(value) };
        barrier.record(slot, value);
    }

    #[inline]
    pub fn fields(&self) -> &[Value] {
        let count = self.size();
        // SAFETY: count slots follow the length field
        unsafe { std::slice::from_raw_parts(self.fields.as_ptr(), count) }
    }

    pub fn required_layout(size: usize) -> Layout {
        let head = Layout::new::<Self>();
        let slots =
            Layout::array::<Value>(size).expect("create valid layout");
        let (layout, _) = head.extend(slots).expect("create valid layout");
        layout
    }
}

impl HeapObject for Array {
    fn heap_size(&self) -> usize {
        mem::size_of::<Self>() + self.size() * mem::size_of::<Value>()
    }
}

impl Visitable for Array {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        self.header.walk(visitor);
        // the length is a fixnum and never reaches the visitor
        visit_edge(&mut self.size, visitor);
        let count = self.size();
        for i in 0..count {
            // SAFETY: in bounds
            let slot = unsafe { &mut *self.fields.as_mut_ptr().add(i) };
            visit_edge(slot, visitor);
        }
    }
}
