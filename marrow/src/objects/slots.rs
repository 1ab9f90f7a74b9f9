use std::{alloc::Layout, mem};

use crate::{
    Header, HeapObject, ObjectKind, Value, Visitable, Visitor, WriteBarrier,
    objects::field_index_fatal, visitor::visit_edge,
};

/// A plain instance: header plus a fixed number of reference slots. The
/// slot count lives in the header so the layout is self-describing.
#[repr(C)]
#[derive(Debug)]
pub struct SlotObject {
    pub header: Header,
    pub fields: [Value; 0],
}

impl SlotObject {
    /// Initialize a freshly allocated slot object, nil-filling every field.
    /// # Safety
    /// `self` must point to zeroed storage of `required_layout(fixed_fields)`
    pub unsafe fn init(&mut self, class: Value, fixed_fields: usize) {
        self.header = Header::new(ObjectKind::Slot, class, fixed_fields);
        for i in 0..fixed_fields {
            // SAFETY: storage covers `fixed_fields` slots
            unsafe { self.fields.as_mut_ptr().add(i).write(Value::nil()) };
        }
    }

    #[inline]
    pub fn field(&self, index: usize) -> Value {
        let count = self.header.fixed_fields();
        if index >= count {
            field_index_fatal("field", index, count);
        }
        // SAFETY: checked
        unsafe { self.fields.as_ptr().add(index).read() }
    }

    #[inline]
    pub fn set_field(
        &mut self,
        index: usize,
        value: Value,
        barrier: &WriteBarrier,
    ) {
        let count = self.header.fixed_fields();
        if index >= count {
            field_index_fatal("field", index, count);
        }
        // SAFETY: checked
        let slot = unsafe { self.fields.as_mut_ptr().add(index) };
        // SAFETY: slot is in bounds
        unsafe { slot.write(value) };
        barrier.record(slot, value);
    }

    #[inline]
    pub fn fields(&self) -> &[Value] {
        let count = self.header.fixed_fields();
        // SAFETY: count slots follow the header
        unsafe { std::slice::from_raw_parts(self.fields.as_ptr(), count) }
    }

    pub fn required_layout(fixed_fields: usize) -> Layout {
        let head = Layout::new::<Self>();
        let slots = Layout::array::<Value>(fixed_fields)
            .expect("create valid layout");
        let (layout, _) = head.extend(slots).expect("create valid layout");
        layout
    }
}

impl HeapObject for SlotObject {
    fn heap_size(&self) -> usize {
        mem::size_of::<Self>()
            + self.header.fixed_fields() * mem::size_of::<Value>()
    }
}

impl Visitable for SlotObject {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        self.header.walk(visitor);
        let count = self.header.fixed_fields();
        for i in 0..count {
            // SAFETY: in bounds
            let slot = unsafe { &mut *self.fields.as_mut_ptr().add(i) };
            visit_edge(slot, visitor);
        }
    }
}
