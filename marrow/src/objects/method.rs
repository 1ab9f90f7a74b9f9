//! Executable method objects, the fully general layout: header, fixed
//! fields, indexable literal slots, then trailing raw bytecode.
//!
//! Every region base is recomputed from the stored counts on access.
//! Nothing in the object is an absolute internal pointer, so a bytewise
//! relocation copy stays correct.

use std::{alloc::Layout, mem};

use crate::{
    Header, HeapObject, KindDescriptor, ObjectKind, Value, Visitable,
    Visitor, WriteBarrier, objects::field_index_fatal, visitor::visit_edge,
};

#[repr(C)]
#[derive(Debug)]
pub struct Method {
    pub header: Header,
    pub fields: [Value; 0],
}

/// Fixed-field indices. The counts are stored as boxed fixnums so they
/// relocate like any other field.
impl Method {
    pub const FIELD_BYTECODE_COUNT: usize = 0;
    pub const FIELD_NUM_LOCALS: usize = 1;
    pub const FIELD_MAX_STACK: usize = 2;
    pub const FIELD_NUM_ARGUMENTS: usize = 3;
    pub const FIELD_NUM_LITERALS: usize = 4;
    /// present only when the layout caches the execution frame
    pub const FIELD_EXECUTION_FRAME: usize = 5;

    pub const BASE_FIXED_FIELDS: usize = 5;
}

impl Method {
    /// Initialize a freshly allocated method. The counts are stored and the
    /// literal slots nil-filled before any trailing byte may be written.
    /// # Safety
    /// `self` must point to zeroed storage of
    /// `required_layout(descriptor, num_literals, bytecode_count)`
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn init(
        &mut self,
        class: Value,
        descriptor: &KindDescriptor,
        bytecode_count: usize,
        num_locals: usize,
        max_stack: usize,
        num_arguments: usize,
        num_literals: usize,
    ) {
        debug_assert_eq!(descriptor.kind, ObjectKind::Method);
        self.header =
            Header::new(ObjectKind::Method, class, descriptor.fixed_fields);

        let base = self.fields.as_mut_ptr();
        // SAFETY: storage covers descriptor.fixed_fields slots
        unsafe {
            base.add(Self::FIELD_BYTECODE_COUNT)
                .write(Value::from_fixnum(bytecode_count as i64));
            base.add(Self::FIELD_NUM_LOCALS)
                .write(Value::from_fixnum(num_locals as i64));
            base.add(Self::FIELD_MAX_STACK)
                .write(Value::from_fixnum(max_stack as i64));
            base.add(Self::FIELD_NUM_ARGUMENTS)
                .write(Value::from_fixnum(num_arguments as i64));
            base.add(Self::FIELD_NUM_LITERALS)
                .write(Value::from_fixnum(num_literals as i64));
            for i in Self::BASE_FIXED_FIELDS..descriptor.fixed_fields {
                base.add(i).write(Value::nil());
            }
            for i in 0..num_literals {
                base.add(descriptor.fixed_fields + i).write(Value::nil());
            }
        }
        // trailing bytecode stays zeroed
    }

    #[inline]
    fn count(&self, index: usize) -> usize {
        let Some(n) = self.field(index).as_fixnum() else {
            unreachable!("method count field holds a non-fixnum");
        };
        n.cast_unsigned() as usize
    }

    #[inline]
    pub fn bytecode_count(&self) -> usize {
        self.count(Self::FIELD_BYTECODE_COUNT)
    }

    #[inline]
    pub fn num_locals(&self) -> usize {
        self.count(Self::FIELD_NUM_LOCALS)
    }

    #[inline]
    pub fn max_stack_depth(&self) -> usize {
        self.count(Self::FIELD_MAX_STACK)
    }

    #[inline]
    pub fn num_arguments(&self) -> usize {
        self.count(Self::FIELD_NUM_ARGUMENTS)
    }

    #[inline]
    pub fn num_literals(&self) -> usize {
        self.count(Self::FIELD_NUM_LITERALS)
    }

    #[inline]
    pub fn field(&self, index: usize) -> Value {
        let count = self.header.fixed_fields();
        if index >= count {
            field_index_fatal("method field", index, count);
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
            field_index_fatal("method field", index, count);
        }
        // SAFETY: checked
        let slot = unsafe { self.fields.as_mut_ptr().add(index) };
        // SAFETY: slot is in bounds
        unsafe { slot.write(value) };
        barrier.record(slot, value);
    }

    /// Fatal unless the layout was configured to cache the frame.
    #[inline]
    pub fn execution_frame(&self) -> Value {
        self.field(Self::FIELD_EXECUTION_FRAME)
    }

    #[inline]
    pub fn set_execution_frame(&mut self, frame: Value, barrier: &WriteBarrier) {
        self.set_field(Self::FIELD_EXECUTION_FRAME, frame, barrier);
    }

    #[inline]
    pub fn literal(&self, index: usize) -> Value {
        let count = self.num_literals();
        if index >= count {
            field_index_fatal("literal", index, count);
        }
        // SAFETY: checked
        unsafe { self.literal_ptr().add(index).read() }
    }

    #[inline]
    pub fn set_literal(
        &mut self,
        index: usize,
        value: Value,
        barrier: &WriteBarrier,
    ) {
        let count = self.num_literals();
        if index >= count {
            field_index_fatal("literal", index, count);
        }
        // SAFETY: checked
        let slot = unsafe { self.literal_mut_ptr().add(index) };
        // SAFETY: slot is in bounds
        unsafe { slot.write(value) };
        barrier.record(slot, value);
    }

    #[inline]
    pub fn literals(&self) -> &[Value] {
        let count = self.num_literals();
        // SAFETY: count literal slots follow the fixed fields
        unsafe { std::slice::from_raw_parts(self.literal_ptr(), count) }
    }

    /// Read the bytecode at `index`. No bounds check; the emitter is
    /// trusted to stay within the declared bytecode count.
    #[inline]
    pub fn bytecode(&self, index: usize) -> u8 {
        // SAFETY: index is within the declared bytecode region by contract
        unsafe { self.bytecode_ptr().add(index).read() }
    }

    #[inline]
    pub fn set_bytecode(&mut self, index: usize, byte: u8) {
        // SAFETY: index is within the declared bytecode region by contract
        unsafe { self.bytecode_mut_ptr().add(index).write(byte) };
    }

    #[inline]
    pub fn bytecodes(&self) -> &[u8] {
        let count = self.bytecode_count();
        // SAFETY: count bytes follow the literal slots
        unsafe { std::slice::from_raw_parts(self.bytecode_ptr(), count) }
    }

    /// The literal referenced by the bytecode at `index + 1`. The
    /// sub-index comes from bytecode data, so an out-of-range value is a
    /// data error, not corruption: it is logged and `None` is returned.
    pub fn constant(&self, index: usize) -> Option<Value> {
        let literal_index = self.bytecode(index + 1) as usize;
        let count = self.num_literals();
        if literal_index >= count {
            log::warn!(
                "constant index {literal_index} out of range, method has \
                 {count} literals"
            );
            return None;
        }
        Some(self.literal(literal_index))
    }

    #[inline]
    fn literal_ptr(&self) -> *const Value {
        // SAFETY: the literal region follows the fixed fields
        unsafe { self.fields.as_ptr().add(self.header.fixed_fields()) }
    }

    #[inline]
    fn literal_mut_ptr(&mut self) -> *mut Value {
        // SAFETY: the literal region follows the fixed fields
        unsafe { self.fields.as_mut_ptr().add(self.header.fixed_fields()) }
    }

    // recomputed from the stored counts on every access, never cached
    #[inline]
    fn bytecode_ptr(&self) -> *const u8 {
        let slots = self.header.fixed_fields() + self.num_literals();
        // SAFETY: the bytecode region follows the literal slots
        unsafe { self.fields.as_ptr().add(slots).cast::<u8>() }
    }

    #[inline]
    fn bytecode_mut_ptr(&mut self) -> *mut u8 {
        let slots = self.header.fixed_fields() + self.num_literals();
        // SAFETY: the bytecode region follows the literal slots
        unsafe { self.fields.as_mut_ptr().add(slots).cast::<u8>() }
    }

    pub fn required_layout(
        descriptor: &KindDescriptor,
        num_literals: usize,
        bytecode_count: usize,
    ) -> Layout {
        let head = Layout::new::<Self>();
        let slots =
            Layout::array::<Value>(descriptor.fixed_fields + num_literals)
                .expect("create valid layout");
        let bytes = Layout::array::<u8>(bytecode_count)
            .expect("create valid layout");
        let (layout, _) = head.extend(slots).expect("create valid layout");
        let (layout, _) = layout.extend(bytes).expect("create valid layout");
        layout
    }
}

impl HeapObject for Method {
    fn heap_size(&self) -> usize {
        mem::size_of::<Self>()
            + (self.header.fixed_fields() + self.num_literals())
                * mem::size_of::<Value>()
            + self.bytecode_count()
    }
}

impl Visitable for Method {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        self.header.walk(visitor);
        // fixed fields first, literals after; the count fields are fixnums
        // and never reach the visitor, a cached frame does
        let slots = self.header.fixed_fields() + self.num_literals();
        for i in 0..slots {
            // SAFETY: in bounds
            let slot = unsafe { &mut *self.fields.as_mut_ptr().add(i) };
            visit_edge(slot, visitor);
        }
    }
}
