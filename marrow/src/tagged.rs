//! Value: one machine word, either a small integer encoded inline (fixnum)
//! or the address of a heap object.
//!
//! Ref<T>: untagged, typed pointer to a heap object. Not protected against
//! relocation; anything held across a collection must live in a root set.
use std::{fmt, marker::PhantomData};

use crate::HeapObject;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    Fixnum = 0b0,
    Reference = 0b01,
}

pub const VALUE_TAG_MASK: u64 = 0b11;

/// raw bits of the canonical nil reference (null address, reference tag)
const NIL_RAW: u64 = ValueTag::Reference as u64;

/// A tagged reference word.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Value(u64);

/// Decoded view of a [`Value`]. Forces a kind check before any dereference.
#[derive(Debug, Copy, Clone)]
pub enum Decoded {
    Fixnum(i64),
    Nil,
    Object(Ref<crate::HeapValue>),
}

/// An untagged pointer to a heap object of kind `T`.
pub struct Ref<T: HeapObject> {
    ptr: *mut T,
    _marker: PhantomData<*mut T>,
}

unsafe impl Send for Value {}
unsafe impl Sync for Value {}

unsafe impl<T: HeapObject> Send for Ref<T> {}
unsafe impl<T: HeapObject> Sync for Ref<T> {}

// a Ref represents a pointer to a T, not a T itself
impl<T: HeapObject> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HeapObject> Copy for Ref<T> {}

impl<T: HeapObject> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: HeapObject> Eq for Ref<T> {}

impl Value {
    /// Out-of-range magnitudes (more than 63 significant bits) truncate
    /// to the shifted low bits.
    #[inline]
    pub fn from_fixnum(value: i64) -> Self {
        Self(value.cast_unsigned() << 1)
    }

    #[inline]
    pub const fn nil() -> Self {
        Self(NIL_RAW)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_fixnum(self) -> bool {
        self.0 & 0b1 == ValueTag::Fixnum as u64
    }

    #[inline]
    pub fn is_reference(self) -> bool {
        self.0 & VALUE_TAG_MASK == ValueTag::Reference as u64
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == NIL_RAW
    }

    /// true for references to an actual object, false for nil and fixnums
    #[inline]
    pub fn is_heap_object(self) -> bool {
        self.is_reference() && !self.is_nil()
    }

    #[inline]
    pub fn as_fixnum(self) -> Option<i64> {
        if self.is_fixnum() {
            Some(self.0.cast_signed() >> 1)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_object<T: HeapObject>(self) -> Option<Ref<T>> {
        if self.is_heap_object() {
            // SAFETY: tag checked, address is non-null
            Some(unsafe { Ref::from_addr(self.0 & !VALUE_TAG_MASK) })
        } else {
            None
        }
    }

    /// # Safety
    /// caller must know this is a non-nil reference to a `T`
    #[inline]
    pub unsafe fn as_object_unchecked<T: HeapObject>(self) -> Ref<T> {
        debug_assert!(self.is_heap_object(), "untagging a non-reference value");
        // SAFETY: by contract this is a T
        unsafe { Ref::from_addr(self.0 & !VALUE_TAG_MASK) }
    }

    /// Decode into the closed sum of representable kinds.
    #[inline]
    pub fn decode(self) -> Decoded {
        if self.is_fixnum() {
            return Decoded::Fixnum(self.0.cast_signed() >> 1);
        }
        if self.is_nil() {
            return Decoded::Nil;
        }
        // SAFETY: not a fixnum, not nil, so a live reference
        Decoded::Object(unsafe { self.as_object_unchecked() })
    }
}

impl<T: HeapObject> Ref<T> {
    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        debug_assert_eq!(
            ptr as u64 & VALUE_TAG_MASK,
            0,
            "heap objects must be aligned so low bits are free"
        );
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// `addr` must be the untagged address of a live `T`
    #[inline]
    unsafe fn from_addr(addr: u64) -> Self {
        Self {
            ptr: addr as *mut T,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ptr(self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub fn as_value(self) -> Value {
        Value(self.ptr as u64 | ValueTag::Reference as u64)
    }

    /// Get a shared reference to the object.
    /// # Safety
    /// the object must not be relocated or reclaimed for `'a`
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        // SAFETY: by contract the pointee is live
        unsafe { &*self.ptr }
    }

    /// Get a mutable reference to the object.
    /// # Safety
    /// the object must not be relocated or reclaimed for `'a`, and the
    /// caller must hold the only mutable access
    #[inline]
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        // SAFETY: by contract the pointee is live and uniquely borrowed
        unsafe { &mut *self.ptr }
    }

    /// Reinterpret as a `Ref<U>`.
    /// # Safety
    /// `T` and `U` must share a layout prefix covering every accessed field
    #[inline]
    pub unsafe fn cast<U: HeapObject>(self) -> Ref<U> {
        Ref {
            ptr: self.ptr.cast(),
            _marker: PhantomData,
        }
    }
}

impl<T: HeapObject> From<Ref<T>> for Value {
    #[inline]
    fn from(value: Ref<T>) -> Self {
        value.as_value()
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(value: i64) -> Self {
        Value::from_fixnum(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Decoded::Fixnum(n) => write!(f, "Value::Fixnum({n})"),
            Decoded::Nil => write!(f, "Value::Nil"),
            Decoded::Object(obj) => {
                write!(f, "Value::Object({:p})", obj.as_ptr())
            }
        }
    }
}

impl<T: HeapObject> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:p})", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Header, HeapValue, ObjectKind};

    fn boxed_heap_value() -> Box<HeapValue> {
        Box::new(HeapValue {
            header: Header::new(ObjectKind::Slot, Value::nil(), 0),
        })
    }

    #[test]
    fn fixnum_roundtrip_preserves_value_and_tag() {
        for n in [0i64, 1, -1, 42, -42, i64::MAX >> 1, i64::MIN >> 1] {
            let v = Value::from_fixnum(n);
            assert!(v.is_fixnum(), "expected fixnum tag for {n}");
            assert!(!v.is_reference());
            assert_eq!(v.as_fixnum(), Some(n));
        }
    }

    #[test]
    fn out_of_range_fixnums_truncate_without_panicking() {
        // 63 significant bits overflow the payload; the top bit is lost
        let v = Value::from_fixnum(i64::MAX);
        assert!(v.is_fixnum());
        assert_eq!(v.as_fixnum(), Some(-1));

        let v = Value::from_fixnum(i64::MIN);
        assert!(v.is_fixnum());
        assert_eq!(v.as_fixnum(), Some(0));
    }

    #[test]
    fn nil_is_a_reference_but_not_a_heap_object() {
        let nil = Value::nil();
        assert!(nil.is_reference());
        assert!(nil.is_nil());
        assert!(!nil.is_heap_object());
        assert!(!nil.is_fixnum());
        assert!(nil.as_object::<HeapValue>().is_none());
    }

    #[test]
    fn reference_roundtrip_recovers_pointer() {
        let mut obj = boxed_heap_value();
        let raw: *mut HeapValue = &mut *obj;

        let r = Ref::new(raw);
        let v = r.as_value();
        assert!(v.is_heap_object());
        assert!(!v.is_fixnum());

        let back = v.as_object::<HeapValue>().expect("should be an object");
        assert_eq!(back.as_ptr(), raw);
    }

    #[test]
    fn fixnum_and_reference_are_mutually_exclusive() {
        let v_fix = Value::from_fixnum(-7);
        assert!(v_fix.is_fixnum());
        assert!(!v_fix.is_heap_object(), "fixnum must not be an object");

        let mut obj = boxed_heap_value();
        let v_obj = Ref::new(&mut *obj as *mut HeapValue).as_value();
        assert!(v_obj.is_heap_object());
        assert!(!v_obj.is_fixnum(), "object must not be a fixnum");
    }

    #[test]
    fn decode_covers_all_three_kinds() {
        assert!(matches!(Value::from_fixnum(9).decode(), Decoded::Fixnum(9)));
        assert!(matches!(Value::nil().decode(), Decoded::Nil));

        let mut obj = boxed_heap_value();
        let raw: *mut HeapValue = &mut *obj;
        match Ref::new(raw).as_value().decode() {
            Decoded::Object(r) => assert_eq!(r.as_ptr(), raw),
            other => panic!("expected Decoded::Object, got {other:?}"),
        }
    }

    #[test]
    fn ref_as_ref_and_as_mut_reach_the_object() {
        let mut obj = boxed_heap_value();
        let r = Ref::new(&mut *obj as *mut HeapValue);

        unsafe {
            assert_eq!(r.as_ref().header.kind(), ObjectKind::Slot);
            r.as_mut().header.mark();
        }
        assert!(obj.header.is_marked());
    }
}
