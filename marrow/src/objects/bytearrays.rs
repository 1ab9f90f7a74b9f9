use std::{alloc::Layout, mem, ptr};

use crate::{
    Header, HeapObject, ObjectKind, Value, Visitable, Visitor,
    objects::field_index_fatal, visitor::visit_edge,
};

/// Raw byte storage: header, boxed-fixnum length, then the bytes.
#[repr(C)]
#[derive(Debug)]
pub struct ByteArray {
    pub header: Header,
    pub size: Value,
    pub bytes: [u8; 0],
}

impl ByteArray {
    /// # Safety
    /// `self` must point to zeroed storage of `required_layout(size)`
    pub unsafe fn init(&mut self, class: Value, size: usize) {
        self.header = Header::new(ObjectKind::ByteArray, class, 1);
        self.size = Value::from_fixnum(size as i64);
        // bytes stay zeroed
    }

    /// # Safety
    /// `self` must point to zeroed storage of `required_layout(data.len())`
    pub unsafe fn init_with_data(&mut self, class: Value, data: &[u8]) {
        // SAFETY: by contract the storage covers the data
        unsafe {
            self.init(class, data.len());
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.bytes.as_mut_ptr(),
                data.len(),
            );
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        let Some(n) = self.size.as_fixnum() else {
            unreachable!("byte array length field holds a non-fixnum");
        };
        n.cast_unsigned() as usize
    }

    #[inline]
    pub fn byte(&self, index: usize) -> u8 {
        let count = self.size();
        if index >= count {
            field_index_fatal("byte", index, count);
        }
        // SAFETY: checked
        unsafe { self.bytes.as_ptr().add(index).read() }
    }

    #[inline]
    pub fn set_byte(&mut self, index: usize, byte: u8) {
        let count = self.size();
        if index >= count {
            field_index_fatal("byte", index, count);
        }
        // SAFETY: checked
        unsafe { self.bytes.as_mut_ptr().add(index).write(byte) };
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: size() bytes follow the length field
        unsafe { std::slice::from_raw_parts(self.bytes.as_ptr(), self.size()) }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.bytes()).ok()
    }

    pub fn required_layout(size: usize) -> Layout {
        let head = Layout::new::<Self>();
        let bytes = Layout::array::<u8>(size).expect("create valid layout");
        let (layout, _) = head.extend(bytes).expect("create valid layout");
        layout
    }
}

impl HeapObject for ByteArray {
    fn heap_size(&self) -> usize {
        mem::size_of::<Self>() + self.size()
    }
}

impl Visitable for ByteArray {
    fn walk(&mut self, visitor: &mut impl Visitor) {
        self.header.walk(visitor);
        visit_edge(&mut self.size, visitor);
        // trailing bytes carry no references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc;

    fn alloc_byte_array(data: &[u8]) -> (*mut ByteArray, Layout) {
        let layout = ByteArray::required_layout(data.len());
        // SAFETY: layout is nonzero
        let ptr = unsafe { alloc::alloc_zeroed(layout) } as *mut ByteArray;
        assert!(!ptr.is_null());
        // SAFETY: freshly allocated, correctly sized
        unsafe { (*ptr).init_with_data(Value::nil(), data) };
        (ptr, layout)
    }

    #[test]
    fn bytes_roundtrip_and_decode_as_str() {
        let (ptr, layout) = alloc_byte_array(b"run:with:");
        // SAFETY: live allocation
        let ba = unsafe { &mut *ptr };
        assert_eq!(ba.size(), 9);
        assert_eq!(ba.bytes(), b"run:with:");
        assert_eq!(ba.as_str(), Some("run:with:"));
        ba.set_byte(0, b'R');
        assert_eq!(ba.byte(0), b'R');
        // SAFETY: same layout
        unsafe { alloc::dealloc(ptr as *mut u8, layout) };
    }

    #[test]
    #[should_panic(expected = "byte index out of bounds")]
    fn byte_access_past_the_end_is_fatal() {
        let (ptr, _layout) = alloc_byte_array(b"ab");
        // SAFETY: live allocation
        let ba = unsafe { &*ptr };
        let _ = ba.byte(2);
    }
}
