use std::{
    mem,
    sync::atomic::{AtomicU8, Ordering},
};

pub mod arrays;
pub mod bytearrays;
pub mod method;
pub mod slots;
pub mod threads;

use crate::Value;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Slot = 0,
    Array = 1,
    ByteArray = 2,
    Method = 3,
    Thread = 4,
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// the object has been relocated; the class slot holds the
        /// forwarding pointer
        const FORWARDED = 1 << 0;
    }
}

/// Every heap object begins with this header.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    /// class/type descriptor reference; while FORWARDED is set this slot
    /// holds the forwarding pointer instead
    class: Value,
    kind: u8,
    flags: HeaderFlags,
    /// GC mark byte
    mark: AtomicU8,
    _reserved: u8,
    /// fixed-field count of this object
    fixed: u32,
}

/// A heap object of statically unknown kind; dispatch goes through the
/// header's kind bits.
#[repr(C)]
#[derive(Debug)]
pub struct HeapValue {
    pub header: Header,
}

pub trait HeapObject: Sized {
    fn header(&self) -> &Header {
        // SAFETY: every heap object starts with a header
        unsafe { mem::transmute::<&Self, &Header>(self) }
    }

    fn header_mut(&mut self) -> &mut Header {
        // SAFETY: every heap object starts with a header
        unsafe { mem::transmute::<&mut Self, &mut Header>(self) }
    }

    /// Total object size: header + fixed fields + indexable fields +
    /// trailing bytes, recomputed from the stored counts.
    fn heap_size(&self) -> usize {
        mem::size_of::<Self>()
    }
}

impl Header {
    #[inline]
    pub fn new(kind: ObjectKind, class: Value, fixed_fields: usize) -> Self {
        Self {
            class,
            kind: kind as u8,
            flags: HeaderFlags::empty(),
            mark: AtomicU8::new(0),
            _reserved: 0,
            fixed: fixed_fields as u32,
        }
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        match self.kind {
            0 => ObjectKind::Slot,
            1 => ObjectKind::Array,
            2 => ObjectKind::ByteArray,
            3 => ObjectKind::Method,
            4 => ObjectKind::Thread,
            other => unreachable!("corrupt object kind bits {other}"),
        }
    }

    #[inline]
    pub fn fixed_fields(&self) -> usize {
        self.fixed as usize
    }

    #[inline]
    pub fn class(&self) -> Value {
        debug_assert!(!self.is_forwarded(), "class read on forwarded header");
        self.class
    }

    #[inline]
    pub fn set_class(&mut self, class: Value) {
        self.class = class;
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn mark(&self) {
        self.mark.store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn unmark(&self) {
        self.mark.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.flags.contains(HeaderFlags::FORWARDED)
    }

    /// Install the forwarding pointer for a relocated object.
    #[inline]
    pub fn forward_to(&mut self, new_location: Value) {
        debug_assert!(!self.is_forwarded(), "double forwarding");
        debug_assert!(new_location.is_heap_object());
        self.class = new_location;
        self.flags.insert(HeaderFlags::FORWARDED);
    }

    /// The relocated address, valid only while forwarded.
    #[inline]
    pub fn forwarding(&self) -> Value {
        debug_assert!(self.is_forwarded());
        self.class
    }

    /// Visit the class slot. Part of every object's walk.
    #[inline]
    pub fn walk(&mut self, visitor: &mut impl crate::Visitor) {
        if self.class.is_heap_object() {
            self.class = visitor.visit(self.class);
        }
    }
}

/// Build-time layout switches, consulted once when a kind descriptor is
/// constructed, never inside accessors.
#[derive(Debug, Default, Copy, Clone)]
pub struct LayoutConfig {
    /// add a fixed field to methods caching the current execution frame
    pub cache_execution_frame: bool,
}

/// Per-kind layout: fixed-field count and which variable regions follow.
#[derive(Debug, Copy, Clone)]
pub struct KindDescriptor {
    pub kind: ObjectKind,
    pub fixed_fields: usize,
    pub has_indexable: bool,
    pub has_trailing_bytes: bool,
}

impl KindDescriptor {
    pub fn method(config: &LayoutConfig) -> Self {
        let fixed = method::Method::BASE_FIXED_FIELDS
            + usize::from(config.cache_execution_frame);
        Self {
            kind: ObjectKind::Method,
            fixed_fields: fixed,
            has_indexable: true,
            has_trailing_bytes: true,
        }
    }

    pub fn slot_object(fixed_fields: usize) -> Self {
        Self {
            kind: ObjectKind::Slot,
            fixed_fields,
            has_indexable: false,
            has_trailing_bytes: false,
        }
    }

    pub fn array() -> Self {
        Self {
            kind: ObjectKind::Array,
            fixed_fields: 1,
            has_indexable: true,
            has_trailing_bytes: false,
        }
    }

    pub fn byte_array() -> Self {
        Self {
            kind: ObjectKind::ByteArray,
            fixed_fields: 1,
            has_indexable: false,
            has_trailing_bytes: true,
        }
    }

    pub fn thread(config: &LayoutConfig) -> Self {
        let _ = config;
        Self {
            kind: ObjectKind::Thread,
            fixed_fields: threads::ThreadObject::FIXED_FIELDS,
            has_indexable: false,
            has_trailing_bytes: false,
        }
    }
}

/// Out-of-range access to a declared field region. Indicates heap
/// corruption or a bad emitter upstream, so this does not return.
#[cold]
pub(crate) fn field_index_fatal(region: &str, index: usize, count: usize) -> ! {
    log::error!(
        "{region} index out of bounds: accessing {index}, but only {count} \
         entries are available"
    );
    panic!("{region} index out of bounds: {index} >= {count}");
}

impl HeapObject for HeapValue {
    fn heap_size(&self) -> usize {
        match self.header.kind() {
            ObjectKind::Slot => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&HeapValue, &slots::SlotObject>(self)
                };
                obj.heap_size()
            }
            ObjectKind::Array => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&HeapValue, &arrays::Array>(self)
                };
                obj.heap_size()
            }
            ObjectKind::ByteArray => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&HeapValue, &bytearrays::ByteArray>(self)
                };
                obj.heap_size()
            }
            ObjectKind::Method => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&HeapValue, &method::Method>(self)
                };
                obj.heap_size()
            }
            ObjectKind::Thread => {
                // SAFETY: kind checked
                let obj = unsafe {
                    mem::transmute::<&HeapValue, &threads::ThreadObject>(self)
                };
                obj.heap_size()
            }
        }
    }
}
