mod collector;
mod heap;
mod objects;
mod safepoint;
mod system;
mod tagged;
mod threads;
mod visitor;
mod vm;

pub use collector::{GcStats, collect};
pub use heap::{
    Heap, HeapCreateInfo, HeapSettings, OutOfSpace, PageFlags, PageMeta,
    ROOT_SET_SIZE, RootSet, WriteBarrier,
};
pub use objects::{
    Header, HeaderFlags, HeapObject, HeapValue, KindDescriptor, LayoutConfig,
    ObjectKind, arrays::Array, bytearrays::ByteArray, method::Method,
    slots::SlotObject, threads::NativeThread, threads::ThreadObject,
};
pub use safepoint::Safepoint;
pub use system::{PAGE_SIZE, map_memory, unmap_memory};
pub use tagged::*;
pub use threads::ThreadRegistry;
pub use visitor::{Visitable, Visitor};
pub use vm::*;
