//! A precise, generational, tracing garbage collector.
//!
//! The heap is a set of tightly coupled regions: a bump-pointer eden, a
//! semi-space survivor pair with aging, a compacting tenured region, and a
//! non-moving list for oversized objects. Roots are explicit, through
//! handle groups and enrolled stack objects, and a refcount maintained by
//! the write barrier lets minor collections skip the mature regions
//! entirely.
//!
//! Consumers describe their object graph through [`object::HeapObject`]:
//! every reference slot is enumerated to the collector, strong or weak, and
//! weak owners get a callback when a referent is reclaimed.

mod array;
mod handles;
mod heap;
mod region;
mod stack;
mod system;

pub use array::{Array, ValueArray};
pub use handles::{Handle, HANDLE_GROUP_CAPACITY};
pub use heap::{
    Heap, LARGE_OBJECT_THRESHOLD, MEMORY_SPACE_SIZE, TENURED_SPACE_THRESHOLD,
};
pub use region::MemorySpace;
pub use stack::StackObject;
pub use system::{release, reserve, AllocError, OS_PAGE_SIZE};
