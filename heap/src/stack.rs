use object::{vtable_of, Header, HeapObject, Value};

use crate::{
    heap::{DecRefVisitor, IncRefVisitor},
    Heap,
};

/// A host-stack value enrolled as a collection root.
///
/// Enrollment links the object into the heap's intrusive root list, in the
/// way a handle scope links itself onto its parent: the object must stay at
/// the same address from [`enroll`](Self::enroll) until drop. Its strong
/// fields are counted as root references for as long as it stays enrolled.
///
/// Slots of other objects never point at a stack object; reachability goes
/// strictly outward, from the stack into the heap.
#[repr(C)]
pub struct StackObject<T: HeapObject> {
    header: Header,
    value: T,
}

impl<T: HeapObject> StackObject<T> {
    pub fn new(value: T) -> Self {
        const {
            assert!(
                align_of::<T>() <= 8,
                "payload alignment above 8 is unsupported"
            )
        };
        Self {
            header: Header::new_stack(vtable_of::<T>()),
            value,
        }
    }

    /// Link into the heap's root list and claim the value's current strong
    /// targets. The object must not move afterwards.
    pub fn enroll(&mut self, heap: &mut Heap) {
        assert!(
            self.header.stack_prev().is_null(),
            "stack object enrolled twice"
        );
        heap.enroll_stack_object(&mut self.header);
        // Symmetric with the dec-ref pass at drop.
        self.value.iterate_fields(&mut IncRefVisitor);
    }

    pub fn is_enrolled(&self) -> bool {
        !self.header.stack_prev().is_null()
    }

    /// The header address, as the write barrier wants it.
    pub fn header(&self) -> *const Header {
        &self.header
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Reference-slot writes on the returned value must go through
    /// [`object::write_barrier`] with [`header`](Self::header) as the owner,
    /// or use [`write`](Self::write).
    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Store `value` into the strong slot selected by `slot`, through the
    /// stack-owner write barrier.
    pub fn write(&mut self, slot: impl FnOnce(&mut T) -> &mut Value, value: Value) {
        let header: *const Header = &self.header;
        let slot = slot(&mut self.value) as *mut Value;
        // SAFETY: the slot is a field of self.value and header is its owner
        unsafe { object::write_barrier(header, slot, value) };
    }

    /// Store `value` into the weak slot selected by `slot`.
    pub fn write_weak(
        &mut self,
        slot: impl FnOnce(&mut T) -> &mut Value,
        value: Value,
    ) {
        let header: *const Header = &self.header;
        let slot = slot(&mut self.value) as *mut Value;
        // SAFETY: the slot is a field of self.value and header is its owner
        unsafe { object::write_weak_barrier(header, slot, value) };
    }
}

impl<T: HeapObject> Drop for StackObject<T> {
    fn drop(&mut self) {
        if self.header.stack_prev().is_null() {
            return;
        }
        // Release the root claims, then unlink. The value's own Drop runs
        // afterwards as part of normal field teardown.
        self.value.iterate_fields(&mut DecRefVisitor);
        let prev = self.header.stack_prev();
        let next = self.header.stack_next();
        // SAFETY: neighbors are live members of the heap's root list
        unsafe {
            (*prev).set_stack_next(next);
            (*next).set_stack_prev(prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Leaf {
        id: u64,
    }

    impl HeapObject for Leaf {}

    #[test]
    fn new_stack_objects_start_unenrolled() {
        let anchor = StackObject::new(Leaf { id: 3 });
        assert!(!anchor.is_enrolled());
        assert_eq!(anchor.value().id, 3);
    }

    #[test]
    fn unenrolled_drop_is_a_noop() {
        let anchor = StackObject::new(Leaf::default());
        drop(anchor);
    }

    #[test]
    #[should_panic(expected = "enrolled twice")]
    fn double_enrollment_aborts() {
        let mut heap = Heap::new().expect("heap");
        let mut anchor = StackObject::new(Leaf::default());
        anchor.enroll(&mut heap);
        anchor.enroll(&mut heap);
    }

    #[test]
    fn enrollment_links_and_drop_unlinks() {
        let mut heap = Heap::new().expect("heap");
        {
            let mut first = StackObject::new(Leaf { id: 1 });
            first.enroll(&mut heap);
            let mut second = StackObject::new(Leaf { id: 2 });
            second.enroll(&mut heap);
            assert!(first.is_enrolled());
            assert!(second.is_enrolled());
        }
        // Both unlinked again; heap teardown asserts the list is empty.
    }
}
