use crate::Value;

/// Receives each outgoing reference slot of an object, by address, so a
/// collection phase may read or rewrite it in place.
pub trait FieldVisitor {
    /// A strong slot. Keeps its referent alive.
    fn visit(&mut self, slot: &mut Value);

    /// A weak slot. Never propagates marks; nulled by the collector when the
    /// referent is reclaimed.
    fn visit_weak(&mut self, slot: &mut Value) {
        let _ = slot;
    }
}

/// Implemented by every managed type.
///
/// The default impls suit leaf objects without reference slots. Types that
/// hold references override [`iterate_fields`](Self::iterate_fields) and
/// hand every slot to the visitor exactly once. The destructor is the
/// ordinary [`Drop`] impl; the collector runs it exactly once before the
/// object's storage is reused.
pub trait HeapObject: Sized {
    fn iterate_fields(&mut self, visitor: &mut dyn FieldVisitor) {
        let _ = visitor;
    }

    /// Called once per weak slot whose referent was reclaimed, after the
    /// slot has been nulled. `slot` is the address of that slot. Must not
    /// allocate or mutate the heap.
    fn weak_reference_collected(&mut self, slot: *mut Value) {
        let _ = slot;
    }
}

impl HeapObject for () {}

/// Erased per-type hooks, stored as the first header word.
pub struct VTable {
    pub trace: unsafe fn(*mut u8, &mut dyn FieldVisitor),
    pub drop: unsafe fn(*mut u8),
    pub weak: unsafe fn(*mut u8, *mut Value),
}

impl VTable {
    pub const fn new<T: HeapObject>() -> VTable {
        VTable {
            trace: trace_erased::<T>,
            drop: drop_erased::<T>,
            weak: weak_erased::<T>,
        }
    }
}

/// The vtable shared by all objects of type `T`.
#[inline(always)]
pub fn vtable_of<T: HeapObject>() -> &'static VTable {
    const { &VTable::new::<T>() }
}

unsafe fn trace_erased<T: HeapObject>(
    payload: *mut u8,
    visitor: &mut dyn FieldVisitor,
) {
    // SAFETY: payload points at a live T by the vtable contract
    unsafe { (*(payload as *mut T)).iterate_fields(visitor) }
}

unsafe fn drop_erased<T: HeapObject>(payload: *mut u8) {
    // SAFETY: payload points at a live T by the vtable contract
    unsafe { core::ptr::drop_in_place(payload as *mut T) }
}

unsafe fn weak_erased<T: HeapObject>(payload: *mut u8, slot: *mut Value) {
    // SAFETY: payload points at a live T by the vtable contract
    unsafe { (*(payload as *mut T)).weak_reference_collected(slot) }
}
