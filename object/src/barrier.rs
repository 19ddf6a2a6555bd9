use crate::{Header, Space, Value};

/// Generational write barrier for strong slots.
///
/// Owners in eden or survivor space take the fast path: a plain store,
/// because a minor collection will visit them anyway. Owners in stack,
/// tenured or large space maintain the refcount that lets minor collections
/// skip scanning the mature regions: the new target gains a reference and
/// the previous one loses it (null and immediate values excepted).
///
/// # Safety
///
/// `owner` must be the header of a live managed or enrolled object and
/// `slot` must be a field of that object. Any object value stored must point
/// at a live heap object; slots never hold stack-object pointers.
pub unsafe fn write_barrier(owner: *const Header, slot: *mut Value, value: Value) {
    // SAFETY: owner is live per the contract
    match unsafe { (*owner).space() } {
        Space::Eden | Space::Survivor => {
            // SAFETY: slot is a field of the live owner
            unsafe { *slot = value }
        }
        Space::Stack | Space::Tenured | Space::Large => {
            // SAFETY: value and the previous slot content are live heap
            // objects per the contract
            unsafe {
                if value.is_object() {
                    debug_assert!((*value.header_ptr()).space() != Space::Stack);
                    (*value.header_ptr()).inc_ref();
                }
                let old = *slot;
                if old.is_object() {
                    (*old.header_ptr()).dec_ref();
                }
                *slot = value;
            }
        }
    }
}

/// Write barrier for weak slots: a plain store from every space.
///
/// Weak slots never contribute to refcounts, so the mature-owner bookkeeping
/// of [`write_barrier`] does not apply.
///
/// # Safety
///
/// Same contract as [`write_barrier`].
pub unsafe fn write_weak_barrier(
    owner: *const Header,
    slot: *mut Value,
    value: Value,
) {
    debug_assert!(
        !value.is_object()
            // SAFETY: value is live per the contract
            || unsafe { (*value.header_ptr()).space() } != Space::Stack
    );
    let _ = owner;
    // SAFETY: slot is a field of the live owner
    unsafe { *slot = value }
}
