use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use object::{HeapObject, Tagged, Value};

use crate::Heap;

pub const HANDLE_GROUP_CAPACITY: usize = 1024;
const BITMAP_WORDS: usize = HANDLE_GROUP_CAPACITY / 64;

/// A fixed-capacity block of root slots with an allocation bitmap.
///
/// Groups are plain process allocations, never managed heap memory, and
/// chain into an overflow list when full.
struct HandleGroup {
    next: Option<NonNull<HandleGroup>>,
    live: usize,
    bitmap: [u64; BITMAP_WORDS],
    slots: [Value; HANDLE_GROUP_CAPACITY],
}

impl HandleGroup {
    fn boxed() -> NonNull<HandleGroup> {
        let group = Box::new(HandleGroup {
            next: None,
            live: 0,
            bitmap: [0; BITMAP_WORDS],
            slots: [Value::null(); HANDLE_GROUP_CAPACITY],
        });
        NonNull::from(Box::leak(group))
    }

    fn owns(&self, slot: *const Value) -> bool {
        let base = self.slots.as_ptr() as usize;
        let addr = slot as usize;
        addr >= base && addr < base + HANDLE_GROUP_CAPACITY * size_of::<Value>()
    }

    /// Set the first clear bit and return its index.
    fn claim_free_index(&mut self) -> Option<usize> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                self.live += 1;
                return Some(word_idx * 64 + bit);
            }
        }
        None
    }
}

/// The root set: the head of the handle-group chain.
pub(crate) struct HandleRoot {
    head: NonNull<HandleGroup>,
}

impl HandleRoot {
    pub(crate) fn new() -> Self {
        Self {
            head: HandleGroup::boxed(),
        }
    }

    pub(crate) fn allocate_slot(&mut self) -> NonNull<Value> {
        let mut group = self.head;
        loop {
            // SAFETY: groups stay alive until this root frees them
            let g = unsafe { group.as_mut() };
            if let Some(idx) = g.claim_free_index() {
                g.slots[idx] = Value::null();
                return NonNull::from(&mut g.slots[idx]);
            }
            group = match g.next {
                Some(next) => next,
                None => {
                    let fresh = HandleGroup::boxed();
                    g.next = Some(fresh);
                    fresh
                }
            };
        }
    }

    /// Release a slot: zero it through the root barrier, clear its bitmap
    /// bit in the owning group, and drop empty trailing overflow groups.
    ///
    /// Freeing a pointer no group owns is an invariant violation and aborts.
    pub(crate) fn free_slot(&mut self, slot: NonNull<Value>) {
        let mut group = Some(self.head);
        while let Some(mut group_ptr) = group {
            // SAFETY: groups stay alive until this root frees them
            let g = unsafe { group_ptr.as_mut() };
            if g.owns(slot.as_ptr()) {
                // SAFETY: the slot belongs to this group and its content is
                // a live heap object or null/immediate
                unsafe {
                    let old = *slot.as_ptr();
                    if old.is_object() {
                        (*old.header_ptr()).dec_ref();
                    }
                    *slot.as_ptr() = Value::null();
                }
                let idx = (slot.as_ptr() as usize - g.slots.as_ptr() as usize)
                    / size_of::<Value>();
                debug_assert!(
                    g.bitmap[idx / 64] & (1 << (idx % 64)) != 0,
                    "handle slot freed twice"
                );
                g.bitmap[idx / 64] &= !(1 << (idx % 64));
                g.live -= 1;
                self.release_empty_tail();
                return;
            }
            group = g.next;
        }
        panic!("freed a handle slot not owned by any group");
    }

    /// Refcounted store. Every handle slot is owned by the root set, so a
    /// write adjusts both the new and the previous target.
    ///
    /// # Safety
    ///
    /// `slot` must be a live slot of this root; object values must point at
    /// live heap objects.
    pub(crate) unsafe fn write_slot(slot: NonNull<Value>, value: Value) {
        // SAFETY: per the contract
        unsafe {
            if value.is_object() {
                debug_assert!(
                    (*value.header_ptr()).space() != object::Space::Stack,
                    "handle slots hold heap pointers only"
                );
                (*value.header_ptr()).inc_ref();
            }
            let old = *slot.as_ptr();
            if old.is_object() {
                (*old.header_ptr()).dec_ref();
            }
            *slot.as_ptr() = value;
        }
    }

    /// Visit every allocated slot holding an object value.
    pub(crate) fn iterate(&mut self, f: &mut dyn FnMut(&mut Value)) {
        let mut group = Some(self.head);
        while let Some(mut group_ptr) = group {
            // SAFETY: groups stay alive until this root frees them
            let g = unsafe { group_ptr.as_mut() };
            for word_idx in 0..BITMAP_WORDS {
                let mut word = g.bitmap[word_idx];
                while word != 0 {
                    let bit = word.trailing_zeros() as usize;
                    word &= word - 1;
                    let slot = &mut g.slots[word_idx * 64 + bit];
                    if slot.is_object() {
                        f(slot);
                    }
                }
            }
            group = g.next;
        }
    }

    pub(crate) fn live_slots(&self) -> usize {
        let mut total = 0;
        let mut group = Some(self.head);
        while let Some(group_ptr) = group {
            // SAFETY: groups stay alive until this root frees them
            let g = unsafe { group_ptr.as_ref() };
            total += g.live;
            group = g.next;
        }
        total
    }

    pub(crate) fn group_count(&self) -> usize {
        let mut count = 0;
        let mut group = Some(self.head);
        while let Some(group_ptr) = group {
            count += 1;
            // SAFETY: groups stay alive until this root frees them
            group = unsafe { group_ptr.as_ref() }.next;
        }
        count
    }

    fn release_empty_tail(&mut self) {
        // SAFETY: groups stay alive until freed right here
        unsafe {
            let mut keep = self.head;
            let mut probe = keep.as_ref().next;
            while let Some(group) = probe {
                if group.as_ref().live > 0 {
                    keep = group;
                }
                probe = group.as_ref().next;
            }
            let mut dead = keep.as_mut().next.take();
            while let Some(group) = dead {
                let boxed = Box::from_raw(group.as_ptr());
                dead = boxed.next;
            }
        }
    }
}

impl Drop for HandleRoot {
    fn drop(&mut self) {
        let mut group = Some(self.head);
        while let Some(group_ptr) = group {
            // SAFETY: groups were leaked by HandleGroup::boxed
            let boxed = unsafe { Box::from_raw(group_ptr.as_ptr()) };
            group = boxed.next;
        }
    }
}

/// A smart root: an indirection cell in the handle root that keeps its
/// referent reachable and is rewritten when the referent moves.
///
/// `Clone` allocates a fresh slot; `Drop` releases it. The handle must not
/// outlive the [`Heap`] it was created from.
pub struct Handle<T: HeapObject> {
    slot: NonNull<Value>,
    root: NonNull<HandleRoot>,
    _marker: PhantomData<*const T>,
}

impl<T: HeapObject> Handle<T> {
    pub fn new(heap: &mut Heap, object: Tagged<T>) -> Handle<T> {
        let root = heap.handle_root_mut();
        let slot = root.allocate_slot();
        // SAFETY: freshly allocated slot of this root
        unsafe { HandleRoot::write_slot(slot, object.value()) };
        Handle {
            slot,
            root: NonNull::from(root),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> Tagged<T> {
        // SAFETY: the slot stays allocated for the handle's lifetime
        Tagged::from_value(unsafe { *self.slot.as_ptr() })
    }

    #[inline]
    pub fn set(&mut self, object: Tagged<T>) {
        // SAFETY: the slot stays allocated for the handle's lifetime
        unsafe { HandleRoot::write_slot(self.slot, object.value()) };
    }

    #[inline]
    pub fn clear(&mut self) {
        // SAFETY: the slot stays allocated for the handle's lifetime
        unsafe { HandleRoot::write_slot(self.slot, Value::null()) };
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }
}

impl<T: HeapObject> Clone for Handle<T> {
    fn clone(&self) -> Self {
        let mut root = self.root;
        // SAFETY: the root outlives every handle attached to it
        let slot = unsafe { root.as_mut() }.allocate_slot();
        // SAFETY: freshly allocated slot of this root
        unsafe { HandleRoot::write_slot(slot, self.get().value()) };
        Handle {
            slot,
            root: self.root,
            _marker: PhantomData,
        }
    }
}

impl<T: HeapObject> Drop for Handle<T> {
    fn drop(&mut self) {
        let mut root = self.root;
        // SAFETY: the root outlives every handle attached to it
        unsafe { root.as_mut() }.free_slot(self.slot);
    }
}

impl<T: HeapObject> Deref for Handle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        debug_assert!(!self.is_null(), "dereferenced a null handle");
        // SAFETY: the handle roots its referent, so it is live
        unsafe { self.get().as_ref() }
    }
}

impl<T: HeapObject> DerefMut for Handle<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        debug_assert!(!self.is_null(), "dereferenced a null handle");
        // SAFETY: the handle roots its referent, so it is live
        unsafe { self.get().as_mut() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Heap;

    struct Leaf {
        id: u64,
    }

    impl HeapObject for Leaf {}

    fn mk_heap() -> Heap {
        Heap::new().expect("heap")
    }

    #[test]
    fn handles_contribute_refcounts() {
        let mut heap = mk_heap();
        let obj = heap.allocate(Leaf { id: 1 }).expect("allocate");

        let first = heap.handle(obj);
        // SAFETY: obj stays valid, no collection here
        unsafe { assert_eq!((*obj.header_ptr()).refcount(), 1) };

        let second = first.clone();
        // SAFETY: as above
        unsafe { assert_eq!((*obj.header_ptr()).refcount(), 2) };

        drop(first);
        // SAFETY: as above
        unsafe { assert_eq!((*obj.header_ptr()).refcount(), 1) };

        drop(second);
        // SAFETY: as above
        unsafe { assert_eq!((*obj.header_ptr()).refcount(), 0) };
    }

    #[test]
    fn set_and_clear_keep_the_count_balanced() {
        let mut heap = mk_heap();
        let a = heap.allocate(Leaf { id: 1 }).expect("allocate");
        let b = heap.allocate(Leaf { id: 2 }).expect("allocate");

        let mut root = heap.handle(a);
        root.set(b);
        // SAFETY: both objects stay valid, no collection here
        unsafe {
            assert_eq!((*a.header_ptr()).refcount(), 0);
            assert_eq!((*b.header_ptr()).refcount(), 1);
        }

        root.clear();
        assert!(root.is_null());
        // SAFETY: as above
        unsafe { assert_eq!((*b.header_ptr()).refcount(), 0) };
    }

    #[test]
    fn deref_reaches_the_payload() {
        let mut heap = mk_heap();
        let obj = heap.allocate(Leaf { id: 42 }).expect("allocate");
        let root = heap.handle(obj);
        assert_eq!(root.id, 42);
    }

    #[test]
    fn slots_are_reused_after_free() {
        let mut heap = mk_heap();
        let obj = heap.allocate(Leaf { id: 1 }).expect("allocate");

        let first = heap.handle(obj);
        let first_slot = first.slot;
        drop(first);

        let second = heap.handle(obj);
        assert_eq!(
            second.slot, first_slot,
            "the bitmap hands back the first clear slot"
        );
    }

    #[test]
    fn overflow_group_created_and_released() {
        let mut heap = mk_heap();
        let obj = heap.allocate(Leaf { id: 1 }).expect("allocate");

        let mut handles = Vec::new();
        for _ in 0..(HANDLE_GROUP_CAPACITY + 1) {
            handles.push(heap.handle(obj));
        }
        assert_eq!(heap.handle_root().group_count(), 2);
        assert_eq!(
            heap.handle_root().live_slots(),
            HANDLE_GROUP_CAPACITY + 1
        );

        handles.clear();
        assert_eq!(
            heap.handle_root().group_count(),
            1,
            "empty trailing group is released"
        );
        assert_eq!(heap.handle_root().live_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "not owned by any group")]
    fn freeing_a_foreign_slot_aborts() {
        let mut heap = mk_heap();
        let mut rogue = Value::null();
        heap.handle_root_mut()
            .free_slot(NonNull::from(&mut rogue));
    }
}
