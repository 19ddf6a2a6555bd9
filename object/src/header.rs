use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hasher},
    sync::OnceLock,
};

use crate::VTable;

/// The region an object currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Space {
    Eden = 0,
    Survivor,
    Tenured,
    Large,
    Stack,
}

/// Tri-state mark used by the collection phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    NotMarked = 0,
    Marking,
    Marked,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct HeapWords {
    /// Forwarding target during a collection; doubles as the liveness
    /// witness (null after finalize means the object was reclaimed).
    dest: *mut Header,
    /// Incoming strong references from the root set and from tenured or
    /// large objects.
    refcount: u32,
    /// Total allocation size in bytes, header included. Multiple of 8.
    size: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct StackLinks {
    prev: *mut Header,
    next: *mut Header,
}

/// `space == Stack` selects the `stack` shape; every other space selects the
/// `heap` shape. The accessors below assert the tag.
#[repr(C)]
union Words {
    heap: HeapWords,
    stack: StackLinks,
}

/// The fixed header at the start of every managed object.
///
/// ```text
/// word 0:      vtable — erased per-type trace/drop/weak hooks
/// words 1..2:  heap shape {dest, refcount, size} | stack shape {prev, next}
/// word 3:      space, status, lifetime, identity
/// ```
///
/// The payload follows immediately at [`HEADER_SIZE`].
#[repr(C)]
pub struct Header {
    vtable: &'static VTable,
    words: Words,
    space: Space,
    status: Status,
    lifetime: u8,
    _pad: u8,
    identity: u32,
}

pub const HEADER_SIZE: usize = size_of::<Header>();

const _: () = assert!(size_of::<Header>() == 32);
const _: () = assert!(align_of::<Header>() == 8);

impl Header {
    pub fn new_heap(
        vtable: &'static VTable,
        space: Space,
        size: u32,
        identity: u32,
    ) -> Self {
        debug_assert!(space != Space::Stack);
        debug_assert!(size as usize % 8 == 0 && size as usize >= HEADER_SIZE);
        Self {
            vtable,
            words: Words {
                heap: HeapWords {
                    dest: core::ptr::null_mut(),
                    refcount: 0,
                    size,
                },
            },
            space,
            status: Status::NotMarked,
            lifetime: 0,
            _pad: 0,
            identity,
        }
    }

    pub fn new_stack(vtable: &'static VTable) -> Self {
        Self {
            vtable,
            words: Words {
                stack: StackLinks {
                    prev: core::ptr::null_mut(),
                    next: core::ptr::null_mut(),
                },
            },
            space: Space::Stack,
            status: Status::NotMarked,
            lifetime: 0,
            _pad: 0,
            identity: 0,
        }
    }

    #[inline(always)]
    pub fn vtable(&self) -> &'static VTable {
        self.vtable
    }

    #[inline(always)]
    pub fn space(&self) -> Space {
        self.space
    }

    #[inline(always)]
    pub fn set_space(&mut self, space: Space) {
        debug_assert!(
            (self.space == Space::Stack) == (space == Space::Stack),
            "space change must not switch the header shape"
        );
        self.space = space;
    }

    #[inline(always)]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline(always)]
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    #[inline(always)]
    pub fn lifetime(&self) -> u8 {
        self.lifetime
    }

    #[inline(always)]
    pub fn bump_lifetime(&mut self) {
        self.lifetime = self.lifetime.saturating_add(1);
    }

    #[inline(always)]
    pub fn identity(&self) -> u32 {
        self.identity
    }

    #[inline(always)]
    pub fn set_identity(&mut self, identity: u32) {
        self.identity = identity;
    }

    /// Stable per-object hash: the allocation identity mixed with a
    /// process-wide seed. Survives relocation, unlike the address.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = identity_seed().build_hasher();
        hasher.write_u32(self.identity);
        hasher.finish()
    }

    // ── heap shape ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn size(&self) -> u32 {
        debug_assert!(self.space != Space::Stack);
        // SAFETY: space tag selects the heap shape
        unsafe { self.words.heap.size }
    }

    #[inline(always)]
    pub fn dest(&self) -> *mut Header {
        debug_assert!(self.space != Space::Stack);
        // SAFETY: space tag selects the heap shape
        unsafe { self.words.heap.dest }
    }

    #[inline(always)]
    pub fn set_dest(&mut self, dest: *mut Header) {
        debug_assert!(self.space != Space::Stack);
        // SAFETY: space tag selects the heap shape
        unsafe { self.words.heap.dest = dest }
    }

    #[inline(always)]
    pub fn refcount(&self) -> u32 {
        debug_assert!(self.space != Space::Stack);
        // SAFETY: space tag selects the heap shape
        unsafe { self.words.heap.refcount }
    }

    #[inline(always)]
    pub fn inc_ref(&mut self) {
        debug_assert!(self.space != Space::Stack);
        // SAFETY: space tag selects the heap shape
        unsafe { self.words.heap.refcount += 1 }
    }

    #[inline(always)]
    pub fn dec_ref(&mut self) {
        debug_assert!(self.space != Space::Stack);
        // SAFETY: space tag selects the heap shape
        unsafe {
            debug_assert!(self.words.heap.refcount > 0, "refcount underflow");
            self.words.heap.refcount -= 1;
        }
    }

    // ── stack shape ────────────────────────────────────────────────

    #[inline(always)]
    pub fn stack_prev(&self) -> *mut Header {
        debug_assert!(self.space == Space::Stack);
        // SAFETY: space tag selects the stack shape
        unsafe { self.words.stack.prev }
    }

    #[inline(always)]
    pub fn stack_next(&self) -> *mut Header {
        debug_assert!(self.space == Space::Stack);
        // SAFETY: space tag selects the stack shape
        unsafe { self.words.stack.next }
    }

    #[inline(always)]
    pub fn set_stack_prev(&mut self, prev: *mut Header) {
        debug_assert!(self.space == Space::Stack);
        // SAFETY: space tag selects the stack shape
        unsafe { self.words.stack.prev = prev }
    }

    #[inline(always)]
    pub fn set_stack_next(&mut self, next: *mut Header) {
        debug_assert!(self.space == Space::Stack);
        // SAFETY: space tag selects the stack shape
        unsafe { self.words.stack.next = next }
    }

    /// The payload address of the object owning `this`.
    ///
    /// # Safety
    ///
    /// `this` must point at the header of a managed or enrolled object whose
    /// payload follows in the same allocation.
    #[inline(always)]
    pub unsafe fn payload(this: *mut Header) -> *mut u8 {
        // SAFETY: caller guarantees the payload follows the header
        unsafe { (this as *mut u8).add(HEADER_SIZE) }
    }
}

/// The header address of a managed payload.
///
/// # Safety
///
/// `payload` must have been obtained from a managed or enrolled object.
#[inline(always)]
pub unsafe fn header_from_payload(payload: *const u8) -> *mut Header {
    // SAFETY: caller guarantees a header precedes the payload
    unsafe { (payload as *mut u8).sub(HEADER_SIZE) as *mut Header }
}

fn identity_seed() -> &'static RandomState {
    static SEED: OnceLock<RandomState> = OnceLock::new();
    SEED.get_or_init(RandomState::new)
}
