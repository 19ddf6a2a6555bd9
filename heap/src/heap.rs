use std::{
    mem,
    ptr::{self, NonNull},
};

use log::{debug, trace};

use object::{
    vtable_of, FieldVisitor, Header, HeapObject, Space, Status, Tagged,
    Value, HEADER_SIZE,
};

use crate::{
    handles::{Handle, HandleRoot},
    region::MemorySpace,
    system::{self, AllocError},
};

/// Allocations above this many bytes (header included) bypass the nursery
/// and live in the non-moving large-object list.
pub const LARGE_OBJECT_THRESHOLD: usize = 4096;

/// Capacity of eden, each survivor half, and each tenured region.
pub const MEMORY_SPACE_SIZE: usize = 1024 * 1024;

/// Minor collections an object must survive before promotion.
pub const TENURED_SPACE_THRESHOLD: u8 = 16;

const DEBUG_FILL: u8 = 0xCC;

/// List node preceding every large-object payload.
#[repr(C)]
struct LargeNode {
    prev: *mut LargeNode,
    next: *mut LargeNode,
}

const LARGE_NODE_SIZE: usize = size_of::<LargeNode>();

const _: () = assert!(LARGE_NODE_SIZE % 8 == 0);

/// # Safety
///
/// `node` must be a live large-object node.
#[inline(always)]
unsafe fn large_payload(node: *mut LargeNode) -> *mut Header {
    // SAFETY: the payload header sits right behind the node
    unsafe { node.add(1) as *mut Header }
}

/// # Safety
///
/// `header` must be a large-object payload header.
#[inline(always)]
unsafe fn large_node_of(header: *mut Header) -> *mut LargeNode {
    // SAFETY: inverse of large_payload
    unsafe { (header as *mut LargeNode).sub(1) }
}

/// Walk the objects laid out in `extents` back to back.
///
/// The next cursor is read before `f` runs, so `f` may relocate or finalize
/// the current object.
///
/// # Safety
///
/// Every extent must cover initialized objects with intact headers.
unsafe fn each_object(
    extents: &[(*mut u8, *mut u8)],
    mut f: impl FnMut(*mut Header),
) {
    for &(begin, end) in extents {
        let mut cursor = begin;
        while cursor < end {
            let header = cursor as *mut Header;
            // SAFETY: the extent covers initialized headers
            let size = unsafe { (*header).size() } as usize;
            debug_assert!(size >= HEADER_SIZE && size % 8 == 0);
            f(header);
            // SAFETY: objects are laid out back to back within the extent
            cursor = unsafe { cursor.add(size) };
        }
    }
}

/// Walk the large-object list. `next` is read before `f`, so `f` may free
/// the current node.
///
/// # Safety
///
/// `head` must be the list sentinel of a live heap.
unsafe fn each_large_object(
    head: *mut LargeNode,
    mut f: impl FnMut(*mut Header),
) {
    // SAFETY: sentinel links are always valid
    unsafe {
        let mut node = (*head).next;
        while node != head {
            let next = (*node).next;
            f(large_payload(node));
            node = next;
        }
    }
}

/// Walk the enrolled stack objects. `next` is read before `f`.
///
/// # Safety
///
/// `head` must be the stack-list sentinel of a live heap.
unsafe fn each_stack_object(head: *mut Header, mut f: impl FnMut(*mut Header)) {
    // SAFETY: sentinel links are always valid
    unsafe {
        let mut cursor = (*head).stack_next();
        while cursor != head {
            let next = (*cursor).stack_next();
            f(cursor);
            cursor = next;
        }
    }
}

fn must_expand(result: Result<Option<NonNull<u8>>, AllocError>) -> NonNull<u8> {
    result
        .unwrap_or_else(|e| {
            panic!("region expansion failed during a collection: {e}")
        })
        .expect("expanding allocation cannot report exhaustion")
}

// ── Field visitors ─────────────────────────────────────────────────────

/// Transitions unmarked strong targets to `Marking`. Weak slots never
/// propagate marks.
pub(crate) struct MarkingVisitor;

impl FieldVisitor for MarkingVisitor {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_object() {
            return;
        }
        let header = value.header_ptr();
        // SAFETY: strong slots hold live heap objects
        unsafe {
            debug_assert!(
                (*header).space() != Space::Stack,
                "slots must not point at stack objects"
            );
            if (*header).status() == Status::NotMarked {
                (*header).set_status(Status::Marking);
            }
        }
    }
}

/// Rewrites every slot to its target's forwarding address. Correct even for
/// non-moving targets because settled objects keep `dest == self`.
pub(crate) struct UpdateVisitor;

impl FieldVisitor for UpdateVisitor {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_object() {
            return;
        }
        // SAFETY: target headers stay intact until relocation completes
        let dest = unsafe { (*value.header_ptr()).dest() };
        debug_assert!(!dest.is_null(), "strong slot points at a reclaimed object");
        *slot = Value::from_ptr(dest);
    }

    fn visit_weak(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_object() {
            return;
        }
        // SAFETY: dead referents were already nulled by the weak pass
        let dest = unsafe { (*value.header_ptr()).dest() };
        *slot = Value::from_ptr(dest);
    }
}

/// Grants one reference to every strong target.
pub(crate) struct IncRefVisitor;

impl FieldVisitor for IncRefVisitor {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_object() {
            return;
        }
        // SAFETY: strong slots hold live heap objects
        unsafe { (*value.header_ptr()).inc_ref() }
    }
}

/// Releases one reference from every strong target.
pub(crate) struct DecRefVisitor;

impl FieldVisitor for DecRefVisitor {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_object() {
            return;
        }
        // SAFETY: strong slots hold live heap objects
        unsafe { (*value.header_ptr()).dec_ref() }
    }
}

/// Nulls weak slots whose referent was reclaimed and records them so the
/// owner can be notified.
struct WeakNotifyVisitor {
    collected: Vec<*mut Value>,
}

impl FieldVisitor for WeakNotifyVisitor {
    fn visit(&mut self, _slot: &mut Value) {}

    fn visit_weak(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_object() {
            return;
        }
        // dest is the liveness witness: null after finalize means reclaimed
        // SAFETY: the referent's header stays intact until relocation
        if unsafe { (*value.header_ptr()).dest() }.is_null() {
            *slot = Value::null();
            self.collected.push(slot as *mut Value);
        }
    }
}

/// Null the dead weak slots of one object, then deliver the callbacks.
///
/// # Safety
///
/// `header` must belong to an object whose fields are still enumerable.
unsafe fn weak_sweep_object(header: *mut Header, scratch: &mut Vec<*mut Value>) {
    // SAFETY: per the contract
    unsafe {
        let vtable = (*header).vtable();
        let payload = Header::payload(header);
        let mut visitor = WeakNotifyVisitor {
            collected: mem::take(scratch),
        };
        (vtable.trace)(payload, &mut visitor);
        let mut collected = visitor.collected;
        for &slot in collected.iter() {
            (vtable.weak)(payload, slot);
        }
        collected.clear();
        *scratch = collected;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WeakMode {
    /// Only `Marked` owners: the walked region is being collected.
    Live,
    /// Every owner: the walked region is a root for this collection.
    Root,
}

// ── Heap ───────────────────────────────────────────────────────────────

/// The heap manager: all regions, the root sets, and the collector.
///
/// Single-threaded by design. Raw pointers into the heap go stale at every
/// collection point; anchor objects with [`Handle`] or enroll them as
/// [stack objects](crate::StackObject) instead.
pub struct Heap {
    eden: MemorySpace,
    survivor_from: MemorySpace,
    survivor_to: MemorySpace,
    tenured: MemorySpace,
    large_head: Box<LargeNode>,
    stack_head: Box<Header>,
    handles: Box<HandleRoot>,
    full_gc_suggested: bool,
    no_gc: usize,
    next_identity: u32,
}

impl Heap {
    pub fn new() -> Result<Heap, AllocError> {
        let mut heap = Heap {
            eden: MemorySpace::new(MEMORY_SPACE_SIZE)?,
            survivor_from: MemorySpace::new(MEMORY_SPACE_SIZE)?,
            survivor_to: MemorySpace::new(MEMORY_SPACE_SIZE)?,
            tenured: MemorySpace::new(MEMORY_SPACE_SIZE)?,
            large_head: Box::new(LargeNode {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            }),
            stack_head: Box::new(Header::new_stack(vtable_of::<()>())),
            handles: Box::new(HandleRoot::new()),
            full_gc_suggested: false,
            no_gc: 0,
            next_identity: 0,
        };

        let large_head = &mut *heap.large_head as *mut LargeNode;
        heap.large_head.prev = large_head;
        heap.large_head.next = large_head;

        let stack_head = &mut *heap.stack_head as *mut Header;
        heap.stack_head.set_stack_prev(stack_head);
        heap.stack_head.set_stack_next(stack_head);

        if cfg!(debug_assertions) {
            heap.eden.fill_unallocated(DEBUG_FILL);
            heap.survivor_from.fill_unallocated(DEBUG_FILL);
            heap.survivor_to.fill_unallocated(DEBUG_FILL);
            heap.tenured.fill_unallocated(DEBUG_FILL);
        }

        Ok(heap)
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Allocate `value` on the managed heap.
    ///
    /// The returned [`Tagged`] is a raw reference: it goes stale at the next
    /// collection point unless anchored through a [`Handle`].
    pub fn allocate<T: HeapObject>(
        &mut self,
        value: T,
    ) -> Result<Tagged<T>, AllocError> {
        const {
            assert!(
                align_of::<T>() <= 8,
                "payload alignment above 8 is unsupported"
            )
        };
        let header = self.allocate_raw_with(vtable_of::<T>(), size_of::<T>())?;
        // SAFETY: fresh allocation with room for T behind the header
        unsafe {
            ptr::write(Header::payload(header) as *mut T, value);
        }
        Ok(Tagged::from_value(Value::from_ptr(header)))
    }

    /// Reserve a managed allocation of `HEADER_SIZE + payload_size` bytes
    /// and initialize its header. The payload is left uninitialized.
    pub(crate) fn allocate_raw_with(
        &mut self,
        vtable: &'static object::VTable,
        payload_size: usize,
    ) -> Result<*mut Header, AllocError> {
        let unaligned = HEADER_SIZE + payload_size;
        let total = (unaligned + 7) & !7;
        if total > u32::MAX as usize {
            return Err(AllocError::TooLarge { requested: total });
        }

        if total > LARGE_OBJECT_THRESHOLD {
            return self.allocate_large(vtable, total);
        }

        if let Some(raw) = self.eden.allocate(total, false)? {
            return Ok(self.init_heap_object(raw, vtable, total, Space::Eden));
        }

        if self.no_gc == 0 {
            debug!("eden space exhausted");
            if self.full_gc_suggested {
                self.major_gc();
                self.full_gc_suggested = false;
            } else {
                self.minor_gc();
            }
            let raw = self
                .eden
                .allocate(total, false)?
                .expect("eden has room after a collection");
            return Ok(self.init_heap_object(raw, vtable, total, Space::Eden));
        }

        // Inside a no-gc scope nursery overflow is diverted to survivor
        // space instead of triggering a collection.
        let raw = must_expand(self.survivor_from.allocate(total, true));
        Ok(self.init_heap_object(raw, vtable, total, Space::Survivor))
    }

    fn allocate_large(
        &mut self,
        vtable: &'static object::VTable,
        total: usize,
    ) -> Result<*mut Header, AllocError> {
        if self.no_gc == 0 && self.full_gc_suggested {
            self.major_gc();
            self.full_gc_suggested = false;
        } else {
            self.full_gc_suggested = true;
        }

        let node =
            system::reserve(LARGE_NODE_SIZE + total)?.as_ptr() as *mut LargeNode;
        let head = &mut *self.large_head as *mut LargeNode;
        let identity = self.fresh_identity();
        // SAFETY: node is a fresh reservation; sentinel links are valid
        unsafe {
            (*node).prev = (*head).prev;
            (*node).next = head;
            (*(*head).prev).next = node;
            (*head).prev = node;

            let header = large_payload(node);
            ptr::write(
                header,
                Header::new_heap(vtable, Space::Large, total as u32, identity),
            );
            // Large objects never move; dest doubles as the liveness witness.
            (*header).set_dest(header);
            trace!("allocated {:p} [large, {} bytes]", header, total);
            Ok(header)
        }
    }

    fn init_heap_object(
        &mut self,
        raw: NonNull<u8>,
        vtable: &'static object::VTable,
        total: usize,
        space: Space,
    ) -> *mut Header {
        let header = raw.as_ptr() as *mut Header;
        let identity = self.fresh_identity();
        // SAFETY: raw points at `total` fresh bytes
        unsafe {
            ptr::write(
                header,
                Header::new_heap(vtable, space, total as u32, identity),
            );
        }
        trace!("allocated {:p} [{:?}, {} bytes]", header, space, total);
        header
    }

    fn fresh_identity(&mut self) -> u32 {
        self.next_identity = self.next_identity.wrapping_add(1);
        self.next_identity
    }

    /// Anchor `object` in the root set.
    pub fn handle<T: HeapObject>(&mut self, object: Tagged<T>) -> Handle<T> {
        Handle::new(self, object)
    }

    pub(crate) fn handle_root_mut(&mut self) -> &mut HandleRoot {
        &mut self.handles
    }

    #[cfg(test)]
    pub(crate) fn handle_root(&self) -> &HandleRoot {
        &self.handles
    }

    /// Run `f` with collection suspended.
    ///
    /// Nursery overflow inside the scope diverts allocations to survivor
    /// space; explicit collection triggers abort. Scopes nest.
    pub fn no_gc<R>(&mut self, f: impl FnOnce(&mut Heap) -> R) -> R {
        self.no_gc += 1;
        let result = f(self);
        debug_assert!(self.no_gc > 0);
        self.no_gc -= 1;
        result
    }

    pub(crate) fn enroll_stack_object(&mut self, header: &mut Header) {
        header.set_identity(self.fresh_identity());
        let head = &mut *self.stack_head as *mut Header;
        let header_ptr = header as *mut Header;
        // SAFETY: sentinel links are always valid
        unsafe {
            let tail = (*head).stack_prev();
            header.set_stack_prev(tail);
            header.set_stack_next(head);
            (*tail).set_stack_next(header_ptr);
            (*head).set_stack_prev(header_ptr);
        }
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn eden(&self) -> &MemorySpace {
        &self.eden
    }

    pub fn survivor_from(&self) -> &MemorySpace {
        &self.survivor_from
    }

    pub fn survivor_to(&self) -> &MemorySpace {
        &self.survivor_to
    }

    pub fn tenured(&self) -> &MemorySpace {
        &self.tenured
    }

    pub fn large_object_count(&self) -> usize {
        let mut count = 0;
        let head = &*self.large_head as *const LargeNode as *mut LargeNode;
        // SAFETY: sentinel links are always valid
        unsafe { each_large_object(head, |_| count += 1) };
        count
    }

    /// Walk every object currently held by the heap.
    pub fn dump(&mut self, visitor: &mut dyn FnMut(&Header)) {
        for extents in [
            self.eden.extents(),
            self.survivor_from.extents(),
            self.tenured.extents(),
        ] {
            // SAFETY: extents cover initialized objects
            unsafe { each_object(&extents, |header| visitor(&*header)) };
        }
        let head = &mut *self.large_head as *mut LargeNode;
        // SAFETY: sentinel links are always valid
        unsafe { each_large_object(head, |header| visitor(&*header)) };
    }

    // ── Minor collection ───────────────────────────────────────────

    /// Collect eden and survivor-from. Stack objects, handles, tenured and
    /// large objects are roots, represented by the refcounts the write
    /// barrier maintains.
    pub fn minor_gc(&mut self) {
        assert!(self.no_gc == 0, "collection triggered inside a no-gc scope");
        debug!("----- minor gc -----");

        let eden_ext = self.eden.extents();
        let from_ext = self.survivor_from.extents();
        let stack_head = &mut *self.stack_head as *mut Header;
        let large_head = &mut *self.large_head as *mut LargeNode;

        // 1. Roots: the refcounts already aggregate every reference from
        //    the root set and the mature regions.
        // SAFETY: extents cover initialized objects
        unsafe {
            Self::scan_refcount_roots(&eden_ext);
            Self::scan_refcount_roots(&from_ext);
        }

        // 2. Mark closure over the young regions.
        loop {
            // SAFETY: extents cover initialized objects
            let changed = unsafe {
                Self::mark_space(&eden_ext) | Self::mark_space(&from_ext)
            };
            if !changed {
                break;
            }
        }

        // 3. Finalize the unreachable; dest becomes the liveness witness.
        // SAFETY: extents cover initialized objects
        unsafe {
            Self::finalize_unreachable(&eden_ext);
            Self::finalize_unreachable(&from_ext);
        }

        // 4. Promotions may expand tenured while later passes iterate it.
        self.tenured.save_original();

        // 5. Forwarding.
        self.eden_calculate_target();
        self.survivor_calculate_target();

        // 6. Weak notifications.
        let tenured_orig = self.tenured.original_extents();
        {
            let mut scratch = Vec::new();
            // SAFETY: every walked object still has enumerable fields
            unsafe {
                Self::notify_weak_space(&eden_ext, WeakMode::Live, &mut scratch);
                Self::notify_weak_space(&from_ext, WeakMode::Live, &mut scratch);
                each_stack_object(stack_head, |header| {
                    weak_sweep_object(header, &mut scratch)
                });
                Self::notify_weak_space(
                    &tenured_orig,
                    WeakMode::Root,
                    &mut scratch,
                );
                Self::notify_weak_large(large_head, WeakMode::Root, &mut scratch);
            }
        }

        // 7. Update references everywhere.
        // SAFETY: every walked object still has enumerable fields
        unsafe {
            each_stack_object(stack_head, |header| {
                Self::update_object(header);
            });
        }
        self.handles.iterate(&mut |slot| UpdateVisitor.visit(slot));
        // SAFETY: extents cover initialized objects
        unsafe {
            Self::update_space_marked(&eden_ext);
            Self::update_space_marked(&from_ext);
            // Minor collections never reclaim mature objects, so the walk
            // is unconditional; it also clears marks the closure left on
            // mature targets.
            Self::update_tenured_minor(&tenured_orig);
            Self::update_large_minor(large_head);
        }

        // 8. Relocate.
        // SAFETY: forwarding targets were reserved in step 5
        unsafe {
            Self::copy_space(&eden_ext);
            Self::copy_space(&from_ext);
        }

        // 9. Reset and swap the survivor halves.
        self.eden.clear();
        self.survivor_from.clear();
        self.survivor_from.trim(1);
        if cfg!(debug_assertions) {
            self.eden.fill_unallocated(DEBUG_FILL);
            self.survivor_from.fill_unallocated(DEBUG_FILL);
        }
        mem::swap(&mut self.survivor_from, &mut self.survivor_to);

        debug!("----- minor gc finished -----");
    }

    // ── Major collection ───────────────────────────────────────────

    /// Collect all four regions. Only the true roots (stack objects and
    /// handles) seed the mark; refcounts play no part, which is what lets
    /// mature cycles die.
    pub fn major_gc(&mut self) {
        assert!(self.no_gc == 0, "collection triggered inside a no-gc scope");
        debug!("----- major gc -----");

        let eden_ext = self.eden.extents();
        let from_ext = self.survivor_from.extents();
        let tenured_ext = self.tenured.extents();
        let stack_head = &mut *self.stack_head as *mut Header;
        let large_head = &mut *self.large_head as *mut LargeNode;

        // 1. True roots.
        // SAFETY: stack objects have enumerable fields
        unsafe {
            each_stack_object(stack_head, |header| {
                let vtable = (*header).vtable();
                (vtable.trace)(Header::payload(header), &mut MarkingVisitor);
            });
        }
        self.handles.iterate(&mut |slot| MarkingVisitor.visit(slot));

        // 2. Mark closure across all four regions.
        loop {
            // SAFETY: extents cover initialized objects
            let changed = unsafe {
                Self::mark_space(&eden_ext)
                    | Self::mark_space(&from_ext)
                    | Self::mark_space(&tenured_ext)
                    | Self::mark_large(large_head)
            };
            if !changed {
                break;
            }
        }

        // 3. Finalize the unreachable everywhere.
        // SAFETY: extents cover initialized objects
        unsafe {
            Self::finalize_unreachable(&eden_ext);
            Self::finalize_unreachable(&from_ext);
            Self::finalize_unreachable(&tenured_ext);
            Self::finalize_large(large_head);
        }

        // 4. Compact tenured in place: reset its bump pointer and hand the
        //    survivors monotone targets below their origins.
        self.tenured.save_original();
        self.tenured.clear();

        // 5. Forwarding. Tenured goes before the survivors so compaction
        //    targets stay monotone and promotions land behind them.
        self.eden_calculate_target();
        self.tenured_calculate_target();
        self.survivor_calculate_target();
        // SAFETY: large headers stay valid throughout the collection
        unsafe { Self::large_calculate_target(large_head) };

        // 6. Weak notifications.
        let tenured_orig = self.tenured.original_extents();
        {
            let mut scratch = Vec::new();
            // SAFETY: every walked object still has enumerable fields
            unsafe {
                Self::notify_weak_space(&eden_ext, WeakMode::Live, &mut scratch);
                Self::notify_weak_space(&from_ext, WeakMode::Live, &mut scratch);
                each_stack_object(stack_head, |header| {
                    weak_sweep_object(header, &mut scratch)
                });
                Self::notify_weak_space(
                    &tenured_orig,
                    WeakMode::Live,
                    &mut scratch,
                );
                Self::notify_weak_large(large_head, WeakMode::Live, &mut scratch);
            }
        }

        // 7. Update references everywhere.
        // SAFETY: every walked object still has enumerable fields
        unsafe {
            each_stack_object(stack_head, |header| {
                Self::update_object(header);
            });
        }
        self.handles.iterate(&mut |slot| UpdateVisitor.visit(slot));
        // SAFETY: extents cover initialized objects
        unsafe {
            Self::update_space_marked(&eden_ext);
            Self::update_space_marked(&from_ext);
            Self::update_space_marked(&tenured_orig);
            Self::update_large_major(large_head);
        }

        // 8. Relocate. Tenured overlaps itself, so it moves instead of
        //    copying; dead large nodes go back to the platform.
        // SAFETY: forwarding targets were reserved in step 5
        unsafe {
            Self::copy_space(&eden_ext);
            Self::move_space(&tenured_orig);
            Self::copy_space(&from_ext);
        }
        self.clean_large();

        // 9. Reset, trim the slack, swap the survivor halves.
        self.eden.clear();
        self.survivor_from.clear();
        self.survivor_from.trim(1);
        self.tenured.trim(0);
        if cfg!(debug_assertions) {
            self.eden.fill_unallocated(DEBUG_FILL);
            self.survivor_from.fill_unallocated(DEBUG_FILL);
            self.tenured.fill_unallocated(DEBUG_FILL);
        }
        mem::swap(&mut self.survivor_from, &mut self.survivor_to);

        debug!("----- major gc finished -----");
    }

    // ── Shared phases ──────────────────────────────────────────────

    /// # Safety
    ///
    /// Extents must cover initialized objects.
    unsafe fn scan_refcount_roots(extents: &[(*mut u8, *mut u8)]) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if (*header).refcount() > 0 {
                    (*header).set_status(Status::Marking);
                }
            });
        }
    }

    /// One marking sweep. Returns whether any object was still `Marking`.
    ///
    /// # Safety
    ///
    /// Extents must cover initialized objects.
    unsafe fn mark_space(extents: &[(*mut u8, *mut u8)]) -> bool {
        let mut modified = false;
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if (*header).status() == Status::Marking {
                    modified = true;
                    let vtable = (*header).vtable();
                    (vtable.trace)(Header::payload(header), &mut MarkingVisitor);
                    (*header).set_status(Status::Marked);
                }
            });
        }
        modified
    }

    /// # Safety
    ///
    /// `head` must be the large-list sentinel of a live heap.
    unsafe fn mark_large(head: *mut LargeNode) -> bool {
        let mut modified = false;
        // SAFETY: per the contract
        unsafe {
            each_large_object(head, |header| {
                if (*header).status() == Status::Marking {
                    modified = true;
                    let vtable = (*header).vtable();
                    (vtable.trace)(Header::payload(header), &mut MarkingVisitor);
                    (*header).set_status(Status::Marked);
                }
            });
        }
        modified
    }

    /// Run destructors of unmarked objects and null their `dest`.
    ///
    /// # Safety
    ///
    /// Extents must cover initialized objects.
    unsafe fn finalize_unreachable(extents: &[(*mut u8, *mut u8)]) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if (*header).status() != Status::Marked {
                    trace!("reclaim {:p}", header);
                    let vtable = (*header).vtable();
                    (vtable.drop)(Header::payload(header));
                    (*header).set_dest(ptr::null_mut());
                }
            });
        }
    }

    /// # Safety
    ///
    /// `head` must be the large-list sentinel of a live heap.
    unsafe fn finalize_large(head: *mut LargeNode) {
        // SAFETY: per the contract
        unsafe {
            each_large_object(head, |header| {
                if (*header).status() != Status::Marked {
                    trace!("reclaim large object {:p}", header);
                    let vtable = (*header).vtable();
                    (vtable.drop)(Header::payload(header));
                    (*header).set_dest(ptr::null_mut());
                }
            });
        }
    }

    fn eden_calculate_target(&mut self) {
        let extents = self.eden.extents();
        let this: *mut Heap = self;
        // SAFETY: the walk touches headers only; targets live in survivor-to
        unsafe {
            each_object(&extents, |header| {
                if (*header).status() != Status::Marked {
                    return;
                }
                let size = (*header).size() as usize;
                let dest = must_expand((*this).survivor_to.allocate(size, true))
                    .as_ptr() as *mut Header;
                (*header).set_dest(dest);
                (*header).set_space(Space::Survivor);
                (*header).bump_lifetime();
                trace!("object {:p} [eden] moved to {:p} [survivor]", header, dest);
            });
        }
    }

    fn survivor_calculate_target(&mut self) {
        let extents = self.survivor_from.extents();
        let this: *mut Heap = self;
        // SAFETY: the walk touches headers only; targets live in survivor-to
        // or tenured
        unsafe {
            each_object(&extents, |header| {
                if (*header).status() != Status::Marked {
                    return;
                }
                if (*header).lifetime() >= TENURED_SPACE_THRESHOLD {
                    (*this).promote_to_tenured(header);
                } else {
                    let size = (*header).size() as usize;
                    let dest =
                        must_expand((*this).survivor_to.allocate(size, true))
                            .as_ptr() as *mut Header;
                    (*header).set_dest(dest);
                    (*header).bump_lifetime();
                    trace!(
                        "object {:p} [survivor] moved to {:p} [survivor]",
                        header,
                        dest
                    );
                }
            });
        }
    }

    fn tenured_calculate_target(&mut self) {
        let extents = self.tenured.original_extents();
        let this: *mut Heap = self;
        // SAFETY: the walk touches headers only; allocation is monotone into
        // the cleared chain
        unsafe {
            each_object(&extents, |header| {
                if (*header).status() == Status::Marked {
                    let size = (*header).size() as usize;
                    let dest = must_expand((*this).tenured.allocate(size, true))
                        .as_ptr() as *mut Header;
                    (*header).set_dest(dest);
                    trace!(
                        "object {:p} [tenured] moved to {:p} [tenured]",
                        header,
                        dest
                    );
                } else {
                    // A dying mature object releases its claim on young
                    // targets, or minor collections would keep them alive.
                    let vtable = (*header).vtable();
                    (vtable.trace)(Header::payload(header), &mut DecRefVisitor);
                }
            });
        }
    }

    /// # Safety
    ///
    /// `head` must be the large-list sentinel of a live heap.
    unsafe fn large_calculate_target(head: *mut LargeNode) {
        // SAFETY: per the contract
        unsafe {
            each_large_object(head, |header| {
                if (*header).status() == Status::Marked {
                    (*header).set_dest(header);
                } else {
                    let vtable = (*header).vtable();
                    (vtable.trace)(Header::payload(header), &mut DecRefVisitor);
                }
            });
        }
    }

    /// Promote one survivor to the tenured region. From now on the object
    /// counts as a minor-collection root, so its outgoing strong references
    /// are added to the refcounts.
    fn promote_to_tenured(&mut self, header: *mut Header) {
        // SAFETY: header belongs to a marked survivor with intact fields
        unsafe {
            let size = (*header).size() as usize;
            let target = match self
                .tenured
                .allocate(size, false)
                .expect("non-expanding allocation does not reserve")
            {
                Some(target) => target,
                None => {
                    self.full_gc_suggested = true;
                    must_expand(self.tenured.allocate(size, true))
                }
            };
            let dest = target.as_ptr() as *mut Header;
            (*header).set_dest(dest);
            (*header).set_space(Space::Tenured);
            let vtable = (*header).vtable();
            (vtable.trace)(Header::payload(header), &mut IncRefVisitor);
            trace!(
                "object {:p} [survivor] promoted to {:p} [tenured]",
                header,
                dest
            );
        }
    }

    /// # Safety
    ///
    /// Extents must cover objects whose fields are still enumerable.
    unsafe fn notify_weak_space(
        extents: &[(*mut u8, *mut u8)],
        mode: WeakMode,
        scratch: &mut Vec<*mut Value>,
    ) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if mode == WeakMode::Live && (*header).status() != Status::Marked
                {
                    return;
                }
                weak_sweep_object(header, scratch);
            });
        }
    }

    /// # Safety
    ///
    /// `head` must be the large-list sentinel of a live heap.
    unsafe fn notify_weak_large(
        head: *mut LargeNode,
        mode: WeakMode,
        scratch: &mut Vec<*mut Value>,
    ) {
        // SAFETY: per the contract
        unsafe {
            each_large_object(head, |header| {
                if mode == WeakMode::Live && (*header).status() != Status::Marked
                {
                    return;
                }
                weak_sweep_object(header, scratch);
            });
        }
    }

    /// # Safety
    ///
    /// `header` must belong to an object with enumerable fields.
    unsafe fn update_object(header: *mut Header) {
        // SAFETY: per the contract
        unsafe {
            let vtable = (*header).vtable();
            (vtable.trace)(Header::payload(header), &mut UpdateVisitor);
        }
    }

    /// # Safety
    ///
    /// Extents must cover initialized objects.
    unsafe fn update_space_marked(extents: &[(*mut u8, *mut u8)]) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if (*header).status() == Status::Marked {
                    Self::update_object(header);
                }
            });
        }
    }

    /// # Safety
    ///
    /// Extents must cover initialized objects.
    unsafe fn update_tenured_minor(extents: &[(*mut u8, *mut u8)]) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                (*header).set_status(Status::NotMarked);
                Self::update_object(header);
            });
        }
    }

    /// # Safety
    ///
    /// `head` must be the large-list sentinel of a live heap.
    unsafe fn update_large_minor(head: *mut LargeNode) {
        // SAFETY: per the contract
        unsafe {
            each_large_object(head, |header| {
                (*header).set_status(Status::NotMarked);
                Self::update_object(header);
            });
        }
    }

    /// # Safety
    ///
    /// `head` must be the large-list sentinel of a live heap.
    unsafe fn update_large_major(head: *mut LargeNode) {
        // SAFETY: per the contract
        unsafe {
            each_large_object(head, |header| {
                if (*header).status() == Status::Marked {
                    Self::update_object(header);
                }
            });
        }
    }

    /// memcpy relocation for eden and survivor-from: targets never overlap
    /// their origin.
    ///
    /// # Safety
    ///
    /// Forwarding targets must have been reserved and references updated.
    unsafe fn copy_space(extents: &[(*mut u8, *mut u8)]) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if (*header).status() == Status::Marked {
                    (*header).set_status(Status::NotMarked);
                    let size = (*header).size() as usize;
                    let dest = (*header).dest();
                    ptr::copy_nonoverlapping(
                        header as *const u8,
                        dest as *mut u8,
                        size,
                    );
                }
            });
        }
    }

    /// memmove relocation for the compacting tenured walk. Forwarding is
    /// monotone, so lower-address moves never clobber unmoved survivors;
    /// the walker prefetches each size before the move.
    ///
    /// # Safety
    ///
    /// Forwarding targets must have been reserved and references updated.
    unsafe fn move_space(extents: &[(*mut u8, *mut u8)]) {
        // SAFETY: per the contract
        unsafe {
            each_object(extents, |header| {
                if (*header).status() == Status::Marked {
                    (*header).set_status(Status::NotMarked);
                    let size = (*header).size() as usize;
                    let dest = (*header).dest();
                    ptr::copy(header as *const u8, dest as *mut u8, size);
                }
            });
        }
    }

    /// Release unmarked large nodes to the platform and clear the marks of
    /// the survivors.
    fn clean_large(&mut self) {
        let head = &mut *self.large_head as *mut LargeNode;
        // SAFETY: the walker prefetches `next` before a node is freed
        unsafe {
            each_large_object(head, |header| {
                if (*header).status() == Status::Marked {
                    (*header).set_status(Status::NotMarked);
                } else {
                    let node = large_node_of(header);
                    (*(*node).prev).next = (*node).next;
                    (*(*node).next).prev = (*node).prev;
                    let size = LARGE_NODE_SIZE + (*header).size() as usize;
                    system::release(
                        NonNull::new_unchecked(node as *mut u8),
                        size,
                    );
                }
            });
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Run the remaining finalizers before the regions disappear.
        for extents in [
            self.eden.extents(),
            self.survivor_from.extents(),
            self.tenured.extents(),
        ] {
            // SAFETY: extents cover initialized live objects
            unsafe {
                each_object(&extents, |header| {
                    let vtable = (*header).vtable();
                    (vtable.drop)(Header::payload(header));
                });
            }
        }
        let head = &mut *self.large_head as *mut LargeNode;
        // SAFETY: nodes are released right after their finalizer runs
        unsafe {
            each_large_object(head, |header| {
                let vtable = (*header).vtable();
                (vtable.drop)(Header::payload(header));
                let node = large_node_of(header);
                let size = LARGE_NODE_SIZE + (*header).size() as usize;
                system::release(NonNull::new_unchecked(node as *mut u8), size);
            });
        }

        let stack_head = &*self.stack_head as *const Header;
        debug_assert!(
            self.stack_head.stack_next() as *const Header == stack_head,
            "heap dropped while stack objects remain enrolled"
        );
        // Regions and the handle root release their own storage.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackObject;
    use object::{write_barrier, write_weak_barrier};
    use std::{cell::Cell, rc::Rc};

    /// 32-byte payload, 64 bytes with the header.
    struct Probe {
        next: Value,
        weak_peer: Value,
        drops: Option<Rc<Cell<usize>>>,
        tag: u32,
        notified: u32,
    }

    impl HeapObject for Probe {
        fn iterate_fields(&mut self, visitor: &mut dyn FieldVisitor) {
            visitor.visit(&mut self.next);
            visitor.visit_weak(&mut self.weak_peer);
        }

        fn weak_reference_collected(&mut self, slot: *mut Value) {
            assert_eq!(slot, &raw mut self.weak_peer, "callback names the slot");
            self.notified += 1;
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            if let Some(drops) = &self.drops {
                drops.set(drops.get() + 1);
            }
        }
    }

    struct Pod<const N: usize> {
        _bytes: [u8; N],
    }

    impl<const N: usize> HeapObject for Pod<N> {}

    struct Big {
        drops: Rc<Cell<usize>>,
        _payload: [u8; 8192],
    }

    impl HeapObject for Big {}

    impl Drop for Big {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn mk_heap() -> Heap {
        Heap::new().expect("heap")
    }

    fn probe() -> Probe {
        Probe {
            next: Value::null(),
            weak_peer: Value::null(),
            drops: None,
            tag: 0,
            notified: 0,
        }
    }

    fn counted(drops: &Rc<Cell<usize>>) -> Probe {
        Probe {
            drops: Some(drops.clone()),
            ..probe()
        }
    }

    fn tagged_probe(tag: u32) -> Probe {
        Probe {
            next: Value::null(),
            weak_peer: Value::null(),
            drops: None,
            tag,
            notified: 0,
        }
    }

    fn space_of<T>(obj: Tagged<T>) -> Space {
        // SAFETY: test objects stay valid between collection points
        unsafe { (*obj.header_ptr()).space() }
    }

    fn probe_at(value: Value) -> *mut Probe {
        Tagged::<Probe>::from_value(value).as_ptr()
    }

    /// # Safety
    ///
    /// `obj` must be live; no collection may intervene.
    unsafe fn set_next(obj: Tagged<Probe>, value: Value) {
        // SAFETY: per the contract
        unsafe {
            write_barrier(obj.header_ptr(), &raw mut (*obj.as_ptr()).next, value)
        }
    }

    /// # Safety
    ///
    /// `obj` must be live; no collection may intervene.
    unsafe fn set_weak(obj: Tagged<Probe>, value: Value) {
        // SAFETY: per the contract
        unsafe {
            write_weak_barrier(
                obj.header_ptr(),
                &raw mut (*obj.as_ptr()).weak_peer,
                value,
            )
        }
    }

    #[test]
    fn probe_objects_are_64_bytes() {
        assert_eq!(HEADER_SIZE + size_of::<Probe>(), 64);
    }

    #[test]
    fn minor_gc_is_a_noop_on_an_empty_heap() {
        let mut heap = mk_heap();
        heap.minor_gc();
        assert_eq!(heap.eden().used_bytes(), 0);
        assert_eq!(heap.survivor_from().used_bytes(), 0);
        assert_eq!(heap.tenured().used_bytes(), 0);
    }

    /// S1: a rooted eden object survives a minor collection into the
    /// survivor half that served as to-space, aged by one.
    #[test]
    fn rooted_object_moves_to_survivor_space() {
        let mut heap = mk_heap();
        let obj = heap.allocate(tagged_probe(7)).expect("allocate");
        let root = heap.handle(obj);
        assert_eq!(space_of(obj), Space::Eden);

        heap.minor_gc();

        let moved = root.get();
        assert_ne!(moved.header_ptr(), obj.header_ptr());
        assert!(heap.survivor_from().contains(moved.header_ptr() as *const u8));
        assert_eq!(space_of(moved), Space::Survivor);
        // SAFETY: rooted through the handle
        unsafe {
            assert_eq!((*moved.header_ptr()).lifetime(), 1);
            assert_eq!((*moved.as_ptr()).tag, 7, "payload moved intact");
        }
    }

    /// S3: unreferenced objects die in one minor collection, eden resets,
    /// and every destructor runs exactly once.
    #[test]
    fn unreachable_objects_reclaimed_in_one_minor_gc() {
        let drops = Rc::new(Cell::new(0));
        let mut heap = mk_heap();
        for _ in 0..1000 {
            heap.allocate(counted(&drops)).expect("allocate");
        }
        assert!(heap.eden().used_bytes() >= 1000 * 64);

        heap.minor_gc();

        assert_eq!(heap.eden().used_bytes(), 0);
        assert_eq!(heap.survivor_from().used_bytes(), 0);
        assert_eq!(drops.get(), 1000);
    }

    /// S2 plus the boundary: sixteen survivals stay in survivor space, the
    /// seventeenth collection promotes.
    #[test]
    fn object_tenures_after_threshold_survivals() {
        let mut heap = mk_heap();
        let obj = heap.allocate(probe()).expect("allocate");
        let root = heap.handle(obj);

        for _ in 0..16 {
            heap.minor_gc();
        }
        assert_eq!(space_of(root.get()), Space::Survivor);
        // SAFETY: rooted through the handle
        unsafe { assert_eq!((*root.get().header_ptr()).lifetime(), 16) };

        heap.minor_gc();
        assert_eq!(space_of(root.get()), Space::Tenured);
        assert!(heap.tenured().contains(root.get().header_ptr() as *const u8));
    }

    /// Exactly the threshold stays in the nursery path; one more byte takes
    /// the large-object path.
    #[test]
    fn large_object_threshold_boundary() {
        let mut heap = mk_heap();

        // 32-byte header + 4064 bytes = exactly LARGE_OBJECT_THRESHOLD.
        let at = heap.allocate(Pod::<4064> { _bytes: [0; 4064] }).expect("allocate");
        assert_eq!(space_of(at), Space::Eden);
        assert_eq!(heap.large_object_count(), 0);

        let over = heap.allocate(Pod::<4072> { _bytes: [0; 4072] }).expect("allocate");
        assert_eq!(space_of(over), Space::Large);
        assert_eq!(heap.large_object_count(), 1);
    }

    /// S4: an unreferenced large object is unlinked and finalized by a
    /// major collection.
    #[test]
    fn large_object_reclaimed_by_major_gc() {
        let drops = Rc::new(Cell::new(0));
        let mut heap = mk_heap();
        heap.allocate(Big {
            drops: drops.clone(),
            _payload: [0; 8192],
        })
        .expect("allocate");
        assert_eq!(heap.large_object_count(), 1);

        heap.major_gc();

        assert_eq!(heap.large_object_count(), 0);
        assert_eq!(drops.get(), 1);
    }

    /// S5: the weak slot is nulled and the owner notified exactly once.
    #[test]
    fn weak_reference_nulled_and_notified_once() {
        let mut heap = mk_heap();
        let owner = heap.allocate(probe()).expect("allocate");
        let root = heap.handle(owner);
        let referent = heap.allocate(probe()).expect("allocate");
        // SAFETY: both just allocated
        unsafe { set_weak(root.get(), referent.value()) };

        heap.major_gc();

        // SAFETY: rooted through the handle
        unsafe {
            assert!((*root.get().as_ptr()).weak_peer.is_null());
            assert_eq!((*root.get().as_ptr()).notified, 1);
        }

        heap.major_gc();
        // SAFETY: rooted through the handle
        unsafe {
            assert_eq!((*root.get().as_ptr()).notified, 1, "no repeat callback");
        }
    }

    #[test]
    fn weak_reference_nulled_in_minor_collection_too() {
        let mut heap = mk_heap();
        let owner = heap.allocate(probe()).expect("allocate");
        let root = heap.handle(owner);
        let referent = heap.allocate(probe()).expect("allocate");
        // SAFETY: both just allocated
        unsafe { set_weak(root.get(), referent.value()) };

        heap.minor_gc();

        // SAFETY: rooted through the handle
        unsafe {
            assert!((*root.get().as_ptr()).weak_peer.is_null());
            assert_eq!((*root.get().as_ptr()).notified, 1);
        }
    }

    /// A weak slot whose referent stays alive is rewritten to the new
    /// address, with no notification.
    #[test]
    fn live_weak_referent_is_updated_not_nulled() {
        let mut heap = mk_heap();
        let owner = heap.allocate(probe()).expect("allocate");
        let owner_root = heap.handle(owner);
        let referent = heap.allocate(probe()).expect("allocate");
        let referent_root = heap.handle(referent);
        // SAFETY: both just allocated
        unsafe { set_weak(owner_root.get(), referent.value()) };

        heap.minor_gc();

        // SAFETY: rooted through the handles
        unsafe {
            let weak_now = (*owner_root.get().as_ptr()).weak_peer;
            assert_eq!(
                weak_now.raw(),
                referent_root.get().value().raw(),
                "weak slot follows the moved referent"
            );
            assert_eq!((*owner_root.get().as_ptr()).notified, 0);
        }
    }

    /// S6: nursery overflow inside a no-gc scope diverts to survivor space;
    /// nothing is collected until after the scope.
    #[test]
    fn no_gc_scope_diverts_overflow_to_survivor() {
        let drops = Rc::new(Cell::new(0));
        let mut heap = mk_heap();
        let count = 2 * MEMORY_SPACE_SIZE / 64;

        heap.no_gc(|heap| {
            let mut survivor_seen = false;
            for _ in 0..count {
                let obj = heap.allocate(counted(&drops)).expect("allocate");
                if space_of(obj) == Space::Survivor {
                    survivor_seen = true;
                }
            }
            assert!(survivor_seen, "overflow must divert to survivor space");
        });

        assert_eq!(drops.get(), 0, "no collection fired inside the scope");
        assert!(heap.survivor_from().used_bytes() >= MEMORY_SPACE_SIZE);

        heap.minor_gc();
        assert_eq!(drops.get(), count);
        assert_eq!(heap.eden().used_bytes(), 0);
        assert_eq!(heap.survivor_from().used_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "no-gc scope")]
    fn collection_inside_no_gc_scope_panics() {
        let mut heap = mk_heap();
        heap.no_gc(|heap| heap.minor_gc());
    }

    /// The refcount contributed by a tenured owner stands in for scanning
    /// the mature region during minor collections.
    #[test]
    fn tenured_owner_keeps_young_target_alive() {
        let mut heap = mk_heap();
        let owner = heap.allocate(probe()).expect("allocate");
        let root = heap.handle(owner);
        for _ in 0..17 {
            heap.minor_gc();
        }
        assert_eq!(space_of(root.get()), Space::Tenured);

        let child_drops = Rc::new(Cell::new(0));
        let child = heap.allocate(counted(&child_drops)).expect("allocate");
        // SAFETY: owner is rooted, child just allocated
        unsafe { set_next(root.get(), child.value()) };
        // SAFETY: the mature-owner barrier path counted the reference
        unsafe { assert_eq!((*child.header_ptr()).refcount(), 1) };

        heap.minor_gc();
        assert_eq!(child_drops.get(), 0, "the refcount kept the child alive");
        // SAFETY: rooted through the handle
        let child_now = unsafe { (*root.get().as_ptr()).next };
        assert!(child_now.is_object());
        // SAFETY: child_now was just rewritten by the collector
        unsafe {
            assert_eq!((*child_now.header_ptr()).space(), Space::Survivor);
        }

        // Severing the reference lets the next minor collection reclaim it.
        // SAFETY: owner is rooted
        unsafe { set_next(root.get(), Value::null()) };
        heap.minor_gc();
        assert_eq!(child_drops.get(), 1);
    }

    /// After a major collection the tenured bump pointer equals the sum of
    /// the survivors' sizes: compaction leaves no holes.
    #[test]
    fn major_gc_compacts_tenured_space() {
        let mut heap = mk_heap();
        let mut roots = Vec::new();
        for _ in 0..6 {
            let obj = heap.allocate(probe()).expect("allocate");
            roots.push(heap.handle(obj));
        }
        for _ in 0..17 {
            heap.minor_gc();
        }
        for root in &roots {
            assert_eq!(space_of(root.get()), Space::Tenured);
        }
        assert_eq!(heap.tenured().used_bytes(), 6 * 64);

        roots.truncate(3);
        heap.major_gc();

        assert_eq!(heap.tenured().used_bytes(), 3 * 64);
        for root in &roots {
            assert_eq!(space_of(root.get()), Space::Tenured);
            assert!(heap.tenured().contains(root.get().header_ptr() as *const u8));
        }
    }

    /// Cycles wholly inside the mature region defeat the refcounts but not
    /// the tracing major collection.
    #[test]
    fn mature_cycle_collected_by_major_gc() {
        let drops = Rc::new(Cell::new(0));
        let mut heap = mk_heap();
        let a = heap.allocate(counted(&drops)).expect("allocate");
        let root_a = heap.handle(a);
        let b = heap.allocate(counted(&drops)).expect("allocate");
        let root_b = heap.handle(b);
        for _ in 0..17 {
            heap.minor_gc();
        }
        assert_eq!(space_of(root_a.get()), Space::Tenured);

        // SAFETY: both rooted
        unsafe {
            set_next(root_a.get(), root_b.get().value());
            set_next(root_b.get(), root_a.get().value());
        }
        drop(root_a);
        drop(root_b);

        heap.minor_gc();
        assert_eq!(drops.get(), 0, "refcounts alone cannot break the cycle");

        heap.major_gc();
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn stack_object_roots_and_releases_its_targets() {
        let drops = Rc::new(Cell::new(0));
        let mut heap = mk_heap();
        let child = heap.allocate(counted(&drops)).expect("allocate");

        let mut anchor = StackObject::new(probe());
        anchor.enroll(&mut heap);
        assert!(anchor.is_enrolled());
        anchor.write(|probe| &mut probe.next, child.value());
        // SAFETY: the stack-owner barrier path counted the reference
        unsafe { assert_eq!((*child.header_ptr()).refcount(), 1) };

        heap.minor_gc();
        assert_eq!(drops.get(), 0);
        let child_now = anchor.value().next;
        assert!(child_now.is_object());
        // SAFETY: slot was rewritten by the collector
        unsafe {
            assert_eq!((*child_now.header_ptr()).space(), Space::Survivor);
        }

        drop(anchor);
        heap.minor_gc();
        assert_eq!(drops.get(), 1, "unenrolling released the root claim");
    }

    /// A three-object chain keeps its shape and payloads through minor and
    /// major collections.
    #[test]
    fn object_graph_preserved_across_collections() {
        let mut heap = mk_heap();
        let a = heap.allocate(tagged_probe(1)).expect("allocate");
        let root = heap.handle(a);
        let b = heap.allocate(tagged_probe(2)).expect("allocate");
        let c = heap.allocate(tagged_probe(3)).expect("allocate");
        // SAFETY: all three just allocated
        unsafe {
            set_next(a, b.value());
            set_next(b, c.value());
        }

        heap.minor_gc();
        heap.minor_gc();
        heap.major_gc();

        // SAFETY: the chain is rooted through `root`
        unsafe {
            let a_now = root.get();
            assert_eq!((*a_now.as_ptr()).tag, 1);
            let b_now = (*a_now.as_ptr()).next;
            assert!(b_now.is_object());
            assert_eq!((*probe_at(b_now)).tag, 2);
            let c_now = (*probe_at(b_now)).next;
            assert!(c_now.is_object());
            assert_eq!((*probe_at(c_now)).tag, 3);
            assert!((*probe_at(c_now)).next.is_null());
        }
    }

    #[test]
    fn dump_reports_every_space() {
        let mut heap = mk_heap();
        let old = heap.allocate(probe()).expect("allocate");
        let old_root = heap.handle(old);
        for _ in 0..17 {
            heap.minor_gc();
        }
        assert_eq!(space_of(old_root.get()), Space::Tenured);

        let young = heap.allocate(probe()).expect("allocate");
        let _young_root = heap.handle(young);
        heap.allocate(Pod::<4072> { _bytes: [0; 4072] }).expect("allocate");

        let mut seen = Vec::new();
        heap.dump(&mut |header| seen.push(header.space()));
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&Space::Eden));
        assert!(seen.contains(&Space::Tenured));
        assert!(seen.contains(&Space::Large));
    }

    #[test]
    fn heap_teardown_finalizes_whatever_is_left() {
        let drops = Rc::new(Cell::new(0));
        {
            let mut heap = mk_heap();
            heap.allocate(counted(&drops)).expect("allocate");
            let rooted = heap.allocate(counted(&drops)).expect("allocate");
            let _root = heap.handle(rooted);
            heap.allocate(Big {
                drops: drops.clone(),
                _payload: [0; 8192],
            })
            .expect("allocate");
        }
        assert_eq!(drops.get(), 3);
    }

    #[test]
    fn destructor_runs_exactly_once_despite_relocations() {
        let drops = Rc::new(Cell::new(0));
        let mut heap = mk_heap();
        let obj = heap.allocate(counted(&drops)).expect("allocate");
        let root = heap.handle(obj);

        heap.minor_gc();
        heap.minor_gc();
        heap.major_gc();
        assert_eq!(drops.get(), 0);

        drop(root);
        heap.minor_gc();
        assert_eq!(drops.get(), 1);
    }

    /// Identity survives relocation; addresses do not.
    #[test]
    fn identity_hash_is_stable_across_moves() {
        let mut heap = mk_heap();
        let obj = heap.allocate(probe()).expect("allocate");
        let root = heap.handle(obj);
        // SAFETY: just allocated
        let before = unsafe { (*obj.header_ptr()).identity_hash() };

        heap.minor_gc();

        let moved = root.get();
        assert_ne!(moved.header_ptr(), obj.header_ptr());
        // SAFETY: rooted through the handle
        let after = unsafe { (*moved.header_ptr()).identity_hash() };
        assert_eq!(before, after);
    }
}
