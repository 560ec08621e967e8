use core::{
    cell::Cell,
    hash::{Hash, Hasher},
    mem::ManuallyDrop,
    ptr::NonNull,
};

use allocator_api2::alloc::{AllocError, Allocator, Layout};

use crate::{
    addr, align_up,
    block::{self, BlockHdr, BLOCK_HDR_SIZE, BLOCK_SIZE, MAX_ALLOC_SIZE},
    chunk::{self, ChunkHdr, CHUNK_HDR_SIZE, FREE_LINK_SIZE},
    ALIGN,
};

/// Chunk length needed to serve `size` payload bytes.
#[inline(always)]
fn chunk_len_for(size: usize) -> usize {
    align_up(size, ALIGN) + CHUNK_HDR_SIZE
}

/// Payload offset inside a jumbo block whose allocation is aligned to
/// `align`. Leaves room for the block header and one chunk header.
#[inline(always)]
const fn jumbo_data_offset(align: usize) -> usize {
    if align <= ALIGN {
        BLOCK_HDR_SIZE + CHUNK_HDR_SIZE
    } else {
        align_up(BLOCK_HDR_SIZE + CHUNK_HDR_SIZE, align)
    }
}

#[inline(always)]
fn slice_ptr(ptr: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // Safety: `ptr` is non-null.
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) }
}

#[cfg(not(feature = "alloc"))]
macro_rules! wheel_alloc {
    ($(#[$meta:meta])* pub struct $wheel_alloc:ident;) => {
        $(#[$meta])*
        #[repr(transparent)]
        pub struct $wheel_alloc<A: Allocator> {
            inner: NonNull<Pool<A>>,
        }
    };
}

#[cfg(feature = "alloc")]
macro_rules! wheel_alloc {
    ($(#[$meta:meta])* pub struct $wheel_alloc:ident;) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[must_use]
        pub struct $wheel_alloc<A: Allocator = allocator_api2::alloc::Global> {
            inner: NonNull<Pool<A>>,
        }
    };
}

wheel_alloc! {
    /// Single-owner pool allocator for short-living allocations.
    ///
    /// Memory is carved from 8 MiB OS-level blocks. Inside each block the
    /// chunks form an inline doubly-linked chain, and free chunks are kept
    /// on two lists: a master stack of pristine chunks (one per block still
    /// in progress) and a circular recycler fed by [`deallocate`]. After
    /// every allocation the recycler is rotated one step so that its
    /// largest member gravitates to the head, where the next allocation
    /// looks first. Reuse costs no scan.
    ///
    /// [`reset`] releases every live allocation in time proportional to the
    /// number of blocks; [`flush`] returns wholly-unused blocks to the
    /// underlying allocator.
    ///
    /// Handles are cheaply cloneable references to one pool; the pool is
    /// destroyed when the last handle drops. Neither the handles nor the
    /// allocations may leave the thread.
    ///
    /// [`deallocate`]: WheelAlloc::deallocate
    /// [`reset`]: WheelAlloc::reset
    /// [`flush`]: WheelAlloc::flush
    pub struct WheelAlloc;
}

impl<A> Clone for WheelAlloc<A>
where
    A: Allocator,
{
    #[inline(always)]
    fn clone(&self) -> Self {
        Pool::inc_ref(self.inner);
        WheelAlloc { inner: self.inner }
    }

    #[inline(always)]
    fn clone_from(&mut self, source: &Self) {
        if self.inner != source.inner {
            Pool::inc_ref(source.inner);
            Pool::dec_ref(self.inner);
            self.inner = source.inner;
        }
    }
}

impl<A> PartialEq for WheelAlloc<A>
where
    A: Allocator,
{
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<A> Hash for WheelAlloc<A>
where
    A: Allocator,
{
    #[inline(always)]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl<A> Drop for WheelAlloc<A>
where
    A: Allocator,
{
    #[inline(always)]
    fn drop(&mut self) {
        Pool::dec_ref(self.inner);
    }
}

struct Pool<A: Allocator> {
    /// Head of the doubly-linked list of OS-level blocks.
    blocks: Cell<Option<NonNull<BlockHdr>>>,

    /// Top of the master stack: pristine chunks, one per block whose tail
    /// has not been consumed yet. Always large enough for any non-jumbo
    /// request.
    master: Cell<Option<NonNull<ChunkHdr>>>,

    /// Named head of the circular recycler of chunks freed by the user or
    /// evicted from the master.
    recycler: Cell<Option<NonNull<ChunkHdr>>>,

    allocator: ManuallyDrop<A>,
    ref_cnt: Cell<usize>,
}

impl<A> Pool<A>
where
    A: Allocator,
{
    #[inline(always)]
    fn try_new_in(allocator: A) -> Result<NonNull<Self>, AllocError> {
        let ptr = allocator.allocate(Layout::new::<Self>())?;
        let inner = Pool {
            blocks: Cell::new(None),
            master: Cell::new(None),
            recycler: Cell::new(None),
            allocator: ManuallyDrop::new(allocator),
            ref_cnt: Cell::new(1),
        };

        let ptr = ptr.cast::<Self>();

        // Safety: `ptr` is valid pointer to `Self` allocated by `allocator`.
        unsafe {
            core::ptr::write(ptr.as_ptr(), inner);
        }

        Ok(ptr)
    }

    #[inline(always)]
    #[cfg(not(no_global_oom_handling))]
    fn new_in(allocator: A) -> NonNull<Self> {
        match Self::try_new_in(allocator) {
            Ok(ptr) => ptr,
            #[cfg(feature = "alloc")]
            Err(AllocError) => {
                alloc::alloc::handle_alloc_error(Layout::new::<Self>());
            }
            #[cfg(not(feature = "alloc"))]
            Err(AllocError) => {
                core::panic!("Failed to allocate Pool");
            }
        }
    }

    fn inc_ref(ptr: NonNull<Self>) {
        // Safety: `ptr` is valid pointer to `Self`.
        let me = unsafe { ptr.as_ref() };
        me.ref_cnt.set(me.ref_cnt.get() + 1);
    }

    fn dec_ref(ptr: NonNull<Self>) {
        // Safety: `ptr` is valid pointer to `Self`.
        let me = unsafe { ptr.as_ref() };

        debug_assert_ne!(me.ref_cnt.get(), 0);
        let new_ref_cnt = me.ref_cnt.get() - 1;
        me.ref_cnt.set(new_ref_cnt);

        if new_ref_cnt == 0 {
            Self::free(ptr);
        }
    }

    #[cold]
    fn free(ptr: NonNull<Self>) {
        // Safety: `ptr` is valid pointer to `Self`.
        let me = unsafe { ptr.as_ref() };

        // Dropping the last handle invalidates every outstanding pointer.
        me.reset();
        me.flush();
        debug_assert!(me.blocks.get().is_none());

        // Safety: taking allocator out of `ManuallyDrop`.
        // The value is dropped immediately after.
        let allocator = unsafe { core::ptr::read(&*me.allocator) };

        // Safety: `ptr` was allocated by `me.allocator`.
        unsafe {
            allocator.deallocate(ptr.cast(), Layout::new::<Self>());
        }
    }

    // ---- block list ----

    fn block_list_push(&self, b: NonNull<BlockHdr>) {
        let bh = unsafe { b.as_ref() };
        bh.prev.set(None);
        bh.next.set(self.blocks.get());
        if let Some(old) = self.blocks.get() {
            unsafe { old.as_ref() }.prev.set(Some(b));
        }
        self.blocks.set(Some(b));
    }

    fn block_list_remove(&self, b: NonNull<BlockHdr>) {
        let bh = unsafe { b.as_ref() };
        let (prev, next) = (bh.prev.get(), bh.next.get());
        match prev {
            Some(p) => unsafe { p.as_ref() }.next.set(next),
            None => self.blocks.set(next),
        }
        if let Some(n) = next {
            unsafe { n.as_ref() }.prev.set(prev);
        }
    }

    /// Restores a normal block to a single pristine chunk on the master.
    ///
    /// # Safety
    ///
    /// `b` must be a live normal block none of whose chunks are referenced
    /// anywhere (free lists included).
    unsafe fn init_block(&self, b: NonNull<BlockHdr>) -> NonNull<ChunkHdr> {
        let c = unsafe { block::first_chunk(b) };
        // Safety: the chunk area starts after the block header and covers
        // the rest of the block.
        unsafe {
            c.as_ptr().write(ChunkHdr::new(BLOCK_SIZE - BLOCK_HDR_SIZE, 0));
            c.as_ref().set_last(true);
        }
        self.master_push(c);
        c
    }

    #[cold]
    fn new_block(&self) -> Result<NonNull<ChunkHdr>, AllocError> {
        let b = block::new_block(&*self.allocator, BLOCK_SIZE, ALIGN)?;
        self.block_list_push(b);
        // Safety: the block is fresh; nothing references it yet.
        Ok(unsafe { self.init_block(b) })
    }

    // ---- master stack ----

    fn master_push(&self, c: NonNull<ChunkHdr>) {
        // Safety: `c` is a pristine free chunk, easily large enough to track.
        let link = unsafe { chunk::free_link(c) };
        link.prev.set(None);
        link.next.set(self.master.get());
        if let Some(old) = self.master.get() {
            unsafe { chunk::free_link(old) }.prev.set(Some(c));
        }
        self.master.set(Some(c));
    }

    fn master_unlink(&self, c: NonNull<ChunkHdr>) {
        // Safety: `c` is a master member, so it is free and trackable.
        let link = unsafe { chunk::free_link(c) };
        let (prev, next) = (link.prev.get(), link.next.get());
        match prev {
            Some(p) => unsafe { chunk::free_link(p) }.next.set(next),
            None => {
                debug_assert_eq!(self.master.get(), Some(c));
                self.master.set(next);
            }
        }
        if let Some(n) = next {
            unsafe { chunk::free_link(n) }.prev.set(prev);
        }
    }

    fn master_contains(&self, c: NonNull<ChunkHdr>) -> bool {
        // The master holds at most one chunk per pristine block, so this
        // walk is short.
        let mut cur = self.master.get();
        while let Some(m) = cur {
            if m == c {
                return true;
            }
            cur = unsafe { chunk::free_link(m) }.next.get();
        }
        false
    }

    // ---- recycler ring ----

    /// Splices `c` in counter-clockwise of `head` without moving the head.
    ///
    /// # Safety
    ///
    /// `head` must be a recycler member; `c` must be free, trackable and in
    /// no list.
    unsafe fn ring_insert_before(&self, head: NonNull<ChunkHdr>, c: NonNull<ChunkHdr>) {
        let head_link = unsafe { chunk::free_link(head) };
        let tail = head_link.prev.get().unwrap();
        let link = unsafe { chunk::free_link(c) };
        unsafe { chunk::free_link(tail) }.next.set(Some(c));
        link.prev.set(Some(tail));
        link.next.set(Some(head));
        head_link.prev.set(Some(c));
    }

    fn recycler_add(&self, c: NonNull<ChunkHdr>) {
        match self.recycler.get() {
            None => {
                // Safety: `c` is free and trackable per this list's contract.
                let link = unsafe { chunk::free_link(c) };
                link.prev.set(Some(c));
                link.next.set(Some(c));
                self.recycler.set(Some(c));
            }
            Some(head) => {
                // Safety: `head` is a ring member, `c` is unlisted.
                unsafe { self.ring_insert_before(head, c) };
                // A bigger entrant takes over as head right away.
                if unsafe { c.as_ref().len() > head.as_ref().len() } {
                    self.recycler.set(Some(c));
                }
            }
        }
    }

    fn recycler_remove(&self, c: NonNull<ChunkHdr>) {
        // Safety: `c` is a ring member, so its linkage is set.
        let link = unsafe { chunk::free_link(c) };
        let next = link.next.get().unwrap();
        if next == c {
            debug_assert_eq!(self.recycler.get(), Some(c));
            self.recycler.set(None);
        } else {
            let prev = link.prev.get().unwrap();
            unsafe { chunk::free_link(prev) }.next.set(Some(next));
            unsafe { chunk::free_link(next) }.prev.set(Some(prev));
            if self.recycler.get() == Some(c) {
                self.recycler.set(Some(next));
            }
        }
    }

    /// One step of the wheel of fortune.
    ///
    /// Compares the head with its clockwise neighbor: a smaller neighbor is
    /// tucked in behind the held head (the rest of the ring advancing one
    /// step past it), a larger-or-equal one simply becomes the head. Once
    /// the strictly-largest chunk reaches the head it stays there, so a
    /// rotation per allocation keeps the best candidate in front without
    /// ever scanning the ring.
    fn cycle_recycler(&self) {
        let head = match self.recycler.get() {
            Some(head) => head,
            None => return,
        };
        // Safety: ring members always carry linkage.
        let next = unsafe { chunk::free_link(head) }.next.get().unwrap();
        if next == head {
            return;
        }
        let larger = unsafe { next.as_ref().len() >= head.as_ref().len() };
        if larger {
            self.recycler.set(Some(next));
        } else {
            self.recycler_remove(next);
            // Safety: `next` was just unlinked, the head is still a member.
            unsafe { self.ring_insert_before(head, next) };
        }
    }

    // ---- split and merge ----

    /// Detaches `size` payload bytes from free chunk `c`.
    ///
    /// On return `c` belongs to no free list and is exactly sized; the
    /// remainder, when big enough to track, occupies `c`'s former list
    /// slot. The caller marks `c` used.
    ///
    /// # Safety
    ///
    /// `c` must be a live free chunk with `len >= chunk_len_for(size)`,
    /// either on one of the free lists or (if untrackable) on none.
    unsafe fn split_free(&self, c: NonNull<ChunkHdr>, size: usize) {
        let want = chunk_len_for(size);
        let hdr = unsafe { c.as_ref() };
        let len = hdr.len();
        debug_assert!(!hdr.used());
        debug_assert!(len >= want);

        let in_master = self.master.get() == Some(c);

        if len < want + CHUNK_HDR_SIZE + FREE_LINK_SIZE {
            // The remainder could not be tracked: hand over the whole chunk.
            if hdr.is_trackable() {
                if in_master {
                    self.master_unlink(c);
                } else {
                    self.recycler_remove(c);
                }
            }
            return;
        }

        // The remainder's header may land on `c`'s linkage bytes, so the
        // linkage is read out before anything is written past `want`.
        let (old_prev, old_next) = {
            let link = unsafe { chunk::free_link(c) };
            (link.prev.get(), link.next.get())
        };
        let was_last = hdr.last();

        hdr.set_len(want);
        hdr.set_last(false);

        let extra = unsafe {
            NonNull::new_unchecked(c.as_ptr().cast::<u8>().add(want).cast::<ChunkHdr>())
        };
        // Safety: the remainder holds at least a header plus linkage.
        unsafe {
            extra.as_ptr().write(ChunkHdr::new(len - want, want));
            extra.as_ref().set_last(was_last);
        }

        // The remainder takes over `c`'s place in whatever list held it.
        let extra_link = unsafe { chunk::free_link(extra) };
        if in_master {
            extra_link.prev.set(None);
            extra_link.next.set(old_next);
            if let Some(next) = old_next {
                unsafe { chunk::free_link(next) }.prev.set(Some(extra));
            }
            self.master.set(Some(extra));
        } else if old_next == Some(c) {
            // `c` was the only recycled chunk.
            extra_link.prev.set(Some(extra));
            extra_link.next.set(Some(extra));
            self.recycler.set(Some(extra));
        } else {
            let prev = old_prev.unwrap();
            let next = old_next.unwrap();
            extra_link.prev.set(Some(prev));
            extra_link.next.set(Some(next));
            unsafe { chunk::free_link(prev) }.next.set(Some(extra));
            unsafe { chunk::free_link(next) }.prev.set(Some(extra));
            if self.recycler.get() == Some(c) {
                self.recycler.set(Some(extra));
            }
        }

        if !was_last {
            // Safety: not last, so a chunk follows the remainder.
            unsafe { chunk::next_in_block(extra).unwrap().as_ref() }.set_prev_len(len - want);
        }
    }

    /// Carves the tail off a used chunk being shrunk and recirculates it.
    ///
    /// # Safety
    ///
    /// `c` must be a live used chunk with payload at least `size`.
    unsafe fn split_used(&self, c: NonNull<ChunkHdr>, size: usize) {
        let want = chunk_len_for(size);
        let hdr = unsafe { c.as_ref() };
        let len = hdr.len();
        debug_assert!(hdr.used());

        if len < want + CHUNK_HDR_SIZE {
            // Not even a bare header's worth to give back.
            return;
        }

        let was_last = hdr.last();
        hdr.set_len(want);
        hdr.set_last(false);

        let extra = unsafe {
            NonNull::new_unchecked(c.as_ptr().cast::<u8>().add(want).cast::<ChunkHdr>())
        };
        // Safety: the remainder holds at least its own header; merge_free
        // fixes up the neighbor linkage.
        unsafe {
            extra.as_ptr().write(ChunkHdr::new(len - want, want));
            extra.as_ref().set_last(was_last);
            self.merge_free(extra);
        }
    }

    /// Coalesces free chunk `c` with free neighbors and settles the result
    /// on the right free list.
    ///
    /// # Safety
    ///
    /// `c` must be a live free non-jumbo chunk that is on no free list.
    unsafe fn merge_free(&self, c: NonNull<ChunkHdr>) {
        let mut merged = c;

        // Absorb the right neighbor. Only header lengths change here; the
        // neighbor's linkage bytes stay readable inside the grown payload
        // until the list fixups below are done with them.
        let mut right: Option<NonNull<ChunkHdr>> = None;
        let mut right_trackable = false;
        let mut right_was_master = false;
        if let Some(r) = unsafe { chunk::next_in_block(merged) } {
            let rh = unsafe { r.as_ref() };
            if !rh.used() {
                right_trackable = rh.is_trackable();
                right_was_master = self.master.get() == Some(r);
                // Untrackable chunks are in no list, the master included.
                debug_assert!(right_trackable || !right_was_master);
                let ch = unsafe { merged.as_ref() };
                ch.set_len(ch.len() + rh.len());
                ch.set_last(rh.last());
                right = Some(r);
            }
        }

        // Absorb into the left neighbor, which then stands for the merge.
        let mut left_trackable = false;
        if let Some(l) = unsafe { chunk::prev_in_block(merged) } {
            let lh = unsafe { l.as_ref() };
            if !lh.used() {
                // Master chunks are block tails; a left neighbor is never one.
                debug_assert_ne!(self.master.get(), Some(l));
                left_trackable = lh.is_trackable();
                let ch = unsafe { merged.as_ref() };
                lh.set_len(lh.len() + ch.len());
                lh.set_last(ch.last());
                merged = l;
            }
        }

        let hdr = unsafe { merged.as_ref() };
        if !hdr.last() {
            // Safety: not last, so a chunk follows the merge.
            unsafe { chunk::next_in_block(merged).unwrap().as_ref() }.set_prev_len(hdr.len());
        }

        match right {
            Some(r) if right_trackable && right_was_master => {
                // The master head was pulled in; the merged chunk inherits
                // its place at the top of the stack.
                if left_trackable {
                    // The merged chunk still wears the left neighbor's ring
                    // linkage; detach it before overwriting.
                    self.recycler_remove(merged);
                }
                let next = unsafe { chunk::free_link(r) }.next.get();
                let link = unsafe { chunk::free_link(merged) };
                link.prev.set(None);
                link.next.set(next);
                if let Some(next) = next {
                    unsafe { chunk::free_link(next) }.prev.set(Some(merged));
                }
                self.master.set(Some(merged));
            }
            _ => {
                if let Some(r) = right {
                    if right_trackable {
                        self.recycler_remove(r);
                    }
                }
                if left_trackable {
                    // The merged chunk already sits in the left neighbor's
                    // ring slot.
                } else if hdr.is_trackable() {
                    self.recycler_add(merged);
                }
            }
        }
    }

    // ---- user operations ----

    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ALIGN || layout.size() > MAX_ALLOC_SIZE {
            return self.alloc_jumbo(layout);
        }
        let size = layout.size();

        // The recycler head serves if it can; the wheel has been nudging
        // the largest recycled chunk toward it all along.
        let recycled = match self.recycler.get() {
            Some(head) if unsafe { head.as_ref().payload() } >= size => Some(head),
            _ => None,
        };
        let candidate = match recycled {
            Some(head) => head,
            None => {
                // An exhausted master head still has a reusable tail; demote
                // it to the recycler rather than discarding it.
                if let Some(m) = self.master.get() {
                    if unsafe { m.as_ref().payload() } < size {
                        self.master_unlink(m);
                        self.recycler_add(m);
                    }
                }
                match self.master.get() {
                    Some(m) => m,
                    None => self.new_block()?,
                }
            }
        };

        // Safety: the candidate came off a free list and fits `size`.
        unsafe {
            self.split_free(candidate, size);
        }
        self.cycle_recycler();

        let hdr = unsafe { candidate.as_ref() };
        debug_assert!(hdr.payload() >= size);
        hdr.set_used(true);

        let data = unsafe { chunk::data(candidate) };
        debug_assert_eq!(addr(data.as_ptr()) % ALIGN, 0);
        Ok(slice_ptr(data, layout.size()))
    }

    /// # Safety
    ///
    /// `ptr` must be currently allocated by this pool.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: `ptr` came out of `allocate`, so a chunk header precedes it.
        let c = unsafe { chunk::from_data(ptr) };
        let hdr = unsafe { c.as_ref() };
        if hdr.jumbo() {
            // Safety: jumbo chunks know their block.
            unsafe { self.free_jumbo(c) };
            return;
        }
        debug_assert!(hdr.used());
        debug_assert!(layout.size() <= hdr.payload());
        hdr.set_used(false);
        // Safety: `c` is now free and in no list.
        unsafe { self.merge_free(c) };
    }

    /// # Safety
    ///
    /// `ptr` must be currently allocated by this pool with a layout fitting
    /// `old_layout`; `new_layout.size() >= old_layout.size()`.
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let c = unsafe { chunk::from_data(ptr) };
        let hdr = unsafe { c.as_ref() };
        let size = new_layout.size();

        if hdr.jumbo() {
            let stored_align = unsafe { Self::jumbo_block(c).as_ref() }.align();
            if new_layout.align() > stored_align {
                return unsafe { self.relocate(ptr, old_layout.size(), new_layout) };
            }
            return unsafe { self.realloc_jumbo(c, size) };
        }

        debug_assert!(hdr.used());
        if new_layout.align() > ALIGN || size > MAX_ALLOC_SIZE {
            return unsafe { self.relocate(ptr, old_layout.size(), new_layout) };
        }

        let cur = hdr.payload();
        if size <= cur {
            // Alignment slack already covers the growth.
            return Ok(slice_ptr(ptr, size));
        }

        // Grow in place by absorbing a free right-hand neighbor, carving
        // off just enough of it and leaving the rest recirculated.
        if let Some(r) = unsafe { chunk::next_in_block(c) } {
            let rh = unsafe { r.as_ref() };
            if !rh.used() && cur + rh.len() >= size {
                let need = (size - cur).saturating_sub(CHUNK_HDR_SIZE);
                // Safety: `r` is free and large enough for `need`.
                unsafe {
                    self.split_free(r, need);
                }
                hdr.set_len(hdr.len() + rh.len());
                hdr.set_last(rh.last());
                if !hdr.last() {
                    // Safety: not last, so a chunk follows the absorbed one.
                    unsafe { chunk::next_in_block(c).unwrap().as_ref() }
                        .set_prev_len(hdr.len());
                }
                debug_assert!(hdr.payload() >= size);
                return Ok(slice_ptr(ptr, size));
            }
        }

        unsafe { self.relocate(ptr, old_layout.size(), new_layout) }
    }

    /// # Safety
    ///
    /// `ptr` must be currently allocated by this pool with a layout fitting
    /// `old_layout`; `new_layout.size() <= old_layout.size()`.
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let _ = old_layout;
        let c = unsafe { chunk::from_data(ptr) };
        let hdr = unsafe { c.as_ref() };
        let size = new_layout.size();

        if hdr.jumbo() {
            let stored_align = unsafe { Self::jumbo_block(c).as_ref() }.align();
            if new_layout.align() > stored_align {
                return unsafe { self.relocate(ptr, size, new_layout) };
            }
            // A jumbo stays jumbo; the OS allocation is trimmed instead.
            return unsafe { self.realloc_jumbo(c, size) };
        }

        debug_assert!(hdr.used());
        if new_layout.align() > ALIGN {
            return unsafe { self.relocate(ptr, size, new_layout) };
        }

        if size < hdr.payload() {
            // Safety: `c` is used and keeps at least `size` payload bytes.
            unsafe {
                self.split_used(c, size);
            }
        }
        Ok(slice_ptr(ptr, size))
    }

    /// Move fallback for reallocation: fresh chunk, copy, release.
    ///
    /// # Safety
    ///
    /// `ptr` must be currently allocated by this pool with at least `copy`
    /// valid payload bytes, and `copy <= new_layout.size()`.
    unsafe fn relocate(
        &self,
        ptr: NonNull<u8>,
        copy: usize,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let new_ptr = self.allocate(new_layout)?;
        // Safety: both regions are live and distinct; `copy` fits each.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.cast::<u8>().as_ptr(), copy);
            self.deallocate(ptr, Layout::from_size_align_unchecked(copy, 1));
        }
        Ok(new_ptr)
    }

    // ---- jumbo blocks ----

    /// # Safety
    ///
    /// `c` must be the chunk of a live jumbo block.
    unsafe fn jumbo_block(c: NonNull<ChunkHdr>) -> NonNull<BlockHdr> {
        debug_assert!(unsafe { c.as_ref() }.jumbo());
        let off = unsafe { c.as_ref() }.prev_len();
        // Safety: a jumbo chunk's `prev_len` is its offset from the block base.
        unsafe { NonNull::new_unchecked(c.as_ptr().cast::<u8>().sub(off).cast()) }
    }

    /// Serves a request too big (or too aligned) for a normal block from a
    /// dedicated block holding a single used chunk.
    #[cold]
    fn alloc_jumbo(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let align = if layout.align() > ALIGN {
            layout.align()
        } else {
            ALIGN
        };
        let data_off = jumbo_data_offset(align);
        let total = data_off.checked_add(layout.size()).ok_or(AllocError)?;

        let b = block::new_block(&*self.allocator, total, align)?;
        self.block_list_push(b);

        // Safety: `data_off` leaves room for the block header and one chunk
        // header below the payload.
        let c = unsafe {
            NonNull::new_unchecked(
                b.as_ptr()
                    .cast::<u8>()
                    .add(data_off - CHUNK_HDR_SIZE)
                    .cast::<ChunkHdr>(),
            )
        };
        unsafe {
            c.as_ptr().write(ChunkHdr::new_jumbo(data_off - CHUNK_HDR_SIZE));
        }

        let data = unsafe { chunk::data(c) };
        debug_assert_eq!(addr(data.as_ptr()) % align, 0);
        Ok(slice_ptr(data, layout.size()))
    }

    /// # Safety
    ///
    /// `c` must be the chunk of a live jumbo block of this pool.
    #[cold]
    unsafe fn free_jumbo(&self, c: NonNull<ChunkHdr>) {
        let b = unsafe { Self::jumbo_block(c) };
        self.block_list_remove(b);
        // Safety: the block is unlinked; its only chunk is `c`.
        unsafe { block::free_block(&*self.allocator, b) };
    }

    /// Resizes a jumbo block through the underlying allocator, which may
    /// move it, and re-points the block list at the new location.
    ///
    /// # Safety
    ///
    /// `c` must be the chunk of a live jumbo block of this pool.
    #[cold]
    unsafe fn realloc_jumbo(
        &self,
        c: NonNull<ChunkHdr>,
        new_size: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let b = unsafe { Self::jumbo_block(c) };
        let bh = unsafe { b.as_ref() };
        let align = bh.align();
        let data_off = jumbo_data_offset(align);
        let new_total = data_off.checked_add(new_size).ok_or(AllocError)?;
        let old_total = bh.size();

        if new_total == old_total {
            return Ok(slice_ptr(unsafe { chunk::data(c) }, new_size));
        }

        let old_layout = bh.layout();
        let new_layout = Layout::from_size_align(new_total, align).map_err(|_| AllocError)?;
        let (prev, next) = (bh.prev.get(), bh.next.get());

        // Safety: the block was allocated with `old_layout`; on success the
        // contents (headers included) travel to the new location.
        let moved = unsafe {
            if new_total > old_total {
                self.allocator.grow(b.cast(), old_layout, new_layout)?
            } else {
                self.allocator.shrink(b.cast(), old_layout, new_layout)?
            }
        };

        let nb = moved.cast::<BlockHdr>();
        let nbh = unsafe { nb.as_ref() };
        nbh.set_size(new_total);

        // The block may have moved; its own links are still right, but the
        // neighbors (or the list head) must be re-pointed.
        match prev {
            Some(p) => unsafe { p.as_ref() }.next.set(Some(nb)),
            None => self.blocks.set(Some(nb)),
        }
        if let Some(n) = next {
            unsafe { n.as_ref() }.prev.set(Some(nb));
        }

        let nc = unsafe {
            NonNull::new_unchecked(
                nb.as_ptr()
                    .cast::<u8>()
                    .add(data_off - CHUNK_HDR_SIZE)
                    .cast::<ChunkHdr>(),
            )
        };
        Ok(slice_ptr(unsafe { chunk::data(nc) }, new_size))
    }

    // ---- bulk operations ----

    /// Releases every live allocation at once: jumbo blocks go back to the
    /// underlying allocator, normal blocks are re-pristined for reuse. Cost
    /// is linear in blocks, not in allocations.
    fn reset(&self) {
        self.master.set(None);
        self.recycler.set(None);

        let mut cur = self.blocks.get();
        while let Some(b) = cur {
            let bh = unsafe { b.as_ref() };
            cur = bh.next.get();
            if bh.is_jumbo() {
                self.block_list_remove(b);
                // Safety: jumbo blocks die with their single allocation.
                unsafe { block::free_block(&*self.allocator, b) };
            } else {
                // Safety: no chunk reference survives the list clearing above.
                unsafe {
                    self.init_block(b);
                }
            }
        }
    }

    /// Returns wholly-unused normal blocks to the underlying allocator.
    /// Live allocations are untouched.
    fn flush(&self) {
        let mut cur = self.blocks.get();
        while let Some(b) = cur {
            let bh = unsafe { b.as_ref() };
            cur = bh.next.get();
            if bh.is_jumbo() {
                continue;
            }
            // Safety: normal blocks always have a first chunk.
            let c = unsafe { block::first_chunk(b) };
            let hdr = unsafe { c.as_ref() };
            if !hdr.used() && hdr.last() {
                // A single free chunk covering the block: nothing lives here.
                if self.master_contains(c) {
                    self.master_unlink(c);
                } else {
                    self.recycler_remove(c);
                }
                self.block_list_remove(b);
                // Safety: the block is unlinked and owns no live chunk.
                unsafe { block::free_block(&*self.allocator, b) };
            }
        }
    }
}

#[cfg(not(no_global_oom_handling))]
#[cfg(feature = "alloc")]
impl WheelAlloc {
    /// Returns new [`WheelAlloc`] that uses [`Global`] allocator.
    ///
    /// [`Global`]: allocator_api2::alloc::Global
    #[inline(always)]
    pub fn new() -> Self {
        WheelAlloc {
            inner: Pool::new_in(allocator_api2::alloc::Global),
        }
    }
}

#[cfg(not(no_global_oom_handling))]
impl<A> Default for WheelAlloc<A>
where
    A: Allocator + Default,
{
    #[inline(always)]
    fn default() -> Self {
        WheelAlloc::new_in(A::default())
    }
}

impl<A> WheelAlloc<A>
where
    A: Allocator,
{
    /// Returns new [`WheelAlloc`] that obtains its blocks from `allocator`.
    #[cfg(not(no_global_oom_handling))]
    #[inline(always)]
    pub fn new_in(allocator: A) -> Self {
        WheelAlloc {
            inner: Pool::new_in(allocator),
        }
    }

    /// Attempts to create new [`WheelAlloc`] that obtains its blocks from
    /// `allocator`.
    #[inline(always)]
    pub fn try_new_in(allocator: A) -> Result<Self, AllocError> {
        Ok(WheelAlloc {
            inner: Pool::try_new_in(allocator)?,
        })
    }

    /// Attempts to allocate a block of memory from this pool.
    /// Returns a pointer to the beginning of the block if successful.
    ///
    /// The pointer is aligned to [`ALIGN`] at least; requests with larger
    /// alignment or larger than a block's capacity get a dedicated block.
    ///
    /// [`ALIGN`]: crate::ALIGN
    #[inline(always)]
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        // Safety: `self.inner` is valid pointer to `Pool`.
        let inner = unsafe { self.inner.as_ref() };
        inner.allocate(layout)
    }

    /// Deallocates the memory referenced by `ptr`. The chunk header is
    /// authoritative for the size; `layout` is only sanity-checked.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via [`WheelAlloc::allocate`], and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/std/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/std/alloc/trait.Allocator.html#memory-fitting
    #[inline(always)]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: `self.inner` is valid pointer to `Pool`.
        let inner = unsafe { self.inner.as_ref() };
        // Safety: covered by this method's contract.
        unsafe { inner.deallocate(ptr, layout) }
    }

    /// Grows the allocation referenced by `ptr` to `new_layout`.
    ///
    /// Growth is in place whenever the chunk's free right-hand neighbor can
    /// cover it; otherwise the allocation moves.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via [`WheelAlloc::allocate`],
    /// * `old_layout` must [*fit*] that block of memory, and
    /// * `new_layout.size()` must be greater than or equal to `old_layout.size()`.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/std/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/std/alloc/trait.Allocator.html#memory-fitting
    #[inline(always)]
    pub unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        // Safety: `self.inner` is valid pointer to `Pool`.
        let inner = unsafe { self.inner.as_ref() };
        // Safety: covered by this method's contract.
        unsafe { inner.grow(ptr, old_layout, new_layout) }
    }

    /// Shrinks the allocation referenced by `ptr` to `new_layout`, giving
    /// the tail back to the pool in place.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via [`WheelAlloc::allocate`],
    /// * `old_layout` must [*fit*] that block of memory, and
    /// * `new_layout.size()` must be smaller than or equal to `old_layout.size()`.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/std/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/std/alloc/trait.Allocator.html#memory-fitting
    #[inline(always)]
    pub unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        // Safety: `self.inner` is valid pointer to `Pool`.
        let inner = unsafe { self.inner.as_ref() };
        // Safety: covered by this method's contract.
        unsafe { inner.shrink(ptr, old_layout, new_layout) }
    }

    /// Releases every live allocation at once.
    ///
    /// Jumbo blocks go back to the underlying allocator; normal blocks are
    /// kept and re-pristined, so the pool is immediately warm for the next
    /// round. Runs in time linear in the number of blocks, however many
    /// allocations were made.
    ///
    /// # Safety
    ///
    /// No pointer previously returned by this pool may be used afterwards.
    pub unsafe fn reset(&self) {
        // Safety: `self.inner` is valid pointer to `Pool`.
        let inner = unsafe { self.inner.as_ref() };
        inner.reset();
    }

    /// Returns wholly-unused blocks back to the underlying allocator.
    ///
    /// Outstanding allocations remain valid; only blocks no allocation
    /// lives in are released. Call after [`reset`] to drop the pool's
    /// entire footprint, or any time memory usage has gone down for good.
    ///
    /// [`reset`]: WheelAlloc::reset
    pub fn flush(&self) {
        // Safety: `self.inner` is valid pointer to `Pool`.
        let inner = unsafe { self.inner.as_ref() };
        inner.flush();
    }
}

unsafe impl<A> Allocator for WheelAlloc<A>
where
    A: Allocator,
{
    #[inline(always)]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(layout)
    }

    #[inline(always)]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: covered by `Allocator::deallocate` contract.
        unsafe { self.deallocate(ptr, layout) }
    }

    #[inline(always)]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // Safety: covered by `Allocator::grow` contract.
        unsafe { self.grow(ptr, old_layout, new_layout) }
    }

    #[inline(always)]
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // Safety: covered by `Allocator::grow_zeroed` contract.
        let new_ptr = unsafe { self.grow(ptr, old_layout, new_layout)? };
        // Zero the extension; the prefix is preserved by `grow`.
        unsafe {
            let base = new_ptr.cast::<u8>().as_ptr();
            core::ptr::write_bytes(
                base.add(old_layout.size()),
                0,
                new_layout.size() - old_layout.size(),
            );
        }
        Ok(new_ptr)
    }

    #[inline(always)]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // Safety: covered by `Allocator::shrink` contract.
        unsafe { self.shrink(ptr, old_layout, new_layout) }
    }
}

#[cfg(test)]
impl<A> WheelAlloc<A>
where
    A: Allocator,
{
    pub(crate) fn block_count(&self) -> usize {
        let inner = unsafe { self.inner.as_ref() };
        let mut n = 0;
        let mut cur = inner.blocks.get();
        while let Some(b) = cur {
            n += 1;
            cur = unsafe { b.as_ref() }.next.get();
        }
        n
    }

    pub(crate) fn master_count(&self) -> usize {
        let inner = unsafe { self.inner.as_ref() };
        let mut n = 0;
        let mut cur = inner.master.get();
        while let Some(c) = cur {
            n += 1;
            cur = unsafe { chunk::free_link(c) }.next.get();
        }
        n
    }

    pub(crate) fn recycler_count(&self) -> usize {
        let inner = unsafe { self.inner.as_ref() };
        let head = match inner.recycler.get() {
            Some(head) => head,
            None => return 0,
        };
        let mut n = 0;
        let mut cur = head;
        loop {
            n += 1;
            cur = unsafe { chunk::free_link(cur) }.next.get().unwrap();
            if cur == head {
                return n;
            }
        }
    }

    pub(crate) fn recycler_head_payload(&self) -> Option<usize> {
        let inner = unsafe { self.inner.as_ref() };
        inner
            .recycler
            .get()
            .map(|head| unsafe { head.as_ref() }.payload())
    }

    pub(crate) fn master_head_payload(&self) -> Option<usize> {
        let inner = unsafe { self.inner.as_ref() };
        inner
            .master
            .get()
            .map(|head| unsafe { head.as_ref() }.payload())
    }

    pub(crate) fn cycle_once(&self) {
        unsafe { self.inner.as_ref() }.cycle_recycler();
    }

    /// Walks every structure and asserts the pool's invariants.
    pub(crate) fn check_integrity(&self) {
        use alloc::vec::Vec;

        let inner = unsafe { self.inner.as_ref() };

        // Every trackable free chunk found inside the blocks; must match
        // the free-list membership exactly.
        let mut free_chunks: Vec<usize> = Vec::new();

        let mut prev_block = None;
        let mut cur = inner.blocks.get();
        while let Some(b) = cur {
            let bh = unsafe { b.as_ref() };
            assert_eq!(bh.prev.get(), prev_block);

            if bh.is_jumbo() {
                let off = jumbo_data_offset(bh.align()) - CHUNK_HDR_SIZE;
                let c = unsafe {
                    NonNull::new_unchecked(b.as_ptr().cast::<u8>().add(off).cast::<ChunkHdr>())
                };
                let hdr = unsafe { c.as_ref() };
                assert!(hdr.jumbo() && hdr.used() && hdr.last());
                assert_eq!(hdr.prev_len(), off);
            } else {
                assert_eq!(bh.size(), BLOCK_SIZE);
                let mut c = unsafe { block::first_chunk(b) };
                let mut covered = 0;
                let mut prev_len = 0;
                let mut prev_free = false;
                loop {
                    let hdr = unsafe { c.as_ref() };
                    assert!(!hdr.jumbo());
                    assert_eq!(hdr.prev_len(), prev_len);
                    assert!(hdr.len() >= CHUNK_HDR_SIZE);
                    assert_eq!(hdr.len() % ALIGN, 0);
                    if !hdr.used() {
                        assert!(!prev_free, "adjacent free chunks survived a merge");
                        if hdr.is_trackable() {
                            free_chunks.push(addr(c.as_ptr()));
                        }
                    }
                    prev_free = !hdr.used();
                    covered += hdr.len();
                    prev_len = hdr.len();
                    match unsafe { chunk::next_in_block(c) } {
                        Some(next) => c = next,
                        None => break,
                    }
                }
                assert_eq!(covered, BLOCK_SIZE - BLOCK_HDR_SIZE);
            }

            prev_block = Some(b);
            cur = bh.next.get();
        }

        let mut listed: Vec<usize> = Vec::new();

        // Master: NULL-terminated in both directions, members pristine.
        let mut prev = None;
        let mut cur = inner.master.get();
        while let Some(c) = cur {
            let hdr = unsafe { c.as_ref() };
            assert!(!hdr.used() && !hdr.jumbo() && hdr.is_trackable());
            let link = unsafe { chunk::free_link(c) };
            assert_eq!(link.prev.get(), prev);
            if prev.is_some() {
                // Only the head may be a partially-consumed tail; the rest
                // span whole pristine blocks.
                assert_eq!(hdr.prev_len(), 0);
                assert!(hdr.last());
            }
            listed.push(addr(c.as_ptr()));
            prev = Some(c);
            cur = link.next.get();
        }

        // Recycler: circular, back-links mirror forward links.
        if let Some(head) = inner.recycler.get() {
            let mut c = head;
            loop {
                let hdr = unsafe { c.as_ref() };
                assert!(!hdr.used() && !hdr.jumbo() && hdr.is_trackable());
                let next = unsafe { chunk::free_link(c) }.next.get().unwrap();
                assert_eq!(unsafe { chunk::free_link(next) }.prev.get(), Some(c));
                listed.push(addr(c.as_ptr()));
                c = next;
                if c == head {
                    break;
                }
            }
        }

        free_chunks.sort_unstable();
        listed.sort_unstable();
        assert_eq!(free_chunks, listed, "free-list membership drifted");
    }
}
