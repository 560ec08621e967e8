use core::{cell::Cell, mem::size_of, ptr::NonNull};

use allocator_api2::alloc::{AllocError, Allocator, Layout};

use crate::{
    align_up,
    chunk::{ChunkHdr, CHUNK_HDR_SIZE, FREE_LINK_SIZE, MAX_LEN},
    ALIGN,
};

/// Bytes of every normal OS-level block.
pub(crate) const BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Bytes occupied by a block header once padded to [`ALIGN`].
pub(crate) const BLOCK_HDR_SIZE: usize = align_up(size_of::<BlockHdr>(), ALIGN);

/// Largest request servable from a normal block; anything bigger gets a
/// dedicated jumbo block.
pub(crate) const MAX_ALLOC_SIZE: usize = BLOCK_SIZE - BLOCK_HDR_SIZE - CHUNK_HDR_SIZE;

const _: () = {
    if BLOCK_SIZE % ALIGN != 0 {
        panic!("BLOCK_SIZE must be a multiple of ALIGN");
    }
    if BLOCK_SIZE - BLOCK_HDR_SIZE > MAX_LEN {
        panic!("BLOCK_SIZE must fit the packed chunk length field");
    }
    if BLOCK_SIZE <= BLOCK_HDR_SIZE + CHUNK_HDR_SIZE + FREE_LINK_SIZE {
        panic!("BLOCK_SIZE is too small");
    }
};

/// Header embedded at the base of every OS-level block.
///
/// Blocks form a doubly-linked list owned by the pool. `size` and `align`
/// reproduce the `Layout` of the underlying allocation so the block can be
/// handed back; they also distinguish jumbo blocks, whose size is dictated
/// by a single oversized request rather than [`BLOCK_SIZE`].
#[repr(C)]
pub(crate) struct BlockHdr {
    pub prev: Cell<Option<NonNull<BlockHdr>>>,
    pub next: Cell<Option<NonNull<BlockHdr>>>,
    size: Cell<usize>,
    align: Cell<usize>,
}

impl BlockHdr {
    pub fn size(&self) -> usize {
        self.size.get()
    }

    pub fn align(&self) -> usize {
        self.align.get()
    }

    pub fn set_size(&self, size: usize) {
        self.size.set(size);
    }

    pub fn is_jumbo(&self) -> bool {
        self.size.get() != BLOCK_SIZE || self.align.get() != ALIGN
    }

    /// Layout of the backing OS allocation.
    pub fn layout(&self) -> Layout {
        // Safety: `size`/`align` are copied from a `Layout` that was valid
        // when the block was allocated.
        unsafe { Layout::from_size_align_unchecked(self.size.get(), self.align.get()) }
    }
}

/// Allocates a raw block and writes its header. The caller links it into
/// the pool's block list and carves the chunk area.
pub(crate) fn new_block<A>(
    alloc: &A,
    size: usize,
    align: usize,
) -> Result<NonNull<BlockHdr>, AllocError>
where
    A: Allocator,
{
    let layout = Layout::from_size_align(size, align).map_err(|_| AllocError)?;
    let ptr = alloc.allocate(layout)?.cast::<BlockHdr>();

    // Safety: the allocation is at least `size` bytes, which covers the
    // header (compile-time checked for normal blocks, sized-in for jumbo).
    unsafe {
        ptr.as_ptr().write(BlockHdr {
            prev: Cell::new(None),
            next: Cell::new(None),
            size: Cell::new(size),
            align: Cell::new(align),
        });
    }

    Ok(ptr)
}

/// Returns a block to the underlying allocator.
///
/// # Safety
///
/// `block` must have been produced by [`new_block`] with the same allocator
/// and must already be unlinked from the pool's block list.
pub(crate) unsafe fn free_block<A>(alloc: &A, block: NonNull<BlockHdr>)
where
    A: Allocator,
{
    let layout = unsafe { block.as_ref() }.layout();
    // Safety: `block` was allocated by `alloc` with this layout.
    unsafe {
        alloc.deallocate(block.cast(), layout);
    }
}

/// First chunk of a normal block, directly after the header.
///
/// # Safety
///
/// `block` must point to a live, normal (non-jumbo) block.
pub(crate) unsafe fn first_chunk(block: NonNull<BlockHdr>) -> NonNull<ChunkHdr> {
    debug_assert!(!unsafe { block.as_ref() }.is_jumbo());
    // Safety: normal blocks always have a chunk at this offset.
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HDR_SIZE).cast()) }
}
