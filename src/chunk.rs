use core::{cell::Cell, mem::size_of, ptr::NonNull};

use crate::{align_up, ALIGN};

/// Bytes occupied by a chunk header once padded to [`ALIGN`].
pub(crate) const CHUNK_HDR_SIZE: usize = align_up(size_of::<ChunkHdr>(), ALIGN);

/// Payload bytes a free chunk needs before it can carry a [`FreeLink`].
pub(crate) const FREE_LINK_SIZE: usize = size_of::<FreeLink>();

/// Largest value the packed `len` field can hold.
pub(crate) const MAX_LEN: usize = LEN_MASK as usize;

const LEN_MASK: u32 = (1 << 29) - 1;
const USED_FLAG: u32 = 1 << 29;
const LAST_FLAG: u32 = 1 << 30;
const JUMBO_FLAG: u32 = 1 << 31;

/// Header at the base of every chunk.
///
/// `len` shares a 32-bit word with the three flag bits; 29 bits of length
/// are enough to address any offset inside a block. `prev_len` is the byte
/// distance back to the previous chunk's header, so the chunks of a block
/// form an implicit doubly-linked chain:
///
/// ```text
/// +----------+----------------------+----------+---------------- -
/// | ChunkHdr |       payload        | ChunkHdr |     payload
/// +----------+----------------------+----------+---------------- -
/// ^ c        ^ c + CHUNK_HDR_SIZE   ^ c + len
/// ```
///
/// The first `FREE_LINK_SIZE` payload bytes of a free chunk are overlaid
/// with its free-list linkage; the `used` flag gates access to it.
#[repr(C)]
pub(crate) struct ChunkHdr {
    prev_len: Cell<u32>,
    word: Cell<u32>,
}

impl ChunkHdr {
    /// A fresh free chunk, not last in its block.
    pub fn new(len: usize, prev_len: usize) -> Self {
        debug_assert!(len <= MAX_LEN);
        debug_assert_eq!(len % ALIGN, 0);
        ChunkHdr {
            prev_len: Cell::new(prev_len as u32),
            word: Cell::new(len as u32),
        }
    }

    /// The sole chunk of a jumbo block. `len` is meaningless there (the
    /// block size is implied by the OS allocation); `prev_len` records the
    /// header's byte offset from the block base instead.
    pub fn new_jumbo(base_offset: usize) -> Self {
        ChunkHdr {
            prev_len: Cell::new(base_offset as u32),
            word: Cell::new(USED_FLAG | LAST_FLAG | JUMBO_FLAG),
        }
    }

    /// Total bytes occupied by this chunk, header included.
    pub fn len(&self) -> usize {
        (self.word.get() & LEN_MASK) as usize
    }

    pub fn set_len(&self, len: usize) {
        debug_assert!(len <= MAX_LEN);
        debug_assert_eq!(len % ALIGN, 0);
        self.word.set((self.word.get() & !LEN_MASK) | len as u32);
    }

    /// Bytes usable by the caller.
    pub fn payload(&self) -> usize {
        debug_assert!(!self.jumbo());
        self.len() - CHUNK_HDR_SIZE
    }

    pub fn prev_len(&self) -> usize {
        self.prev_len.get() as usize
    }

    pub fn set_prev_len(&self, prev_len: usize) {
        debug_assert!(prev_len <= MAX_LEN);
        self.prev_len.set(prev_len as u32);
    }

    pub fn used(&self) -> bool {
        self.word.get() & USED_FLAG != 0
    }

    pub fn set_used(&self, used: bool) {
        self.set_flag(USED_FLAG, used);
    }

    pub fn last(&self) -> bool {
        self.word.get() & LAST_FLAG != 0
    }

    pub fn set_last(&self, last: bool) {
        self.set_flag(LAST_FLAG, last);
    }

    pub fn jumbo(&self) -> bool {
        self.word.get() & JUMBO_FLAG != 0
    }

    /// Whether this chunk's payload can hold free-list linkage. Smaller free
    /// chunks exist but live outside both lists until coalesced away.
    pub fn is_trackable(&self) -> bool {
        self.payload() >= FREE_LINK_SIZE
    }

    fn set_flag(&self, flag: u32, on: bool) {
        if on {
            self.word.set(self.word.get() | flag);
        } else {
            self.word.set(self.word.get() & !flag);
        }
    }
}

/// Free-list linkage, overlaid at payload offset 0 of a free chunk.
///
/// In the master stack `prev`/`next` form a NULL-terminated doubly-linked
/// list; in the recycler they form a circular one where every link is set.
#[repr(C)]
pub(crate) struct FreeLink {
    pub prev: Cell<Option<NonNull<ChunkHdr>>>,
    pub next: Cell<Option<NonNull<ChunkHdr>>>,
}

/// Returns the chunk's free-list linkage.
///
/// # Safety
///
/// `c` must point to a live chunk that is free and [trackable]; the linkage
/// bytes must not be aliased mutably elsewhere.
///
/// [trackable]: ChunkHdr::is_trackable
pub(crate) unsafe fn free_link<'a>(c: NonNull<ChunkHdr>) -> &'a FreeLink {
    debug_assert!(!unsafe { c.as_ref() }.used());
    debug_assert!(unsafe { c.as_ref() }.is_trackable());
    // Safety: a trackable free chunk's payload starts with its linkage.
    unsafe { &*data(c).as_ptr().cast::<FreeLink>() }
}

/// Pointer handed to the caller for `c`.
///
/// # Safety
///
/// `c` must point to a live chunk.
pub(crate) unsafe fn data(c: NonNull<ChunkHdr>) -> NonNull<u8> {
    // Safety: the payload begins `CHUNK_HDR_SIZE` bytes into the chunk.
    unsafe { NonNull::new_unchecked(c.as_ptr().cast::<u8>().add(CHUNK_HDR_SIZE)) }
}

/// Recovers the owning chunk from a pointer returned by [`data`].
///
/// # Safety
///
/// `ptr` must have been produced by [`data`] for a still-live chunk.
pub(crate) unsafe fn from_data(ptr: NonNull<u8>) -> NonNull<ChunkHdr> {
    // Safety: covered by the caller's contract.
    unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(CHUNK_HDR_SIZE).cast()) }
}

/// The chunk following `c` in its block, unless `c` is the last one.
///
/// # Safety
///
/// `c` must point to a live, non-jumbo chunk with a valid header.
pub(crate) unsafe fn next_in_block(c: NonNull<ChunkHdr>) -> Option<NonNull<ChunkHdr>> {
    let hdr = unsafe { c.as_ref() };
    if hdr.last() {
        None
    } else {
        // Safety: a non-last chunk is followed by another within the block.
        Some(unsafe { NonNull::new_unchecked(c.as_ptr().cast::<u8>().add(hdr.len()).cast()) })
    }
}

/// The chunk preceding `c` in its block, unless `c` is the first one.
///
/// # Safety
///
/// `c` must point to a live, non-jumbo chunk with a valid header.
pub(crate) unsafe fn prev_in_block(c: NonNull<ChunkHdr>) -> Option<NonNull<ChunkHdr>> {
    let prev_len = unsafe { c.as_ref() }.prev_len();
    if prev_len == 0 {
        None
    } else {
        // Safety: `prev_len` is the distance back to the previous header.
        Some(unsafe { NonNull::new_unchecked(c.as_ptr().cast::<u8>().sub(prev_len).cast()) })
    }
}
