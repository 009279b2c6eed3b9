//! Owned native memory blocks
//!
//! A [`NativeBuffer`] is a block obtained from the platform allocator. The
//! block is freed when the buffer and every [`MemoryView`] derived from it
//! have been dropped, or earlier through [`NativeBuffer::dispose`], after
//! which every derived view reports [`FfiError::StaleHandle`].
//!
//! Buffers and views are confined to the thread that allocated them. The
//! freed check and the access that follows it are not atomic together, so a
//! block must never be disposed from another thread while it is being read.

use crate::error::{FfiError, FfiResult};
use crate::memory::view::MemoryView;
use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);

/// Shared allocation state. Views hold a strong reference to it, which is
/// what keeps the block alive while any view is reachable.
pub(crate) struct Allocation {
    ptr: Cell<*mut u8>,
    address: usize,
    size: usize,
}

impl Allocation {
    /// Base pointer, or `StaleHandle` once the block has been freed.
    pub(crate) fn base(&self) -> FfiResult<*mut u8> {
        let p = self.ptr.get();
        if p.is_null() {
            Err(FfiError::StaleHandle { address: self.address })
        } else {
            Ok(p)
        }
    }

    pub(crate) fn address(&self) -> usize {
        self.address
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.ptr.get().is_null()
    }

    /// Free the block. The pointer is nulled first, so dispose and drop free
    /// exactly once between them.
    fn release(&self) -> bool {
        let p = self.ptr.replace(ptr::null_mut());
        if p.is_null() {
            return false;
        }
        unsafe { libc::free(p as *mut libc::c_void) };
        LIVE_BUFFERS.fetch_sub(1, Ordering::Relaxed);
        log::trace!("freed {} bytes at 0x{:x}", self.size, self.address);
        true
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.release();
    }
}

/// An owned block of native memory
pub struct NativeBuffer {
    allocation: Rc<Allocation>,
}

impl NativeBuffer {
    /// Allocate `size` zeroed bytes.
    pub fn allocate(size: usize) -> FfiResult<Self> {
        Self::allocate_with(size, true)
    }

    /// Allocate `size` bytes, zeroed or left uninitialized.
    pub fn allocate_with(size: usize, zeroed: bool) -> FfiResult<Self> {
        if size == 0 {
            return Err(FfiError::invalid_argument(
                "Allocation size must be greater than zero",
            ));
        }

        let p = unsafe {
            if zeroed {
                libc::calloc(1, size)
            } else {
                libc::malloc(size)
            }
        } as *mut u8;

        if p.is_null() {
            return Err(FfiError::Allocation { size });
        }

        LIVE_BUFFERS.fetch_add(1, Ordering::Relaxed);
        log::trace!("allocated {} bytes at 0x{:x}", size, p as usize);

        Ok(Self {
            allocation: Rc::new(Allocation {
                ptr: Cell::new(p),
                address: p as usize,
                size,
            }),
        })
    }

    /// Allocate a block holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> FfiResult<Self> {
        let buffer = Self::allocate_with(bytes.len().max(1), bytes.is_empty())?;
        if !bytes.is_empty() {
            buffer.view().write_bytes(0, bytes)?;
        }
        Ok(buffer)
    }

    /// Native address of the first byte.
    pub fn address(&self) -> usize {
        self.allocation.address()
    }

    pub fn size(&self) -> usize {
        self.allocation.size()
    }

    /// A view over the whole block.
    pub fn view(&self) -> MemoryView {
        MemoryView::owned(Rc::clone(&self.allocation), 0, self.size())
    }

    /// A bounds-checked view of `size` bytes starting at `offset`.
    pub fn share(&self, offset: usize, size: usize) -> FfiResult<MemoryView> {
        self.view().share(offset, size)
    }

    /// A view from `offset` to the end of the block.
    pub fn share_from(&self, offset: usize) -> FfiResult<MemoryView> {
        self.view().share_from(offset)
    }

    /// Free the block now instead of when the last view goes away.
    ///
    /// Returns false if it was already freed.
    pub fn dispose(&self) -> bool {
        let freed = self.allocation.release();
        if !freed {
            log::warn!("native buffer at 0x{:x} disposed twice", self.address());
        }
        freed
    }

    pub fn is_disposed(&self) -> bool {
        self.allocation.is_freed()
    }

    /// Number of blocks allocated and not yet freed, process wide.
    pub fn live_count() -> usize {
        LIVE_BUFFERS.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocated@0x{:x} ({} bytes)", self.address(), self.size())
    }
}
