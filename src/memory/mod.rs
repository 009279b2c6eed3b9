//! Native memory ownership
//!
//! Blocks are reference counted: a [`NativeBuffer`] and every view shared
//! from it keep the block alive, and the block is freed exactly once when the
//! last of them is dropped (or when the buffer is disposed explicitly).

pub mod buffer;
pub mod strings;
pub mod view;

pub use buffer::NativeBuffer;
pub use strings::{NarrowEncoding, StringFlavor, WCHAR_SIZE};
pub use view::{MemoryView, POINTER_SIZE};
