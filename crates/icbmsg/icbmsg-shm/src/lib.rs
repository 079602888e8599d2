//! Shared memory backings and the bounds-checked view used by the ICBMsg transport.
//!
//! Every byte the transport reads from or writes to shared memory goes through
//! [`ShmView`]. A view never hands out `&[u8]` borrows of the underlying memory,
//! since the peer core may be writing to it at the same time; all access is by
//! raw copy or atomic load/store at a range-checked offset.
//!
//! # Backings
//!
//! | Backing | Use |
//! |---|---|
//! | [`HeapRegion`] | two instances in one process (tests, benches) |
//! | [`MmapRegion`] | two processes sharing a file-backed mapping |
//! | [`ShmView::from_raw`] | a linker-placed region on real hardware |

mod error;
mod heap;
mod mmap;
mod view;

pub use error::ShmError;
pub use heap::HeapRegion;
pub use mmap::MmapRegion;
pub use view::{Backing, ShmView};
