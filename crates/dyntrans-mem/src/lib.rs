//! Guest physical memory for the dynamic-translation core.
//!
//! RAM is stored as page-sized host frames that are allocated on first touch. Every frame has a
//! stable [`HostPage`] index for the lifetime of the [`PhysicalMemory`], which is what the MMU
//! caches in its fast-path tables instead of raw host pointers.
//!
//! Frames that back translated code carry a *code mark*. Writing to a marked frame through the
//! slow path ([`PhysicalMemory::write_physical`]) clears the mark and queues the frame's physical
//! page number so the execution core can drop stale translations (see
//! [`PhysicalMemory::take_code_writes`]).

mod error;
mod mmio;
mod order;
mod phys;

pub use error::MemoryError;
pub use mmio::MmioHandler;
pub use order::ByteOrder;
pub use phys::{Backing, HostPage, PhysicalMemory};

/// Supported page sizes, as log2 of the byte count.
pub const PAGE_SHIFTS: core::ops::RangeInclusive<u32> = 8..=24;
