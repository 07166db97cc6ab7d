#![cfg_attr(not(feature = "std"), no_std)]

//! A virtual memory allocator for memory-constrained hosts.
//!
//! `virtpool` presents a flat, byte-addressable "virtual pool" that can be
//! far larger than the RAM of the machine it runs on. The pool lives in a
//! slow external store (a file, an external RAM chip behind a bus, or a
//! plain in-RAM buffer for testing), and a small set of RAM-resident page
//! frames mediates every access to it. Client code allocates variably
//! sized blocks out of the pool, reads and writes bytes at virtual
//! addresses, and can *lock* a range into a frame to obtain a stable host
//! pointer.
//!
//! ## Pieces
//!
//! ### [`VirtAlloc`](allocator/struct.VirtAlloc.html)
//!
//! The allocator itself: a free-list allocator whose block headers live
//! inside the virtual pool, on top of a three-tier page cache (small /
//! medium / big frames) that handles demand paging, dirty write-back and
//! lock pinning. One instance owns all state; there are no globals.
//!
//! ### [`BackingStore`](backing/trait.BackingStore.html)
//!
//! The capability the pool is stored in: `start`/`stop` lifecycle plus
//! positioned `read`/`write`. [`StaticBacking`](backing/struct.StaticBacking.html)
//! keeps the pool in an ordinary RAM buffer (useful for tests and small
//! pools), and [`FileBacking`](backing/struct.FileBacking.html) keeps it
//! in a file (`std` builds only).
//!
//! ## Caveats
//!
//! The allocator is strictly single-threaded and cooperative: one caller
//! at a time, no internal locking. Pointers returned by
//! [`read`](allocator/struct.VirtAlloc.html#method.read) are only valid
//! until the next allocator call (the borrow checker enforces this).
//! Pointers returned by the lock calls stay valid until the matching
//! `release_lock`, with one caveat: a later data lock on an overlapping
//! range may shrink the holding frame, invalidating the tail of the
//! earlier pointer.

extern crate alloc;

pub mod allocator;
pub mod backing;
mod cache;
mod freelist;
mod locks;
pub mod pages;
pub mod stats;

#[cfg(feature = "std")]
pub use backing::FileBacking;
pub use allocator::{PageGeometry, PoolConfig, VirtAlloc};
pub use backing::{BackingStore, StaticBacking};
pub use freelist::{FreeStats, Validity};
pub use pages::PageClass;
pub use stats::TraceStats;

/// Numeric type used to store raw virtual pool addresses.
///
/// Address `0` is reserved and means "null": it is never handed out by
/// the allocator and [`VirtAlloc::free_raw`](allocator/struct.VirtAlloc.html#method.free_raw)
/// ignores it.
pub type VAddr = u32;

/// Numeric type used to store the size of a virtual memory block.
pub type VSize = u32;

/// Numeric type used to store the size of a page frame or a locked range.
pub type FrameSize = u16;
