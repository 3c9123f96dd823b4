//! `heapledger`: keep books on every heap block a program holds.
//!
//! An [`AccountingAllocator`] sits between a program and a raw memory
//! provider (`calloc()`/`realloc()`/`free()`, or any [`GlobalAlloc`]). It
//! knows how many bytes are held right now, the peak, and which call site owns
//! every live block. Releasing or resizing with the wrong size, releasing an
//! address it never handed out, or leaking at teardown are all caught and
//! reported with the call sites involved.
//!
//! The books live in a [`Registry`](alloc::registry::Registry): an
//! open-addressing hash table keyed by block address.
//!
//! ```
//! use heapledger::{acquire, release, resize, raw::Libc, AccountingAllocator};
//!
//! let mut ledger = AccountingAllocator::new(Libc);
//! let p = acquire!(ledger, 64);
//! let q = resize!(ledger, p, 64, 128);
//! println!("{}", ledger.report());
//! release!(ledger, q, 128);
//! ```
//!
//! C hosts use the functions in [`externc`] and `include/heapledger.h`.
//!
//! [`GlobalAlloc`]: std::alloc::GlobalAlloc

pub mod alloc;
pub mod config;
pub mod externc;
pub mod report;
pub mod serialize;
pub mod shared;
pub mod util;

pub use crate::alloc::{
    accounting::AccountingAllocator,
    error::{Fault, FaultKind},
    raw,
    registry::{BlockRecord, Registry},
    site::{Address, CallSite, Operation},
};
pub use config::{Config, ConfigError, FaultPolicy, LeakPolicy, Provenance};
pub use report::{LiveBlock, Report, SiteSummary};
pub use shared::SharedAllocator;
