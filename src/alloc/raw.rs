//! Where the bytes actually come from.
//!
//! The tracker never carves up memory itself, it asks a [`RawProvider`] and
//! keeps books on the answer. Three providers ship with the crate:
//!
//! - [`Libc`]: `calloc()` / `realloc()` / `free()`, same as a C host would use
//! - [`System`]: the Rust standard library's system allocator
//! - [`Dlmalloc`]: Doug Lea's allocator, from the `dlmalloc` crate, with its
//!   own heap separate from the process allocator

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
};

use thiserror::Error;

use crate::util::hint::cold;

/// The provider could not satisfy a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("raw memory provider is exhausted")]
pub struct Exhausted;

/// The three raw primitives the tracker sits on top of.
///
/// `old_size` and `size` are the sizes the tracker has on record for the
/// block; providers that need the original layout back (anything built on
/// [`GlobalAlloc`]) use them, `malloc`-style providers ignore them.
///
/// # Safety
///
/// - A pointer returned from `allocate_zeroed()` or `resize()` must point to
///   at least the requested number of bytes, and must not be returned again
///   while the block it names is live. The tracker relies on this to keep
///   one record per address.
/// - `allocate_zeroed()` must return zeroed memory.
/// - Neither may report success without actually providing the memory.
pub unsafe trait RawProvider {
    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, Exhausted>;

    /// Grow or shrink a block, possibly moving it. On `Err` the original block
    /// must be left untouched and still live.
    ///
    /// # Safety
    ///
    /// `ptr` must be live, from this provider, and `old_size` bytes long.
    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, Exhausted>;

    /// # Safety
    ///
    /// `ptr` must be live, from this provider, and `size` bytes long. It is
    /// dangling afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);
}

/// The C library heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct Libc;

// SAFETY: `calloc()` zeroes, and the C heap never hands out a live block
// twice. Zero-byte requests are bumped to one byte so a zero-sized block
// still gets an address of its own (and `realloc(p, 0)` never frees).
unsafe impl RawProvider for Libc {
    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, Exhausted> {
        // SAFETY: `calloc()` has no preconditions
        let data = unsafe { libc::calloc(1, size.max(1)) };
        NonNull::new(data.cast()).ok_or_else(|| cold(|| Exhausted))
    }

    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, Exhausted> {
        // SAFETY: the caller guarantees `ptr` is a live block from
        // `calloc()`/`realloc()`. On failure `realloc()` leaves it alone.
        let data = unsafe { libc::realloc(ptr.as_ptr().cast(), new_size.max(1)) };
        NonNull::new(data.cast()).ok_or_else(|| cold(|| Exhausted))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: same contract as the caller
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }
}

/// Any [`GlobalAlloc`] used as a provider. Every block is [`GLOBAL_ALIGN`]
/// aligned, which is what `malloc()` guarantees on 64-bit targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct Global<A>(pub A);

pub const GLOBAL_ALIGN: usize = 16;

pub type System = Global<std::alloc::System>;
pub type Dlmalloc = Global<dlmalloc::GlobalDlmalloc>;

pub const SYSTEM: System = Global(std::alloc::System);
pub const DLMALLOC: Dlmalloc = Global(dlmalloc::GlobalDlmalloc);

impl<A> Global<A> {
    pub const fn new(allocator: A) -> Self {
        Self(allocator)
    }

    /// The layout a block of `size` bytes is allocated with. Zero becomes one
    /// byte, because `GlobalAlloc` forbids zero-sized layouts.
    fn layout(size: usize) -> Result<Layout, Exhausted> {
        Layout::from_size_align(size.max(1), GLOBAL_ALIGN).map_err(|_| cold(|| Exhausted))
    }
}

// SAFETY: `GlobalAlloc` implementors already promise distinct live blocks,
// and `alloc_zeroed()` zeroes.
unsafe impl<A: GlobalAlloc> RawProvider for Global<A> {
    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, Exhausted> {
        let layout = Self::layout(size)?;
        // SAFETY: `layout` has a nonzero size
        let data = unsafe { self.0.alloc_zeroed(layout) };
        NonNull::new(data).ok_or_else(|| cold(|| Exhausted))
    }

    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, Exhausted> {
        let old_layout = Self::layout(old_size)?;
        let new_layout = Self::layout(new_size)?;
        // SAFETY:
        // - The caller guarantees `ptr` was allocated here with `old_size`
        //   bytes, i.e. with `old_layout`.
        // - `new_layout` validated that the new size is nonzero and does not
        //   overflow `isize` once rounded up to the alignment.
        let data = unsafe { self.0.realloc(ptr.as_ptr(), old_layout, new_layout.size()) };
        NonNull::new(data).ok_or_else(|| cold(|| Exhausted))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        // The layout was valid when the block was allocated, so this can't
        // fail for a block that really came from here.
        if let Ok(layout) = Self::layout(size) {
            // SAFETY: same contract as the caller, and `layout` is the layout
            // the block was allocated with
            unsafe { self.0.dealloc(ptr.as_ptr(), layout) }
        }
    }
}
