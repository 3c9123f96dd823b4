//! An [`AccountingAllocator`] that can be used from several threads.

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::{
    alloc::{accounting::AccountingAllocator, error::Fault, raw::RawProvider, site::CallSite},
    report::Report,
};

/// Serializes every call behind one lock, held for the whole call. Blocks
/// handed out are plain addresses, so they can move between threads freely;
/// the books stay consistent because only one operation runs at a time.
#[derive(Debug)]
pub struct SharedAllocator<P: RawProvider> {
    inner: Mutex<AccountingAllocator<P>>,
}

impl<P: RawProvider> SharedAllocator<P> {
    pub fn new(allocator: AccountingAllocator<P>) -> Self {
        Self {
            inner: Mutex::new(allocator),
        }
    }

    /// Hold the lock across several operations.
    pub fn lock(&self) -> MutexGuard<'_, AccountingAllocator<P>> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> AccountingAllocator<P> {
        self.inner.into_inner()
    }

    pub fn try_acquire(&self, size: usize, site: CallSite) -> Result<NonNull<u8>, Fault> {
        self.inner.lock().try_acquire(size, site)
    }

    pub fn try_resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, Fault> {
        self.inner.lock().try_resize(ptr, old_size, new_size, site)
    }

    pub fn try_release(&self, ptr: NonNull<u8>, size: usize, site: CallSite) -> Result<(), Fault> {
        self.inner.lock().try_release(ptr, size, site)
    }

    pub fn acquire(&self, size: usize, site: CallSite) -> NonNull<u8> {
        self.inner.lock().acquire(size, site)
    }

    pub fn resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        site: CallSite,
    ) -> NonNull<u8> {
        self.inner.lock().resize(ptr, old_size, new_size, site)
    }

    pub fn release(&self, ptr: NonNull<u8>, size: usize, site: CallSite) {
        self.inner.lock().release(ptr, size, site)
    }

    pub fn current_usage(&self) -> usize {
        self.inner.lock().current_usage()
    }

    pub fn peak_usage(&self) -> usize {
        self.inner.lock().peak_usage()
    }

    pub fn report(&self) -> Report {
        self.inner.lock().report()
    }
}

impl<P: RawProvider> From<AccountingAllocator<P>> for SharedAllocator<P> {
    fn from(allocator: AccountingAllocator<P>) -> Self {
        Self::new(allocator)
    }
}
