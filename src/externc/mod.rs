//! The C interface, declared in `include/heapledger.h`.
//!
//! A `heapledger` handle is a boxed [`AccountingAllocator`] over [`Libc`], so
//! blocks it hands out can be passed to code expecting `malloc()` memory for
//! reading and writing (but must come back here to be resized or freed).
//!
//! Every function taking a handle requires it to come from
//! [`heapledger_create()`] or [`heapledger_create_with_config()`] and not to
//! have been deleted yet. Handles are not thread safe.

use std::{
    ffi::{c_char, c_int, c_void, CStr},
    process,
    ptr::{self, NonNull},
};

use libc::size_t;

use crate::{
    alloc::{
        accounting::AccountingAllocator,
        error::Fault,
        raw::Libc,
        site::{Address, CallSite, Operation},
    },
    config::Config,
};

pub type Ledger = AccountingAllocator<Libc>;

/// Turn on log output, filtered by `RUST_LOG` (default `warn`). Calling it
/// again does nothing.
#[no_mangle]
pub extern "C" fn heapledger_init_logging() {
    let env = env_logger::Env::default().default_filter_or("warn");
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// A new handle, configured from the `HEAPLEDGER_*` environment variables.
#[no_mangle]
pub extern "C" fn heapledger_create() -> *mut Ledger {
    Box::into_raw(Box::new(AccountingAllocator::new(Libc)))
}

/// A new handle configured from a JSON object such as
/// `{"on_leak": "fatal"}`; omitted fields take their defaults. Returns null
/// (and logs why) if the JSON is not a valid configuration.
///
/// # Safety
///
/// `json` must be null or a valid nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapledger_create_with_config(json: *const c_char) -> *mut Ledger {
    if json.is_null() {
        return heapledger_create();
    }
    // SAFETY: caller guarantees a valid C string
    let json = unsafe { CStr::from_ptr(json) }.to_string_lossy();
    match Config::from_json(&json) {
        Ok(config) => Box::into_raw(Box::new(AccountingAllocator::with_config(Libc, config))),
        Err(err) => {
            crate::diagnostic!("{err}");
            ptr::null_mut()
        }
    }
}

/// Tear down a handle: leaks are reported (and reclaimed) as configured.
/// Null is ignored.
///
/// # Safety
///
/// `ledger` must be null or a live handle, which is dangling afterwards.
#[no_mangle]
pub unsafe extern "C" fn heapledger_delete(ledger: *mut Ledger) {
    if !ledger.is_null() {
        // SAFETY: caller guarantees this came from `Box::into_raw()` and is
        // deleted once
        drop(unsafe { Box::from_raw(ledger) });
    }
}

/// # Safety
///
/// `ledger` must be a live handle.
unsafe fn ledger_mut<'a>(ledger: *mut Ledger) -> &'a mut Ledger {
    // SAFETY: caller guarantees a live handle, so non-null and unaliased
    match unsafe { ledger.as_mut() } {
        Some(ledger) => ledger,
        None => {
            crate::diagnostic!("null heapledger handle");
            process::abort()
        }
    }
}

/// # Safety
///
/// `ledger` must be a live handle.
unsafe fn ledger_ref<'a>(ledger: *const Ledger) -> &'a Ledger {
    // SAFETY: see `ledger_mut()`
    unsafe { ledger_mut(ledger.cast_mut()) }
}

/// # Safety
///
/// `source` must be null or a valid nul-terminated string.
unsafe fn call_site(source: *const c_char, line: c_int) -> CallSite {
    let line = u32::try_from(line).unwrap_or(0);
    if source.is_null() {
        return CallSite::new("<unknown>", line);
    }
    // SAFETY: caller guarantees a valid C string
    let source = unsafe { CStr::from_ptr(source) };
    CallSite::owned(source.to_string_lossy(), line)
}

/// Terminates through the fault policy if `pointer` is null.
fn non_null(ledger: &Ledger, pointer: *mut c_void, op: Operation, site: &CallSite) -> NonNull<u8> {
    match NonNull::new(pointer.cast()) {
        Some(ptr) => ptr,
        None => ledger.raise(Fault::UnknownAddress {
            op,
            address: Address::new(0),
            site: site.clone(),
        }),
    }
}

/// `size` zeroed bytes, attributed to `source`:`line`. Never returns null.
///
/// # Safety
///
/// `ledger` must be a live handle, `source` null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn heapledger_allocate(
    ledger: *mut Ledger,
    size: size_t,
    source: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: forwarded from the caller
    let (ledger, site) = unsafe { (ledger_mut(ledger), call_site(source, line)) };
    ledger.acquire(size, site).as_ptr().cast()
}

/// Resize a block from `old_size` (its current size) to `new_size`. The
/// block may move. Never returns null.
///
/// # Safety
///
/// `ledger` must be a live handle, `source` null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn heapledger_reallocate(
    ledger: *mut Ledger,
    pointer: *mut c_void,
    old_size: size_t,
    new_size: size_t,
    source: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: forwarded from the caller
    let (ledger, site) = unsafe { (ledger_mut(ledger), call_site(source, line)) };
    let ptr = non_null(ledger, pointer, Operation::Resize, &site);
    ledger.resize(ptr, old_size, new_size, site).as_ptr().cast()
}

/// # Safety
///
/// `ledger` must be a live handle, `source` null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn heapledger_deallocate(
    ledger: *mut Ledger,
    pointer: *mut c_void,
    size: size_t,
    source: *const c_char,
    line: c_int,
) {
    // SAFETY: forwarded from the caller
    let (ledger, site) = unsafe { (ledger_mut(ledger), call_site(source, line)) };
    let ptr = non_null(ledger, pointer, Operation::Release, &site);
    ledger.release(ptr, size, site)
}

/// # Safety
///
/// `ledger` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn heapledger_memory_usage(ledger: *const Ledger) -> size_t {
    // SAFETY: forwarded from the caller
    unsafe { ledger_ref(ledger) }.current_usage()
}

/// # Safety
///
/// `ledger` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn heapledger_peak_memory_usage(ledger: *const Ledger) -> size_t {
    // SAFETY: forwarded from the caller
    unsafe { ledger_ref(ledger) }.peak_usage()
}

/// Print the usage report to stdout.
///
/// # Safety
///
/// `ledger` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn heapledger_print(ledger: *const Ledger) {
    // SAFETY: forwarded from the caller
    unsafe { ledger_ref(ledger) }.print_report()
}
