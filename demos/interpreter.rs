//! A toy interpreter heap: a value stack that grows by doubling and
//! heap-allocated strings, all accounted through one ledger.
//!
//! `cargo run --example interpreter` (add `RUST_LOG=trace` to see every call).

use std::ptr::NonNull;

use heapledger::{
    acquire, raw::DLMALLOC, release, resize, AccountingAllocator, Config, LeakPolicy,
};

struct Stack {
    data: NonNull<u8>,
    capacity: usize,
    len: usize,
}

const SLOT: usize = 16;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::global().clone().with_on_leak(LeakPolicy::Report);
    let mut ledger = AccountingAllocator::with_config(DLMALLOC, config);

    let mut stack = Stack {
        data: acquire!(ledger, 4 * SLOT),
        capacity: 4,
        len: 0,
    };

    let mut strings = Vec::new();
    for word in ["let", "x", "=", "concat", "(", "\"hello\"", ",", "\"world\"", ")"] {
        if stack.len == stack.capacity {
            let old = stack.capacity * SLOT;
            stack.data = resize!(ledger, stack.data, old, old * 2);
            stack.capacity *= 2;
        }
        stack.len += 1;

        let bytes = word.len() + 1;
        let string = acquire!(ledger, bytes);
        // SAFETY: `bytes` fresh bytes, one more than the word needs
        unsafe { string.as_ptr().copy_from_nonoverlapping(word.as_ptr(), word.len()) };
        strings.push((string, bytes));
    }

    println!("after parsing:");
    ledger.print_report();

    // Free everything but the last string, which the "interpreter" forgets
    let forgotten = strings.pop();
    for (string, bytes) in strings {
        release!(ledger, string, bytes);
    }
    release!(ledger, stack.data, stack.capacity * SLOT);

    let report = ledger.report();
    println!("\nstill held by site:");
    for summary in report.by_site() {
        println!("  {}: {} bytes in {} blocks", summary.site, summary.bytes, summary.blocks);
    }
    if let Some((_, bytes)) = forgotten {
        println!("\nleaking {bytes} bytes on purpose, teardown reclaims them:");
    }
}
