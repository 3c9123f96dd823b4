//! The public face of the crate: a raw provider plus the books kept on it.

use std::{
    io::{self, Write},
    mem,
    ptr::NonNull,
    thread,
};

use log::{trace, warn};

use super::{
    error::Fault,
    raw::RawProvider,
    registry::{BlockRecord, Registry},
    site::{Address, CallSite, Operation},
};
use crate::{
    config::{Config, LeakPolicy, Provenance},
    report::Report,
    util::hint::cold,
};

/// Tracks every block it hands out: how many bytes are held right now, the
/// most that were ever held, and which call site owns each live block.
///
/// Usage counts include the allocator's own fixed size (the
/// [baseline](AccountingAllocator::baseline)), so a fresh allocator does not
/// report zero.
///
/// Every operation comes in two flavours. `try_*` returns the [`Fault`];
/// the plain one hands it to the configured
/// [`FaultPolicy`](crate::FaultPolicy) and never returns. Either way a
/// fault is detected before anything changes, so the books, the registry and
/// the provider are exactly as they were. The exception is a resize the
/// provider moved onto a live block; see [`try_resize`](Self::try_resize).
///
/// ```
/// use heapledger::{acquire, release, raw::Libc, AccountingAllocator};
///
/// let mut ledger = AccountingAllocator::new(Libc);
/// let block = acquire!(ledger, 64);
/// assert_eq!(ledger.current_usage(), ledger.baseline() + 64);
/// release!(ledger, block, 64);
/// assert!(ledger.finish().is_ok());
/// ```
#[derive(Debug)]
pub struct AccountingAllocator<P: RawProvider> {
    provider: P,
    registry: Registry,
    current: usize,
    peak: usize,
    config: Config,
    finished: bool,
}

impl<P: RawProvider> AccountingAllocator<P> {
    /// An allocator using [`Config::global()`].
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, Config::global().clone())
    }

    pub fn with_config(provider: P, config: Config) -> Self {
        let baseline = Self::baseline_size();
        Self {
            provider,
            registry: Registry::new(),
            current: baseline,
            peak: baseline,
            config,
            finished: false,
        }
    }

    const fn baseline_size() -> usize {
        mem::size_of::<Self>()
    }

    /// The allocator's own overhead, which the usage counters start from.
    pub const fn baseline(&self) -> usize {
        Self::baseline_size()
    }

    pub fn current_usage(&self) -> usize {
        self.current
    }

    /// Never decreases, and is never below [`current_usage`].
    ///
    /// [`current_usage`]: AccountingAllocator::current_usage
    pub fn peak_usage(&self) -> usize {
        self.peak
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Every live block, in registry slot order.
    pub fn live_blocks(&self) -> impl ExactSizeIterator<Item = &BlockRecord> + '_ {
        self.registry.iter()
    }

    fn account(&mut self, released: usize, acquired: usize) {
        // Whatever is released is on record, so it was counted in `current`
        self.current = self.current - released + acquired;
        self.peak = self.peak.max(self.current);
    }

    /// Get `size` zeroed bytes from the provider and start tracking them.
    ///
    /// # Errors
    ///
    /// - [`Fault::ResourceExhausted`] if the provider (or the registry,
    ///   growing) ran out of memory.
    /// - [`Fault::DuplicateKey`] if the provider returned an address that is
    ///   already live. That block is left with the provider.
    pub fn try_acquire(&mut self, size: usize, site: CallSite) -> Result<NonNull<u8>, Fault> {
        let Ok(ptr) = self.provider.allocate_zeroed(size) else {
            return Err(cold(|| Fault::ResourceExhausted {
                op: Operation::Acquire,
                requested: size,
                site,
            }));
        };

        let record = BlockRecord {
            address: Address::from(ptr),
            size,
            origin: site,
        };
        match self.registry.insert(record, Operation::Acquire) {
            Ok(record) => trace!(
                "acquired {} bytes at {} in {}",
                record.size,
                record.address,
                record.origin
            ),
            Err(fault) => {
                if let Fault::ResourceExhausted { .. } = fault {
                    // SAFETY: fresh from the provider and not tracked
                    unsafe { self.provider.release(ptr, size) };
                }
                return Err(fault);
            }
        }

        self.account(0, size);
        Ok(ptr)
    }

    /// Grow or shrink a tracked block, possibly moving it. `old_size` must be
    /// the size the block is tracked with.
    ///
    /// # Errors
    ///
    /// - [`Fault::UnknownAddress`] or [`Fault::SizeMismatch`] if `ptr` is not
    ///   live with `old_size` bytes. The provider is not called.
    /// - [`Fault::ResourceExhausted`] if the provider could not resize. The
    ///   original block stays live and tracked.
    /// - [`Fault::DuplicateKey`] if the provider moved the block onto an
    ///   address that is already live. Nothing can be rolled back at that
    ///   point: the old record is gone, the new block is untracked, and
    ///   `old_size` is no longer counted.
    pub fn try_resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, Fault> {
        let address = Address::from(ptr);
        self.registry
            .check(address, old_size, &site, Operation::Resize)?;

        // SAFETY: the registry has `ptr` live with exactly `old_size` bytes,
        // and nothing but this provider puts blocks in the registry
        let Ok(moved) = (unsafe { self.provider.resize(ptr, old_size, new_size) }) else {
            return Err(cold(|| Fault::ResourceExhausted {
                op: Operation::Resize,
                requested: new_size,
                site,
            }));
        };

        let previous = self
            .registry
            .remove(address, old_size, &site, Operation::Resize)?;
        let origin = match self.config.provenance {
            Provenance::LatestResize => site,
            Provenance::FirstAllocation => previous.origin,
        };
        let record = BlockRecord {
            address: Address::from(moved),
            size: new_size,
            origin,
        };
        // One record out, one in: this never grows the table
        let record = match self.registry.insert(record, Operation::Resize) {
            Ok(record) => record,
            Err(fault) => {
                // The old record is gone, so its bytes must go too
                self.account(old_size, 0);
                return Err(fault);
            }
        };
        trace!(
            "resized {address} ({old_size} bytes) to {} ({} bytes), origin {}",
            record.address,
            record.size,
            record.origin
        );

        self.account(old_size, new_size);
        Ok(moved)
    }

    /// Give a tracked block back to the provider. `size` must be the size the
    /// block is tracked with.
    ///
    /// # Errors
    ///
    /// [`Fault::UnknownAddress`] or [`Fault::SizeMismatch`] if `ptr` is not
    /// live with `size` bytes. The provider is not called.
    pub fn try_release(&mut self, ptr: NonNull<u8>, size: usize, site: CallSite) -> Result<(), Fault> {
        let address = Address::from(ptr);
        let record = self
            .registry
            .remove(address, size, &site, Operation::Release)?;
        trace!(
            "released {size} bytes at {address} in {site} (allocated in {})",
            record.origin
        );

        // SAFETY: `ptr` was live with exactly `size` bytes, and nothing but
        // this provider puts blocks in the registry
        unsafe { self.provider.release(ptr, size) };
        self.account(size, 0);
        Ok(())
    }

    /// [`try_acquire`](Self::try_acquire), terminating on a fault.
    pub fn acquire(&mut self, size: usize, site: CallSite) -> NonNull<u8> {
        match self.try_acquire(size, site) {
            Ok(ptr) => ptr,
            Err(fault) => self.raise(fault),
        }
    }

    /// [`try_resize`](Self::try_resize), terminating on a fault.
    pub fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        site: CallSite,
    ) -> NonNull<u8> {
        match self.try_resize(ptr, old_size, new_size, site) {
            Ok(ptr) => ptr,
            Err(fault) => self.raise(fault),
        }
    }

    /// [`try_release`](Self::try_release), terminating on a fault.
    pub fn release(&mut self, ptr: NonNull<u8>, size: usize, site: CallSite) {
        if let Err(fault) = self.try_release(ptr, size, site) {
            self.raise(fault)
        }
    }

    /// Escalate `fault` through the fault policy.
    pub(crate) fn raise(&self, fault: Fault) -> ! {
        self.config.on_fault.escalate(&fault)
    }

    pub fn report(&self) -> Report {
        Report {
            current_usage: self.current,
            peak_usage: self.peak,
            baseline: self.baseline(),
            blocks: self.registry.iter().cloned().collect(),
        }
    }

    pub fn write_report<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "{}", self.report())
    }

    /// [`write_report`](Self::write_report) to stdout.
    pub fn print_report(&self) {
        let stdout = io::stdout();
        if let Err(err) = self.write_report(stdout.lock()) {
            warn!("could not print memory report: {err}");
        }
    }

    /// Check for leaks, then optionally hand leaked blocks back. Runs once.
    fn teardown(&mut self) -> Result<(), Fault> {
        if mem::replace(&mut self.finished, true) {
            return Ok(());
        }

        let outstanding = self.current - self.baseline();
        let blocks = self.registry.len();
        let result = if outstanding == 0 && blocks == 0 {
            Ok(())
        } else {
            let fault = Fault::LeakDetected { outstanding, blocks };
            if self.config.on_leak != LeakPolicy::Ignore {
                self.print_report();
                warn!("{fault}");
            }
            Err(fault)
        };

        if self.config.reclaim_leaks {
            for record in self.registry.drain() {
                if let Some(ptr) = NonNull::new(record.address.get() as *mut u8) {
                    // SAFETY: the block was live with this size, and the
                    // record is gone now so nothing can release it twice
                    unsafe { self.provider.release(ptr, record.size) };
                }
                self.current -= record.size;
            }
        }

        result
    }

    /// Tear the allocator down, returning [`Fault::LeakDetected`] if any
    /// block is still live. Unless the leak policy is
    /// [`LeakPolicy::Ignore`], the report is printed to stdout first, same as
    /// on drop. Leaked blocks are reclaimed if [`Config::reclaim_leaks`] says
    /// so. A [`LeakPolicy::Fatal`] policy is not escalated here; the fault is
    /// the caller's to handle.
    pub fn finish(mut self) -> Result<(), Fault> {
        self.teardown()
    }
}

impl<P: RawProvider> Drop for AccountingAllocator<P> {
    fn drop(&mut self) {
        if let Err(fault) = self.teardown() {
            // Escalating while unwinding would abort and hide the real panic
            if self.config.on_leak == LeakPolicy::Fatal && !thread::panicking() {
                self.raise(fault)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        alloc::{error::FaultKind, raw::synthetic::Synthetic},
        config::FaultPolicy,
    };

    type Ledger = AccountingAllocator<Synthetic>;

    fn test_config() -> Config {
        Config::default()
            .with_on_fault(FaultPolicy::Panic)
            .with_on_leak(LeakPolicy::Ignore)
    }

    fn ledger(provider: Synthetic) -> Ledger {
        AccountingAllocator::with_config(provider, test_config())
    }

    fn at(source: &'static str, line: u32) -> CallSite {
        CallSite::new(source, line)
    }

    fn address(ptr: NonNull<u8>) -> Address {
        Address::from(ptr)
    }

    /// Everything a fault must leave untouched.
    fn snapshot(ledger: &Ledger) -> (usize, usize, Vec<BlockRecord>, usize) {
        (
            ledger.current_usage(),
            ledger.peak_usage(),
            ledger.live_blocks().cloned().collect(),
            ledger.provider().calls,
        )
    }

    #[test]
    fn acquire_resize_release_scenario() {
        let mut ledger = ledger(Synthetic::relocating());
        let baseline = ledger.baseline();
        assert_eq!(ledger.current_usage(), baseline);
        assert_eq!(ledger.peak_usage(), baseline);

        let p = ledger.try_acquire(64, at("a.c", 10)).unwrap();
        assert_eq!(ledger.current_usage(), baseline + 64);

        let q = ledger.try_resize(p, 64, 128, at("a.c", 11)).unwrap();
        assert_ne!(p, q);
        assert_eq!(ledger.current_usage(), baseline + 128);
        assert!(!ledger.registry().contains(address(p)));
        assert_eq!(ledger.registry().get(address(q)).unwrap().origin, at("a.c", 11));

        ledger.try_release(q, 128, at("a.c", 12)).unwrap();
        assert_eq!(ledger.current_usage(), baseline);
        assert_eq!(ledger.peak_usage(), baseline + 128);

        let report = ledger.report();
        assert!(report.blocks.is_empty());
        assert!(report.is_clean());
        assert!(ledger.finish().is_ok());
    }

    #[test]
    fn registry_grows_on_the_third_block() {
        let mut ledger = ledger(Synthetic::new());
        let blocks: Vec<_> = (0..5)
            .map(|i| {
                let ptr = ledger.try_acquire(16, at("grow.c", i)).unwrap();
                if i == 1 {
                    assert_eq!(ledger.registry().capacity(), 4);
                }
                if i == 2 {
                    assert_eq!(ledger.registry().capacity(), 8);
                }
                ptr
            })
            .collect();

        for ptr in blocks {
            ledger.try_release(ptr, 16, at("grow.c", 99)).unwrap();
        }
        assert_eq!(ledger.current_usage(), ledger.baseline());
    }

    #[test]
    fn wrong_release_size_names_both_sites_and_changes_nothing() {
        let mut ledger = ledger(Synthetic::new());
        let p = ledger.try_acquire(64, at("a.c", 10)).unwrap();
        let before = snapshot(&ledger);

        let fault = ledger.try_release(p, 32, at("b.c", 20)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::SizeMismatch);
        assert_eq!(fault.site(), Some(&at("b.c", 20)));
        assert_eq!(fault.origin(), Some(&at("a.c", 10)));
        assert_eq!(snapshot(&ledger), before);

        ledger.try_release(p, 64, at("b.c", 21)).unwrap();
    }

    #[test]
    fn wrong_resize_size_never_reaches_the_provider() {
        let mut ledger = ledger(Synthetic::relocating());
        let p = ledger.try_acquire(64, at("a.c", 10)).unwrap();
        let before = snapshot(&ledger);

        let fault = ledger.try_resize(p, 63, 128, at("a.c", 11)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::SizeMismatch);
        assert_eq!(snapshot(&ledger), before);
    }

    #[test]
    fn unknown_addresses_are_refused() {
        let mut ledger = ledger(Synthetic::new());
        let bogus = NonNull::new(0xbad0 as *mut u8).unwrap();
        let before = snapshot(&ledger);

        let fault = ledger.try_release(bogus, 8, at("c.c", 5)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::UnknownAddress);
        assert_eq!(fault.to_string(), "invalid deallocation address 0x0000bad0 in c.c:5");

        let fault = ledger.try_resize(bogus, 8, 16, at("c.c", 6)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::UnknownAddress);
        assert_eq!(snapshot(&ledger), before);
    }

    #[test]
    fn double_release_is_an_unknown_address() {
        let mut ledger = ledger(Synthetic::new());
        let p = ledger.try_acquire(8, at("d.c", 1)).unwrap();
        ledger.try_release(p, 8, at("d.c", 2)).unwrap();
        let fault = ledger.try_release(p, 8, at("d.c", 3)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::UnknownAddress);
    }

    #[test]
    fn exhausted_provider_leaves_everything_alone() {
        let mut ledger = ledger(Synthetic::relocating());
        let p = ledger.try_acquire(64, at("e.c", 1)).unwrap();

        ledger.provider.exhausted = true;
        let before = snapshot(&ledger);
        let fault = ledger.try_acquire(32, at("e.c", 2)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::ResourceExhausted);
        let fault = ledger.try_resize(p, 64, 4096, at("e.c", 3)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::ResourceExhausted);

        let (current, peak, blocks, _) = before;
        let (after_current, after_peak, after_blocks, _) = snapshot(&ledger);
        assert_eq!((current, peak, blocks), (after_current, after_peak, after_blocks));

        ledger.provider.exhausted = false;
        ledger.try_release(p, 64, at("e.c", 4)).unwrap();
    }

    #[test]
    fn provider_handing_out_a_live_address_is_a_duplicate() {
        let mut provider = Synthetic::new();
        provider.script.extend([0x7000, 0x7000]);
        let mut ledger = ledger(provider);

        ledger.try_acquire(16, at("f.c", 1)).unwrap();
        let before = ledger.current_usage();
        let fault = ledger.try_acquire(32, at("f.c", 2)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::DuplicateKey);
        assert_eq!(fault.origin(), Some(&at("f.c", 1)));
        assert_eq!(ledger.current_usage(), before);
        assert_eq!(ledger.registry().len(), 1);
    }

    #[test]
    fn resize_moved_onto_a_live_block_stops_counting_the_old_one() {
        let mut provider = Synthetic::relocating();
        provider.script.extend([0x7000, 0x8000, 0x8000]);
        let mut ledger = ledger(provider);

        let a = ledger.try_acquire(16, at("m.c", 1)).unwrap();
        ledger.try_acquire(32, at("m.c", 2)).unwrap();
        let fault = ledger.try_resize(a, 16, 64, at("m.c", 3)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::DuplicateKey);
        assert_eq!(fault.origin(), Some(&at("m.c", 2)));

        let live: usize = ledger.live_blocks().map(|record| record.size).sum();
        assert_eq!(live, 32);
        assert_eq!(ledger.current_usage(), ledger.baseline() + live);
        assert_eq!(ledger.registry().len(), 1);
        assert!(!ledger.registry().contains(address(a)));
    }

    #[test]
    fn provenance_policy_picks_the_origin_after_resize() {
        for (provenance, expected) in [
            (Provenance::LatestResize, at("g.c", 2)),
            (Provenance::FirstAllocation, at("g.c", 1)),
        ] {
            let config = test_config().with_provenance(provenance);
            let mut ledger = AccountingAllocator::with_config(Synthetic::relocating(), config);
            let p = ledger.try_acquire(8, at("g.c", 1)).unwrap();
            let q = ledger.try_resize(p, 8, 24, at("g.c", 2)).unwrap();
            assert_eq!(ledger.registry().get(address(q)).unwrap().origin, expected);
        }
    }

    #[test]
    fn zero_sized_blocks_are_tracked() {
        let mut ledger = ledger(Synthetic::new());
        let p = ledger.try_acquire(0, at("z.c", 1)).unwrap();
        assert_eq!(ledger.current_usage(), ledger.baseline());
        assert_eq!(ledger.registry().get(address(p)).unwrap().size, 0);

        let fault = ledger.try_release(p, 1, at("z.c", 2)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::SizeMismatch);
        ledger.try_release(p, 0, at("z.c", 3)).unwrap();
    }

    #[test]
    fn finish_reports_and_reclaims_leaks() {
        let provider = Synthetic::new();
        let released = provider.released.clone();
        let mut ledger = ledger(provider);
        let leaked = ledger.try_acquire(40, at("h.c", 1)).unwrap();
        let freed = ledger.try_acquire(8, at("h.c", 2)).unwrap();
        ledger.try_release(freed, 8, at("h.c", 3)).unwrap();

        let fault = ledger.finish().unwrap_err();
        assert_eq!(
            fault,
            Fault::LeakDetected {
                outstanding: 40,
                blocks: 1
            }
        );
        assert!(!fault.is_fatal());
        let released = released.lock();
        assert_eq!(*released, [address(freed).get(), address(leaked).get()]);
    }

    #[test]
    fn finish_under_the_report_policy_still_returns_the_leak() {
        let provider = Synthetic::new();
        let released = provider.released.clone();
        let config = test_config().with_on_leak(LeakPolicy::Report);
        let mut ledger = AccountingAllocator::with_config(provider, config);
        let leaked = ledger.try_acquire(24, at("r.c", 1)).unwrap();

        assert_eq!(
            ledger.finish(),
            Err(Fault::LeakDetected {
                outstanding: 24,
                blocks: 1
            })
        );
        assert_eq!(*released.lock(), [address(leaked).get()]);
    }

    #[test]
    fn leaks_stay_put_when_reclaiming_is_off() {
        let provider = Synthetic::new();
        let released = provider.released.clone();
        let mut ledger =
            AccountingAllocator::with_config(provider, test_config().with_reclaim_leaks(false));
        ledger.try_acquire(40, at("h.c", 1)).unwrap();
        drop(ledger);
        assert!(released.lock().is_empty());
    }

    #[test]
    fn peak_is_monotonic_and_usage_matches_a_model() {
        for seed in [7, 8, 9] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ledger = ledger(Synthetic::relocating());
            let mut model: HashMap<usize, (NonNull<u8>, usize)> = HashMap::new();
            let mut next_key = 0;
            let mut last_peak = ledger.peak_usage();

            for _ in 0..3_000 {
                let keys: Vec<usize> = model.keys().copied().collect();
                let choice = if keys.is_empty() { 0 } else { rng.gen_range(0..4) };
                match choice {
                    0 | 1 => {
                        let size = rng.gen_range(0..512);
                        let ptr = ledger.try_acquire(size, at("rand.c", 1)).unwrap();
                        model.insert(next_key, (ptr, size));
                        next_key += 1;
                    }
                    2 => {
                        let key = keys[rng.gen_range(0..keys.len())];
                        let (ptr, size) = model[&key];
                        let new_size = rng.gen_range(0..512);
                        let moved = ledger.try_resize(ptr, size, new_size, at("rand.c", 2)).unwrap();
                        model.insert(key, (moved, new_size));
                    }
                    _ => {
                        let key = keys[rng.gen_range(0..keys.len())];
                        let (ptr, size) = model.remove(&key).unwrap();
                        ledger.try_release(ptr, size, at("rand.c", 3)).unwrap();
                    }
                }

                let live: usize = model.values().map(|&(_, size)| size).sum();
                assert_eq!(ledger.current_usage(), ledger.baseline() + live);
                assert!(ledger.peak_usage() >= last_peak);
                assert!(ledger.peak_usage() >= ledger.current_usage());
                last_peak = ledger.peak_usage();
                assert_eq!(ledger.registry().len(), model.len());
            }

            for (_, (ptr, size)) in model.drain() {
                ledger.try_release(ptr, size, at("rand.c", 4)).unwrap();
            }
            assert_eq!(ledger.current_usage(), ledger.baseline());
        }
    }

    #[test]
    fn report_lists_live_blocks_with_their_origin() {
        let mut ledger = ledger(Synthetic::new());
        ledger.try_acquire(64, at("a.c", 10)).unwrap();

        let mut out = Vec::new();
        ledger.write_report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let baseline = ledger.baseline();
        assert!(text.starts_with(&format!(
            "memory usage: {} bytes (peak {} bytes)\nlive blocks: 1\n  1. address=0x",
            baseline + 64,
            baseline + 64
        )));
        assert!(text.ends_with(" size=64 allocated-at=a.c:10\n"), "{text}");
    }

    #[test]
    #[should_panic(expected = "invalid deallocation size in b.c:20")]
    fn plain_release_escalates_through_the_fault_policy() {
        let mut ledger = ledger(Synthetic::new());
        let p = ledger.acquire(64, at("a.c", 10));
        ledger.release(p, 65, at("b.c", 20));
    }

    #[test]
    #[should_panic(expected = "memory leak: 16 bytes in 1 live blocks")]
    fn fatal_leak_policy_escalates_on_drop() {
        let config = test_config().with_on_leak(LeakPolicy::Fatal);
        let mut ledger = AccountingAllocator::with_config(Synthetic::new(), config);
        ledger.acquire(16, at("leak.c", 1));
    }
}
