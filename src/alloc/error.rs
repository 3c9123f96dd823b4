use thiserror::Error;

use super::site::{Address, CallSite, Operation};

/// Everything the tracker can detect. All but [`Fault::LeakDetected`] are
/// contract violations: they are never retried, and the plain (non-`try_`)
/// API terminates on them through the configured
/// [`FaultPolicy`](crate::FaultPolicy).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("out of memory: {requested} bytes requested for {op} in {site}")]
    ResourceExhausted {
        op: Operation,
        requested: usize,
        site: CallSite,
    },

    #[error(
        "{op} in {site} returned {address}, which is already tracked (allocated in {existing})"
    )]
    DuplicateKey {
        op: Operation,
        address: Address,
        site: CallSite,
        existing: CallSite,
    },

    #[error("invalid {op} address {address} in {site}")]
    UnknownAddress {
        op: Operation,
        address: Address,
        site: CallSite,
    },

    #[error(
        "invalid {op} size in {site}: {address} holds {recorded} bytes but {supplied} were given (allocated in {origin})"
    )]
    SizeMismatch {
        op: Operation,
        address: Address,
        supplied: usize,
        recorded: usize,
        site: CallSite,
        origin: CallSite,
    },

    #[error("probe for {address} went through all {capacity} slots without finding room")]
    ProbeExhausted { address: Address, capacity: usize },

    #[error("memory leak: {outstanding} bytes in {blocks} live blocks at teardown")]
    LeakDetected { outstanding: usize, blocks: usize },
}

/// The variant of a [`Fault`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    ResourceExhausted,
    DuplicateKey,
    UnknownAddress,
    SizeMismatch,
    ProbeExhausted,
    LeakDetected,
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::ResourceExhausted { .. } => FaultKind::ResourceExhausted,
            Fault::DuplicateKey { .. } => FaultKind::DuplicateKey,
            Fault::UnknownAddress { .. } => FaultKind::UnknownAddress,
            Fault::SizeMismatch { .. } => FaultKind::SizeMismatch,
            Fault::ProbeExhausted { .. } => FaultKind::ProbeExhausted,
            Fault::LeakDetected { .. } => FaultKind::LeakDetected,
        }
    }

    /// Leaks are the only fault the tracker can carry on after.
    pub fn is_fatal(&self) -> bool {
        self.kind() != FaultKind::LeakDetected
    }

    /// The call site of the operation that failed, if there was one.
    pub fn site(&self) -> Option<&CallSite> {
        match self {
            Fault::ResourceExhausted { site, .. }
            | Fault::DuplicateKey { site, .. }
            | Fault::UnknownAddress { site, .. }
            | Fault::SizeMismatch { site, .. } => Some(site),
            Fault::ProbeExhausted { .. } | Fault::LeakDetected { .. } => None,
        }
    }

    /// Where the block involved was originally allocated, if known.
    pub fn origin(&self) -> Option<&CallSite> {
        match self {
            Fault::DuplicateKey { existing, .. } => Some(existing),
            Fault::SizeMismatch { origin, .. } => Some(origin),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mismatch_names_both_sites() {
        let fault = Fault::SizeMismatch {
            op: Operation::Release,
            address: Address::new(0x1000),
            supplied: 8,
            recorded: 64,
            site: CallSite::new("b.c", 20),
            origin: CallSite::new("a.c", 10),
        };
        let message = fault.to_string();
        assert!(message.contains("b.c:20"), "{message}");
        assert!(message.contains("a.c:10"), "{message}");
        assert!(message.contains("deallocation"), "{message}");
        assert_eq!(fault.origin(), Some(&CallSite::new("a.c", 10)));
    }

    #[test]
    fn only_leaks_are_survivable() {
        let leak = Fault::LeakDetected {
            outstanding: 16,
            blocks: 1,
        };
        let probe = Fault::ProbeExhausted {
            address: Address::new(0),
            capacity: 4,
        };
        assert!(!leak.is_fatal());
        assert!(probe.is_fatal());
        assert_eq!(probe.site(), None);
    }
}
