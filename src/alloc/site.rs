//! Identities the tracker attaches to blocks: where a block lives
//! ([`Address`]) and which piece of code asked for it ([`CallSite`]).

use std::{borrow::Cow, fmt, panic::Location, ptr::NonNull};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serialize::serde_addr;

/// The identity of a block, as handed out by the raw provider.
///
/// This is only ever hashed and compared. The tracker never reads or writes
/// through it, and it does not own the memory it names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(usize);

impl Address {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as *const () as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl<T> From<NonNull<T>> for Address {
    fn from(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_addr::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_addr::deserialize(deserializer).map(Self)
    }
}

/// Where in the host program an operation was requested. Both halves are
/// opaque to the tracker: they are stored and printed, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub source: Cow<'static, str>,
    pub line: u32,
}

impl CallSite {
    /// A call site with a `'static` source name, which is what [`site!`]
    /// produces. No allocation.
    ///
    /// [`site!`]: crate::site
    pub const fn new(source: &'static str, line: u32) -> Self {
        Self {
            source: Cow::Borrowed(source),
            line,
        }
    }

    /// A call site whose source name has to be copied, e.g. one that arrived
    /// over the C ABI.
    pub fn owned(source: impl Into<String>, line: u32) -> Self {
        Self {
            source: Cow::Owned(source.into()),
            line,
        }
    }

    /// The location of whoever called the `#[track_caller]` function this is
    /// used in.
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

/// Which public operation touched the registry. Used to word diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Acquire,
    Resize,
    Release,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Acquire => "allocation",
            Operation::Resize => "reallocation",
            Operation::Release => "deallocation",
        })
    }
}

/// The [`CallSite`] of the macro invocation.
#[macro_export]
macro_rules! site {
    () => {
        $crate::CallSite::new(file!(), line!())
    };
}

/// `acquire!(ledger, size)`: acquire, attributed to the invocation site.
#[macro_export]
macro_rules! acquire {
    ($ledger:expr, $size:expr $(,)?) => {
        $ledger.acquire($size, $crate::site!())
    };
}

/// `resize!(ledger, ptr, old_size, new_size)`: resize, attributed to the
/// invocation site.
#[macro_export]
macro_rules! resize {
    ($ledger:expr, $ptr:expr, $old_size:expr, $new_size:expr $(,)?) => {
        $ledger.resize($ptr, $old_size, $new_size, $crate::site!())
    };
}

/// `release!(ledger, ptr, size)`: release, attributed to the invocation site.
#[macro_export]
macro_rules! release {
    ($ledger:expr, $ptr:expr, $size:expr $(,)?) => {
        $ledger.release($ptr, $size, $crate::site!())
    };
}
