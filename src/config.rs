//! What the tracker does when something goes wrong.
//!
//! A [`Config`] can be built in code, parsed from JSON, or read from the
//! environment:
//!
//! | variable                   | values                                |
//! |----------------------------|---------------------------------------|
//! | `HEAPLEDGER_ON_FAULT`      | `exit` (default), `abort`, `panic`    |
//! | `HEAPLEDGER_ON_LEAK`       | `report` (default), `fatal`, `ignore` |
//! | `HEAPLEDGER_PROVENANCE`    | `latest-resize` (default), `first-allocation` |
//! | `HEAPLEDGER_RECLAIM_LEAKS` | `true` (default), `false`             |
//!
//! [`AccountingAllocator::new`](crate::AccountingAllocator::new) uses
//! [`Config::global()`], which reads the environment once per process.

use std::{env, process, str::FromStr};

use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alloc::error::Fault;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}, expected one of: {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, expected: &'static str) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_owned(),
            expected,
        }
    }

    fn rekeyed(self, new_key: &'static str) -> Self {
        match self {
            Self::InvalidValue {
                value, expected, ..
            } => Self::InvalidValue {
                key: new_key,
                value,
                expected,
            },
            other => other,
        }
    }
}

/// How the plain (non-`try_`) operations terminate on a fault. The diagnostic
/// is always written first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPolicy {
    /// `exit(1)`.
    #[default]
    Exit,
    Abort,
    /// Panic with the fault's message. Meant for test harnesses.
    Panic,
}

impl FaultPolicy {
    /// Write the diagnostic for `fault` and terminate the way this policy
    /// says.
    #[cold]
    pub fn escalate(self, fault: &Fault) -> ! {
        crate::diagnostic!("{fault}");
        match self {
            FaultPolicy::Exit => process::exit(1),
            FaultPolicy::Abort => process::abort(),
            FaultPolicy::Panic => panic!("{fault}"),
        }
    }
}

impl FromStr for FaultPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exit" => Ok(Self::Exit),
            "abort" => Ok(Self::Abort),
            "panic" => Ok(Self::Panic),
            _ => Err(ConfigError::invalid("on_fault", s, "exit, abort, panic")),
        }
    }
}

/// What teardown does with blocks that are still live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeakPolicy {
    /// Print the report and a warning, then carry on.
    #[default]
    Report,
    /// Print the report, then escalate [`Fault::LeakDetected`] through the
    /// fault policy.
    Fatal,
    Ignore,
}

impl FromStr for LeakPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "fatal" => Ok(Self::Fatal),
            "ignore" => Ok(Self::Ignore),
            _ => Err(ConfigError::invalid("on_leak", s, "report, fatal, ignore")),
        }
    }
}

/// Which call site a block is attributed to once it has been resized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// The last resize becomes the block's origin.
    #[default]
    LatestResize,
    /// The origin recorded by the acquire sticks for the block's lifetime.
    FirstAllocation,
}

impl FromStr for Provenance {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "latest-resize" => Ok(Self::LatestResize),
            "first-allocation" => Ok(Self::FirstAllocation),
            _ => Err(ConfigError::invalid(
                "provenance",
                s,
                "latest-resize, first-allocation",
            )),
        }
    }
}

fn parse_bool(key: &'static str, s: &str) -> Result<bool, ConfigError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, s, "true, false")),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub on_fault: FaultPolicy,
    pub on_leak: LeakPolicy,
    pub provenance: Provenance,
    /// Hand blocks that are still live at teardown back to the provider.
    pub reclaim_leaks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            on_fault: FaultPolicy::default(),
            on_leak: LeakPolicy::default(),
            provenance: Provenance::default(),
            reclaim_leaks: true,
        }
    }
}

pub const ENV_ON_FAULT: &str = "HEAPLEDGER_ON_FAULT";
pub const ENV_ON_LEAK: &str = "HEAPLEDGER_ON_LEAK";
pub const ENV_PROVENANCE: &str = "HEAPLEDGER_PROVENANCE";
pub const ENV_RECLAIM_LEAKS: &str = "HEAPLEDGER_RECLAIM_LEAKS";

static GLOBAL: Lazy<Config> = Lazy::new(|| {
    Config::from_env().unwrap_or_else(|err| {
        warn!("{err}; using the default configuration");
        Config::default()
    })
});

impl Config {
    /// The process-wide default, read from the environment the first time
    /// it is asked for.
    pub fn global() -> &'static Config {
        &GLOBAL
    }

    /// Defaults, overridden by whichever `HEAPLEDGER_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// [`Config::from_env()`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_ON_FAULT) {
            config.on_fault = value.parse().map_err(|e: ConfigError| e.rekeyed(ENV_ON_FAULT))?;
        }
        if let Some(value) = lookup(ENV_ON_LEAK) {
            config.on_leak = value.parse().map_err(|e: ConfigError| e.rekeyed(ENV_ON_LEAK))?;
        }
        if let Some(value) = lookup(ENV_PROVENANCE) {
            config.provenance = value
                .parse()
                .map_err(|e: ConfigError| e.rekeyed(ENV_PROVENANCE))?;
        }
        if let Some(value) = lookup(ENV_RECLAIM_LEAKS) {
            config.reclaim_leaks = parse_bool(ENV_RECLAIM_LEAKS, &value)?;
        }
        Ok(config)
    }

    /// Missing fields keep their defaults; unknown fields are an error.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_on_fault(mut self, on_fault: FaultPolicy) -> Self {
        self.on_fault = on_fault;
        self
    }

    pub fn with_on_leak(mut self, on_leak: LeakPolicy) -> Self {
        self.on_leak = on_leak;
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_reclaim_leaks(mut self, reclaim_leaks: bool) -> Self {
        self.reclaim_leaks = reclaim_leaks;
        self
    }
}
