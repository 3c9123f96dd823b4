//! Snapshots of an allocator's books.

use std::{cmp::Reverse, fmt};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::alloc::{registry::BlockRecord, site::CallSite};

/// One still-live block, as it appears in a [`Report`].
pub type LiveBlock = BlockRecord;

/// What [`AccountingAllocator::report`](crate::AccountingAllocator::report)
/// returns. Owns its data, so it can outlive the allocator.
///
/// Displays as:
///
/// ```text
/// memory usage: 184 bytes (peak 248 bytes)
/// live blocks: 2
///   1. address=0x55d0c2a0 size=64 allocated-at=a.c:10
///   2. address=0x55d0c320 size=56 allocated-at=b.c:3
/// ```
///
/// The last two sections are left out when nothing is live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub current_usage: usize,
    pub peak_usage: usize,
    /// The allocator's own fixed overhead, which `current_usage` includes.
    pub baseline: usize,
    /// In registry slot order.
    pub blocks: Vec<LiveBlock>,
}

/// Live blocks grouped by where they were allocated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSummary {
    pub site: CallSite,
    pub blocks: usize,
    pub bytes: usize,
}

impl Report {
    /// Bytes held on top of the baseline. Nonzero at teardown means a leak.
    pub fn outstanding(&self) -> usize {
        self.current_usage.saturating_sub(self.baseline)
    }

    pub fn is_clean(&self) -> bool {
        self.outstanding() == 0 && self.blocks.is_empty()
    }

    /// Per-site totals, biggest first. Ties are broken by site so the order
    /// is stable.
    pub fn by_site(&self) -> Vec<SiteSummary> {
        let mut totals: HashMap<&CallSite, (usize, usize)> = HashMap::new();
        for block in &self.blocks {
            let (blocks, bytes) = totals.entry(&block.origin).or_default();
            *blocks += 1;
            *bytes += block.size;
        }

        let mut summaries: Vec<SiteSummary> = totals
            .into_iter()
            .map(|(site, (blocks, bytes))| SiteSummary {
                site: site.clone(),
                blocks,
                bytes,
            })
            .collect();
        summaries.sort_by(|a, b| {
            (Reverse(a.bytes), &a.site.source, a.site.line).cmp(&(
                Reverse(b.bytes),
                &b.site.source,
                b.site.line,
            ))
        });
        summaries
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "memory usage: {} bytes (peak {} bytes)",
            self.current_usage, self.peak_usage
        )?;
        if self.blocks.is_empty() {
            return Ok(());
        }
        writeln!(f, "live blocks: {}", self.blocks.len())?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(
                f,
                "  {}. address={} size={} allocated-at={}",
                i + 1,
                block.address,
                block.size,
                block.origin
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::site::Address;

    fn block(address: usize, size: usize, source: &'static str, line: u32) -> LiveBlock {
        LiveBlock {
            address: Address::new(address),
            size,
            origin: CallSite::new(source, line),
        }
    }

    fn leaky() -> Report {
        Report {
            current_usage: 96 + 64 + 16 + 32,
            peak_usage: 400,
            baseline: 96,
            blocks: vec![
                block(0x1000, 64, "a.c", 10),
                block(0x2000, 16, "b.c", 3),
                block(0x3000, 32, "b.c", 3),
            ],
        }
    }

    #[test]
    fn empty_report_is_a_single_line() {
        let report = Report {
            current_usage: 96,
            peak_usage: 96,
            baseline: 96,
            blocks: Vec::new(),
        };
        assert_eq!(report.to_string(), "memory usage: 96 bytes (peak 96 bytes)\n");
        assert!(report.is_clean());
    }

    #[test]
    fn live_blocks_are_numbered_from_one() {
        let text = leaky().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "memory usage: 208 bytes (peak 400 bytes)",
                "live blocks: 3",
                "  1. address=0x00001000 size=64 allocated-at=a.c:10",
                "  2. address=0x00002000 size=16 allocated-at=b.c:3",
                "  3. address=0x00003000 size=32 allocated-at=b.c:3",
            ]
        );
    }

    #[test]
    fn outstanding_excludes_the_baseline() {
        let report = leaky();
        assert_eq!(report.outstanding(), 112);
        assert!(!report.is_clean());
    }

    #[test]
    fn by_site_sums_and_sorts_biggest_first() {
        let summaries = leaky().by_site();
        assert_eq!(
            summaries,
            [
                SiteSummary {
                    site: CallSite::new("a.c", 10),
                    blocks: 1,
                    bytes: 64,
                },
                SiteSummary {
                    site: CallSite::new("b.c", 3),
                    blocks: 2,
                    bytes: 48,
                },
            ]
        );
    }

    #[test]
    fn json_uses_hex_addresses() {
        let json = leaky().to_json().unwrap();
        assert!(json.contains(r#""address": "0x1000""#), "{json}");
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, leaky());
    }
}
