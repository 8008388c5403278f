//! Bookkeeping of received byte ranges.
//!
//! A [`ReceivedRangeSet`] is the coverage of a task: the union of every
//! `[start, end)` interval durably persisted so far. Intervals are kept sorted,
//! non-overlapping and non-adjacent, so the covered length can be maintained
//! incrementally and re-delivered ranges never count twice.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Sorted set of disjoint half-open byte intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(u64, u64)>", into = "Vec<(u64, u64)>")]
pub struct ReceivedRangeSet {
    /// start -> end
    ranges: BTreeMap<u64, u64>,
    covered: u64,
}

impl ReceivedRangeSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end)` and return how many bytes became newly covered.
    ///
    /// Overlapping, adjacent and duplicate insertions merge; inserting an
    /// already covered range returns 0 and leaves the set untouched.
    pub fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }

        let mut merged_start = start;
        let mut merged_end = end;

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= end {
                return 0;
            }
            if e >= start {
                merged_start = s;
            }
        }

        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(merged_start..=merged_end)
            .map(|(&s, &e)| (s, e))
            .collect();

        let mut absorbed_len = 0;
        for (s, e) in absorbed {
            self.ranges.remove(&s);
            absorbed_len += e - s;
            merged_end = merged_end.max(e);
        }

        self.ranges.insert(merged_start, merged_end);
        let added = (merged_end - merged_start) - absorbed_len;
        self.covered += added;
        added
    }

    /// Whether `[start, end)` is fully covered.
    #[must_use]
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &e)| e >= end)
    }

    /// Total number of covered bytes.
    #[must_use]
    pub const fn covered(&self) -> u64 {
        self.covered
    }

    /// Whether `[0, total)` is fully covered.
    #[must_use]
    pub fn is_complete(&self, total: u64) -> bool {
        self.contains(0, total)
    }

    /// Number of disjoint intervals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether nothing has been received yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over the covered intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    /// Gaps in `[0, total)` that are still missing, in ascending order.
    #[must_use]
    pub fn missing(&self, total: u64) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = 0;

        for (&s, &e) in &self.ranges {
            if s >= total {
                break;
            }
            if s > cursor {
                gaps.push(cursor..s);
            }
            cursor = cursor.max(e);
        }

        if cursor < total {
            gaps.push(cursor..total);
        }
        gaps
    }

    /// First byte not covered by the interval starting at zero.
    #[must_use]
    pub fn contiguous_prefix(&self) -> u64 {
        self.ranges.get(&0).copied().unwrap_or(0)
    }
}

impl From<Vec<(u64, u64)>> for ReceivedRangeSet {
    fn from(ranges: Vec<(u64, u64)>) -> Self {
        let mut set = Self::new();
        for (start, end) in ranges {
            set.insert(start, end);
        }
        set
    }
}

impl From<ReceivedRangeSet> for Vec<(u64, u64)> {
    fn from(set: ReceivedRangeSet) -> Self {
        set.ranges.into_iter().collect()
    }
}
