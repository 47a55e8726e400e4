// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Half-open byte-range interval algebra.

use serde::{Deserialize, Serialize};

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(end > start, "inverted or zero-length range [{start}, {end})");
        Self { start, end }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    fn intersects(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A canonical, sorted, disjoint, non-adjacent collection of ranges.
///
/// Every method returns a new set; inputs are never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn single(start: u64, end: u64) -> Self {
        Self {
            ranges: vec![Range::new(start, end)],
        }
    }

    /// Build a canonical set from arbitrary (possibly overlapping, unsorted) ranges.
    pub fn from_ranges(mut ranges: Vec<Range>) -> Self {
        if ranges.is_empty() {
            return Self::new();
        }
        ranges.sort();
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => {
                    if r.end > last.end {
                        last.end = r.end;
                    }
                }
                _ => merged.push(r),
            }
        }
        Self { ranges: merged }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[Range] {
        &self.ranges
    }

    /// Total number of bytes covered.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|r| r.size()).sum()
    }

    /// `O(log n)` membership test.
    pub fn contains(&self, offset: u64) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if offset < r.start {
                    std::cmp::Ordering::Greater
                } else if offset >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut all = self.ranges.clone();
        all.extend(other.ranges.iter().copied());
        RangeSet::from_ranges(all)
    }

    /// Largest canonical set representing membership in `self` but not in `other`.
    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let mut result = Vec::new();
        for r in &self.ranges {
            let mut pieces = vec![*r];
            for o in &other.ranges {
                let mut next = Vec::new();
                for p in pieces {
                    if !p.intersects(o) {
                        next.push(p);
                        continue;
                    }
                    if o.start > p.start {
                        next.push(Range::new(p.start, o.start.min(p.end)));
                    }
                    if o.end < p.end {
                        next.push(Range::new(o.end.max(p.start), p.end));
                    }
                }
                pieces = next;
            }
            result.extend(pieces);
        }
        RangeSet::from_ranges(result)
    }

    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        self.difference(&self.difference(other))
    }

    /// Lowest `[s,e) <= bounds` not covered by `self`, or `None` if `bounds` is fully covered.
    pub fn first_gap_within(&self, bounds: Range) -> Option<Range> {
        let mut cursor = bounds.start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= bounds.end {
                break;
            }
            if r.start > cursor {
                return Some(Range::new(cursor, r.start.min(bounds.end)));
            }
            cursor = r.end;
            if cursor >= bounds.end {
                return None;
            }
        }
        if cursor < bounds.end {
            Some(Range::new(cursor, bounds.end))
        } else {
            None
        }
    }

    /// Split the set into two at `offset`: everything below, everything at-or-above.
    pub fn split_at(&self, offset: u64) -> (RangeSet, RangeSet) {
        let mut below = Vec::new();
        let mut above = Vec::new();
        for r in &self.ranges {
            if r.end <= offset {
                below.push(*r);
            } else if r.start >= offset {
                above.push(*r);
            } else {
                below.push(Range::new(r.start, offset));
                above.push(Range::new(offset, r.end));
            }
        }
        (RangeSet { ranges: below }, RangeSet { ranges: above })
    }
}
