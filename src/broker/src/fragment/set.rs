// Copyright 2024 The Journal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use journal_proto::Fragment;

use super::spool::ContentHandle;

/// A Fragment paired with the spool content which backs it, when the
/// content is still resident on this broker.
#[derive(Clone)]
pub struct IndexFragment {
    pub spec: Fragment,
    pub content: Option<Arc<ContentHandle>>,
}

impl IndexFragment {
    pub fn remote(spec: Fragment) -> Self {
        IndexFragment {
            spec,
            content: None,
        }
    }
}

/// An ordered set of Fragments: ascending on begin, with ties broken by
/// descending end. No member strictly contains another; adjacent members
/// may overlap at endpoints. A consequence of the containment invariant
/// is that member ends are non-decreasing, which queries rely upon.
#[derive(Clone, Default)]
pub struct FragmentSet {
    items: Vec<IndexFragment>,
}

#[derive(Clone, Copy)]
pub enum SetQuery<'a> {
    /// The longest member covering the queried offset.
    Covered(&'a IndexFragment),
    /// No member covers the offset; this is the closest member above it.
    Ahead(&'a IndexFragment),
    /// The offset is at or beyond the end of the set.
    Beyond,
}

impl FragmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexFragment> {
        self.items.iter()
    }

    /// Largest end offset of any member.
    pub fn end_offset(&self) -> i64 {
        self.items.last().map(|f| f.spec.end).unwrap_or(0)
    }

    /// Smallest begin offset of any member.
    pub fn begin_offset(&self) -> i64 {
        self.items.first().map(|f| f.spec.begin).unwrap_or(0)
    }

    /// Insert |fragment|, replacing members it strictly contains. A
    /// fragment which is itself strictly contained is not inserted, and a
    /// fragment of an already-present range replaces that member (its
    /// metadata is the fresher). Returns whether the set was modified.
    pub fn insert(&mut self, fragment: IndexFragment) -> bool {
        let (begin, end) = (fragment.spec.begin, fragment.spec.end);

        // The last member beginning at or before |begin| has the largest
        // end of any such member, and is the sole containment candidate.
        let at = self.items.partition_point(|f| f.spec.begin <= begin);
        if at > 0 {
            let prior = &self.items[at - 1].spec;
            if prior.begin <= begin && end <= prior.end {
                if (prior.begin, prior.end) == (begin, end) {
                    self.items[at - 1] = fragment;
                    return true;
                }
                return false;
            }
        }

        // Remove the run of members which |fragment| contains.
        let from = self.items.partition_point(|f| f.spec.begin < begin);
        let to = from
            + self.items[from..]
                .iter()
                .take_while(|f| f.spec.end <= end)
                .count();
        self.items.splice(from..to, [fragment]);
        true
    }

    pub fn query(&self, offset: i64) -> SetQuery<'_> {
        let at = self.items.partition_point(|f| f.spec.begin <= offset);
        if at > 0 && self.items[at - 1].spec.end > offset {
            return SetQuery::Covered(&self.items[at - 1]);
        }
        match self.items.get(at) {
            Some(ahead) => SetQuery::Ahead(ahead),
            None => SetQuery::Beyond,
        }
    }

    /// True if some member covers the entire |begin|..|end| range.
    pub fn covers_range(&self, begin: i64, end: i64) -> bool {
        match self.query(begin) {
            SetQuery::Covered(f) => f.spec.end >= end,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(begin: i64, end: i64) -> IndexFragment {
        IndexFragment::remote(Fragment {
            journal: "a/journal".to_string(),
            begin,
            end,
            ..Default::default()
        })
    }

    fn ranges(set: &FragmentSet) -> Vec<(i64, i64)> {
        set.iter().map(|f| (f.spec.begin, f.spec.end)).collect()
    }

    #[test]
    fn insertion_holds_ordering_invariants() {
        let mut set = FragmentSet::new();
        assert!(set.insert(fragment(100, 200)));
        assert!(set.insert(fragment(0, 100)));
        assert!(set.insert(fragment(200, 250)));
        assert_eq!(ranges(&set), vec![(0, 100), (100, 200), (200, 250)]);

        // Strictly contained fragments are not inserted.
        assert!(!set.insert(fragment(120, 180)));
        assert!(!set.insert(fragment(100, 150)));
        assert_eq!(set.len(), 3);

        // A containing fragment replaces the members it covers.
        assert!(set.insert(fragment(90, 250)));
        assert_eq!(ranges(&set), vec![(0, 100), (90, 250)]);

        // An equal range replaces in place.
        let mut update = fragment(90, 250);
        update.spec.backing_store = "mem://x/".to_string();
        assert!(set.insert(update));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().last().unwrap().spec.backing_store, "mem://x/");
    }

    #[test]
    fn ends_are_non_decreasing() {
        let mut set = FragmentSet::new();
        set.insert(fragment(0, 10));
        set.insert(fragment(5, 30));
        set.insert(fragment(10, 20));
        let r = ranges(&set);
        assert!(r.windows(2).all(|w| w[0].0 <= w[1].0 && w[0].1 <= w[1].1));
    }

    #[test]
    fn queries_cover_and_advance() {
        let mut set = FragmentSet::new();
        set.insert(fragment(0, 100));
        set.insert(fragment(150, 200));

        match set.query(50) {
            SetQuery::Covered(f) => assert_eq!((f.spec.begin, f.spec.end), (0, 100)),
            _ => panic!("expected covered"),
        }
        // Offsets within the gap resolve to the next fragment above.
        match set.query(120) {
            SetQuery::Ahead(f) => assert_eq!(f.spec.begin, 150),
            _ => panic!("expected ahead"),
        }
        assert!(matches!(set.query(200), SetQuery::Beyond));
        assert!(matches!(set.query(500), SetQuery::Beyond));

        assert_eq!(set.end_offset(), 200);
        assert_eq!(set.begin_offset(), 0);
        assert!(set.covers_range(10, 100));
        assert!(!set.covers_range(10, 101));
    }

    #[test]
    fn overlapping_endpoints_pick_the_longest() {
        let mut set = FragmentSet::new();
        set.insert(fragment(0, 100));
        set.insert(fragment(50, 200));

        // 50 is covered by both; the longer (later-ending) member wins.
        match set.query(50) {
            SetQuery::Covered(f) => assert_eq!(f.spec.end, 200),
            _ => panic!("expected covered"),
        }
    }
}
