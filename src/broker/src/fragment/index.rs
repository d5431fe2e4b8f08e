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

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use journal_proto::Fragment;
use tokio::sync::watch;

use super::set::{FragmentSet, IndexFragment, SetQuery};

/// Outcome of a [`FragmentIndex::query`].
pub enum IndexQuery {
    /// The longest fragment covering the offset or, past a gap, the
    /// closest fragment above it.
    Found {
        fragment: IndexFragment,
        write_head: i64,
    },
    /// The offset is at or beyond the journal's write head.
    NotYetAvailable { write_head: i64 },
}

/// The thread-safe union of a replica's local (spooled) fragments and the
/// remote fragments listed from backing stores, with a monotonic write
/// head whose advances wake blocked queries.
#[derive(Clone)]
pub struct FragmentIndex {
    inner: Arc<StdMutex<Inner>>,
    head_tx: Arc<watch::Sender<i64>>,
}

struct Inner {
    local: FragmentSet,
    remote: FragmentSet,
}

impl Default for FragmentIndex {
    fn default() -> Self {
        FragmentIndex {
            inner: Arc::new(StdMutex::new(Inner {
                local: FragmentSet::new(),
                remote: FragmentSet::new(),
            })),
            head_tx: Arc::new(watch::channel(0).0),
        }
    }
}

impl FragmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The journal's write head: the largest end offset this index has
    /// ever observed.
    pub fn end_offset(&self) -> i64 {
        *self.head_tx.borrow()
    }

    /// Insert a committed local fragment, advancing the write head.
    pub fn insert_local(&self, fragment: IndexFragment) {
        let mut inner = self.inner.lock().unwrap();
        if fragment.spec.begin == fragment.spec.end {
            return;
        }
        inner.local.insert(fragment);
        self.bump_head(&inner);
    }

    /// Record that a local fragment was persisted to a backing store.
    pub fn mark_persisted(&self, persisted: &Fragment) {
        let mut inner = self.inner.lock().unwrap();
        let mut updated = None;
        for f in inner.local.iter() {
            if (f.spec.begin, f.spec.end) == (persisted.begin, persisted.end) {
                let mut f = f.clone();
                f.spec.backing_store = persisted.backing_store.clone();
                f.spec.mod_time = persisted.mod_time;
                updated = Some(f);
                break;
            }
        }
        if let Some(f) = updated {
            inner.local.insert(f);
        }
    }

    /// Atomically swap the remote lane with a freshly listed set. Local
    /// fragments wholly covered by the new remote lane are dropped, their
    /// content now being served from a store.
    pub fn replace_remote(&self, set: FragmentSet) {
        let mut inner = self.inner.lock().unwrap();
        inner.remote = set;

        let retained: Vec<IndexFragment> = inner
            .local
            .iter()
            .filter(|f| !inner.remote.covers_range(f.spec.begin, f.spec.end))
            .cloned()
            .collect();
        if retained.len() != inner.local.len() {
            let mut local = FragmentSet::new();
            for f in retained {
                local.insert(f);
            }
            inner.local = local;
        }
        self.bump_head(&inner);
    }

    /// Locate the fragment serving |offset|. With |block|, waits for the
    /// write head to advance past |offset| (up to |timeout|, when given)
    /// before reporting it unavailable.
    pub async fn query(&self, offset: i64, block: bool, timeout: Option<Duration>) -> IndexQuery {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut rx = self.head_tx.subscribe();
        loop {
            if let Some(found) = self.try_query(offset) {
                return found;
            }
            let write_head = self.end_offset();
            if !block {
                return IndexQuery::NotYetAvailable { write_head };
            }

            let changed = rx.changed();
            let timed_out = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, changed).await.is_err(),
                None => changed.await.is_err(),
            };
            if timed_out {
                return IndexQuery::NotYetAvailable { write_head };
            }
        }
    }

    fn try_query(&self, offset: i64) -> Option<IndexQuery> {
        let inner = self.inner.lock().unwrap();
        let write_head = *self.head_tx.borrow();

        let best = match (inner.local.query(offset), inner.remote.query(offset)) {
            (SetQuery::Covered(l), SetQuery::Covered(r)) => {
                // Prefer resident content for equal coverage.
                Some(if r.spec.end > l.spec.end { r } else { l })
            }
            (SetQuery::Covered(l), _) => Some(l),
            (_, SetQuery::Covered(r)) => Some(r),
            (SetQuery::Ahead(l), SetQuery::Ahead(r)) => {
                Some(if r.spec.begin < l.spec.begin { r } else { l })
            }
            (SetQuery::Ahead(l), SetQuery::Beyond) => Some(l),
            (SetQuery::Beyond, SetQuery::Ahead(r)) => Some(r),
            (SetQuery::Beyond, SetQuery::Beyond) => None,
        };
        best.map(|f| IndexQuery::Found {
            fragment: f.clone(),
            write_head,
        })
    }

    /// The ordered union of both lanes, for fragment listings.
    pub fn snapshot(&self) -> (Vec<IndexFragment>, i64) {
        let inner = self.inner.lock().unwrap();
        let mut union = FragmentSet::new();
        for f in inner.local.iter() {
            union.insert(f.clone());
        }
        // Remote listings replace their equal-ranged local counterparts.
        for f in inner.remote.iter() {
            union.insert(f.clone());
        }
        let fragments = union.iter().cloned().collect();
        (fragments, *self.head_tx.borrow())
    }

    fn bump_head(&self, inner: &Inner) {
        let lanes = inner.local.end_offset().max(inner.remote.end_offset());
        self.head_tx.send_if_modified(|head| {
            if lanes > *head {
                *head = lanes;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(begin: i64, end: i64) -> IndexFragment {
        IndexFragment::remote(Fragment {
            journal: "j".to_string(),
            begin,
            end,
            ..Default::default()
        })
    }

    fn remote(begin: i64, end: i64) -> IndexFragment {
        let mut f = local(begin, end);
        f.spec.backing_store = "mem://x/".to_string();
        f.spec.mod_time = 100;
        f
    }

    fn remote_set(ranges: &[(i64, i64)]) -> FragmentSet {
        let mut set = FragmentSet::new();
        for (begin, end) in ranges {
            set.insert(remote(*begin, *end));
        }
        set
    }

    #[tokio::test]
    async fn end_offset_is_monotonic() {
        let index = FragmentIndex::new();
        assert_eq!(index.end_offset(), 0);

        index.insert_local(local(0, 100));
        assert_eq!(index.end_offset(), 100);

        index.replace_remote(remote_set(&[(0, 150)]));
        assert_eq!(index.end_offset(), 150);

        // A shrunken re-listing (as after retention pruning) never lowers
        // the head.
        index.replace_remote(remote_set(&[(0, 20)]));
        assert_eq!(index.end_offset(), 150);
    }

    #[tokio::test]
    async fn queries_union_both_lanes() {
        let index = FragmentIndex::new();
        index.insert_local(local(100, 200));
        index.replace_remote(remote_set(&[(0, 80)]));

        // Covered by the remote lane.
        match index.query(10, false, None).await {
            IndexQuery::Found { fragment, .. } => assert_eq!(fragment.spec.end, 80),
            _ => panic!("expected found"),
        }
        // A retention gap advances to the next local fragment.
        match index.query(90, false, None).await {
            IndexQuery::Found { fragment, .. } => assert_eq!(fragment.spec.begin, 100),
            _ => panic!("expected found"),
        }
        // At the write head.
        match index.query(200, false, None).await {
            IndexQuery::NotYetAvailable { write_head } => assert_eq!(write_head, 200),
            _ => panic!("expected not yet available"),
        }
    }

    #[tokio::test]
    async fn blocking_query_wakes_on_insert() {
        let index = FragmentIndex::new();
        index.insert_local(local(0, 42));

        let waiter = {
            let index = index.clone();
            tokio::spawn(async move { index.query(42, true, Some(Duration::from_secs(5))).await })
        };
        tokio::task::yield_now().await;

        index.insert_local(local(42, 50));
        match waiter.await.unwrap() {
            IndexQuery::Found { fragment, .. } => {
                assert_eq!((fragment.spec.begin, fragment.spec.end), (42, 50))
            }
            _ => panic!("expected found"),
        }
    }

    #[tokio::test]
    async fn blocking_query_times_out() {
        let index = FragmentIndex::new();
        match index.query(0, true, Some(Duration::from_millis(10))).await {
            IndexQuery::NotYetAvailable { write_head } => assert_eq!(write_head, 0),
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn remote_lane_absorbs_persisted_local_fragments() {
        let index = FragmentIndex::new();
        index.insert_local(local(0, 100));
        index.mark_persisted(&Fragment {
            journal: "j".to_string(),
            begin: 0,
            end: 100,
            backing_store: "mem://x/".to_string(),
            mod_time: 12345,
            ..Default::default()
        });

        let (fragments, _) = index.snapshot();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].spec.mod_time, 12345);

        // After the store listing reflects it, the local copy is dropped.
        index.replace_remote(remote_set(&[(0, 100)]));
        let (fragments, head) = index.snapshot();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].content.is_none());
        assert_eq!(head, 100);

        // An uncovered local fragment is retained.
        index.insert_local(local(100, 130));
        index.replace_remote(remote_set(&[(0, 100)]));
        let (fragments, _) = index.snapshot();
        assert_eq!(fragments.len(), 2);
    }
}
