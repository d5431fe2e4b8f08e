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

//! A local mirror of a decoded, prefixed portion of the coordination
//! store's key space, kept in sync through long-lived watches.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Mutex as StdMutex,
    time::Duration,
};

use journal_proto::header::Etcd;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tokio_stream::StreamExt as _;

use crate::{
    coord::{CoordStore, Event, EventType, KeyValue, WatchResponse},
    error::{Error, Result},
};

/// Default duration for which watch responses are allowed to queue before
/// being applied as one batched update.
pub const DEFAULT_APPLY_DELAY: Duration = Duration::from_millis(30);

const WATCH_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Decodes a raw key-value into its typed representation.
pub type DecodeFn<V> = Box<dyn Fn(&KeyValue) -> Result<V> + Send + Sync>;

/// Observers run after each state update, while the exclusive lock is
/// still held. They must not re-enter the KeySpace.
pub type Observer<V> = Box<dyn Fn(&State<V>) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Entry<V> {
    pub key: String,
    pub decoded: V,
    pub create_revision: i64,
    pub mod_revision: i64,
}

/// The mirrored state: decoded entries ordered on key, at exactly the
/// revision of |header|.
#[derive(Default)]
pub struct State<V> {
    pub header: Etcd,
    pub entries: Vec<Entry<V>>,
}

impl<V> State<V> {
    pub fn search(&self, key: &str) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_str().cmp(key))
    }

    /// Entries whose keys begin with |prefix|.
    pub fn prefixed(&self, prefix: &str) -> &[Entry<V>] {
        let begin = match self.search(prefix) {
            Ok(i) | Err(i) => i,
        };
        let end = begin
            + self.entries[begin..]
                .iter()
                .take_while(|e| e.key.starts_with(prefix))
                .count();
        &self.entries[begin..end]
    }
}

/// A revision-consistent local mirror of the coordination-store keys under
/// a root prefix. Readers acquire the shared lock via [`KeySpace::read`];
/// updates run under the exclusive lock and invoke observers before any
/// reader can observe the new state.
pub struct KeySpace<V> {
    root: String,
    apply_delay: Duration,
    decode: DecodeFn<V>,
    state: RwLock<State<V>>,
    observers: StdMutex<Vec<Observer<V>>>,
    update_tx: watch::Sender<i64>,
}

impl<V: Clone + Send + Sync + 'static> KeySpace<V> {
    /// A KeySpace rooted at |root|, which must be a cleaned, rooted path
    /// without a trailing separator.
    pub fn new(root: &str, decode: DecodeFn<V>) -> Self {
        assert!(
            root.starts_with('/') && !root.ends_with('/') && !root.contains("//"),
            "root {:?} is not a cleaned path",
            root,
        );
        KeySpace {
            root: root.to_string(),
            apply_delay: DEFAULT_APPLY_DELAY,
            decode,
            state: RwLock::new(State {
                header: Etcd::default(),
                entries: Vec::new(),
            }),
            observers: StdMutex::new(Vec::new()),
            update_tx: watch::channel(0).0,
        }
    }

    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn prefix(&self) -> String {
        format!("{}/", self.root)
    }

    /// Register an observer. Observers are invoked in registration order
    /// upon each update, within the exclusive-lock critical section, so
    /// state they derive appears atomically to readers of the KeySpace.
    pub fn observe(&self, observer: Observer<V>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Acquire the shared lock over the mirrored state.
    pub async fn read(&self) -> RwLockReadGuard<'_, State<V>> {
        self.state.read().await
    }

    /// Acquire the shared lock once the state has reached |revision|.
    /// The shared lock is released and re-acquired across each wait.
    pub async fn read_through(&self, revision: i64) -> RwLockReadGuard<'_, State<V>> {
        let mut rx = self.update_tx.subscribe();
        loop {
            let guard = self.state.read().await;
            if guard.header.revision >= revision {
                return guard;
            }
            drop(guard);
            // The sender lives as long as self; changed cannot fail.
            if rx.changed().await.is_err() {
                return self.state.read().await;
            }
        }
    }

    /// Load a snapshot of the prefixed key space at the store's current
    /// revision, replacing any prior state.
    pub async fn load(&self, coord: &dyn CoordStore) -> Result<()> {
        let resp = coord.get_prefix(&self.prefix()).await?;

        let mut entries = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            match (self.decode)(kv) {
                Ok(decoded) => entries.push(Entry {
                    key: kv.key.clone(),
                    decoded,
                    create_revision: kv.create_revision,
                    mod_revision: kv.mod_revision,
                }),
                Err(err) => {
                    tracing::error!(key = %kv.key, %err, "key/value decode failed while loading")
                }
            }
        }

        let mut state = self.state.write().await;
        state.header = resp.header;
        state.entries = entries;
        self.on_update(&state);
        Ok(())
    }

    /// Watch the loaded KeySpace and apply updates as they arrive, until
    /// a fatal inconsistency occurs. Transient watch failures restart the
    /// watch from the last applied revision. Responses arriving in close
    /// succession are coalesced into a single update, amortizing observer
    /// notifications.
    pub async fn watch(&self, coord: &dyn CoordStore) -> Result<()> {
        loop {
            let from = self.read().await.header.revision + 1;
            let mut stream = coord.watch(&self.prefix(), from);

            // The first response of a burst starts the apply-delay clock;
            // all responses queued by its expiry apply as one update.
            let mut queued: Vec<WatchResponse> = Vec::new();
            let mut apply_at = tokio::time::Instant::now();
            let restart = loop {
                if queued.is_empty() {
                    match stream.next().await {
                        Some(Ok(resp)) => {
                            apply_at = tokio::time::Instant::now() + self.apply_delay;
                            queued.push(resp);
                        }
                        Some(Err(err)) => break err,
                        None => break Error::Coord("watch stream closed".to_string()),
                    }
                    continue;
                }
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(resp)) => queued.push(resp),
                        Some(Err(err)) => break err,
                        None => break Error::Coord("watch stream closed".to_string()),
                    },
                    _ = tokio::time::sleep_until(apply_at) => {
                        self.apply(std::mem::take(&mut queued)).await?;
                    }
                }
            };

            tracing::warn!(err = %restart, "journal keyspace watch failed (will restart)");
            tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
        }
    }

    /// Apply one or more watch responses to the KeySpace. Only
    /// unrecoverable inconsistencies are returned as errors; per-key
    /// decode failures are logged and the key is dropped. Exported in
    /// support of test fixtures; concurrent calls must not be made.
    pub async fn apply(&self, mut responses: Vec<WatchResponse>) -> Result<()> {
        let mut hdr = Etcd::default();
        for resp in &mut responses {
            patch_header(&mut hdr, &resp.header, false)?;
            // Events arrive ordered on ascending mod revision. Order on
            // key, preserving relative mod-revision order per key.
            resp.events.sort_by(|a, b| a.kv.key.cmp(&b.kv.key));
        }

        // Heap responses on the (key, mod revision) of their next event,
        // and merge-walk them against the current sorted entries.
        let mut heap = BinaryHeap::new();
        for resp in &responses {
            if !resp.events.is_empty() {
                heap.push(HeapedEvents {
                    events: resp.events.clone(),
                    cursor: 0,
                });
            }
        }

        let current: Vec<Entry<V>> = self.state.read().await.entries.clone();
        let mut next: Vec<Entry<V>> = Vec::with_capacity(current.len() + 8);
        let mut consumed = 0;

        while let Some(mut top) = heap.pop() {
            let ev = top.events[top.cursor].clone();
            top.cursor += 1;
            if top.cursor < top.events.len() {
                heap.push(top);
            }

            // Copy unmodified keys through a current value of this key,
            // then patch the tail of |next| with the event.
            let ind = match current[consumed..]
                .binary_search_by(|e| e.key.as_str().cmp(ev.kv.key.as_str()))
            {
                Ok(i) => consumed + i + 1,
                Err(i) => consumed + i,
            };
            next.extend_from_slice(&current[consumed..ind]);
            consumed = ind;

            self.update_tail(&mut next, &ev);
        }
        next.extend_from_slice(&current[consumed..]);

        // Critical section: patch the header, swap in rebuilt entries, and
        // notify observers.
        let mut state = self.state.write().await;

        // Revision must be strictly increasing, except that an idle store
        // sends progress notifications which repeat the last revision.
        let expect_same = responses.len() == 1
            && responses[0].progress_notify
            && state.header.revision == hdr.revision;

        patch_header(&mut state.header, &hdr, expect_same)?;
        state.entries = next;
        self.on_update(&state);
        Ok(())
    }

    fn update_tail(&self, next: &mut Vec<Entry<V>>, ev: &Event) {
        let tail_matches = next.last().map(|e| e.key == ev.kv.key).unwrap_or(false);
        match ev.r#type {
            EventType::Put => match (self.decode)(&ev.kv) {
                Ok(decoded) => {
                    let entry = Entry {
                        key: ev.kv.key.clone(),
                        decoded,
                        create_revision: ev.kv.create_revision,
                        mod_revision: ev.kv.mod_revision,
                    };
                    if tail_matches {
                        *next.last_mut().unwrap() = entry;
                    } else {
                        next.push(entry);
                    }
                }
                Err(err) => {
                    tracing::error!(key = %ev.kv.key, %err, "inconsistent watched key/value event");
                    if tail_matches {
                        next.pop();
                    }
                }
            },
            EventType::Delete => {
                if tail_matches {
                    next.pop();
                } else {
                    tracing::error!(key = %ev.kv.key, "watched deletion of an absent key");
                }
            }
        }
    }

    fn on_update(&self, state: &State<V>) {
        for observer in self.observers.lock().unwrap().iter() {
            observer(state);
        }
        self.update_tx.send_replace(state.header.revision);
    }
}

/// Patch |h| with an |update| header, verifying consistency: the cluster
/// id may never change once set, and the revision must advance (or hold,
/// when |allow_same|).
fn patch_header(h: &mut Etcd, update: &Etcd, allow_same: bool) -> Result<()> {
    if h.cluster_id != 0 && h.cluster_id != update.cluster_id {
        return Err(Error::ClusterIdMismatch {
            expected: h.cluster_id,
            actual: update.cluster_id,
        });
    }
    if allow_same && update.revision < h.revision {
        return Err(Error::RevisionMismatch {
            expected_relation: ">=",
            expected: h.revision,
            actual: update.revision,
        });
    }
    if !allow_same && update.revision <= h.revision {
        return Err(Error::RevisionMismatch {
            expected_relation: ">",
            expected: h.revision,
            actual: update.revision,
        });
    }
    if h.cluster_id != 0 && (h.member_id != update.member_id || h.raft_term != update.raft_term) {
        tracing::info!(
            member_id = h.member_id,
            raft_term = h.raft_term,
            update_member_id = update.member_id,
            update_raft_term = update.raft_term,
            "etcd member id / raft term changed",
        );
    }
    *h = update.clone();
    Ok(())
}

struct HeapedEvents {
    events: Vec<Event>,
    cursor: usize,
}

impl HeapedEvents {
    fn head(&self) -> (&str, i64) {
        let kv = &self.events[self.cursor].kv;
        (kv.key.as_str(), kv.mod_revision)
    }
}

impl PartialEq for HeapedEvents {
    fn eq(&self, other: &Self) -> bool {
        self.head() == other.head()
    }
}
impl Eq for HeapedEvents {}

impl Ord for HeapedEvents {
    // Inverted: BinaryHeap is a max-heap, and the merge wants the least
    // (key, mod revision) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.head().cmp(&self.head())
    }
}
impl PartialOrd for HeapedEvents {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
