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
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use journal_proto::header::Etcd;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    coord::{Compare, CoordStore, Event, EventType, KeyValue, RangeResponse, TxnOp, TxnResponse, WatchResponse},
    error::{Error, Result},
};

const BROADCAST_CAPACITY: usize = 256;

/// An in-memory coordination store: revisioned keys, prefix watches with
/// replay and progress notification, and compare-mod-revision
/// transactions.
#[derive(Clone)]
pub struct MemCoord {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    header: Etcd,
    kvs: BTreeMap<String, KeyValue>,
    // Every applied revision's events, for watch replay.
    history: Vec<(i64, Vec<Event>)>,
    broadcast: broadcast::Sender<WatchResponse>,
}

impl Default for MemCoord {
    fn default() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        MemCoord {
            inner: Arc::new(Mutex::new(Inner {
                header: Etcd {
                    cluster_id: 0xfeed,
                    member_id: 1,
                    revision: 1,
                    raft_term: 1,
                },
                kvs: BTreeMap::new(),
                history: Vec::new(),
                broadcast,
            })),
        }
    }
}

impl MemCoord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally put a key. Returns the applied revision.
    pub fn put(&self, key: &str, value: Bytes) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.apply(vec![TxnOp::Put {
            key: key.to_string(),
            value,
        }])
    }

    /// Unconditionally delete a key, if present. Returns the applied
    /// revision.
    pub fn delete(&self, key: &str) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if !inner.kvs.contains_key(key) {
            return inner.header.revision;
        }
        inner.apply(vec![TxnOp::Delete {
            key: key.to_string(),
        }])
    }

    pub fn revision(&self) -> i64 {
        self.inner.lock().unwrap().header.revision
    }

    pub fn mod_revision(&self, key: &str) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .kvs
            .get(key)
            .map(|kv| kv.mod_revision)
            .unwrap_or(0)
    }

    /// Emit a progress notification to all watchers, as an idle store
    /// would on its own cadence.
    pub fn notify_progress(&self) {
        let inner = self.inner.lock().unwrap();
        let _ = inner.broadcast.send(WatchResponse {
            header: inner.header.clone(),
            events: Vec::new(),
            progress_notify: true,
        });
    }
}

impl Inner {
    fn apply(&mut self, ops: Vec<TxnOp>) -> i64 {
        let revision = self.header.revision + 1;
        self.header.revision = revision;

        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    let create_revision = self
                        .kvs
                        .get(&key)
                        .map(|kv| kv.create_revision)
                        .unwrap_or(revision);
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision,
                        mod_revision: revision,
                    };
                    self.kvs.insert(key, kv.clone());
                    events.push(Event {
                        r#type: EventType::Put,
                        kv,
                    });
                }
                TxnOp::Delete { key } => {
                    if self.kvs.remove(&key).is_some() {
                        events.push(Event {
                            r#type: EventType::Delete,
                            kv: KeyValue {
                                key,
                                value: Bytes::new(),
                                create_revision: 0,
                                mod_revision: revision,
                            },
                        });
                    }
                }
            }
        }

        self.history.push((revision, events.clone()));
        let _ = self.broadcast.send(WatchResponse {
            header: self.header.clone(),
            events,
            progress_notify: false,
        });
        revision
    }
}

fn filter_events(events: &[Event], prefix: &str) -> Vec<Event> {
    events
        .iter()
        .filter(|ev| ev.kv.key.starts_with(prefix))
        .cloned()
        .collect()
}

#[async_trait::async_trait]
impl CoordStore for MemCoord {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse> {
        let inner = self.inner.lock().unwrap();
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(RangeResponse {
            header: inner.header.clone(),
            kvs,
        })
    }

    fn watch(&self, prefix: &str, from_revision: i64) -> BoxStream<'static, Result<WatchResponse>> {
        let prefix = prefix.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(BROADCAST_CAPACITY);

        // Subscribe and snapshot history under one lock, so replayed and
        // live responses neither race nor overlap.
        let (replay, header, mut live) = {
            let inner = self.inner.lock().unwrap();
            let replay: Vec<_> = inner
                .history
                .iter()
                .filter(|(rev, _)| *rev >= from_revision)
                .map(|(rev, events)| (*rev, filter_events(events, &prefix)))
                .collect();
            (replay, inner.header.clone(), inner.broadcast.subscribe())
        };

        tokio::spawn(async move {
            for (revision, events) in replay {
                if events.is_empty() {
                    continue;
                }
                let response = WatchResponse {
                    header: Etcd {
                        revision,
                        ..header.clone()
                    },
                    events,
                    progress_notify: false,
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(mut response) => {
                        response.events = filter_events(&response.events, &prefix);
                        if response.events.is_empty() && !response.progress_notify {
                            continue;
                        }
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Watchers restart from their last revision.
                        let _ = tx
                            .send(Err(Error::Coord(format!("watch lagged by {} responses", n))))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<TxnResponse> {
        let mut inner = self.inner.lock().unwrap();

        let succeeded = compares.iter().all(|cmp| {
            inner
                .kvs
                .get(&cmp.key)
                .map(|kv| kv.mod_revision)
                .unwrap_or(0)
                == cmp.mod_revision
        });
        if succeeded && !ops.is_empty() {
            inner.apply(ops);
        }
        Ok(TxnResponse {
            header: inner.header.clone(),
            succeeded,
        })
    }
}
