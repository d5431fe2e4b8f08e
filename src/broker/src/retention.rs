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

//! Retention pruning: selection and removal of persisted fragments which
//! have outlived their JournalSpec retention.

use journal_proto::{duration_from_proto, Fragment, JournalSpec};
use journal_store::StoreRegistry;

use crate::error::Result;

/// Fragments of |fragments| whose persisted age, as of the Unix time
/// |now|, meets or exceeds the spec's retention. An unset retention is
/// zero, so every persisted fragment of such a journal is immediately
/// eligible. Fragments resident only in a local spool are never
/// selected.
pub fn aged_fragments(spec: &JournalSpec, fragments: &[Fragment], now: i64) -> Vec<Fragment> {
    let retention = duration_from_proto(
        spec.fragment
            .as_ref()
            .and_then(|f| f.retention.as_ref()),
    );

    fragments
        .iter()
        .filter(|f| !f.backing_store.is_empty() && now - f.mod_time >= retention.as_secs() as i64)
        .cloned()
        .collect()
}

/// One prune iteration: remove every aged fragment's object from its
/// backing store. The fragment index reflects the removals after its next
/// remote refresh. Returns the pruned fragments.
pub async fn prune_journal(
    stores: &StoreRegistry,
    spec: &JournalSpec,
    fragments: &[Fragment],
    now: i64,
) -> Result<Vec<Fragment>> {
    let aged = aged_fragments(spec, fragments, now);
    for fragment in &aged {
        stores.remove(fragment).await?;
        tracing::info!(
            journal = %fragment.journal,
            name = %fragment.content_name(),
            mod_time = fragment.mod_time,
            "pruned fragment",
        );
    }
    Ok(aged)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use journal_proto::{CompressionCodec, Sha1Sum};
    use journal_store::{FragmentStore, MemStore};

    use super::*;

    fn spec_with_retention(secs: i64) -> JournalSpec {
        JournalSpec {
            name: "r".to_string(),
            replication: 1,
            labels: None,
            fragment: Some(journal_proto::journal_spec::Fragment {
                length: 1 << 20,
                compression_codec: CompressionCodec::None as i32,
                stores: vec!["mem://stores/one/".to_string()],
                refresh_interval: None,
                retention: (secs > 0).then(|| journal_proto::duration_to_proto(
                    std::time::Duration::from_secs(secs as u64),
                )),
                flush_interval: None,
            }),
            flags: 0,
        }
    }

    fn fragment(begin: i64, end: i64, mod_time: i64, persisted: bool) -> Fragment {
        Fragment {
            journal: "r".to_string(),
            begin,
            end,
            sum: Some(Sha1Sum::default()),
            compression_codec: CompressionCodec::None as i32,
            backing_store: if persisted {
                "mem://stores/one/".to_string()
            } else {
                String::new()
            },
            mod_time,
        }
    }

    #[test]
    fn selection_respects_retention_and_persistence() {
        let now = 10_000;
        let spec = spec_with_retention(3600);
        let fragments = vec![
            fragment(0, 5, now - 3 * 3600, true),  // Three hours old.
            fragment(5, 9, now - 1800, true),      // Thirty minutes old.
            fragment(9, 12, now - 3 * 3600, false), // Old, but never persisted.
        ];

        let aged = aged_fragments(&spec, &fragments, now);
        assert_eq!(aged.len(), 1);
        assert_eq!((aged[0].begin, aged[0].end), (0, 5));

        // Without a configured retention, every persisted fragment is
        // immediately eligible; the unpersisted one still is not.
        let aged = aged_fragments(&spec_with_retention(0), &fragments, now);
        assert_eq!(aged.len(), 2);
        assert!(aged.iter().all(|f| !f.backing_store.is_empty()));
    }

    #[tokio::test]
    async fn prune_removes_objects() {
        let store = MemStore::new();
        let mut registry = StoreRegistry::new();
        registry.register("mem", Arc::new(store.clone()));

        let old = fragment(0, 5, 0, true);
        let new = fragment(5, 9, 0, true);
        store.persist(&old, Bytes::from_static(b"hello")).await.unwrap();
        store.persist(&new, Bytes::from_static(b"word")).await.unwrap();

        // Listing supplies true mod times; age the first fragment.
        let listed = store.list("mem://stores/one/", "r").await.unwrap();
        let now = listed[0].mod_time + 2 * 3600;
        let mut aged_input = listed.clone();
        aged_input[1].mod_time = now; // The second is brand new.

        let pruned = prune_journal(&registry, &spec_with_retention(3600), &aged_input, now)
            .await
            .unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!((pruned[0].begin, pruned[0].end), (0, 5));

        // Only the young fragment survives in the store listing.
        let listed = store.list("mem://stores/one/", "r").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!((listed[0].begin, listed[0].end), (5, 9));
    }
}
