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
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use journal_proto::{parse_content_name, Fragment};

use crate::{async_trait, object_url, Error, FragmentStore, Result};

/// An in-memory fragment store, for tests and demos. Objects are keyed on
/// their full object URL, so one instance can serve many `mem://` roots.
#[derive(Clone, Default)]
pub struct MemStore {
    objects: Arc<Mutex<BTreeMap<String, (Bytes, i64)>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fragment: &Fragment) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&object_url(fragment))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[async_trait]
impl FragmentStore for MemStore {
    async fn persist(&self, fragment: &Fragment, content: Bytes) -> Result<i64> {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects
            .entry(object_url(fragment))
            .or_insert_with(|| (content, unix_now()));
        Ok(entry.1)
    }

    async fn open(&self, fragment: &Fragment) -> Result<Bytes> {
        let url = object_url(fragment);
        self.objects
            .lock()
            .unwrap()
            .get(&url)
            .map(|(content, _)| content.clone())
            .ok_or(Error::NotFound(url))
    }

    async fn list(&self, store: &str, journal: &str) -> Result<Vec<Fragment>> {
        let prefix = format!("{}{}/", store, journal);
        let objects = self.objects.lock().unwrap();

        let mut fragments = Vec::new();
        for (url, (_, mod_time)) in objects.range(prefix.clone()..) {
            let name = match url.strip_prefix(&prefix) {
                Some(name) => name,
                None => break,
            };
            // Nested journals share the prefix but not the parent's listing.
            if name.contains('/') {
                continue;
            }
            match parse_content_name(journal, name) {
                Some(mut fragment) => {
                    fragment.backing_store = store.to_string();
                    fragment.mod_time = *mod_time;
                    fragments.push(fragment);
                }
                None => tracing::warn!(%url, "skipping unparseable fragment object"),
            }
        }
        Ok(fragments)
    }

    async fn sign_get(&self, fragment: &Fragment, ttl: Duration) -> Result<String> {
        Ok(format!(
            "{}?expires={}",
            object_url(fragment),
            unix_now() + ttl.as_secs() as i64,
        ))
    }

    async fn remove(&self, fragment: &Fragment) -> Result<()> {
        let url = object_url(fragment);
        match self.objects.lock().unwrap().remove(&url) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(url)),
        }
    }
}

#[cfg(test)]
mod tests {
    use journal_proto::{CompressionCodec, Sha1Sum};

    use super::*;

    fn fragment(journal: &str, begin: i64, end: i64) -> Fragment {
        Fragment {
            journal: journal.to_string(),
            begin,
            end,
            sum: Some(Sha1Sum::default()),
            compression_codec: CompressionCodec::None as i32,
            backing_store: "mem://stores/one/".to_string(),
            mod_time: 0,
        }
    }

    #[tokio::test]
    async fn persist_list_remove() {
        let store = MemStore::new();
        let f1 = fragment("j", 0, 5);
        let f2 = fragment("j", 5, 9);
        let nested = fragment("j/nested", 0, 3);

        store.persist(&f1, Bytes::from_static(b"hello")).await.unwrap();
        store.persist(&f2, Bytes::from_static(b"world")).await.unwrap();
        store.persist(&nested, Bytes::from_static(b"abc")).await.unwrap();

        let listed = store.list("mem://stores/one/", "j").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].begin, 0);
        assert_eq!(listed[1].begin, 5);
        assert!(listed.iter().all(|f| f.mod_time > 0));
        assert!(listed.iter().all(|f| f.backing_store == "mem://stores/one/"));

        assert_eq!(store.open(&f1).await.unwrap(), Bytes::from_static(b"hello"));

        store.remove(&f1).await.unwrap();
        assert!(store.open(&f1).await.is_err());
        assert_eq!(store.list("mem://stores/one/", "j").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_is_idempotent() {
        let store = MemStore::new();
        let f = fragment("j", 0, 5);
        let t1 = store.persist(&f, Bytes::from_static(b"hello")).await.unwrap();
        let t2 = store.persist(&f, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(t1, t2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn signed_urls_carry_expiry() {
        let store = MemStore::new();
        let f = fragment("j", 0, 5);
        let url = store.sign_get(&f, Duration::from_secs(60)).await.unwrap();
        assert!(url.starts_with("mem://stores/one/j/"));
        assert!(url.contains("?expires="));
    }
}
