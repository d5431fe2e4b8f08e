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

//! Fragment store abstractions and implementations.
//!
//! [`FragmentStore`] is the interface a backing object store implements:
//! persist, open, list, sign, and remove content-addressed fragment
//! objects. Built-in drivers cover the `mem` and `file` schemes; a
//! [`StoreRegistry`] dispatches on the scheme of a fragment's backing
//! store URL.

mod codec;
mod error;
mod file;
mod mem;

use std::{collections::HashMap, sync::Arc, time::Duration};

pub use async_trait::async_trait;
use bytes::Bytes;
use journal_proto::Fragment;

pub use self::{
    codec::{compress, decompress},
    error::{Error, Result},
    file::FileStore,
    mem::MemStore,
};

/// An interface to a backing store of fragment objects.
///
/// Object paths are derived from fragment metadata (see
/// [`Fragment::content_path`]) and rooted at the fragment's
/// `backing_store` URL, which drivers interpret.
#[async_trait]
pub trait FragmentStore: Send + Sync + 'static {
    /// Persist the compressed |content| of |fragment| at its content path.
    /// Returns the modification time of the stored object. Persisting an
    /// object which already exists is a no-op (names are content
    /// addressed).
    async fn persist(&self, fragment: &Fragment, content: Bytes) -> Result<i64>;

    /// Open the raw (compressed) object of a persisted fragment.
    async fn open(&self, fragment: &Fragment) -> Result<Bytes>;

    /// List fragments of |journal| persisted under the |store| URL.
    async fn list(&self, store: &str, journal: &str) -> Result<Vec<Fragment>>;

    /// A pre-signed GET URL for the fragment's object, valid for |ttl|.
    async fn sign_get(&self, fragment: &Fragment, ttl: Duration) -> Result<String>;

    /// Remove the fragment's object.
    async fn remove(&self, fragment: &Fragment) -> Result<()>;
}

/// Maps store URL schemes to drivers.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    drivers: HashMap<String, Arc<dyn FragmentStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, driver: Arc<dyn FragmentStore>) {
        self.drivers.insert(scheme.to_string(), driver);
    }

    pub fn for_url(&self, url: &str) -> Result<Arc<dyn FragmentStore>> {
        let scheme = url
            .split_once("://")
            .map(|(s, _)| s)
            .ok_or_else(|| Error::UnknownScheme(url.to_string()))?;
        self.drivers
            .get(scheme)
            .cloned()
            .ok_or_else(|| Error::UnknownScheme(url.to_string()))
    }

    /// Compress and persist uncompressed spool |content|, returning the
    /// fragment updated with its modification time.
    pub async fn persist(&self, mut fragment: Fragment, content: Bytes) -> Result<Fragment> {
        let driver = self.for_url(&fragment.backing_store)?;
        let compressed = compress(fragment.codec(), &content)?;
        fragment.mod_time = driver.persist(&fragment, compressed).await?;
        Ok(fragment)
    }

    /// Open a persisted fragment and return its decompressed content.
    pub async fn open_decoded(&self, fragment: &Fragment) -> Result<Bytes> {
        let driver = self.for_url(&fragment.backing_store)?;
        let raw = driver.open(fragment).await?;
        decompress(fragment.codec(), &raw)
    }

    pub async fn list(&self, store: &str, journal: &str) -> Result<Vec<Fragment>> {
        self.for_url(store)?.list(store, journal).await
    }

    pub async fn sign_get(&self, fragment: &Fragment, ttl: Duration) -> Result<String> {
        self.for_url(&fragment.backing_store)?
            .sign_get(fragment, ttl)
            .await
    }

    pub async fn remove(&self, fragment: &Fragment) -> Result<()> {
        self.for_url(&fragment.backing_store)?.remove(fragment).await
    }
}

/// Full object URL of a fragment: its backing store root joined with its
/// content path.
pub fn object_url(fragment: &Fragment) -> String {
    format!("{}{}", fragment.backing_store, fragment.content_path())
}
