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

//! The coordination-store interface: a watchable, revisioned key-value
//! store recording journal specs and broker assignments. The broker is
//! written against this interface alone; [`mem::MemCoord`] is the built-in
//! implementation backing tests and demos.

mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use journal_proto::header::Etcd;

use crate::error::Result;

pub use self::mem::MemCoord;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: i64,
    pub mod_revision: i64,
}

#[derive(Clone, Debug)]
pub struct RangeResponse {
    pub header: Etcd,
    pub kvs: Vec<KeyValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single key mutation. For deletions, |kv| carries the deleted key with
/// an empty value and the revision of the deletion.
#[derive(Clone, Debug)]
pub struct Event {
    pub r#type: EventType,
    pub kv: KeyValue,
}

#[derive(Clone, Debug)]
pub struct WatchResponse {
    pub header: Etcd,
    pub events: Vec<Event>,
    /// A progress notification: no events, only a refreshed revision.
    pub progress_notify: bool,
}

/// A transaction precondition: the key's current mod revision must equal
/// |revision| (zero expects the key to not exist).
#[derive(Clone, Debug)]
pub struct Compare {
    pub key: String,
    pub mod_revision: i64,
}

#[derive(Clone, Debug)]
pub enum TxnOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

#[derive(Clone, Debug)]
pub struct TxnResponse {
    pub header: Etcd,
    pub succeeded: bool,
}

/// The watchable, revisioned key-value interface required of the
/// coordination store.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Range over all keys under |prefix|, at the current revision.
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse>;

    /// Watch keys under |prefix| beginning at |from_revision|, with
    /// progress notifications on an otherwise idle prefix. The stream ends
    /// or yields an error on transient disconnection; callers restart it
    /// from their last observed revision.
    fn watch(&self, prefix: &str, from_revision: i64) -> BoxStream<'static, Result<WatchResponse>>;

    /// Atomically evaluate |compares| and, if every one holds, apply |ops|.
    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<TxnResponse>;
}
