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

use journal_proto::CompressionCodec;
use tokio::sync::{mpsc, watch, Mutex};

use crate::{
    fragment::{FragmentIndex, Spool},
    pipeline::Pipeline,
};

/// Per-journal local state of this broker: the spool, the fragment index,
/// and (while primary) the replication pipeline. A Replica is created when
/// a local assignment appears in the keyspace, and cancelled when it
/// vanishes; in-flight operations hold it alive through their Arc.
pub struct Replica {
    pub journal: String,
    pub index: FragmentIndex,
    pub spool: Mutex<Spool>,
    /// The active pipeline while this broker is primary. The lock is the
    /// admission point serializing Appends.
    pub pipeline: Mutex<Option<Pipeline>>,

    cancel_tx: watch::Sender<bool>,
    pulse_tx: mpsc::Sender<()>,
}

impl Replica {
    /// A new Replica, and the receiver of its pipeline health-check
    /// signals.
    pub fn new(journal: &str, codec: CompressionCodec) -> (Arc<Replica>, mpsc::Receiver<()>) {
        let (pulse_tx, pulse_rx) = mpsc::channel(1);
        let replica = Arc::new(Replica {
            journal: journal.to_string(),
            index: FragmentIndex::new(),
            spool: Mutex::new(Spool::new(journal, 0, codec)),
            pipeline: Mutex::new(None),
            cancel_tx: watch::channel(false).0,
            pulse_tx,
        });
        (replica, pulse_rx)
    }

    /// Signal teardown. The maintenance loop closes the pipeline and
    /// returns; the spool is discarded with the final Arc.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves when the replica is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Request an on-demand pipeline health check.
    pub fn pulse(&self) {
        let _ = self.pulse_tx.try_send(());
    }
}
