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

//! The broker Service: it drives local journal handling in response to
//! keyspace updates, powers journal resolution, and implements the wire
//! protocol's six operations.

mod admin;
mod append;
mod read;
mod replicate;

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use journal_proto::{process_spec::Id, v1 as pb, CompressionCodec, JournalSpec};
use journal_store::StoreRegistry;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::{
    allocator::{self, AllocItem, Allocator},
    coord::CoordStore,
    error::Result,
    fragment::{FragmentIndex, FragmentSet, IndexFragment},
    keyspace::KeySpace,
    replica::Replica,
    resolver::{ReplicaFactory, Resolution, ResolveArgs, Resolver},
};

/// Interval between unsolicited pipeline health checks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

// Fallbacks for JournalSpecs which leave intervals unset.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const REFRESH_RETRY_INTERVAL: Duration = Duration::from_secs(10);

const PERSIST_ATTEMPTS: usize = 5;
const PERSIST_RETRY_BACKOFF: Duration = Duration::from_secs(2);

pub struct Config {
    /// This broker's process ID.
    pub id: Id,
    /// Keyspace root prefix.
    pub root: String,
    /// Coalescing window for keyspace watch responses.
    pub apply_delay: Duration,
    pub health_check_interval: Duration,
}

struct Inner {
    id: Id,
    keyspace: KeySpace<AllocItem>,
    alloc: Allocator,
    resolver: Arc<Resolver>,
    coord: Arc<dyn CoordStore>,
    stores: StoreRegistry,
    root: String,
    health_check_interval: Duration,
}

#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(cfg: Config, coord: Arc<dyn CoordStore>, stores: StoreRegistry) -> Service {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let keyspace = KeySpace::new(&cfg.root, allocator::decoder(&cfg.root))
                .with_apply_delay(cfg.apply_delay);
            let alloc = Allocator::new();
            keyspace.observe(alloc.observer(cfg.root.clone()));

            let factory: ReplicaFactory = {
                let weak = weak.clone();
                Box::new(move |spec: &JournalSpec| {
                    let codec = spec
                        .fragment
                        .as_ref()
                        .map(|f| CompressionCodec::from(f.compression_codec))
                        .unwrap_or(CompressionCodec::None);
                    let (replica, pulse_rx) = Replica::new(&spec.name, codec);
                    if let Some(inner) = weak.upgrade() {
                        let svc = Service { inner };
                        tokio::spawn(svc.maintenance_loop(replica.clone(), pulse_rx));
                    }
                    replica
                })
            };
            let resolver = Resolver::new(cfg.id.clone(), alloc.clone(), factory);
            keyspace.observe(resolver.observer());

            Inner {
                id: cfg.id,
                keyspace,
                alloc,
                resolver,
                coord,
                stores,
                root: cfg.root,
                health_check_interval: cfg.health_check_interval,
            }
        });
        Service { inner }
    }

    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    pub fn keyspace(&self) -> &KeySpace<AllocItem> {
        &self.inner.keyspace
    }

    pub fn into_service(self) -> pb::journal_server::JournalServer<Service> {
        pb::journal_server::JournalServer::new(self)
    }

    /// Load the keyspace mirror and serve local assignments reflected in
    /// it, until a fatal inconsistency occurs.
    pub async fn watch(&self) -> Result<()> {
        self.inner.keyspace.load(self.inner.coord.as_ref()).await?;
        self.inner.keyspace.watch(self.inner.coord.as_ref()).await
    }

    pub(crate) async fn resolve(&self, args: ResolveArgs) -> Resolution {
        self.inner.resolver.resolve(&self.inner.keyspace, args).await
    }

    pub(crate) fn stores(&self) -> &StoreRegistry {
        &self.inner.stores
    }

    pub(crate) fn coord(&self) -> &Arc<dyn CoordStore> {
        &self.inner.coord
    }

    pub(crate) fn alloc(&self) -> &Allocator {
        &self.inner.alloc
    }

    pub(crate) fn root(&self) -> &str {
        &self.inner.root
    }

    /// Periodic per-replica tasks: refreshing remote fragment listings on
    /// the spec's cadence, and checking pipeline health on a timer and
    /// on demand.
    async fn maintenance_loop(self, replica: Arc<Replica>, mut pulse_rx: mpsc::Receiver<()>) {
        let mut refresh_at = tokio::time::Instant::now();
        let mut ping = tokio::time::interval(self.inner.health_check_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = replica.cancelled() => {
                    // Drop the pipeline; its streams close with it.
                    replica.pipeline.lock().await.take();
                    return;
                }
                _ = tokio::time::sleep_until(refresh_at) => {
                    let interval = self.refresh_fragments(&replica).await;
                    refresh_at = tokio::time::Instant::now() + interval;
                }
                _ = ping.tick() => self.check_health(&replica).await,
                Some(_) = pulse_rx.recv() => self.check_health(&replica).await,
            }
        }
    }

    /// Re-list the journal's backing stores and union the result into the
    /// replica's fragment index. Returns the interval until the next
    /// refresh.
    async fn refresh_fragments(&self, replica: &Replica) -> Duration {
        let res = self
            .resolve(ResolveArgs {
                journal: replica.journal.clone(),
                ..Default::default()
            })
            .await;
        if res.status != pb::Status::Ok {
            tracing::warn!(
                journal = %replica.journal,
                status = ?res.status,
                "refreshing fragments: failed to resolve",
            );
            return REFRESH_RETRY_INTERVAL;
        }
        let fragment_cfg = res.spec.and_then(|s| s.fragment).unwrap_or_default();

        let mut set = FragmentSet::new();
        for store in &fragment_cfg.stores {
            match self.inner.stores.list(store, &replica.journal).await {
                Ok(listed) => {
                    for fragment in listed {
                        set.insert(IndexFragment::remote(fragment));
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        journal = %replica.journal,
                        %store,
                        %err,
                        "failed to refresh remote fragments (will retry)",
                    );
                    return REFRESH_RETRY_INTERVAL;
                }
            }
        }
        replica.index.replace_remote(set);

        let interval = journal_proto::duration_from_proto(fragment_cfg.refresh_interval.as_ref());
        if interval.is_zero() {
            DEFAULT_REFRESH_INTERVAL
        } else {
            interval
        }
    }

    /// Verify the replication pipeline while this broker is primary.
    /// `NOT_JOURNAL_PRIMARY_BROKER` is the benign replica-side outcome.
    async fn check_health(&self, replica: &Arc<Replica>) {
        let res = self
            .resolve(ResolveArgs {
                journal: replica.journal.clone(),
                require_primary: true,
                require_full_assignment: true,
                ..Default::default()
            })
            .await;
        match res.status {
            pb::Status::NotJournalPrimaryBroker => (),
            pb::Status::Ok => {
                let mut slot = replica.pipeline.lock().await;
                if let Err(err) = append::ensure_pipeline(self, replica, &res, &mut slot).await {
                    tracing::warn!(
                        journal = %replica.journal,
                        ?err,
                        "pipeline health check failed (will retry)",
                    );
                }
            }
            status => {
                tracing::warn!(
                    journal = %replica.journal,
                    ?status,
                    "pipeline health check failed (will retry)",
                );
            }
        }
    }

    /// Persist a frozen spool fragment to the spec's first backing store,
    /// in the background. Specs without stores keep content resident.
    pub(crate) fn spawn_persist(
        &self,
        spec: &JournalSpec,
        frozen: IndexFragment,
        index: FragmentIndex,
    ) {
        let stores = spec
            .fragment
            .as_ref()
            .map(|f| f.stores.clone())
            .unwrap_or_default();
        let Some(store) = stores.first().cloned() else {
            return;
        };
        let registry = self.inner.stores.clone();

        tokio::spawn(async move {
            let mut fragment = frozen.spec.clone();
            fragment.backing_store = store;

            let content = match frozen.content.as_ref() {
                Some(handle) => {
                    match handle.read(fragment.begin, (fragment.end - fragment.begin) as usize) {
                        Ok(content) => content,
                        Err(err) => {
                            tracing::error!(?fragment, %err, "failed to read frozen spool content");
                            return;
                        }
                    }
                }
                None => return,
            };

            for attempt in 1..=PERSIST_ATTEMPTS {
                match registry.persist(fragment.clone(), content.clone()).await {
                    Ok(persisted) => {
                        tracing::info!(
                            journal = %persisted.journal,
                            name = %persisted.content_name(),
                            "persisted fragment",
                        );
                        index.mark_persisted(&persisted);
                        return;
                    }
                    Err(err) if attempt < PERSIST_ATTEMPTS => {
                        tracing::warn!(%err, attempt, "fragment persist failed (will retry)");
                        tokio::time::sleep(PERSIST_RETRY_BACKOFF).await;
                    }
                    Err(err) => {
                        tracing::error!(%err, "fragment persist failed; dropping spool");
                        return;
                    }
                }
            }
        });
    }
}

#[tonic::async_trait]
impl pb::journal_server::Journal for Service {
    async fn list(
        &self,
        request: Request<pb::ListRequest>,
    ) -> std::result::Result<Response<pb::ListResponse>, Status> {
        Ok(Response::new(
            admin::serve_list(self, request.into_inner()).await?,
        ))
    }

    async fn apply(
        &self,
        request: Request<pb::ApplyRequest>,
    ) -> std::result::Result<Response<pb::ApplyResponse>, Status> {
        Ok(Response::new(
            admin::serve_apply(self, request.into_inner()).await?,
        ))
    }

    type ReadStream = ReceiverStream<std::result::Result<pb::ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<pb::ReadRequest>,
    ) -> std::result::Result<Response<Self::ReadStream>, Status> {
        Ok(Response::new(read::serve_read(
            self.clone(),
            request.into_inner(),
        )))
    }

    async fn append(
        &self,
        request: Request<Streaming<pb::AppendRequest>>,
    ) -> std::result::Result<Response<pb::AppendResponse>, Status> {
        Ok(Response::new(
            append::serve_append(self, request.into_inner()).await?,
        ))
    }

    type ReplicateStream = ReceiverStream<std::result::Result<pb::ReplicateResponse, Status>>;

    async fn replicate(
        &self,
        request: Request<Streaming<pb::ReplicateRequest>>,
    ) -> std::result::Result<Response<Self::ReplicateStream>, Status> {
        Ok(Response::new(replicate::serve_replicate(
            self.clone(),
            request.into_inner(),
        )))
    }

    async fn list_fragments(
        &self,
        request: Request<pb::FragmentsRequest>,
    ) -> std::result::Result<Response<pb::FragmentsResponse>, Status> {
        Ok(Response::new(
            admin::serve_fragments(self, request.into_inner()).await?,
        ))
    }
}
