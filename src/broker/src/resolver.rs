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

//! Maps a journal to its current Route, primary, and local Replica, as of
//! the keyspace revision a request requires.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use journal_proto::{process_spec::Id, v1 as pb, JournalSpec};

use crate::{
    allocator::{AllocItem, Allocator},
    keyspace::{KeySpace, Observer},
    replica::Replica,
};

#[derive(Default)]
pub struct ResolveArgs {
    pub journal: String,
    /// Permit resolution to a route which does not include this broker.
    pub may_proxy: bool,
    /// Require that this broker hold the primary slot.
    pub require_primary: bool,
    /// Require that the full desired replication be assigned.
    pub require_full_assignment: bool,
    /// Wait until the keyspace has read through this revision.
    pub min_etcd_revision: i64,
    /// A proxying broker's Header: resolution waits for its revision and
    /// verifies Route agreement.
    pub proxy_header: Option<pb::Header>,
}

pub struct Resolution {
    pub status: pb::Status,
    pub header: pb::Header,
    pub spec: Option<JournalSpec>,
    pub mod_revision: i64,
    pub replica: Option<Arc<Replica>>,
}

/// Creates the Replica of a newly observed local assignment.
pub type ReplicaFactory = Box<dyn Fn(&JournalSpec) -> Arc<Replica> + Send + Sync>;

pub struct Resolver {
    id: Id,
    alloc: Allocator,
    replicas: StdMutex<HashMap<String, Arc<Replica>>>,
    factory: ReplicaFactory,
}

impl Resolver {
    pub fn new(id: Id, alloc: Allocator, factory: ReplicaFactory) -> Arc<Resolver> {
        Arc::new(Resolver {
            id,
            alloc,
            replicas: StdMutex::new(HashMap::new()),
            factory,
        })
    }

    /// The keyspace observer which creates Replicas of newly appearing
    /// local assignments and cancels those which have disappeared.
    /// Register it after the allocator's own observer.
    pub fn observer(self: &Arc<Self>) -> Observer<AllocItem> {
        let resolver = self.clone();
        Box::new(move |_state| resolver.sync_replicas())
    }

    fn sync_replicas(&self) {
        let alloc = self.alloc.snapshot();
        let mut replicas = self.replicas.lock().unwrap();

        let local: HashMap<&str, &JournalSpec> = alloc
            .local_assignments(&self.id)
            .into_iter()
            .filter_map(|a| {
                alloc
                    .journal(&a.journal)
                    .map(|e| (a.journal.as_str(), &e.spec))
            })
            .collect();

        replicas.retain(|journal, replica| {
            if local.contains_key(journal.as_str()) {
                true
            } else {
                tracing::info!(%journal, "cancelling local replica");
                replica.cancel();
                false
            }
        });
        for (journal, spec) in local {
            if !replicas.contains_key(journal) {
                tracing::info!(journal, "creating local replica");
                replicas.insert(journal.to_string(), (self.factory)(spec));
            }
        }
    }

    pub fn replica(&self, journal: &str) -> Option<Arc<Replica>> {
        self.replicas.lock().unwrap().get(journal).cloned()
    }

    /// Resolve |args| against the keyspace, producing the request Header,
    /// a Status, and the local Replica when this broker is assigned.
    pub async fn resolve(&self, keyspace: &KeySpace<AllocItem>, args: ResolveArgs) -> Resolution {
        let min_revision = args.min_etcd_revision.max(
            args.proxy_header
                .as_ref()
                .and_then(|h| h.etcd.as_ref())
                .map(|e| e.revision)
                .unwrap_or(0),
        );
        let state = if min_revision > 0 {
            keyspace.read_through(min_revision).await
        } else {
            keyspace.read().await
        };
        // The projection is swapped under the keyspace's exclusive lock,
        // so this snapshot is atomic with the revision held above.
        let alloc = self.alloc.snapshot();

        let route = alloc.route(&args.journal);
        let header = pb::Header {
            process_id: Some(self.id.clone()),
            route: Some(route.clone()),
            etcd: Some(state.header.clone()),
        };
        drop(state);

        let entry = alloc.journal(&args.journal);
        let is_member = route.members.contains(&self.id);
        let is_primary = route.primary_id() == Some(&self.id);

        let status = if entry.is_none() {
            pb::Status::JournalNotFound
        } else if args.require_full_assignment
            && (route.members.len() as i32) < entry.map(|e| e.spec.replication).unwrap_or(0)
        {
            pb::Status::InsufficientJournalBrokers
        } else if args.require_primary && route.primary == -1 {
            pb::Status::NoJournalPrimaryBroker
        } else if args.require_primary && !is_primary {
            pb::Status::NotJournalPrimaryBroker
        } else if !is_member && !args.may_proxy {
            pb::Status::NotJournalBroker
        } else if args
            .proxy_header
            .as_ref()
            .and_then(|h| h.route.as_ref())
            .map(|r| !r.equivalent(&route))
            .unwrap_or(false)
        {
            pb::Status::WrongRoute
        } else {
            pb::Status::Ok
        };

        Resolution {
            status,
            header,
            spec: entry.map(|e| e.spec.clone()),
            mod_revision: entry.map(|e| e.mod_revision).unwrap_or(0),
            replica: if is_member {
                self.replica(&args.journal)
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use journal_proto::{BrokerSpec, CompressionCodec, ProcessSpec};
    use prost::Message;

    use super::*;
    use crate::{allocator, coord::MemCoord, keyspace::KeySpace};

    fn id(zone: &str, suffix: &str) -> Id {
        Id {
            zone: zone.to_string(),
            suffix: suffix.to_string(),
        }
    }

    fn journal_spec(name: &str, replication: i32) -> JournalSpec {
        JournalSpec {
            name: name.to_string(),
            replication,
            labels: None,
            fragment: Some(journal_proto::journal_spec::Fragment {
                length: 1 << 20,
                compression_codec: CompressionCodec::None as i32,
                stores: vec![],
                refresh_interval: None,
                retention: None,
                flush_interval: None,
            }),
            flags: 0,
        }
    }

    fn broker_spec(member: &Id, endpoint: &str) -> BrokerSpec {
        BrokerSpec {
            process_spec: Some(ProcessSpec {
                id: Some(member.clone()),
                endpoint: endpoint.to_string(),
            }),
            journal_limit: 100,
        }
    }

    const ROOT: &str = "/test/broker";

    async fn fixture(local: &Id) -> (MemCoord, Arc<KeySpace<AllocItem>>, Arc<Resolver>) {
        let coord = MemCoord::new();
        let keyspace = Arc::new(KeySpace::new(ROOT, allocator::decoder(ROOT)));
        let alloc = Allocator::new();
        keyspace.observe(alloc.observer(ROOT.to_string()));

        let resolver = Resolver::new(
            local.clone(),
            alloc,
            Box::new(|spec: &JournalSpec| {
                Replica::new(&spec.name, CompressionCodec::None).0
            }),
        );
        keyspace.observe(resolver.observer());
        (coord, keyspace, resolver)
    }

    fn announce(coord: &MemCoord, member: &Id, endpoint: &str) {
        coord.put(
            &allocator::member_key(ROOT, member),
            broker_spec(member, endpoint).encode_to_vec().into(),
        );
    }

    fn create_journal(coord: &MemCoord, spec: &JournalSpec) {
        coord.put(
            &allocator::item_key(ROOT, &spec.name),
            spec.encode_to_vec().into(),
        );
    }

    fn assign(coord: &MemCoord, journal: &str, member: &Id, slot: u32) -> i64 {
        coord.put(
            &allocator::assignment_key(ROOT, journal, member, slot),
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn statuses_and_replica_lifecycle() {
        let (a, b) = (id("zone", "a"), id("zone", "b"));
        let (coord, keyspace, resolver) = fixture(&a).await;

        announce(&coord, &a, "http://a:8080");
        announce(&coord, &b, "http://b:8080");
        create_journal(&coord, &journal_spec("j", 2));
        keyspace.load(&coord).await.unwrap();

        // Known journal, but nothing assigned.
        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j".to_string(),
                    require_primary: true,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::NoJournalPrimaryBroker);

        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "missing".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::JournalNotFound);

        // Assign the primary slot to B, and a replica slot to A.
        assign(&coord, "j", &b, 0);
        assign(&coord, "j", &a, 1);
        keyspace.load(&coord).await.unwrap();

        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j".to_string(),
                    require_primary: true,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::NotJournalPrimaryBroker);
        // A holds an assignment, so its replica exists regardless.
        assert!(res.replica.is_some());

        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::Ok);
        assert_eq!(res.header.route.as_ref().unwrap().members.len(), 2);
        assert_eq!(
            res.header.route.as_ref().unwrap().endpoints,
            vec!["http://a:8080".to_string(), "http://b:8080".to_string()],
        );

        // Dropping A's assignment cancels its replica.
        let replica = res.replica.clone().unwrap();
        coord.delete(&allocator::assignment_key(ROOT, "j", &a, 1));
        keyspace.load(&coord).await.unwrap();
        assert!(replica.is_cancelled());

        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::NotJournalBroker);
        assert!(res.replica.is_none());
    }

    #[tokio::test]
    async fn insufficient_assignment_and_wrong_route() {
        let a = id("zone", "a");
        let (coord, keyspace, resolver) = fixture(&a).await;

        announce(&coord, &a, "http://a:8080");
        create_journal(&coord, &journal_spec("j", 2));
        assign(&coord, "j", &a, 0);
        keyspace.load(&coord).await.unwrap();

        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j".to_string(),
                    require_full_assignment: true,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::InsufficientJournalBrokers);

        // With a lone non-primary assignment, under-assignment takes
        // precedence over the missing primary.
        create_journal(&coord, &journal_spec("j2", 2));
        assign(&coord, "j2", &a, 1);
        keyspace.load(&coord).await.unwrap();

        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j2".to_string(),
                    require_primary: true,
                    require_full_assignment: true,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::InsufficientJournalBrokers);

        // A proxy header whose route disagrees with ours.
        let stale_route = journal_proto::Route {
            members: vec![id("zone", "gone")],
            primary: 0,
            endpoints: vec!["http://gone:8080".to_string()],
        };
        let res = resolver
            .resolve(
                &keyspace,
                ResolveArgs {
                    journal: "j".to_string(),
                    proxy_header: Some(pb::Header {
                        process_id: Some(a.clone()),
                        route: Some(stale_route),
                        etcd: None,
                    }),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(res.status, pb::Status::WrongRoute);
    }

    #[tokio::test]
    async fn resolve_waits_for_minimum_revision() {
        let a = id("zone", "a");
        let (coord, keyspace, resolver) = fixture(&a).await;

        announce(&coord, &a, "http://a:8080");
        create_journal(&coord, &journal_spec("j", 1));
        let target = assign(&coord, "j", &a, 0);
        keyspace.load(&coord).await.unwrap();

        // Target a future revision; resolution parks until it is applied.
        let handle = {
            let (keyspace, resolver) = (keyspace.clone(), resolver.clone());
            tokio::spawn(async move {
                resolver
                    .resolve(
                        &keyspace,
                        ResolveArgs {
                            journal: "j".to_string(),
                            min_etcd_revision: target + 1,
                            ..Default::default()
                        },
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        coord.put("/test/broker/items/other", Bytes::from_static(b""));
        keyspace.load(&coord).await.unwrap();

        let res = handle.await.unwrap();
        assert_eq!(res.status, pb::Status::Ok);
    }
}
