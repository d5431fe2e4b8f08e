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

//! The unary administrative operations: List, Apply, and ListFragments.

use journal_proto::{v1 as pb, Route};
use prost::Message;
use tonic::Status;

use super::Service;
use crate::{
    allocator::item_key,
    coord::{Compare, TxnOp},
    resolver::ResolveArgs,
};

const DEFAULT_FRAGMENT_PAGE: usize = 1000;

/// Enumerate JournalSpecs matching the request selector, with their
/// current Routes.
pub(crate) async fn serve_list(
    svc: &Service,
    req: pb::ListRequest,
) -> Result<pb::ListResponse, Status> {
    let selector = req.selector.unwrap_or_default();
    let offset: usize = match req.page_token.as_str() {
        "" => 0,
        token => token
            .parse()
            .map_err(|_| Status::invalid_argument(format!("page token {:?}", token)))?,
    };
    let limit = match req.page_limit {
        n if n <= 0 => usize::MAX,
        n => n as usize,
    };

    let header = {
        let state = svc.keyspace().read().await;
        pb::Header {
            process_id: Some(svc.id().clone()),
            route: Some(Route::none()),
            etcd: Some(state.header.clone()),
        }
    };
    let alloc = svc.alloc().snapshot();

    let matched: Vec<_> = alloc
        .journals
        .iter()
        .filter(|e| {
            let labels = e.spec.labels.clone().unwrap_or_default();
            selector.matches(&labels, &e.spec.name)
        })
        .collect();

    let journals = matched
        .iter()
        .skip(offset)
        .take(limit)
        .map(|e| pb::list_response::Journal {
            spec: Some(e.spec.clone()),
            mod_revision: e.mod_revision,
            route: Some(alloc.route(&e.spec.name)),
        })
        .collect();

    let consumed = offset.saturating_add(limit);
    let next_page_token = if consumed < matched.len() {
        consumed.to_string()
    } else {
        String::new()
    };

    Ok(pb::ListResponse {
        status: pb::Status::Ok as i32,
        header: Some(header),
        journals,
        next_page_token,
    })
}

/// Atomically apply JournalSpec upserts and deletes, each gated on its
/// expected mod revision.
pub(crate) async fn serve_apply(
    svc: &Service,
    req: pb::ApplyRequest,
) -> Result<pb::ApplyResponse, Status> {
    let mut compares = Vec::with_capacity(req.changes.len());
    let mut ops = Vec::with_capacity(req.changes.len());

    for change in &req.changes {
        match (&change.upsert, change.delete.as_str()) {
            (Some(spec), "") => {
                spec.validate()
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                let key = item_key(svc.root(), &spec.name);
                compares.push(Compare {
                    key: key.clone(),
                    mod_revision: change.expect_mod_revision,
                });
                ops.push(TxnOp::Put {
                    key,
                    value: spec.encode_to_vec().into(),
                });
            }
            (None, journal) if !journal.is_empty() => {
                let key = item_key(svc.root(), journal);
                compares.push(Compare {
                    key: key.clone(),
                    mod_revision: change.expect_mod_revision,
                });
                ops.push(TxnOp::Delete { key });
            }
            _ => {
                return Err(Status::invalid_argument(
                    "change must have exactly one of upsert or delete",
                ))
            }
        }
    }

    let txn = svc.coord().txn(compares, ops).await.map_err(Status::from)?;
    let status = if txn.succeeded {
        pb::Status::Ok
    } else {
        pb::Status::EtcdTransactionFailed
    };

    Ok(pb::ApplyResponse {
        status: status as i32,
        header: Some(pb::Header {
            process_id: Some(svc.id().clone()),
            route: Some(Route::none()),
            etcd: Some(txn.header),
        }),
    })
}

/// Fragments of the journal from the union of the local and remote lanes,
/// filtered on modification time and paginated.
pub(crate) async fn serve_fragments(
    svc: &Service,
    req: pb::FragmentsRequest,
) -> Result<pb::FragmentsResponse, Status> {
    let res = svc
        .resolve(ResolveArgs {
            journal: req.journal.clone(),
            proxy_header: req.header.clone(),
            ..Default::default()
        })
        .await;
    if res.status != pb::Status::Ok {
        return Ok(pb::FragmentsResponse {
            status: res.status as i32,
            header: Some(res.header),
            fragments: Vec::new(),
            next_page_token: 0,
        });
    }
    let replica = match res.replica.as_ref() {
        Some(replica) => replica,
        None => return Err(Status::internal("resolution is missing its replica")),
    };
    let signature_ttl = req
        .signature_ttl
        .as_ref()
        .map(|ttl| journal_proto::duration_from_proto(Some(ttl)));

    let (union, _) = replica.index.snapshot();
    let matched: Vec<_> = union
        .into_iter()
        .filter(|f| {
            f.spec.mod_time >= req.begin_mod_time
                && (req.end_mod_time == 0 || f.spec.mod_time < req.end_mod_time)
        })
        .collect();

    let offset = req.next_page_token.max(0) as usize;
    let limit = match req.page_limit {
        n if n <= 0 => DEFAULT_FRAGMENT_PAGE,
        n => n as usize,
    };

    let mut fragments = Vec::new();
    for f in matched.iter().skip(offset).take(limit) {
        let signed_url = match (&signature_ttl, !f.spec.backing_store.is_empty()) {
            (Some(ttl), true) => svc
                .stores()
                .sign_get(&f.spec, *ttl)
                .await
                .map_err(|e| Status::internal(e.to_string()))?,
            _ => String::new(),
        };
        fragments.push(pb::fragments_response::Fragment {
            spec: Some(f.spec.clone()),
            signed_url,
        });
    }

    let consumed = offset.saturating_add(limit);
    let next_page_token = if consumed < matched.len() {
        consumed as i64
    } else {
        0
    };

    Ok(pb::FragmentsResponse {
        status: pb::Status::Ok as i32,
        header: Some(res.header),
        fragments,
        next_page_token,
    })
}
