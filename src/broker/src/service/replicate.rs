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

//! The peer side of the replication pipeline: validate the primary's
//! Route, stage streamed content, and acknowledge (or refuse) commit
//! proposals against the local spool.

use journal_proto::v1 as pb;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Status, Streaming};

use super::Service;
use crate::{fragment::CommitOutcome, resolver::ResolveArgs};

type ResponseTx = mpsc::Sender<Result<pb::ReplicateResponse, Status>>;

pub(crate) fn serve_replicate(
    svc: Service,
    requests: Streaming<pb::ReplicateRequest>,
) -> ReceiverStream<Result<pb::ReplicateResponse, Status>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(status) = run(svc, requests, &tx).await {
            let _ = tx.send(Err(status)).await;
        }
    });
    ReceiverStream::new(rx)
}

async fn run(
    svc: Service,
    mut requests: Streaming<pb::ReplicateRequest>,
    tx: &ResponseTx,
) -> Result<(), Status> {
    let first = match requests.message().await? {
        Some(first) => first,
        None => return Err(Status::invalid_argument("expected ReplicateRequest")),
    };

    // Resolve through the primary's revision, and verify that we agree on
    // the Route it replicates under.
    let res = svc
        .resolve(ResolveArgs {
            journal: first.journal.clone(),
            proxy_header: first.header.clone(),
            ..Default::default()
        })
        .await;
    if res.status != pb::Status::Ok {
        tracing::info!(
            journal = %first.journal,
            status = ?res.status,
            "refusing replication stream",
        );
        let _ = tx
            .send(Ok(pb::ReplicateResponse {
                status: res.status as i32,
                header: Some(res.header),
                fragment: None,
            }))
            .await;
        return Ok(());
    }
    let spec = res.spec.clone();
    let replica = match res.replica.clone() {
        Some(replica) => replica,
        None => return Err(Status::internal("resolution is missing its replica")),
    };

    let mut next = Some(first);
    loop {
        let req = match next.take() {
            Some(req) => req,
            None => match requests.message().await? {
                Some(req) => req,
                None => return Ok(()), // Primary closed the pipeline.
            },
        };

        if !req.acknowledge {
            let mut spool = replica.spool.lock().await;
            spool
                .append(req.content_delta, &req.content)
                .map_err(Status::from)?;
            continue;
        }

        let proposal = req.proposal.unwrap_or_default();
        let mut spool = replica.spool.lock().await;
        let response = match spool.apply_commit(&proposal).map_err(Status::from)? {
            CommitOutcome::Committed(fragment) => {
                replica.index.insert_local(fragment);
                ok_response()
            }
            CommitOutcome::NoOp => ok_response(),
            CommitOutcome::Rolled { frozen } => {
                if let (Some(frozen), Some(spec)) = (frozen, spec.as_ref()) {
                    svc.spawn_persist(spec, frozen, replica.index.clone());
                }
                ok_response()
            }
            CommitOutcome::Mismatch(fragment) => {
                tracing::warn!(
                    journal = %replica.journal,
                    proposal_begin = proposal.begin,
                    proposal_end = proposal.end,
                    spool_end = fragment.end,
                    "refusing mismatched fragment proposal",
                );
                pb::ReplicateResponse {
                    status: pb::Status::FragmentMismatch as i32,
                    header: None,
                    fragment: Some(fragment),
                }
            }
        };
        drop(spool);

        if tx.send(Ok(response)).await.is_err() {
            return Ok(()); // Primary went away.
        }
    }
}

fn ok_response() -> pb::ReplicateResponse {
    pb::ReplicateResponse {
        status: pb::Status::Ok as i32,
        header: None,
        fragment: None,
    }
}
