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

//! The server-streamed Read: fragment metadata, then content chunks,
//! advancing fragment by fragment and optionally blocking at the write
//! head.

use std::time::Duration;

use bytes::Bytes;
use journal_proto::v1 as pb;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use super::Service;
use crate::{
    fragment::{IndexFragment, IndexQuery},
    resolver::ResolveArgs,
};

const READ_CHUNK: usize = 1 << 17;
const SIGNED_URL_TTL: Duration = Duration::from_secs(60);

// Blocked reads re-check client liveness on this cadence, so an orphaned
// stream doesn't wait on the write head forever.
const BLOCK_RECHECK: Duration = Duration::from_secs(30);

pub(crate) fn serve_read(
    svc: Service,
    req: pb::ReadRequest,
) -> ReceiverStream<Result<pb::ReadResponse, Status>> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let tx2 = tx.clone();
        if let Err(Fault::Status(status)) = run(svc, req, tx).await {
            let _ = tx2.send(Err(status)).await;
        }
    });
    ReceiverStream::new(rx)
}

enum Fault {
    /// The client went away; there is nobody left to tell.
    Disconnected,
    Status(Status),
}

async fn send(
    tx: &mpsc::Sender<Result<pb::ReadResponse, Status>>,
    response: pb::ReadResponse,
) -> Result<(), Fault> {
    tx.send(Ok(response))
        .await
        .map_err(|_| Fault::Disconnected)
}

async fn run(
    svc: Service,
    req: pb::ReadRequest,
    tx: mpsc::Sender<Result<pb::ReadResponse, Status>>,
) -> Result<(), Fault> {
    let res = svc
        .resolve(ResolveArgs {
            journal: req.journal.clone(),
            proxy_header: req.header.clone(),
            ..Default::default()
        })
        .await;
    if res.status != pb::Status::Ok {
        return send(
            &tx,
            pb::ReadResponse {
                status: res.status as i32,
                header: Some(res.header),
                ..Default::default()
            },
        )
        .await;
    }
    if !res.spec.as_ref().map(|s| s.may_read()).unwrap_or(true) {
        return Err(Fault::Status(Status::failed_precondition(format!(
            "journal {} is not readable",
            req.journal,
        ))));
    }
    let replica = match res.replica.clone() {
        Some(replica) => replica,
        None => {
            return Err(Fault::Status(Status::internal(
                "resolution is missing its replica",
            )))
        }
    };

    let mut offset = if req.offset < 0 {
        replica.index.end_offset()
    } else {
        req.offset
    };

    loop {
        let query = replica.index.query(offset, req.block, Some(BLOCK_RECHECK)).await;
        let (fragment, write_head) = match query {
            IndexQuery::NotYetAvailable { write_head } => {
                if req.block {
                    if tx.is_closed() {
                        return Err(Fault::Disconnected);
                    }
                    continue;
                }
                return send(
                    &tx,
                    pb::ReadResponse {
                        status: pb::Status::OffsetNotYetAvailable as i32,
                        header: Some(res.header.clone()),
                        offset,
                        write_head,
                        ..Default::default()
                    },
                )
                .await;
            }
            IndexQuery::Found {
                fragment,
                write_head,
            } => (fragment, write_head),
        };

        // A gap (from retention) advances the read to the fragment above.
        let begin = offset.max(fragment.spec.begin);
        let persisted = !fragment.spec.backing_store.is_empty();

        let fragment_url = if req.do_not_proxy && persisted {
            svc.stores()
                .sign_get(&fragment.spec, SIGNED_URL_TTL)
                .await
                .map_err(|e| Fault::Status(Status::internal(e.to_string())))?
        } else {
            String::new()
        };
        let direct = !fragment_url.is_empty();

        send(
            &tx,
            pb::ReadResponse {
                status: pb::Status::Ok as i32,
                header: Some(res.header.clone()),
                offset: begin,
                write_head,
                fragment: Some(fragment.spec.clone()),
                fragment_url,
                ..Default::default()
            },
        )
        .await?;

        if req.metadata_only {
            return Ok(());
        }
        if !direct {
            stream_content(&svc, &fragment, begin, &tx).await?;
        }
        offset = fragment.spec.end;

        if !req.block && offset >= replica.index.end_offset() {
            return Ok(());
        }
    }
}

async fn stream_content(
    svc: &Service,
    fragment: &IndexFragment,
    begin: i64,
    tx: &mpsc::Sender<Result<pb::ReadResponse, Status>>,
) -> Result<(), Fault> {
    // Resident spool content is read in place; otherwise the fragment is
    // fetched from its backing store and decompressed.
    let fetched: Option<Bytes> = match &fragment.content {
        Some(_) => None,
        None => Some(
            svc.stores()
                .open_decoded(&fragment.spec)
                .await
                .map_err(|e| Fault::Status(Status::internal(e.to_string())))?,
        ),
    };

    let mut pos = begin;
    while pos < fragment.spec.end {
        let want = ((fragment.spec.end - pos) as usize).min(READ_CHUNK);
        let chunk = match (&fragment.content, &fetched) {
            (Some(handle), _) => handle
                .read(pos, want)
                .map_err(|e| Fault::Status(Status::internal(e.to_string())))?,
            (None, Some(content)) => {
                let at = (pos - fragment.spec.begin) as usize;
                content.slice(at..(at + want).min(content.len()))
            }
            (None, None) => Bytes::new(),
        };
        if chunk.is_empty() {
            return Err(Fault::Status(Status::data_loss(format!(
                "fragment {} is missing content at offset {}",
                fragment.spec.content_name(),
                pos,
            ))));
        }

        send(
            tx,
            pb::ReadResponse {
                status: pb::Status::Ok as i32,
                offset: pos,
                content: chunk.to_vec(),
                ..Default::default()
            },
        )
        .await?;
        pos += chunk.len() as i64;
    }
    Ok(())
}
