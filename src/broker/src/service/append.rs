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

//! The primary side of Append: admission against the write head, content
//! fan-out over the pipeline, and the ordered commit decision.

use std::sync::Arc;

use journal_proto::{v1 as pb, CompressionCodec, Fragment, JournalSpec, Sha1Sum};
use tonic::{Status, Streaming};

use super::Service;
use crate::{
    error::Error,
    fragment::{CommitOutcome, Spool},
    pipeline::{PeerAck, Pipeline},
    replica::Replica,
    resolver::{ResolveArgs, Resolution},
};

#[derive(Debug)]
pub(crate) enum EnsureError {
    /// A protocol outcome to relay to the caller.
    Status(pb::Status),
    /// A stream or transport fault; the pipeline is torn down.
    Fault(Error),
}

impl From<Error> for EnsureError {
    fn from(err: Error) -> Self {
        EnsureError::Fault(err)
    }
}

fn zero_fragment(journal: &str, offset: i64, codec: CompressionCodec) -> Fragment {
    Fragment {
        journal: journal.to_string(),
        begin: offset,
        end: offset,
        sum: Some(Sha1Sum::default()),
        compression_codec: codec as i32,
        backing_store: String::new(),
        mod_time: 0,
    }
}

fn spec_codec(spec: Option<&JournalSpec>) -> CompressionCodec {
    spec.and_then(|s| s.fragment.as_ref())
        .map(|f| CompressionCodec::from(f.compression_codec))
        .unwrap_or(CompressionCodec::None)
}

/// Position the spool at the journal's write head. An empty spool behind
/// the head simply jumps forward; a spool with content behind the head
/// reflects a historic replication inconsistency.
fn position_spool(
    replica: &Replica,
    spool: &mut Spool,
    codec: CompressionCodec,
) -> Result<(), pb::Status> {
    let head = replica.index.end_offset();
    if head <= spool.end() {
        return Ok(());
    }
    if spool.committed_length() == 0 && spool.pending() == 0 {
        *spool = Spool::new(&replica.journal, head, codec);
        Ok(())
    } else {
        Err(pb::Status::IndexHasGreaterOffset)
    }
}

/// Ensure a pipeline of the resolution's Route exists and is
/// synchronized. On a Route change the prior pipeline is dropped and the
/// new one re-synchronizes every peer spool, rolling this spool forward
/// as needed.
pub(crate) async fn ensure_pipeline(
    svc: &Service,
    replica: &Arc<Replica>,
    res: &Resolution,
    slot: &mut Option<Pipeline>,
) -> Result<(), EnsureError> {
    let route = res.header.route.clone().unwrap_or_default();
    if let Some(pl) = slot.as_ref() {
        if pl.route.equivalent(&route) {
            return Ok(());
        }
        // The Route changed; rebuild and re-synchronize below.
        slot.take();
    }

    let codec = spec_codec(res.spec.as_ref());
    let mut spool = replica.spool.lock().await;
    position_spool(replica, &mut spool, codec).map_err(EnsureError::Status)?;

    let mut pl = Pipeline::connect(res.header.clone(), &replica.journal).await?;
    if pl.peer_count() == 0 {
        *slot = Some(pl);
        return Ok(());
    }

    // Propose our current head fragment. Peers with an identical spool
    // acknowledge; any disagreement is resolved by rolling everyone
    // forward to the maximum known end.
    let acks = pl.propose(&spool.fragment().clone()).await?;
    let mut max_end = spool.end();
    let mut mismatched = false;
    for ack in acks {
        match ack {
            PeerAck::Ok => (),
            PeerAck::Mismatch(fragment) => {
                mismatched = true;
                max_end = max_end.max(fragment.end);
            }
            PeerAck::Rejected(status) => return Err(EnsureError::Status(status)),
        }
    }

    if mismatched {
        let rollback = zero_fragment(&replica.journal, max_end, codec);
        for ack in pl.propose(&rollback).await? {
            if !matches!(ack, PeerAck::Ok) {
                return Err(EnsureError::Status(pb::Status::FragmentMismatch));
            }
        }
        if let CommitOutcome::Rolled { frozen: Some(frozen) } = spool.apply_commit(&rollback)? {
            if let Some(spec) = res.spec.as_ref() {
                svc.spawn_persist(spec, frozen, replica.index.clone());
            }
        }
        tracing::info!(
            journal = %replica.journal,
            offset = max_end,
            "synchronized replication pipeline",
        );
    }

    *slot = Some(pl);
    Ok(())
}

pub(crate) async fn serve_append(
    svc: &Service,
    mut requests: Streaming<pb::AppendRequest>,
) -> Result<pb::AppendResponse, Status> {
    let first = match requests.message().await? {
        Some(first) => first,
        None => return Err(Status::invalid_argument("expected AppendRequest")),
    };

    let res = svc
        .resolve(ResolveArgs {
            journal: first.journal.clone(),
            require_primary: true,
            require_full_assignment: true,
            proxy_header: first.header.clone(),
            ..Default::default()
        })
        .await;
    if res.status != pb::Status::Ok {
        return Ok(respond(res.status, &res, None));
    }
    let spec = match res.spec.clone() {
        Some(spec) => spec,
        None => return Err(Status::internal("resolution is missing its JournalSpec")),
    };
    if !spec.may_write() {
        return Err(Status::failed_precondition(format!(
            "journal {} is not writable",
            spec.name,
        )));
    }
    let replica = match res.replica.clone() {
        Some(replica) => replica,
        None => return Err(Status::internal("resolution is missing its replica")),
    };

    // The pipeline lock is the admission point: it orders this append
    // after every preceding commit.
    let mut slot = replica.pipeline.lock().await;
    if let Err(err) = ensure_pipeline(svc, &replica, &res, &mut slot).await {
        return match err {
            EnsureError::Status(status) => Ok(respond(status, &res, None)),
            EnsureError::Fault(err) => {
                tracing::warn!(journal = %replica.journal, %err, "append failed to build pipeline");
                replica.pulse();
                Err(Status::unavailable(err.to_string()))
            }
        };
    }
    let mut pl = match slot.take() {
        Some(pl) => pl,
        None => return Err(Status::internal("pipeline was just ensured")),
    };
    let mut spool = replica.spool.lock().await;

    if first.offset != 0 && first.offset != spool.end() {
        *slot = Some(pl);
        return Ok(respond(pb::Status::WrongAppendOffset, &res, None));
    }

    // Content phase: stage chunks locally and fan them out to peers. A
    // zero-byte chunk commits; EOF without one is a client rollback.
    let mut staged: i64 = 0;
    let committed = loop {
        match requests.message().await {
            Ok(Some(req)) if !req.content.is_empty() => {
                spool.append(staged, &req.content).map_err(Status::from)?;
                if let Err(err) = pl.scatter_content(staged, &req.content).await {
                    tracing::warn!(journal = %replica.journal, %err, "append content fan-out failed");
                    spool.discard_pending();
                    replica.pulse();
                    return Err(Status::unavailable(err.to_string()));
                }
                staged += req.content.len() as i64;
            }
            Ok(Some(_)) => break true,
            Ok(None) => break false,
            Err(status) => {
                spool.discard_pending();
                *slot = Some(pl);
                return Err(status);
            }
        }
    };
    if !committed {
        spool.discard_pending();
        *slot = Some(pl);
        return Err(Status::aborted("append stream closed without commit"));
    }

    // Commit phase.
    spool.truncate_pending(staged);
    let proposal = spool.next_proposal().map_err(Status::from)?;

    let acks = if pl.peer_count() == 0 {
        Vec::new()
    } else {
        match pl.propose(&proposal).await {
            Ok(acks) => acks,
            Err(err) => {
                tracing::warn!(journal = %replica.journal, %err, "append commit fan-out failed");
                spool.discard_pending();
                replica.pulse();
                return Err(Status::unavailable(err.to_string()));
            }
        }
    };

    let mut max_end = spool.end();
    let mut mismatched = false;
    for ack in &acks {
        match ack {
            PeerAck::Ok => max_end = max_end.max(proposal.end),
            PeerAck::Mismatch(fragment) => {
                mismatched = true;
                max_end = max_end.max(fragment.end);
            }
            PeerAck::Rejected(status) => {
                replica.pulse();
                return Ok(respond(*status, &res, None));
            }
        }
    }

    if mismatched {
        // Re-establish alignment through a rollback proposal at the
        // maximum known end, then fail this append.
        let rollback = zero_fragment(&replica.journal, max_end, spec_codec(Some(&spec)));
        let aligned = match pl.propose(&rollback).await {
            Ok(acks) => acks.iter().all(|a| matches!(a, PeerAck::Ok)),
            Err(err) => {
                tracing::warn!(journal = %replica.journal, %err, "append rollback fan-out failed");
                false
            }
        };
        if let CommitOutcome::Rolled { frozen: Some(frozen) } =
            spool.apply_commit(&rollback).map_err(Status::from)?
        {
            svc.spawn_persist(&spec, frozen, replica.index.clone());
        }
        if aligned {
            *slot = Some(pl);
        } else {
            replica.pulse();
        }
        return Ok(respond(pb::Status::FragmentMismatch, &res, None));
    }

    // Unanimous acknowledgement: commit locally and wake blocked readers.
    match spool.apply_commit(&proposal).map_err(Status::from)? {
        CommitOutcome::Committed(fragment) => replica.index.insert_local(fragment),
        CommitOutcome::NoOp => (),
        _ => return Err(Status::internal("local commit diverged from proposal")),
    }

    match maybe_roll(svc, &spec, &replica, &mut pl, &mut spool).await {
        Ok(()) => *slot = Some(pl),
        Err(err) => {
            tracing::warn!(journal = %replica.journal, %err, "spool roll fan-out failed");
            replica.pulse();
        }
    }

    Ok(respond(pb::Status::Ok, &res, Some(proposal)))
}

fn respond(
    status: pb::Status,
    res: &Resolution,
    commit: Option<Fragment>,
) -> pb::AppendResponse {
    pb::AppendResponse {
        status: status as i32,
        header: Some(res.header.clone()),
        commit,
    }
}

/// Roll the spool once it exceeds its target length or flush interval,
/// freezing the prior spool for persistence.
async fn maybe_roll(
    svc: &Service,
    spec: &JournalSpec,
    replica: &Arc<Replica>,
    pl: &mut Pipeline,
    spool: &mut Spool,
) -> crate::error::Result<()> {
    let cfg = spec.fragment.clone().unwrap_or_default();
    let flush = journal_proto::duration_from_proto(cfg.flush_interval.as_ref());

    let over_length = cfg.length > 0 && spool.committed_length() >= cfg.length;
    let over_interval = !flush.is_zero()
        && spool
            .first_append_at()
            .map(|at| at.elapsed() >= flush)
            .unwrap_or(false);
    if spool.committed_length() == 0 || !(over_length || over_interval) {
        return Ok(());
    }

    let next = zero_fragment(&replica.journal, spool.end(), spec_codec(Some(spec)));
    if pl.peer_count() != 0 {
        for ack in pl.propose(&next).await? {
            if !matches!(ack, PeerAck::Ok) {
                return Err(Error::InvalidArgument(
                    "peer rejected spool roll".to_string(),
                ));
            }
        }
    }
    if let CommitOutcome::Rolled { frozen: Some(frozen) } = spool.apply_commit(&next)? {
        svc.spawn_persist(spec, frozen, replica.index.clone());
    }
    Ok(())
}
