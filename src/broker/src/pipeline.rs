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

//! The primary's replication pipeline: long-lived replicate streams to
//! each peer of the Route, over which content and ordered commit
//! proposals fan out.

use journal_proto::{
    journal_client::JournalClient, process_spec::Id, v1 as pb, Fragment, Header, Route,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;

use crate::error::{Error, Result};

const PEER_CHANNEL_DEPTH: usize = 16;

/// One peer acknowledgement, classified.
#[derive(Debug)]
pub enum PeerAck {
    Ok,
    /// The peer rejected the proposal, answering with its own head.
    Mismatch(Fragment),
    /// The peer rejected this pipeline outright (wrong route, not a
    /// broker, ...).
    Rejected(pb::Status),
}

struct Peer {
    id: Id,
    tx: mpsc::Sender<pb::ReplicateRequest>,
    rx: Streaming<pb::ReplicateResponse>,
}

/// Replicate streams to every non-local member of a Route. Messages
/// carry the Header only on each stream's first request.
pub struct Pipeline {
    pub route: Route,
    header: Header,
    journal: String,
    peers: Vec<Peer>,
    header_sent: bool,
}

impl Pipeline {
    /// Dial each peer of the route and open its replicate stream.
    pub async fn connect(header: Header, journal: &str) -> Result<Pipeline> {
        let route = header.route.clone().unwrap_or_else(Route::none);
        let self_id = header.process_id.clone().unwrap_or_default();

        let mut peers = Vec::new();
        for member in &route.members {
            if *member == self_id {
                continue;
            }
            let endpoint = route.endpoint_of(member).map(str::to_string).ok_or_else(|| {
                Error::InvalidArgument(format!("member {} has no endpoint", member.format()))
            })?;

            let mut client = JournalClient::connect(endpoint)
                .await
                .map_err(Error::Transport)?;
            let (tx, requests) = mpsc::channel(PEER_CHANNEL_DEPTH);
            let responses = client
                .replicate(ReceiverStream::new(requests))
                .await
                .map_err(|status| Error::Peer(member.format(), status))?;

            peers.push(Peer {
                id: member.clone(),
                tx,
                rx: responses.into_inner(),
            });
        }

        Ok(Pipeline {
            route,
            header,
            journal: journal.to_string(),
            peers,
            header_sent: false,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn base_request(&mut self) -> pb::ReplicateRequest {
        let mut req = pb::ReplicateRequest {
            journal: self.journal.clone(),
            ..Default::default()
        };
        if !self.header_sent {
            req.header = Some(self.header.clone());
            self.header_sent = true;
        }
        req
    }

    /// Stream a content chunk to every peer.
    pub async fn scatter_content(&mut self, delta: i64, content: &[u8]) -> Result<()> {
        let mut req = self.base_request();
        req.content = content.to_vec();
        req.content_delta = delta;
        self.scatter(req).await
    }

    /// Send |proposal| to every peer for acknowledgement, and gather each
    /// peer's classified response. Stream-level failures are returned as
    /// errors naming the peer.
    pub async fn propose(&mut self, proposal: &Fragment) -> Result<Vec<PeerAck>> {
        let mut req = self.base_request();
        req.proposal = Some(proposal.clone());
        req.acknowledge = true;
        self.scatter(req).await?;
        self.gather().await
    }

    async fn scatter(&mut self, req: pb::ReplicateRequest) -> Result<()> {
        for i in 0..self.peers.len() {
            let id = self.peers[i].id.clone();
            self.peers[i].tx.send(req.clone()).await.map_err(|_| {
                Error::Peer(id.format(), tonic::Status::unavailable("replicate stream closed"))
            })?;
        }
        Ok(())
    }

    async fn gather(&mut self) -> Result<Vec<PeerAck>> {
        let mut acks = Vec::with_capacity(self.peers.len());
        for peer in &mut self.peers {
            let response = match peer.rx.message().await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    return Err(Error::Peer(
                        peer.id.format(),
                        tonic::Status::unavailable("replicate stream closed"),
                    ))
                }
                Err(status) => return Err(Error::Peer(peer.id.format(), status)),
            };
            acks.push(match pb::Status::from(response.status) {
                pb::Status::Ok => PeerAck::Ok,
                pb::Status::FragmentMismatch => {
                    PeerAck::Mismatch(response.fragment.unwrap_or_default())
                }
                status => PeerAck::Rejected(status),
            });
        }
        Ok(acks)
    }
}
