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

use thiserror::Error;
use tonic::{Code, Status};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} is not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("etcd cluster id mismatch (expected {expected}, got {actual})")]
    ClusterIdMismatch { expected: u64, actual: u64 },
    #[error("etcd revision mismatch (expected {expected_relation} {expected}, got {actual})")]
    RevisionMismatch {
        expected_relation: &'static str,
        expected: i64,
        actual: i64,
    },
    #[error("coordination store: {0}")]
    Coord(String),
    #[error("replication peer {0} failed: {1}")]
    Peer(String, Status),
    #[error(transparent)]
    Spec(#[from] journal_proto::ValidationError),
    #[error(transparent)]
    Store(#[from] journal_store::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("rpc: {0}")]
    Rpc(#[from] Status),
    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl From<Error> for Status {
    fn from(err: Error) -> Status {
        let code = match &err {
            Error::NotFound(_) => Code::NotFound,
            Error::InvalidArgument(_) | Error::Spec(_) => Code::InvalidArgument,
            Error::Rpc(status) => return status.clone(),
            _ => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
