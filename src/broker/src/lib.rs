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

//! A clustered broker of named, append-only byte streams ("journals"),
//! with durable replication, offset-addressed reads, and
//! content-addressed persistence of closed byte ranges ("fragments") to
//! backing object stores.
//!
//! The broker discovers journal specs and assignments through a
//! [`keyspace::KeySpace`] mirror of an external coordination store,
//! resolves requests through the [`resolver::Resolver`], serializes and
//! fans out appends over the [`pipeline::Pipeline`], and tracks each
//! journal's byte ranges in a [`fragment::FragmentIndex`].

pub mod allocator;
pub mod coord;
pub mod error;
pub mod fragment;
pub mod keyspace;
pub mod pipeline;
pub mod replica;
pub mod resolver;
pub mod retention;
pub mod service;

pub use self::{
    error::{Error, Result},
    service::{Config, Service, DEFAULT_HEALTH_CHECK_INTERVAL},
};
