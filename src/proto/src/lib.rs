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

//! Wire protocol of the journal broker, and typed extensions over the
//! generated messages: label selectors, fragment naming, route equivalence,
//! and JournalSpec validation.

mod cast;
mod fragment;
mod label;
mod route;
mod spec;

pub mod v1 {
    tonic::include_proto!("journal.v1");
}

pub use v1::*;

pub use self::{
    cast::{duration_from_proto, duration_to_proto},
    fragment::parse_content_name,
    label::{is_token, parse_label_selector, ParseSelectorError, META_LABEL_NAME, META_LABEL_PREFIX},
    spec::{
        validate_journal_name, validate_store_url, ValidationError, FLAG_NOT_SPECIFIED,
        FLAG_O_RDONLY, FLAG_O_RDWR, FLAG_O_WRONLY, MAX_JOURNAL_NAME_LEN, MAX_REPLICATION,
    },
};
