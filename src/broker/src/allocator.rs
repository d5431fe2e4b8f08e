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

//! A projection of the keyspace into journals, member brokers, and
//! assignments, with Routes derived per journal. The projection is rebuilt
//! by a KeySpace observer, so it is always atomic with the mirror itself.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex},
};

use journal_proto::{process_spec::Id, BrokerSpec, JournalSpec, Route};
use prost::Message;

use crate::{
    coord::KeyValue,
    error::{Error, Result},
    keyspace::{DecodeFn, Observer, State},
};

pub fn items_prefix(root: &str) -> String {
    format!("{}/items/", root)
}

pub fn members_prefix(root: &str) -> String {
    format!("{}/members/", root)
}

pub fn assignments_prefix(root: &str) -> String {
    format!("{}/assign/", root)
}

pub fn item_key(root: &str, journal: &str) -> String {
    format!("{}{}", items_prefix(root), journal)
}

pub fn member_key(root: &str, id: &Id) -> String {
    format!("{}{}", members_prefix(root), id.format())
}

pub fn assignment_key(root: &str, journal: &str, id: &Id, slot: u32) -> String {
    format!(
        "{}{}#{}#{}#{}",
        assignments_prefix(root),
        journal,
        id.zone,
        id.suffix,
        slot,
    )
}

/// A single journal-to-broker binding. Slot zero designates the primary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub journal: String,
    pub member: Id,
    pub slot: u32,
}

#[derive(Clone, Debug)]
pub enum AllocItem {
    Journal(JournalSpec),
    Member(BrokerSpec),
    Assignment(Assignment),
}

/// Decoder of keyspace entries under |root| into typed allocator items.
pub fn decoder(root: &str) -> DecodeFn<AllocItem> {
    let items = items_prefix(root);
    let members = members_prefix(root);
    let assignments = assignments_prefix(root);

    Box::new(move |kv: &KeyValue| {
        if let Some(name) = kv.key.strip_prefix(&items) {
            let spec = JournalSpec::decode(kv.value.clone())
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
            spec.validate()?;
            if spec.name != name {
                return Err(Error::InvalidArgument(format!(
                    "JournalSpec name {:?} does not match key {:?}",
                    spec.name, name,
                )));
            }
            Ok(AllocItem::Journal(spec))
        } else if let Some(id) = kv.key.strip_prefix(&members) {
            let spec = BrokerSpec::decode(kv.value.clone())
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
            spec.validate()?;
            let spec_id = spec
                .process_spec
                .as_ref()
                .and_then(|p| p.id.as_ref())
                .map(|i| i.format())
                .unwrap_or_default();
            if spec_id != id {
                return Err(Error::InvalidArgument(format!(
                    "BrokerSpec id {:?} does not match key {:?}",
                    spec_id, id,
                )));
            }
            Ok(AllocItem::Member(spec))
        } else if let Some(binding) = kv.key.strip_prefix(&assignments) {
            parse_assignment(binding).map(AllocItem::Assignment)
        } else {
            Err(Error::InvalidArgument(format!(
                "unexpected key {:?}",
                kv.key,
            )))
        }
    })
}

// Assignment values live entirely within the key:
// `{journal}#{zone}#{suffix}#{slot}` (none of which may contain '#').
fn parse_assignment(binding: &str) -> Result<Assignment> {
    let parts: Vec<&str> = binding.split('#').collect();
    match parts.as_slice() {
        [journal, zone, suffix, slot] if !journal.is_empty() => Ok(Assignment {
            journal: journal.to_string(),
            member: Id {
                zone: zone.to_string(),
                suffix: suffix.to_string(),
            },
            slot: slot
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("assignment slot {:?}", slot)))?,
        }),
        _ => Err(Error::InvalidArgument(format!(
            "malformed assignment {:?}",
            binding,
        ))),
    }
}

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub spec: JournalSpec,
    pub mod_revision: i64,
}

/// The derived allocator state: ordered journals, members, assignments,
/// and per-journal Routes with endpoints attached.
#[derive(Clone, Debug, Default)]
pub struct AllocatorState {
    pub journals: Vec<JournalEntry>,
    pub members: Vec<BrokerSpec>,
    pub assignments: Vec<Assignment>,
    pub routes: BTreeMap<String, Route>,
}

impl AllocatorState {
    pub fn build(root: &str, state: &State<AllocItem>) -> AllocatorState {
        let mut out = AllocatorState::default();

        for entry in state.prefixed(&items_prefix(root)) {
            if let AllocItem::Journal(spec) = &entry.decoded {
                out.journals.push(JournalEntry {
                    spec: spec.clone(),
                    mod_revision: entry.mod_revision,
                });
            }
        }
        for entry in state.prefixed(&members_prefix(root)) {
            if let AllocItem::Member(spec) = &entry.decoded {
                out.members.push(spec.clone());
            }
        }
        for entry in state.prefixed(&assignments_prefix(root)) {
            if let AllocItem::Assignment(assignment) = &entry.decoded {
                out.assignments.push(assignment.clone());
            }
        }

        // Assignments are grouped by journal in key order; derive each
        // journal's Route.
        let mut i = 0;
        while i != out.assignments.len() {
            let journal = out.assignments[i].journal.clone();
            let j = i + out.assignments[i..]
                .iter()
                .take_while(|a| a.journal == journal)
                .count();
            let route = out.build_route(&out.assignments[i..j]);
            out.routes.insert(journal, route);
            i = j;
        }
        out
    }

    fn build_route(&self, assignments: &[Assignment]) -> Route {
        let mut members: Vec<Id> = assignments.iter().map(|a| a.member.clone()).collect();
        members.sort_by(|a, b| a.cmp_id(b));
        members.dedup();

        let primary = assignments
            .iter()
            .find(|a| a.slot == 0)
            .and_then(|a| members.iter().position(|m| *m == a.member))
            .map(|p| p as i32)
            .unwrap_or(-1);

        let endpoints = members
            .iter()
            .map(|id| {
                self.member(id)
                    .and_then(|m| m.process_spec.as_ref())
                    .map(|p| p.endpoint.clone())
                    .unwrap_or_default()
            })
            .collect();

        Route {
            members,
            primary,
            endpoints,
        }
    }

    pub fn journal(&self, name: &str) -> Option<&JournalEntry> {
        self.journals
            .binary_search_by(|e| e.spec.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.journals[i])
    }

    pub fn member(&self, id: &Id) -> Option<&BrokerSpec> {
        self.members
            .iter()
            .find(|m| m.process_spec.as_ref().and_then(|p| p.id.as_ref()) == Some(id))
    }

    pub fn route(&self, journal: &str) -> Route {
        self.routes.get(journal).cloned().unwrap_or_else(Route::none)
    }

    /// Journals assigned to |id|, with that member's slot.
    pub fn local_assignments(&self, id: &Id) -> Vec<&Assignment> {
        self.assignments
            .iter()
            .filter(|a| &a.member == id)
            .collect()
    }
}

/// Shared handle over the latest [`AllocatorState`], swapped atomically by
/// a KeySpace observer.
#[derive(Clone, Default)]
pub struct Allocator {
    state: Arc<StdMutex<Arc<AllocatorState>>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The observer which rebuilds the projection. Register it with the
    /// KeySpace before loading.
    pub fn observer(&self, root: String) -> Observer<AllocItem> {
        let handle = self.state.clone();
        Box::new(move |state: &State<AllocItem>| {
            *handle.lock().unwrap() = Arc::new(AllocatorState::build(&root, state));
        })
    }

    pub fn snapshot(&self) -> Arc<AllocatorState> {
        self.state.lock().unwrap().clone()
    }
}
