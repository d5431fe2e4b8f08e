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

//! Fragment bookkeeping of a journal replica: the ordered [`FragmentSet`],
//! the thread-safe [`FragmentIndex`] uniting local and remote fragments,
//! and the [`Spool`] holding the open byte range at the journal's head.

mod index;
mod set;
mod spool;

pub use self::{
    index::{FragmentIndex, IndexQuery},
    set::{FragmentSet, IndexFragment, SetQuery},
    spool::{CommitOutcome, ContentHandle, Spool},
};
