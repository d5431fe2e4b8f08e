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

use std::{
    io,
    os::unix::fs::FileExt,
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};

use bytes::Bytes;
use journal_proto::{CompressionCodec, Fragment, Sha1Sum};
use sha1::{Digest, Sha1};

use super::set::IndexFragment;
use crate::error::{Error, Result};

// Spool content is held in memory until it exceeds this threshold, after
// which it spills to an unlinked temporary file.
const SPILL_THRESHOLD: usize = 1 << 22;

/// Shared, append-extended content of one spool. Bytes below the committed
/// end are immutable, so readers holding a fragment of the committed range
/// never observe mutation.
pub struct ContentHandle {
    begin: i64,
    buf: StdMutex<SpoolBuf>,
}

enum SpoolBuf {
    Mem(Vec<u8>),
    File { file: std::fs::File, len: u64 },
}

impl ContentHandle {
    fn new(begin: i64) -> Arc<Self> {
        Arc::new(ContentHandle {
            begin,
            buf: StdMutex::new(SpoolBuf::Mem(Vec::new())),
        })
    }

    /// Write |data| at the absolute journal |offset|.
    fn write_at(&self, offset: i64, data: &[u8]) -> io::Result<()> {
        let pos = (offset - self.begin) as usize;
        let mut buf = self.buf.lock().unwrap();

        if let SpoolBuf::Mem(vec) = &mut *buf {
            if pos + data.len() > SPILL_THRESHOLD {
                let file = tempfile::tempfile()?;
                file.write_all_at(vec, 0)?;
                *buf = SpoolBuf::File {
                    file,
                    len: vec.len() as u64,
                };
            }
        }

        match &mut *buf {
            SpoolBuf::Mem(vec) => {
                if vec.len() < pos + data.len() {
                    vec.resize(pos + data.len(), 0);
                }
                vec[pos..pos + data.len()].copy_from_slice(data);
            }
            SpoolBuf::File { file, len } => {
                file.write_all_at(data, pos as u64)?;
                *len = (*len).max((pos + data.len()) as u64);
            }
        }
        Ok(())
    }

    /// Read up to |len| bytes at the absolute journal |offset|, clamped to
    /// the written extent.
    pub fn read(&self, offset: i64, len: usize) -> io::Result<Bytes> {
        let pos = (offset - self.begin).max(0) as usize;
        let buf = self.buf.lock().unwrap();
        match &*buf {
            SpoolBuf::Mem(vec) => {
                let end = vec.len().min(pos + len);
                if pos >= end {
                    return Ok(Bytes::new());
                }
                Ok(Bytes::copy_from_slice(&vec[pos..end]))
            }
            SpoolBuf::File { file, len: extent } => {
                let end = (*extent as usize).min(pos + len);
                if pos >= end {
                    return Ok(Bytes::new());
                }
                let mut out = vec![0u8; end - pos];
                file.read_exact_at(&mut out, pos as u64)?;
                Ok(out.into())
            }
        }
    }
}

/// Outcome of applying a commit proposal to a [`Spool`].
pub enum CommitOutcome {
    /// The proposal extended the committed fragment; insert it into the
    /// journal's index.
    Committed(IndexFragment),
    /// The proposal restates the current fragment; nothing changed.
    NoOp,
    /// A zero-length proposal at or beyond the current end rolled the
    /// spool. A frozen non-empty prior fragment is ready for persistence.
    Rolled { frozen: Option<IndexFragment> },
    /// The proposal disagrees with this spool, whose head fragment is
    /// returned.
    Mismatch(Fragment),
}

/// The open, uncommitted byte range at the head of a journal on one
/// broker. Content arrives ahead of commitment at a delta relative to the
/// committed end; commit proposals extend the committed fragment after
/// digest verification, and zero-length proposals roll the spool.
pub struct Spool {
    fragment: Fragment,
    digest: Sha1,
    content: Arc<ContentHandle>,
    pending: i64,
    first_append_at: Option<Instant>,
}

impl Spool {
    pub fn new(journal: &str, begin: i64, codec: CompressionCodec) -> Spool {
        Spool {
            fragment: Fragment {
                journal: journal.to_string(),
                begin,
                end: begin,
                sum: Some(Sha1Sum::default()),
                compression_codec: codec as i32,
                backing_store: String::new(),
                mod_time: 0,
            },
            digest: Sha1::new(),
            content: ContentHandle::new(begin),
            pending: 0,
            first_append_at: None,
        }
    }

    /// The committed head fragment of this spool.
    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    pub fn begin(&self) -> i64 {
        self.fragment.begin
    }

    /// Committed end offset, which is the journal's next write offset.
    pub fn end(&self) -> i64 {
        self.fragment.end
    }

    pub fn pending(&self) -> i64 {
        self.pending
    }

    pub fn committed_length(&self) -> i64 {
        self.fragment.end - self.fragment.begin
    }

    /// When the first uncommitted-or-committed append of this spool
    /// arrived, for flush-interval accounting.
    pub fn first_append_at(&self) -> Option<Instant> {
        self.first_append_at
    }

    /// Stage |data| at |delta| bytes beyond the committed end. Deltas may
    /// rewind to overwrite staged-but-uncommitted content (as after an
    /// aborted append), but never below the committed end.
    pub fn append(&mut self, delta: i64, data: &[u8]) -> Result<()> {
        if delta < 0 || delta > self.pending {
            return Err(Error::InvalidArgument(format!(
                "content delta {} is outside the staged range 0..={}",
                delta, self.pending,
            )));
        }
        self.content.write_at(self.fragment.end + delta, data)?;
        self.pending = self.pending.max(delta + data.len() as i64);
        if self.first_append_at.is_none() {
            self.first_append_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Discard staged content, as when a client aborts its append. Staged
    /// bytes are simply overwritten by the next append.
    pub fn discard_pending(&mut self) {
        self.pending = 0;
    }

    /// Bound staged content to |len| bytes, dropping any stale tail left
    /// by a previously aborted append.
    pub fn truncate_pending(&mut self, len: i64) {
        self.pending = self.pending.min(len.max(0));
    }

    /// The Fragment which committing all staged content would produce.
    pub fn next_proposal(&self) -> Result<Fragment> {
        if self.pending == 0 {
            return Ok(self.fragment.clone());
        }
        let staged = self
            .content
            .read(self.fragment.end, self.pending as usize)?;
        let mut digest = self.digest.clone();
        digest.update(&staged);

        let mut proposal = self.fragment.clone();
        proposal.end += self.pending;
        proposal.sum = Some(Sha1Sum::from_digest(digest.finalize().into()));
        Ok(proposal)
    }

    /// Apply a commit |proposal| to this spool.
    pub fn apply_commit(&mut self, proposal: &Fragment) -> Result<CommitOutcome> {
        let current = &self.fragment;

        if (proposal.begin, proposal.end) == (current.begin, current.end) {
            if proposal.sum == current.sum {
                return Ok(CommitOutcome::NoOp);
            }
            return Ok(CommitOutcome::Mismatch(self.fragment.clone()));
        }

        // A zero-length proposal at or beyond our end rolls the spool.
        if proposal.begin == proposal.end && proposal.end >= current.end {
            let frozen = (self.committed_length() > 0).then(|| IndexFragment {
                spec: self.fragment.clone(),
                content: Some(self.content.clone()),
            });
            *self = Spool::new(&proposal.journal, proposal.end, self.codec());
            return Ok(CommitOutcome::Rolled { frozen });
        }

        // Otherwise the proposal must extend our fragment through content
        // we have staged, and its digest must verify.
        if proposal.begin != current.begin
            || proposal.end <= current.end
            || proposal.end > current.end + self.pending
        {
            return Ok(CommitOutcome::Mismatch(self.fragment.clone()));
        }

        let staged = self
            .content
            .read(current.end, (proposal.end - current.end) as usize)?;
        let mut digest = self.digest.clone();
        digest.update(&staged);
        let sum = Sha1Sum::from_digest(digest.clone().finalize().into());

        if Some(&sum) != proposal.sum.as_ref() {
            return Ok(CommitOutcome::Mismatch(self.fragment.clone()));
        }

        self.digest = digest;
        self.fragment.end = proposal.end;
        self.fragment.sum = Some(sum);
        self.pending = 0;

        Ok(CommitOutcome::Committed(IndexFragment {
            spec: self.fragment.clone(),
            content: Some(self.content.clone()),
        }))
    }

    /// Read committed content of this spool.
    pub fn read(&self, offset: i64, len: usize) -> io::Result<Bytes> {
        self.content.read(offset, len)
    }

    fn codec(&self) -> CompressionCodec {
        self.fragment.codec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1_of(content: &[u8]) -> Sha1Sum {
        let mut digest = Sha1::new();
        digest.update(content);
        Sha1Sum::from_digest(digest.finalize().into())
    }

    #[test]
    fn append_commit_digest_law() {
        let mut spool = Spool::new("j", 0, CompressionCodec::None);
        spool.append(0, b"hel").unwrap();
        spool.append(3, b"lo").unwrap();

        let proposal = spool.next_proposal().unwrap();
        assert_eq!((proposal.begin, proposal.end), (0, 5));
        assert_eq!(proposal.sum, Some(sha1_of(b"hello")));

        match spool.apply_commit(&proposal).unwrap() {
            CommitOutcome::Committed(f) => {
                assert_eq!(f.spec, proposal);
                assert_eq!(
                    f.content.unwrap().read(0, 5).unwrap(),
                    Bytes::from_static(b"hello")
                );
            }
            _ => panic!("expected commit"),
        }
        assert_eq!(spool.end(), 5);
        assert_eq!(spool.pending(), 0);

        // A second commit continues the running digest from the begin.
        spool.append(0, b" world").unwrap();
        let proposal = spool.next_proposal().unwrap();
        assert_eq!(proposal.end, 11);
        assert_eq!(proposal.sum, Some(sha1_of(b"hello world")));
        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::Committed(_)
        ));
    }

    #[test]
    fn aborted_content_is_overwritten() {
        let mut spool = Spool::new("j", 0, CompressionCodec::None);
        spool.append(0, b"junk-junk").unwrap();
        spool.discard_pending();

        spool.append(0, b"keep").unwrap();
        let proposal = spool.next_proposal().unwrap();
        assert_eq!(proposal.end, 4);
        assert_eq!(proposal.sum, Some(sha1_of(b"keep")));
        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::Committed(_)
        ));
        assert_eq!(spool.read(0, 10).unwrap(), Bytes::from_static(b"keep"));
    }

    #[test]
    fn replica_overwrite_after_peer_abort() {
        // A peer staged 9 bytes which the primary then abandoned. The next
        // append rewinds to delta zero and commits a shorter extent.
        let mut spool = Spool::new("j", 0, CompressionCodec::None);
        spool.append(0, b"abandoned").unwrap();

        spool.append(0, b"kept").unwrap();
        let mut proposal = spool.fragment().clone();
        proposal.end = 4;
        proposal.sum = Some(sha1_of(b"kept"));

        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::Committed(_)
        ));
        assert_eq!(spool.read(0, 4).unwrap(), Bytes::from_static(b"kept"));
    }

    #[test]
    fn mismatched_proposals_leave_the_spool_intact() {
        let mut spool = Spool::new("j", 0, CompressionCodec::None);
        spool.append(0, b"hello").unwrap();

        // Wrong digest.
        let mut proposal = spool.fragment().clone();
        proposal.end = 5;
        proposal.sum = Some(sha1_of(b"jello"));
        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::Mismatch(_)
        ));

        // Beyond staged content.
        let mut proposal = spool.fragment().clone();
        proposal.end = 6;
        proposal.sum = Some(sha1_of(b"hello!"));
        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::Mismatch(_)
        ));

        // The correct proposal still commits.
        let proposal = spool.next_proposal().unwrap();
        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::Committed(_)
        ));
    }

    #[test]
    fn zero_length_proposal_rolls() {
        let mut spool = Spool::new("j", 0, CompressionCodec::Gzip);
        spool.append(0, b"hello").unwrap();
        let proposal = spool.next_proposal().unwrap();
        spool.apply_commit(&proposal).unwrap();

        let mut roll = Fragment {
            journal: "j".to_string(),
            begin: 5,
            end: 5,
            sum: Some(Sha1Sum::default()),
            compression_codec: CompressionCodec::Gzip as i32,
            ..Default::default()
        };
        match spool.apply_commit(&roll).unwrap() {
            CommitOutcome::Rolled { frozen } => {
                let frozen = frozen.unwrap();
                assert_eq!((frozen.spec.begin, frozen.spec.end), (0, 5));
                assert_eq!(
                    frozen.content.unwrap().read(0, 5).unwrap(),
                    Bytes::from_static(b"hello")
                );
            }
            _ => panic!("expected roll"),
        }
        assert_eq!((spool.begin(), spool.end()), (5, 5));

        // Rolling an empty spool freezes nothing.
        roll.begin = 8;
        roll.end = 8;
        match spool.apply_commit(&roll).unwrap() {
            CommitOutcome::Rolled { frozen } => assert!(frozen.is_none()),
            _ => panic!("expected roll"),
        }
        assert_eq!(spool.begin(), 8);

        // A rollback below the committed end is a mismatch.
        roll.begin = 3;
        roll.end = 3;
        assert!(matches!(
            spool.apply_commit(&roll).unwrap(),
            CommitOutcome::Mismatch(_)
        ));
    }

    #[test]
    fn restating_the_current_fragment_is_a_noop() {
        let mut spool = Spool::new("j", 0, CompressionCodec::None);
        let proposal = spool.fragment().clone();
        assert!(matches!(
            spool.apply_commit(&proposal).unwrap(),
            CommitOutcome::NoOp
        ));
    }

    #[test]
    fn content_spills_to_disk_beyond_threshold() {
        let handle = ContentHandle::new(0);
        let chunk = vec![7u8; 1 << 20];
        for i in 0..5 {
            handle.write_at(i * (1 << 20), &chunk).unwrap();
        }
        let read = handle.read(4 * (1 << 20), 1 << 20).unwrap();
        assert_eq!(read.len(), 1 << 20);
        assert!(read.iter().all(|b| *b == 7));

        // Reads clamp to the written extent.
        assert_eq!(handle.read(5 * (1 << 20), 100).unwrap().len(), 0);
    }

    #[test]
    fn append_rejects_invalid_deltas() {
        let mut spool = Spool::new("j", 100, CompressionCodec::None);
        assert!(spool.append(-1, b"x").is_err());
        assert!(spool.append(1, b"x").is_err());
        spool.append(0, b"x").unwrap();
        spool.append(1, b"y").unwrap();
    }
}
