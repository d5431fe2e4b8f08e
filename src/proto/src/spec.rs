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

use crate::{
    label::{is_token, META_LABEL_NAME, META_LABEL_PREFIX},
    v1::{BrokerSpec, CompressionCodec, JournalSpec},
};

/// Journal flag bits.
pub const FLAG_NOT_SPECIFIED: u32 = 0;
pub const FLAG_O_RDONLY: u32 = 0x01;
pub const FLAG_O_WRONLY: u32 = 0x02;
pub const FLAG_O_RDWR: u32 = 0x04;

pub const MAX_JOURNAL_NAME_LEN: usize = 512;
pub const MAX_REPLICATION: i32 = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid journal name {0:?}")]
    InvalidName(String),
    #[error("invalid replication factor {0} (expected 1..={MAX_REPLICATION})")]
    InvalidReplication(i32),
    #[error("labels are not unique and sorted on (name, value)")]
    InconsistentLabels,
    #[error("label name {0:?} is reserved")]
    ReservedLabel(String),
    #[error("invalid label token {0:?}")]
    InvalidLabel(String),
    #[error("missing fragment configuration")]
    MissingFragment,
    #[error("invalid fragment length {0}")]
    InvalidFragmentLength(i64),
    #[error("invalid compression codec")]
    InvalidCodec,
    #[error("invalid fragment store URL {0:?}")]
    InvalidStore(String),
    #[error("invalid flags {0:#x}")]
    InvalidFlags(u32),
    #[error("invalid process zone or suffix {0:?}")]
    InvalidProcessId(String),
}

/// True if a journal name is well formed: a token without leading,
/// trailing, or repeated path separators.
pub fn validate_journal_name(name: &str) -> bool {
    is_token(name)
        && name.len() <= MAX_JOURNAL_NAME_LEN
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.contains("//")
}

impl JournalSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !validate_journal_name(&self.name) {
            return Err(ValidationError::InvalidName(self.name.clone()));
        }
        if self.replication < 1 || self.replication > MAX_REPLICATION {
            return Err(ValidationError::InvalidReplication(self.replication));
        }

        let labels = self.labels.clone().unwrap_or_default();
        if !labels.is_consistent() {
            return Err(ValidationError::InconsistentLabels);
        }
        for l in &labels.labels {
            if l.name == META_LABEL_NAME || l.name == META_LABEL_PREFIX {
                return Err(ValidationError::ReservedLabel(l.name.clone()));
            }
            if !is_token(&l.name) || (!l.value.is_empty() && !is_token(&l.value)) {
                return Err(ValidationError::InvalidLabel(format!("{}={}", l.name, l.value)));
            }
        }

        let fragment = self
            .fragment
            .as_ref()
            .ok_or(ValidationError::MissingFragment)?;
        if fragment.length <= 0 {
            return Err(ValidationError::InvalidFragmentLength(fragment.length));
        }
        if CompressionCodec::from(fragment.compression_codec) == CompressionCodec::InvalidCodec {
            return Err(ValidationError::InvalidCodec);
        }
        for store in &fragment.stores {
            if !validate_store_url(store) {
                return Err(ValidationError::InvalidStore(store.clone()));
            }
        }

        match self.flags {
            FLAG_NOT_SPECIFIED | FLAG_O_RDONLY | FLAG_O_WRONLY | FLAG_O_RDWR => Ok(()),
            flags => Err(ValidationError::InvalidFlags(flags)),
        }
    }

    /// True unless the journal is write-only.
    pub fn may_read(&self) -> bool {
        self.flags != FLAG_O_WRONLY
    }

    /// True unless the journal is read-only.
    pub fn may_write(&self) -> bool {
        self.flags != FLAG_O_RDONLY
    }
}

/// Store URLs are `scheme://path/` with a trailing slash, under which
/// fragment content paths are rooted.
pub fn validate_store_url(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, rest)) => !scheme.is_empty() && url.ends_with('/') && !rest.is_empty(),
        None => false,
    }
}

impl BrokerSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let id = self
            .process_spec
            .as_ref()
            .and_then(|p| p.id.as_ref())
            .ok_or_else(|| ValidationError::InvalidProcessId(String::new()))?;
        if !is_token(&id.zone) || !is_token(&id.suffix) {
            return Err(ValidationError::InvalidProcessId(id.format()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::v1::LabelSet;

    fn spec() -> JournalSpec {
        JournalSpec {
            name: "topic/part-000".to_string(),
            replication: 2,
            labels: Some(LabelSet::from_pairs(&[("topic", "clicks")])),
            fragment: Some(crate::v1::journal_spec::Fragment {
                length: 1 << 20,
                compression_codec: CompressionCodec::Gzip as i32,
                stores: vec!["file:///fragments/".to_string()],
                refresh_interval: Some(crate::duration_to_proto(
                    std::time::Duration::from_secs(300),
                )),
                retention: Some(crate::duration_to_proto(std::time::Duration::from_secs(
                    3600,
                ))),
                flush_interval: Some(crate::duration_to_proto(std::time::Duration::from_secs(
                    600,
                ))),
            }),
            flags: FLAG_NOT_SPECIFIED,
        }
    }

    #[test]
    fn valid_spec_round_trips() {
        let s = spec();
        s.validate().unwrap();

        let encoded = s.encode_to_vec();
        let decoded = JournalSpec::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(decoded.encode_to_vec(), encoded);
    }

    #[test]
    fn name_validation() {
        for bad in ["", "/lead", "trail/", "a//b", "sp ace"] {
            let mut s = spec();
            s.name = bad.to_string();
            assert!(s.validate().is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn reserved_labels_rejected() {
        let mut s = spec();
        s.labels = Some(LabelSet::from_pairs(&[("name", "x")]));
        assert_eq!(
            s.validate(),
            Err(ValidationError::ReservedLabel("name".to_string()))
        );

        s.labels = Some(LabelSet::from_pairs(&[("prefix", "x/")]));
        assert!(s.validate().is_err());
    }

    #[test]
    fn fragment_validation() {
        let mut s = spec();
        s.fragment = None;
        assert_eq!(s.validate(), Err(ValidationError::MissingFragment));

        let mut s = spec();
        s.fragment.as_mut().unwrap().length = 0;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.fragment.as_mut().unwrap().stores = vec!["no-scheme/".to_string()];
        assert!(s.validate().is_err());

        // Missing trailing slash.
        let mut s = spec();
        s.fragment.as_mut().unwrap().stores = vec!["file:///fragments".to_string()];
        assert!(s.validate().is_err());
    }

    #[test]
    fn flags_gate_io() {
        let mut s = spec();
        s.flags = FLAG_O_RDONLY;
        assert!(s.may_read() && !s.may_write());

        s.flags = FLAG_O_WRONLY;
        assert!(!s.may_read() && s.may_write());

        s.flags = 0x08;
        assert!(s.validate().is_err());
    }
}
