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

use std::fmt::Write as _;

use crate::v1::{CompressionCodec, Fragment, Sha1Sum};

impl Sha1Sum {
    pub fn from_digest(digest: [u8; 20]) -> Self {
        Sha1Sum {
            part1: u64::from_be_bytes(digest[0..8].try_into().unwrap()),
            part2: u64::from_be_bytes(digest[8..16].try_into().unwrap()),
            part3: u32::from_be_bytes(digest[16..20].try_into().unwrap()),
        }
    }

    pub fn to_digest(&self) -> [u8; 20] {
        let mut d = [0u8; 20];
        d[0..8].copy_from_slice(&self.part1.to_be_bytes());
        d[8..16].copy_from_slice(&self.part2.to_be_bytes());
        d[16..20].copy_from_slice(&self.part3.to_be_bytes());
        d
    }

    pub fn is_zero(&self) -> bool {
        self.part1 == 0 && self.part2 == 0 && self.part3 == 0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(40);
        for b in self.to_digest() {
            write!(&mut s, "{:02x}", b).unwrap();
        }
        s
    }

    pub fn parse_hex(hex: &str) -> Option<Sha1Sum> {
        if hex.len() != 40 {
            return None;
        }
        let mut digest = [0u8; 20];
        for (i, d) in digest.iter_mut().enumerate() {
            *d = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
        }
        Some(Sha1Sum::from_digest(digest))
    }
}

impl CompressionCodec {
    /// File extension of fragment objects written with this codec.
    pub fn suffix(&self) -> &'static str {
        match self {
            CompressionCodec::None => ".raw",
            CompressionCodec::Gzip => ".gz",
            CompressionCodec::Zstandard => ".zst",
            CompressionCodec::Snappy => ".sz",
            CompressionCodec::GzipOffloadDecompression => ".gzod",
            CompressionCodec::InvalidCodec => ".invalid",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<CompressionCodec> {
        match suffix {
            ".raw" => Some(CompressionCodec::None),
            ".gz" => Some(CompressionCodec::Gzip),
            ".zst" => Some(CompressionCodec::Zstandard),
            ".sz" => Some(CompressionCodec::Snappy),
            ".gzod" => Some(CompressionCodec::GzipOffloadDecompression),
            _ => None,
        }
    }
}

impl Fragment {
    pub fn content_length(&self) -> i64 {
        self.end - self.begin
    }

    /// True if this fragment covers |offset|.
    pub fn covers(&self, offset: i64) -> bool {
        self.begin <= offset && offset < self.end
    }

    pub fn codec(&self) -> CompressionCodec {
        CompressionCodec::from(self.compression_codec)
    }

    /// Content-addressed object name of this fragment, without its journal
    /// prefix: `{begin:016x}-{end:016x}-{digest}{suffix}`.
    pub fn content_name(&self) -> String {
        format!(
            "{:016x}-{:016x}-{}{}",
            self.begin,
            self.end,
            self.sum.clone().unwrap_or_default().to_hex(),
            self.codec().suffix(),
        )
    }

    /// Object path of this fragment relative to a store root.
    pub fn content_path(&self) -> String {
        format!("{}/{}", self.journal, self.content_name())
    }
}

/// Parses a fragment object name (as produced by [`Fragment::content_name`])
/// back into a Fragment of the journal.
pub fn parse_content_name(journal: &str, name: &str) -> Option<Fragment> {
    let dot = name.rfind('.')?;
    let codec = CompressionCodec::from_suffix(&name[dot..])?;

    let mut parts = name[..dot].splitn(3, '-');
    let begin = i64::from_str_radix(parts.next()?, 16).ok()?;
    let end = i64::from_str_radix(parts.next()?, 16).ok()?;
    let sum = Sha1Sum::parse_hex(parts.next()?)?;
    if begin > end {
        return None;
    }

    Some(Fragment {
        journal: journal.to_string(),
        begin,
        end,
        sum: Some(sum),
        compression_codec: codec as i32,
        backing_store: String::new(),
        mod_time: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_fixture() -> Sha1Sum {
        let mut digest = [0u8; 20];
        for (i, d) in digest.iter_mut().enumerate() {
            *d = i as u8;
        }
        Sha1Sum::from_digest(digest)
    }

    #[test]
    fn sum_digest_round_trip() {
        let sum = sum_fixture();
        assert_eq!(Sha1Sum::from_digest(sum.to_digest()), sum);
        assert_eq!(Sha1Sum::parse_hex(&sum.to_hex()), Some(sum));
        assert!(Sha1Sum::default().is_zero());
    }

    #[test]
    fn content_name_round_trip() {
        let fragment = Fragment {
            journal: "a/journal".to_string(),
            begin: 0x1234,
            end: 0x5678,
            sum: Some(sum_fixture()),
            compression_codec: CompressionCodec::Snappy as i32,
            backing_store: "file:///fragments/".to_string(),
            mod_time: 1234567890,
        };
        let parsed = parse_content_name("a/journal", &fragment.content_name()).unwrap();

        assert_eq!(parsed.journal, fragment.journal);
        assert_eq!(parsed.begin, fragment.begin);
        assert_eq!(parsed.end, fragment.end);
        assert_eq!(parsed.sum, fragment.sum);
        assert_eq!(parsed.compression_codec, fragment.compression_codec);
        // Store and mod time are supplied by the listing, not the name.
        assert_eq!(parsed.backing_store, "");
        assert_eq!(parsed.mod_time, 0);
    }

    #[test]
    fn content_name_rejects_malformed() {
        assert!(parse_content_name("j", "not-a-fragment").is_none());
        assert!(parse_content_name("j", "0-1-abcd.raw").is_none());
        let inverted = format!(
            "{:016x}-{:016x}-{}.raw",
            10,
            5,
            Sha1Sum::default().to_hex()
        );
        assert!(parse_content_name("j", &inverted).is_none());
    }

    #[test]
    fn covers_and_length() {
        let f = Fragment {
            begin: 100,
            end: 200,
            ..Default::default()
        };
        assert_eq!(f.content_length(), 100);
        assert!(f.covers(100) && f.covers(199));
        assert!(!f.covers(99) && !f.covers(200));
    }
}
