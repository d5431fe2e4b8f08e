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

use std::io::{Read, Write};

use bytes::Bytes;
use journal_proto::CompressionCodec;

use crate::{Error, Result};

/// Compresses uncompressed fragment content per |codec|.
pub fn compress(codec: CompressionCodec, content: &[u8]) -> Result<Bytes> {
    match codec {
        CompressionCodec::None => Ok(Bytes::copy_from_slice(content)),
        CompressionCodec::Gzip | CompressionCodec::GzipOffloadDecompression => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(content)?;
            Ok(enc.finish()?.into())
        }
        CompressionCodec::Zstandard => Ok(zstd::stream::encode_all(content, 0)
            .map_err(Error::Io)?
            .into()),
        CompressionCodec::Snappy => {
            let mut enc = snap::write::FrameEncoder::new(Vec::new());
            enc.write_all(content)?;
            Ok(enc
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?
                .into())
        }
        CompressionCodec::InvalidCodec => {
            Err(Error::InvalidFragment("invalid compression codec".into()))
        }
    }
}

/// Decompresses a raw fragment object per |codec|.
pub fn decompress(codec: CompressionCodec, raw: &[u8]) -> Result<Bytes> {
    match codec {
        CompressionCodec::None => Ok(Bytes::copy_from_slice(raw)),
        CompressionCodec::Gzip | CompressionCodec::GzipOffloadDecompression => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(raw).read_to_end(&mut out)?;
            Ok(out.into())
        }
        CompressionCodec::Zstandard => Ok(zstd::stream::decode_all(raw).map_err(Error::Io)?.into()),
        CompressionCodec::Snappy => {
            let mut out = Vec::new();
            snap::read::FrameDecoder::new(raw).read_to_end(&mut out)?;
            Ok(out.into())
        }
        CompressionCodec::InvalidCodec => {
            Err(Error::InvalidFragment("invalid compression codec".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let content = b"the quick brown fox jumps over the lazy dog".repeat(32);
        for codec in [
            CompressionCodec::None,
            CompressionCodec::Gzip,
            CompressionCodec::Zstandard,
            CompressionCodec::Snappy,
            CompressionCodec::GzipOffloadDecompression,
        ] {
            let compressed = compress(codec, &content).unwrap();
            assert_eq!(decompress(codec, &compressed).unwrap(), content, "{:?}", codec);
        }
    }

    #[test]
    fn invalid_codec_errors() {
        assert!(compress(CompressionCodec::InvalidCodec, b"x").is_err());
        assert!(decompress(CompressionCodec::InvalidCodec, b"x").is_err());
    }
}
