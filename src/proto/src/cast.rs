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

use std::time::Duration;

use crate::v1::{CompressionCodec, Status};

impl From<i32> for Status {
    fn from(status: i32) -> Self {
        Status::from_i32(status).unwrap_or(Status::Ok)
    }
}

impl From<i32> for CompressionCodec {
    fn from(codec: i32) -> Self {
        CompressionCodec::from_i32(codec).unwrap_or(CompressionCodec::InvalidCodec)
    }
}

/// Converts a wire duration to a std duration. Negative wire durations
/// clamp to zero.
pub fn duration_from_proto(d: Option<&prost_types::Duration>) -> Duration {
    match d {
        Some(d) if d.seconds >= 0 && d.nanos >= 0 => {
            Duration::new(d.seconds as u64, d.nanos as u32)
        }
        _ => Duration::ZERO,
    }
}

pub fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_round_trip() {
        let d = Duration::new(300, 250_000_000);
        assert_eq!(duration_from_proto(Some(&duration_to_proto(d))), d);
        assert_eq!(duration_from_proto(None), Duration::ZERO);
    }
}
