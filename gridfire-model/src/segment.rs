use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::ModelError, track::ByteRange};

/// How a playback time is turned into a segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SegmentLookup {
    /// Always the first segment.
    Initial,
    /// Round the fractional index up; used while buffering ahead.
    Forward,
    /// Round the fractional index down; used when seeking.
    Backward,
}

impl SegmentLookup {
    fn code(self) -> &'static str {
        match self {
            SegmentLookup::Initial => "0",
            SegmentLookup::Forward => "1",
            SegmentLookup::Backward => "2",
        }
    }
}

impl FromStr for SegmentLookup {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "initial" => Ok(SegmentLookup::Initial),
            "1" | "forward" => Ok(SegmentLookup::Forward),
            "2" | "backward" | "seek" => Ok(SegmentLookup::Backward),
            other => Err(ModelError::UnknownVariant {
                kind: "segment lookup",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for SegmentLookup {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SegmentLookup> for String {
    fn from(lookup: SegmentLookup) -> Self {
        lookup.code().to_string()
    }
}

impl fmt::Display for SegmentLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The streaming-relevant projection of a packaged track.
///
/// This is all a player needs; it never carries key material or the
/// status of unrelated tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStreamInfo {
    pub duration: f64,
    pub cid: String,
    pub init_range: ByteRange,
    pub segment_list: Vec<ByteRange>,
    pub segment_duration: u32,
    pub segment_timescale: u32,
}

/// Result of resolving a playback time against a segment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentResolution {
    pub index: usize,
    pub range: ByteRange,
    pub end: bool,
}

impl TrackStreamInfo {
    /// Nominal segment length in seconds.
    pub fn segment_seconds(&self) -> f64 {
        f64::from(self.segment_duration) / f64::from(self.segment_timescale)
    }

    /// Maps `time` (seconds) onto a segment.
    ///
    /// The fractional index is `time / (segment_duration / timescale)`. A
    /// forward lookup past the final segment is clamped to it, and `end` is
    /// set whenever the resolved segment is the last one.
    pub fn resolve(
        &self,
        time: f64,
        lookup: SegmentLookup,
    ) -> Result<SegmentResolution, ModelError> {
        if !time.is_finite() || time < 0.0 {
            return Err(ModelError::SegmentLookup(format!(
                "invalid playback time {time}"
            )));
        }
        let last = self.segment_list.len().checked_sub(1).ok_or_else(|| {
            ModelError::SegmentLookup("track has no segments".to_string())
        })?;
        let span = self.segment_seconds();
        if !span.is_normal() {
            return Err(ModelError::SegmentLookup(format!(
                "invalid segment length {span}"
            )));
        }

        let segment_time = time / span;
        let raw = match lookup {
            SegmentLookup::Initial => 0.0,
            SegmentLookup::Forward => segment_time.ceil(),
            SegmentLookup::Backward => segment_time.floor(),
        };
        let index = (raw as usize).min(last);

        Ok(SegmentResolution {
            index,
            range: self.segment_list[index],
            end: index == last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packaged(segments: usize) -> TrackStreamInfo {
        TrackStreamInfo {
            duration: segments as f64 * 10.0 - 3.0,
            cid: "r/t/track.mp4".into(),
            init_range: ByteRange::at(0, 600),
            segment_list: (0..segments)
                .map(|i| ByteRange::at(600 + i as u64 * 1000, 1000))
                .collect(),
            segment_duration: 441_000,
            segment_timescale: 44_100,
        }
    }

    #[test]
    fn seek_into_last_segment_marks_end() {
        let info = packaged(5);
        let hit = info.resolve(47.0, SegmentLookup::Backward).unwrap();
        assert_eq!(hit.index, 4);
        assert!(hit.end);
        assert_eq!(hit.range, info.segment_list[4]);
    }

    #[test]
    fn forward_lookup_rounds_up_and_clamps() {
        let info = packaged(5);
        let hit = info.resolve(12.5, SegmentLookup::Forward).unwrap();
        assert_eq!(hit.index, 2);
        assert!(!hit.end);

        let past = info.resolve(47.0, SegmentLookup::Forward).unwrap();
        assert_eq!(past.index, 4);
        assert!(past.end);
    }

    #[test]
    fn initial_lookup_ignores_time() {
        let info = packaged(5);
        let hit = info.resolve(33.0, SegmentLookup::Initial).unwrap();
        assert_eq!(hit.index, 0);
        assert!(!hit.end);
    }

    #[test]
    fn single_segment_is_always_the_end() {
        let info = packaged(1);
        assert!(info.resolve(0.0, SegmentLookup::Initial).unwrap().end);
    }

    #[test]
    fn invalid_times_are_rejected() {
        let info = packaged(3);
        assert!(info.resolve(-1.0, SegmentLookup::Backward).is_err());
        assert!(info.resolve(f64::NAN, SegmentLookup::Backward).is_err());
    }

    #[test]
    fn lookup_accepts_codes_and_names() {
        assert_eq!("0".parse::<SegmentLookup>(), Ok(SegmentLookup::Initial));
        assert_eq!("1".parse::<SegmentLookup>(), Ok(SegmentLookup::Forward));
        assert_eq!("seek".parse::<SegmentLookup>(), Ok(SegmentLookup::Backward));
        assert!("3".parse::<SegmentLookup>().is_err());
    }
}
