use thiserror::Error;

use crate::track::{TrackEvent, TrackStatus};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("track cannot go from {from} via {event:?}")]
    InvalidTransition { from: TrackStatus, event: TrackEvent },
    #[error("job parameters missing: {}", .0.join(", "))]
    MissingJobFields(Vec<&'static str>),
    #[error("unsupported audio type '{0}'; only lossless formats are accepted")]
    UnsupportedMimeType(String),
    #[error("malformed byte range '{0}'")]
    InvalidByteRange(String),
    #[error("cannot resolve segment: {0}")]
    SegmentLookup(String),
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;
