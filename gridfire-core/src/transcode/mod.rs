//! Transcoding engine adapter.
//!
//! Stage handlers talk to a [`TranscodeEngine`]; production uses
//! [`FfmpegEngine`], which drives the `ffmpeg`/`ffprobe` binaries as child
//! processes.

pub mod ffmpeg;
pub mod progress;

use std::{fmt, io, path::Path, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::{ErrorClass, io_class},
    storage::ByteStream,
};

pub use ffmpeg::{FfmpegEngine, FfmpegSettings};
pub use progress::ProgressReporter;

/// Facts learned by probing an audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeInfo {
    /// Seconds.
    pub duration: f64,
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bit_rate: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with status {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("reading encoder input failed: {0}")]
    Input(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TranscodeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TranscodeError::Spawn { .. } | TranscodeError::Io(_) => {
                ErrorClass::Transient
            }
            TranscodeError::Exit { .. }
            | TranscodeError::Timeout { .. }
            | TranscodeError::Probe(_) => ErrorClass::Content,
            TranscodeError::Input(err) => io_class(err),
        }
    }
}

#[async_trait]
pub trait TranscodeEngine: Send + Sync + fmt::Debug {
    /// Re-encodes a lossless source arriving on `input` into an archival FLAC
    /// file at `output`. `size_hint` is the input length in bytes when known.
    async fn encode_flac(
        &self,
        input: ByteStream,
        size_hint: Option<u64>,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError>;

    /// Encodes a fragmented MP4 with AAC audio suitable for segmenting.
    async fn encode_fragmented_aac(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError>;

    async fn encode_mp3(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError>;

    async fn probe(&self, input: &Path) -> Result<ProbeInfo, TranscodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherError;

    #[test]
    fn encoder_failures_are_not_retried() {
        let exit = TranscodeError::Exit {
            program: "ffmpeg".into(),
            code: Some(1),
            stderr: "Invalid data found when processing input".into(),
        };
        assert_eq!(exit.class(), ErrorClass::Content);

        let spawn = TranscodeError::Spawn {
            program: "ffmpeg".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(spawn.class(), ErrorClass::Transient);

        let tampered = TranscodeError::Input(CipherError::Integrity.into());
        assert_eq!(tampered.class(), ErrorClass::Content);
    }
}
