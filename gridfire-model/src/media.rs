use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lossless container formats accepted for ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Aiff,
    Flac,
    Wav,
}

impl SourceFormat {
    /// Resolves a declared MIME type. Parameters such as `; codecs=...` are
    /// ignored; anything outside the lossless allow-list is rejected.
    pub fn from_mime(mime: &str) -> Result<Self, ModelError> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "audio/aiff" | "audio/x-aiff" => Ok(SourceFormat::Aiff),
            "audio/flac" | "audio/x-flac" => Ok(SourceFormat::Flac),
            "audio/wav" | "audio/x-wav" | "audio/vnd.wav" | "audio/wave" => {
                Ok(SourceFormat::Wav)
            }
            _ => Err(ModelError::UnsupportedMimeType(mime.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SourceFormat::Aiff => ".aiff",
            SourceFormat::Flac => ".flac",
            SourceFormat::Wav => ".wav",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_types_map_to_extensions() {
        let cases = [
            ("audio/aiff", ".aiff"),
            ("audio/x-aiff", ".aiff"),
            ("audio/flac", ".flac"),
            ("audio/vnd.wav", ".wav"),
            ("audio/wav", ".wav"),
            ("AUDIO/X-WAV; charset=binary", ".wav"),
        ];
        for (mime, ext) in cases {
            assert_eq!(SourceFormat::from_mime(mime).unwrap().extension(), ext);
        }
    }

    #[test]
    fn lossy_and_unknown_types_are_rejected() {
        for mime in ["audio/mpeg", "audio/mp4", "video/mp4", ""] {
            assert!(matches!(
                SourceFormat::from_mime(mime),
                Err(ModelError::UnsupportedMimeType(_))
            ));
        }
    }
}
