use std::{
    collections::VecDeque,
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
};
use tracing::{debug, info, trace, warn};

use super::{ProbeInfo, ProgressReporter, TranscodeEngine, TranscodeError};
use crate::storage::ByteStream;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Upper bound for a single encoder run.
    pub timeout: Duration,
    pub aac_bitrate: String,
    pub fragment_duration: Duration,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            timeout: Duration::from_secs(30 * 60),
            aac_bitrate: "256k".to_string(),
            fragment_duration: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegEngine {
    settings: FfmpegSettings,
}

/// How encode progress is derived for one run.
#[derive(Debug, Clone, Copy)]
enum ProgressBasis {
    /// Bytes fed on stdin against the known input size.
    InputBytes(u64),
    /// `out_time` against the input duration announced on stderr.
    OutputTime,
}

enum Feed {
    Input(std::io::Error),
    Closed,
}

impl FfmpegEngine {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FfmpegSettings {
        &self.settings
    }

    fn program(&self) -> String {
        self.settings.ffmpeg_path.display().to_string()
    }

    fn flac_args(output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        args.extend(
            [
                "-i", "pipe:0", "-map", "0:a:0", "-map_metadata", "-1",
                "-c:a", "flac", "-compression_level", "8",
                "-fflags", "+bitexact", "-flags:a", "+bitexact",
                "-f", "flac",
            ]
            .map(OsString::from),
        );
        args.push(output.into());
        args
    }

    fn aac_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let fragment_us = self.settings.fragment_duration.as_micros().max(1).to_string();
        let mut args = base_args();
        args.extend([OsString::from("-i"), input.into()]);
        args.extend(
            [
                "-map", "0:a:0", "-map_metadata", "-1", "-vn",
                "-c:a", "aac", "-b:a", self.settings.aac_bitrate.as_str(),
                "-movflags", "+empty_moov+default_base_moof+frag_keyframe",
                "-frag_duration", fragment_us.as_str(),
                "-f", "mp4",
            ]
            .map(OsString::from),
        );
        args.push(output.into());
        args
    }

    fn mp3_args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        args.extend([OsString::from("-i"), input.into()]);
        args.extend(
            [
                "-map", "0:a:0", "-vn", "-c:a", "libmp3lame", "-q:a", "0",
                "-id3v2_version", "3", "-f", "mp3",
            ]
            .map(OsString::from),
        );
        args.push(output.into());
        args
    }

    async fn run(
        &self,
        args: Vec<OsString>,
        input: Option<ByteStream>,
        basis: ProgressBasis,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        let program = self.program();
        debug!(program = %program, ?args, "starting encoder");

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: program.clone(),
                source,
            })?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let monitor = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&tail);
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut duration: Option<f64> = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    if let ProgressBasis::OutputTime = basis {
                        if duration.is_none() && line.contains("Duration:") {
                            duration = parse_duration_from_line(&line);
                        }
                        if let (Some(total), Some(at)) = (duration, parse_out_time(&line)) {
                            progress.fraction(at, total);
                        }
                    }
                    if is_progress_line(&line) {
                        trace!(line = %line, "encoder progress");
                        continue;
                    }
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        let feeder = match (input, child.stdin.take()) {
            (Some(input), Some(stdin)) => {
                let progress = progress.clone();
                Some(tokio::spawn(feed_stdin(input, stdin, basis, progress)))
            }
            _ => None,
        };

        let status: ExitStatus =
            match tokio::time::timeout(self.settings.timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(program = %program, timeout = ?self.settings.timeout, "encoder timed out, killing");
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill encoder");
                    }
                    if let Some(feeder) = feeder {
                        feeder.abort();
                    }
                    return Err(TranscodeError::Timeout {
                        program,
                        after: self.settings.timeout,
                    });
                }
            };

        // A failed read upstream outranks whatever ffmpeg made of the short input.
        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Feed::Input(err)) => return Err(TranscodeError::Input(err)),
                Ok(Feed::Closed) => {}
                Err(err) => warn!(error = %err, "stdin feeder task failed"),
            }
        }
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        if !status.success() {
            let stderr = tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
            warn!(program = %program, code = ?status.code(), stderr = %stderr, "encoder failed");
            return Err(TranscodeError::Exit {
                program,
                code: status.code(),
                stderr,
            });
        }

        progress.percent(100.0);
        Ok(())
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn encode_flac(
        &self,
        input: ByteStream,
        size_hint: Option<u64>,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        let basis = match size_hint {
            Some(total) if total > 0 => ProgressBasis::InputBytes(total),
            _ => ProgressBasis::OutputTime,
        };
        self.run(Self::flac_args(output), Some(input), basis, progress)
            .await?;
        info!(output = %output.display(), "flac encode finished");
        Ok(())
    }

    async fn encode_fragmented_aac(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        self.run(
            self.aac_args(input, output),
            None,
            ProgressBasis::OutputTime,
            progress,
        )
        .await?;
        info!(output = %output.display(), "aac encode finished");
        Ok(())
    }

    async fn encode_mp3(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        self.run(
            Self::mp3_args(input, output),
            None,
            ProgressBasis::OutputTime,
            progress,
        )
        .await?;
        info!(output = %output.display(), "mp3 encode finished");
        Ok(())
    }

    async fn probe(&self, input: &Path) -> Result<ProbeInfo, TranscodeError> {
        let program = self.settings.ffprobe_path.display().to_string();
        let run = Command::new(&self.settings.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.settings.timeout, run).await {
            Ok(output) => output.map_err(|source| TranscodeError::Spawn {
                program: program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(TranscodeError::Timeout {
                    program,
                    after: self.settings.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(TranscodeError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let info = parse_probe_output(&output.stdout)?;
        debug!(input = %input.display(), duration = info.duration, codec = %info.codec, "probed audio");
        Ok(info)
    }
}

fn base_args() -> Vec<OsString> {
    ["-hide_banner", "-nostats", "-progress", "pipe:2", "-y"]
        .map(OsString::from)
        .to_vec()
}

async fn feed_stdin(
    mut input: ByteStream,
    mut stdin: ChildStdin,
    basis: ProgressBasis,
    progress: ProgressReporter,
) -> Feed {
    let mut fed = 0u64;
    while let Some(chunk) = input.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return Feed::Input(err),
        };
        if let Err(err) = stdin.write_all(&chunk).await {
            // The encoder stopped reading; its exit status tells the story.
            debug!(error = %err, "encoder closed stdin early");
            return Feed::Closed;
        }
        fed += chunk.len() as u64;
        if let ProgressBasis::InputBytes(total) = basis {
            progress.fraction(fed as f64, total as f64);
        }
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(error = %err, "closing encoder stdin failed");
    }
    Feed::Closed
}

fn is_progress_line(line: &str) -> bool {
    line.split_once('=').is_some_and(|(key, _)| {
        !key.is_empty() && key.chars().all(|c| c.is_ascii_lowercase() || c == '_')
    })
}

/// `out_time=00:01:02.500000` from `-progress` output, in seconds.
fn parse_out_time(line: &str) -> Option<f64> {
    let value = line.strip_prefix("out_time=")?;
    parse_time_to_seconds(value.trim())
}

/// Parses `HH:MM:SS.frac`.
fn parse_time_to_seconds(time_str: &str) -> Option<f64> {
    let mut parts = time_str.split(':');
    let (hours, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let total = hours.parse::<f64>().ok()? * 3600.0
        + minutes.parse::<f64>().ok()? * 60.0
        + seconds.parse::<f64>().ok()?;
    (total >= 0.0).then_some(total)
}

/// Reads the input duration from a banner line such as
/// `  Duration: 00:03:05.12, start: 0.000000, bitrate: 1411 kb/s`.
fn parse_duration_from_line(line: &str) -> Option<f64> {
    let rest = line.split("Duration:").nth(1)?;
    parse_time_to_seconds(rest.split(',').next()?.trim())
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

fn parse_probe_output(raw: &[u8]) -> Result<ProbeInfo, TranscodeError> {
    let parsed: ProbeOutput = serde_json::from_slice(raw)
        .map_err(|err| TranscodeError::Probe(format!("unreadable ffprobe output: {err}")))?;

    let audio = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("audio"))
        .ok_or_else(|| TranscodeError::Probe("no audio stream".into()))?;

    let duration = parsed
        .format
        .as_ref()
        .and_then(|format| format.duration.as_deref())
        .or(audio.duration.as_deref())
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .ok_or_else(|| TranscodeError::Probe("duration unavailable".into()))?;

    Ok(ProbeInfo {
        duration,
        codec: audio.codec_name.clone().unwrap_or_else(|| "unknown".into()),
        sample_rate: audio.sample_rate.as_deref().and_then(|v| v.parse().ok()),
        channels: audio.channels,
        bit_rate: parsed
            .format
            .as_ref()
            .and_then(|format| format.bit_rate.as_deref())
            .and_then(|v| v.parse().ok()),
        format: parsed.format.and_then(|format| format.format_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_banner_and_progress_times() {
        assert_eq!(parse_time_to_seconds("00:00:41.36"), Some(41.36));
        assert_eq!(parse_time_to_seconds("01:02:03"), Some(3723.0));
        assert_eq!(parse_time_to_seconds("41.36"), None);
        assert_eq!(
            parse_duration_from_line("  Duration: 00:03:05.50, start: 0.000000, bitrate: 1411 kb/s"),
            Some(185.5)
        );
        assert_eq!(parse_out_time("out_time=00:00:10.000000"), Some(10.0));
        assert_eq!(parse_out_time("out_time_ms=10000000"), None);
    }

    #[test]
    fn separates_progress_keys_from_diagnostics() {
        assert!(is_progress_line("out_time_us=1000"));
        assert!(is_progress_line("progress=continue"));
        assert!(!is_progress_line("[flac @ 0x55] invalid sync code"));
        assert!(!is_progress_line("Error opening input: Invalid data found"));
    }

    #[test]
    fn probe_output_prefers_container_duration() {
        let raw = br#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "flac", "sample_rate": "44100", "channels": 2, "duration": "180.2"}
            ],
            "format": {"format_name": "flac", "duration": "180.000000", "bit_rate": "912345"}
        }"#;
        let info = parse_probe_output(raw).unwrap();
        assert_eq!(info.duration, 180.0);
        assert_eq!(info.codec, "flac");
        assert_eq!(info.sample_rate, Some(44_100));
        assert_eq!(info.channels, Some(2));
        assert_eq!(info.bit_rate, Some(912_345));
    }

    #[test]
    fn probe_without_audio_is_a_content_error() {
        let raw = br#"{"streams": [{"codec_type": "video"}], "format": {"duration": "3.0"}}"#;
        let err = parse_probe_output(raw).unwrap_err();
        assert!(matches!(err, TranscodeError::Probe(_)));
    }

    #[test]
    fn aac_arguments_request_fragmented_output() {
        let engine = FfmpegEngine::default();
        let args: Vec<String> = engine
            .aac_args(Path::new("in.flac"), Path::new("out.mp4"))
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-c:a aac -b:a 256k"));
        assert!(joined.contains("-frag_duration 1000000"));
        assert!(joined.contains("+empty_moov+default_base_moof"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let engine = FfmpegEngine::new(FfmpegSettings {
            ffmpeg_path: PathBuf::from("/nonexistent/gridfire-ffmpeg"),
            ..FfmpegSettings::default()
        });
        let err = engine
            .encode_mp3(Path::new("in.flac"), Path::new("out.mp3"), ProgressReporter::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
    }
}
