//! Segment packager.
//!
//! Splits a fragmented MP4 into an init segment plus fixed-duration media
//! segments. Segment `i` covers every fragment whose decode time falls in
//! `[i * len, (i + 1) * len)`, so a player can map a playback time to a
//! segment index by plain division. Byte ranges are recorded against the
//! source file and the same bytes are also written out as standalone files
//! alongside an HLS playlist.

mod boxes;
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;

use std::{
    fmt::Write as _,
    fs::File,
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use gridfire_model::ByteRange;
use thiserror::Error;
use tracing::debug;

use boxes::{TopBox, fourcc, parse_moof, parse_moov, read_payload, scan_top_level};

pub const INIT_FILE: &str = "init.mp4";
pub const PLAYLIST_FILE: &str = "playlist.m3u8";

pub fn segment_file_name(index: usize) -> String {
    format!("segment_{index:05}.m4s")
}

#[derive(Debug, Error)]
pub enum PackagerError {
    #[error("malformed MP4: {0}")]
    Malformed(String),
    #[error("MP4 has no '{0}' box")]
    MissingBox(&'static str),
    #[error("MP4 contains no media fragments")]
    NoFragments,
    #[error("fragment at {start_seconds:.3}s skips past segment {expected}; fragments must be shorter than segments")]
    SegmentGap { start_seconds: f64, expected: usize },
    #[error("packaging task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PackagerError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        PackagerError::Malformed(message.into())
    }
}

/// A file written into the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedFile {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackagedTrack {
    /// `ftyp` through `moov` in the source file.
    pub init_range: ByteRange,
    /// Byte range of every media segment in the source file.
    pub segments: Vec<ByteRange>,
    /// Actual playback length of each segment, in seconds.
    pub segment_durations: Vec<f64>,
    /// Nominal segment length in `timescale` ticks.
    pub segment_duration: u32,
    pub timescale: u32,
    /// Seconds.
    pub duration: f64,
    /// Init segment, media segments and playlist, in that order.
    pub files: Vec<PackagedFile>,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentPackager {
    segment_seconds: u32,
}

impl Default for SegmentPackager {
    fn default() -> Self {
        Self::new(10)
    }
}

#[derive(Debug, Clone, Copy)]
struct Fragment {
    start: u64,
    duration: u64,
    offset: u64,
    end: u64,
}

#[derive(Debug)]
struct Layout {
    init_range: ByteRange,
    timescale: u32,
    segment_ticks: u64,
    segments: Vec<(ByteRange, u64)>,
    total_ticks: u64,
}

impl SegmentPackager {
    pub fn new(segment_seconds: u32) -> Self {
        Self {
            segment_seconds: segment_seconds.max(1),
        }
    }

    pub fn segment_seconds(&self) -> u32 {
        self.segment_seconds
    }

    /// Packages `input` into `out_dir`, which must exist and should be empty.
    pub async fn package(
        &self,
        input: &Path,
        out_dir: &Path,
    ) -> Result<PackagedTrack, PackagerError> {
        let packager = *self;
        let input = input.to_path_buf();
        let out_dir = out_dir.to_path_buf();
        tokio::task::spawn_blocking(move || packager.package_blocking(&input, &out_dir))
            .await
            .map_err(|err| PackagerError::Task(err.to_string()))?
    }

    fn package_blocking(
        &self,
        input: &Path,
        out_dir: &Path,
    ) -> Result<PackagedTrack, PackagerError> {
        let mut source = File::open(input)?;
        let layout = self.layout(&mut source)?;

        let mut files = Vec::with_capacity(layout.segments.len() + 2);
        files.push(copy_range(&mut source, layout.init_range, out_dir, INIT_FILE)?);
        for (index, (range, _)) in layout.segments.iter().enumerate() {
            files.push(copy_range(&mut source, *range, out_dir, &segment_file_name(index))?);
        }

        let timescale = f64::from(layout.timescale);
        let segment_durations: Vec<f64> = layout
            .segments
            .iter()
            .map(|(_, ticks)| *ticks as f64 / timescale)
            .collect();

        let playlist_path = out_dir.join(PLAYLIST_FILE);
        std::fs::write(&playlist_path, render_playlist(&segment_durations))?;
        files.push(PackagedFile {
            name: PLAYLIST_FILE.to_string(),
            path: playlist_path,
        });

        let segment_duration = u32::try_from(layout.segment_ticks)
            .map_err(|_| PackagerError::malformed("segment length overflows the timescale"))?;

        debug!(
            input = %input.display(),
            segments = layout.segments.len(),
            timescale = layout.timescale,
            "packaged fragmented mp4"
        );

        Ok(PackagedTrack {
            init_range: layout.init_range,
            segments: layout.segments.iter().map(|(range, _)| *range).collect(),
            segment_durations,
            segment_duration,
            timescale: layout.timescale,
            duration: layout.total_ticks as f64 / timescale,
            files,
        })
    }

    fn layout<R: Read + Seek>(&self, source: &mut R) -> Result<Layout, PackagerError> {
        let boxes = scan_top_level(source)?;

        let first = boxes.first().ok_or(PackagerError::MissingBox("ftyp"))?;
        if &first.kind != b"ftyp" {
            return Err(PackagerError::malformed(format!(
                "expected 'ftyp' first, found '{}'",
                fourcc(&first.kind)
            )));
        }
        let moov_at = boxes
            .iter()
            .position(|b| &b.kind == b"moov")
            .ok_or(PackagerError::MissingBox("moov"))?;
        let moov = &boxes[moov_at];
        if boxes[..moov_at].iter().any(|b| &b.kind == b"moof") {
            return Err(PackagerError::malformed("'moof' precedes 'moov'"));
        }
        let movie = parse_moov(&read_payload(source, moov)?)?;
        let init_range = ByteRange::new(0, moov.end() - 1);

        let fragments = collect_fragments(source, &boxes[moov_at + 1..], &movie)?;
        if fragments.is_empty() {
            return Err(PackagerError::NoFragments);
        }

        let segment_ticks = u64::from(movie.timescale) * u64::from(self.segment_seconds);
        let origin = fragments[0].start;
        let mut segments: Vec<(ByteRange, u64)> = Vec::new();
        let mut current: Option<(usize, u64, u64, u64)> = None;

        for fragment in &fragments {
            let index = usize::try_from((fragment.start.saturating_sub(origin)) / segment_ticks)
                .map_err(|_| PackagerError::malformed("segment index overflow"))?;
            match current {
                Some((open, start, _, ticks)) if open == index => {
                    current = Some((open, start, fragment.end, ticks + fragment.duration));
                }
                Some((open, start, end, ticks)) => {
                    if index != open + 1 {
                        return Err(PackagerError::SegmentGap {
                            start_seconds: (fragment.start - origin) as f64
                                / f64::from(movie.timescale),
                            expected: open + 1,
                        });
                    }
                    segments.push((ByteRange::new(start, end - 1), ticks));
                    current = Some((index, fragment.offset, fragment.end, fragment.duration));
                }
                None => {
                    if index != 0 {
                        return Err(PackagerError::SegmentGap {
                            start_seconds: 0.0,
                            expected: 0,
                        });
                    }
                    current = Some((0, fragment.offset, fragment.end, fragment.duration));
                }
            }
        }
        if let Some((_, start, end, ticks)) = current {
            segments.push((ByteRange::new(start, end - 1), ticks));
        }

        Ok(Layout {
            init_range,
            timescale: movie.timescale,
            segment_ticks,
            segments,
            total_ticks: fragments.iter().map(|f| f.duration).sum(),
        })
    }
}

fn collect_fragments<R: Read + Seek>(
    source: &mut R,
    boxes: &[TopBox],
    movie: &boxes::MovieInfo,
) -> Result<Vec<Fragment>, PackagerError> {
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut next_start = 0u64;

    for (i, top) in boxes.iter().enumerate() {
        if &top.kind != b"moof" {
            continue;
        }
        let timing = parse_moof(&read_payload(source, top)?, movie)?;
        let start = timing.decode_time.unwrap_or(next_start);
        if let Some(previous) = fragments.last()
            && start < previous.start
        {
            return Err(PackagerError::malformed("fragment decode times go backwards"));
        }

        // The fragment runs until the next moof or the trailing index.
        let end = boxes[i + 1..]
            .iter()
            .find(|b| &b.kind == b"moof" || &b.kind == b"mfra")
            .map(|b| b.offset)
            .unwrap_or_else(|| boxes.last().map_or(top.end(), TopBox::end));

        fragments.push(Fragment {
            start,
            duration: timing.duration,
            offset: top.offset,
            end,
        });
        next_start = start + timing.duration;
    }

    Ok(fragments)
}

fn copy_range(
    source: &mut File,
    range: ByteRange,
    out_dir: &Path,
    name: &str,
) -> Result<PackagedFile, PackagerError> {
    let path = out_dir.join(name);
    source.seek(SeekFrom::Start(range.start))?;
    let mut writer = BufWriter::new(File::create(&path)?);
    let copied = io::copy(&mut Read::by_ref(source).take(range.len()), &mut writer)?;
    if copied != range.len() {
        return Err(PackagerError::malformed(format!(
            "short read copying {name}: {copied} of {} bytes",
            range.len()
        )));
    }
    writer.flush()?;
    Ok(PackagedFile {
        name: name.to_string(),
        path,
    })
}

/// HLS VOD playlist over the standalone segment files.
pub fn render_playlist(segment_durations: &[f64]) -> String {
    let target = segment_durations
        .iter()
        .copied()
        .fold(0.0f64, f64::max)
        .ceil()
        .max(1.0) as u64;

    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:7");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target}");
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0");
    let _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD");
    let _ = writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS");
    let _ = writeln!(out, "#EXT-X-MAP:URI=\"{INIT_FILE}\"");
    for (index, duration) in segment_durations.iter().enumerate() {
        let _ = writeln!(out, "#EXTINF:{duration:.3},");
        let _ = writeln!(out, "{}", segment_file_name(index));
    }
    let _ = writeln!(out, "#EXT-X-ENDLIST");
    out
}
