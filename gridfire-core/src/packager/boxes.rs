//! Just enough ISO BMFF parsing to locate fragments in a fragmented MP4.

use std::io::{self, Read, Seek, SeekFrom};

use super::PackagerError;

pub(crate) type FourCc = [u8; 4];

/// A top-level box located in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TopBox {
    pub kind: FourCc,
    pub offset: u64,
    pub size: u64,
    pub header_len: u64,
}

impl TopBox {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Walks the top-level boxes of `reader` without loading their payloads.
pub(crate) fn scan_top_level<R: Read + Seek>(
    reader: &mut R,
) -> Result<Vec<TopBox>, PackagerError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let mut offset = 0u64;
    let mut boxes = Vec::new();

    while offset < file_len {
        if file_len - offset < 8 {
            return Err(PackagerError::malformed(format!(
                "{} trailing bytes at offset {offset}",
                file_len - offset
            )));
        }
        reader.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind: FourCc = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - offset, 8),
            1 => {
                let mut large = [0u8; 8];
                reader.read_exact(&mut large)?;
                (u64::from_be_bytes(large), 16)
            }
            n => (u64::from(n), 8),
        };

        if size < header_len || offset.checked_add(size).is_none_or(|end| end > file_len) {
            return Err(PackagerError::malformed(format!(
                "box '{}' at offset {offset} has invalid size {size}",
                fourcc(&kind)
            )));
        }

        boxes.push(TopBox {
            kind,
            offset,
            size,
            header_len,
        });
        offset += size;
    }

    Ok(boxes)
}

/// Reads the payload of `top` into memory.
pub(crate) fn read_payload<R: Read + Seek>(
    reader: &mut R,
    top: &TopBox,
) -> io::Result<Vec<u8>> {
    let len = usize::try_from(top.size - top.header_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "box too large"))?;
    let mut payload = vec![0u8; len];
    reader.seek(SeekFrom::Start(top.offset + top.header_len))?;
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Splits a container payload into its child boxes.
pub(crate) fn children(buf: &[u8]) -> Result<Vec<(FourCc, &[u8])>, PackagerError> {
    let mut out = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let mut cursor = Cursor::new(rest);
        let size32 = cursor.u32()?;
        let kind = cursor.fourcc()?;
        let (size, header_len) = match size32 {
            0 => (rest.len() as u64, 8u64),
            1 => (cursor.u64()?, 16),
            n => (u64::from(n), 8),
        };
        let size = usize::try_from(size).map_err(|_| PackagerError::malformed("child box too large"))?;
        if size < header_len as usize || size > rest.len() {
            return Err(PackagerError::malformed(format!(
                "child box '{}' has invalid size {size}",
                fourcc(&kind)
            )));
        }
        out.push((kind, &rest[header_len as usize..size]));
        rest = &rest[size..];
    }
    Ok(out)
}

pub(crate) fn child<'a>(
    buf: &'a [u8],
    kind: &FourCc,
) -> Result<Option<&'a [u8]>, PackagerError> {
    Ok(children(buf)?
        .into_iter()
        .find(|(k, _)| k == kind)
        .map(|(_, payload)| payload))
}

pub(crate) fn fourcc(kind: &FourCc) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

/// Big endian reader over a box payload.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PackagerError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| PackagerError::malformed("box payload ended early"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), PackagerError> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, PackagerError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, PackagerError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, PackagerError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn fourcc(&mut self) -> Result<FourCc, PackagerError> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Version byte and 24-bit flags of a full box.
    pub fn full_header(&mut self) -> Result<(u8, u32), PackagerError> {
        let word = self.u32()?;
        Ok(((word >> 24) as u8, word & 0x00ff_ffff))
    }
}

/// Track-level facts pulled from `moov`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MovieInfo {
    pub track_id: u32,
    pub timescale: u32,
    pub default_sample_duration: Option<u32>,
}

pub(crate) fn parse_moov(moov: &[u8]) -> Result<MovieInfo, PackagerError> {
    let traks: Vec<&[u8]> = children(moov)?
        .into_iter()
        .filter(|(kind, _)| kind == b"trak")
        .map(|(_, payload)| payload)
        .collect();

    let mut chosen = None;
    for trak in &traks {
        let Some(mdia) = child(trak, b"mdia")? else { continue };
        let handler = match child(mdia, b"hdlr")? {
            Some(hdlr) => {
                let mut cursor = Cursor::new(hdlr);
                cursor.full_header()?;
                cursor.skip(4)?;
                Some(cursor.fourcc()?)
            }
            None => None,
        };
        if chosen.is_none() || handler.as_ref() == Some(b"soun") {
            chosen = Some((*trak, mdia));
            if handler.as_ref() == Some(b"soun") {
                break;
            }
        }
    }
    let (trak, mdia) = chosen.ok_or(PackagerError::MissingBox("trak"))?;

    let tkhd = child(trak, b"tkhd")?.ok_or(PackagerError::MissingBox("tkhd"))?;
    let mut cursor = Cursor::new(tkhd);
    let (version, _) = cursor.full_header()?;
    cursor.skip(if version == 1 { 16 } else { 8 })?;
    let track_id = cursor.u32()?;

    let mdhd = child(mdia, b"mdhd")?.ok_or(PackagerError::MissingBox("mdhd"))?;
    let mut cursor = Cursor::new(mdhd);
    let (version, _) = cursor.full_header()?;
    cursor.skip(if version == 1 { 16 } else { 8 })?;
    let timescale = cursor.u32()?;
    if timescale == 0 {
        return Err(PackagerError::malformed("mdhd timescale is zero"));
    }

    let mut default_sample_duration = None;
    if let Some(mvex) = child(moov, b"mvex")? {
        for (kind, trex) in children(mvex)? {
            if &kind != b"trex" {
                continue;
            }
            let mut cursor = Cursor::new(trex);
            cursor.full_header()?;
            if cursor.u32()? == track_id {
                cursor.skip(4)?;
                default_sample_duration = Some(cursor.u32()?);
            }
        }
    }

    Ok(MovieInfo {
        track_id,
        timescale,
        default_sample_duration,
    })
}

/// Timing of one `moof`, in media timescale ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentTiming {
    pub decode_time: Option<u64>,
    pub duration: u64,
}

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION: u32 = 0x02;
const TFHD_DEFAULT_DURATION: u32 = 0x08;

const TRUN_DATA_OFFSET: u32 = 0x001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x004;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_SIZE: u32 = 0x200;
const TRUN_SAMPLE_FLAGS: u32 = 0x400;
const TRUN_COMPOSITION_OFFSET: u32 = 0x800;

pub(crate) fn parse_moof(
    moof: &[u8],
    movie: &MovieInfo,
) -> Result<FragmentTiming, PackagerError> {
    let mut decode_time = None;
    let mut duration = 0u64;

    for (kind, traf) in children(moof)? {
        if &kind != b"traf" {
            continue;
        }
        let boxes = children(traf)?;

        let tfhd = boxes
            .iter()
            .find(|(k, _)| k == b"tfhd")
            .map(|(_, p)| *p)
            .ok_or(PackagerError::MissingBox("tfhd"))?;
        let mut cursor = Cursor::new(tfhd);
        let (_, flags) = cursor.full_header()?;
        if cursor.u32()? != movie.track_id {
            continue;
        }
        if flags & TFHD_BASE_DATA_OFFSET != 0 {
            cursor.skip(8)?;
        }
        if flags & TFHD_SAMPLE_DESCRIPTION != 0 {
            cursor.skip(4)?;
        }
        let default_duration = if flags & TFHD_DEFAULT_DURATION != 0 {
            Some(cursor.u32()?)
        } else {
            movie.default_sample_duration
        };

        if let Some((_, tfdt)) = boxes.iter().find(|(k, _)| k == b"tfdt") {
            let mut cursor = Cursor::new(tfdt);
            let (version, _) = cursor.full_header()?;
            let base = if version == 1 {
                cursor.u64()?
            } else {
                u64::from(cursor.u32()?)
            };
            decode_time.get_or_insert(base);
        }

        for (_, trun) in boxes.iter().filter(|(k, _)| k == b"trun") {
            let mut cursor = Cursor::new(trun);
            let (_, flags) = cursor.full_header()?;
            let samples = cursor.u32()?;
            if flags & TRUN_DATA_OFFSET != 0 {
                cursor.skip(4)?;
            }
            if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
                cursor.skip(4)?;
            }
            for _ in 0..samples {
                let sample_duration = if flags & TRUN_SAMPLE_DURATION != 0 {
                    cursor.u32()?
                } else {
                    default_duration.ok_or_else(|| {
                        PackagerError::malformed("sample duration unknown")
                    })?
                };
                duration += u64::from(sample_duration);
                for field in [TRUN_SAMPLE_SIZE, TRUN_SAMPLE_FLAGS, TRUN_COMPOSITION_OFFSET] {
                    if flags & field != 0 {
                        cursor.skip(4)?;
                    }
                }
            }
        }
    }

    Ok(FragmentTiming {
        decode_time,
        duration,
    })
}
