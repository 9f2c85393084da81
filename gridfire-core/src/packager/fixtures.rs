//! Synthetic fragmented MP4 files for tests.

/// Builds a minimal single-track audio fMP4: `ftyp`, `moov` (with `mvex`),
/// then one `moof`/`mdat` pair per fragment.
#[derive(Debug, Clone)]
pub struct FragmentedMp4 {
    timescale: u32,
    fragment_ticks: u32,
    fragments: usize,
    samples_per_fragment: u32,
    sample_bytes: usize,
    explicit_durations: bool,
}

const TRACK_ID: u32 = 1;

impl FragmentedMp4 {
    pub fn new(timescale: u32, fragment_ticks: u32, fragments: usize) -> Self {
        Self {
            timescale,
            fragment_ticks,
            fragments,
            samples_per_fragment: 4,
            sample_bytes: 32,
            explicit_durations: false,
        }
    }

    /// Writes per-sample durations in `trun` instead of a `tfhd` default.
    pub fn explicit_durations(mut self, explicit: bool) -> Self {
        self.explicit_durations = explicit;
        self
    }

    pub fn sample_bytes(mut self, bytes: usize) -> Self {
        self.sample_bytes = bytes.max(1);
        self
    }

    /// Total playback length in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.fragments as f64 * f64::from(self.fragment_ticks) / f64::from(self.timescale)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(ftyp());
        out.extend(self.moov());
        for index in 0..self.fragments {
            out.extend(self.fragment(index));
        }
        out
    }

    fn moov(&self) -> Vec<u8> {
        let total = u64::from(self.fragment_ticks) * self.fragments as u64;

        let mut tkhd = Vec::new();
        tkhd.extend(0u32.to_be_bytes()); // creation
        tkhd.extend(0u32.to_be_bytes()); // modification
        tkhd.extend(TRACK_ID.to_be_bytes());
        tkhd.extend([0u8; 4]);
        tkhd.extend(0u32.to_be_bytes()); // duration, unknown up front
        tkhd.extend([0u8; 60]);

        let mut mdhd = Vec::new();
        mdhd.extend(0u64.to_be_bytes()); // creation
        mdhd.extend(0u64.to_be_bytes()); // modification
        mdhd.extend(self.timescale.to_be_bytes());
        mdhd.extend(total.to_be_bytes());
        mdhd.extend([0x55, 0xc4, 0, 0]);

        let mut hdlr = Vec::new();
        hdlr.extend([0u8; 4]);
        hdlr.extend(*b"soun");
        hdlr.extend([0u8; 12]);
        hdlr.extend(*b"SoundHandler\0");

        let mdia = [
            full_box(b"mdhd", 1, 0, &mdhd),
            full_box(b"hdlr", 0, 0, &hdlr),
        ]
        .concat();
        let trak = [full_box(b"tkhd", 0, 3, &tkhd), plain_box(b"mdia", &mdia)].concat();

        let mut trex = Vec::new();
        trex.extend(TRACK_ID.to_be_bytes());
        trex.extend(1u32.to_be_bytes());
        trex.extend(1024u32.to_be_bytes());
        trex.extend(0u32.to_be_bytes());
        trex.extend(0u32.to_be_bytes());

        let mut mvhd = Vec::new();
        mvhd.extend([0u8; 8]);
        mvhd.extend(1000u32.to_be_bytes());
        mvhd.extend([0u8; 84]);

        let moov = [
            full_box(b"mvhd", 0, 0, &mvhd),
            plain_box(b"trak", &trak),
            plain_box(b"mvex", &full_box(b"trex", 0, 0, &trex)),
        ]
        .concat();
        plain_box(b"moov", &moov)
    }

    fn sample_durations(&self) -> Vec<u32> {
        let count = self.samples_per_fragment;
        let base = self.fragment_ticks / count;
        let mut durations = vec![base; count as usize];
        if let Some(last) = durations.last_mut() {
            *last += self.fragment_ticks - base * count;
        }
        durations
    }

    fn fragment(&self, index: usize) -> Vec<u8> {
        let durations = self.sample_durations();
        let uniform = durations.windows(2).all(|w| w[0] == w[1]);
        let use_default = uniform && !self.explicit_durations;

        let mut tfhd = Vec::new();
        tfhd.extend(TRACK_ID.to_be_bytes());
        let mut tfhd_flags = 0x02_0000; // default-base-is-moof
        if use_default {
            tfhd_flags |= 0x08;
            tfhd.extend(durations[0].to_be_bytes());
        }

        let decode_time = u64::from(self.fragment_ticks) * index as u64;
        let tfdt = decode_time.to_be_bytes();

        let mut trun_flags = 0x001 | 0x200;
        if !use_default {
            trun_flags |= 0x100;
        }
        let trun_len = 12 + 8 + durations.len() * if use_default { 4 } else { 8 };

        let traf_len = 8 + (12 + tfhd.len()) + (12 + tfdt.len()) + trun_len;
        let moof_len = 8 + 16 + traf_len;
        // Sample data starts right after the mdat header.
        let data_offset = (moof_len + 8) as u32;

        let mut trun = Vec::new();
        trun.extend((durations.len() as u32).to_be_bytes());
        trun.extend(data_offset.to_be_bytes());
        for duration in &durations {
            if !use_default {
                trun.extend(duration.to_be_bytes());
            }
            trun.extend((self.sample_bytes as u32).to_be_bytes());
        }

        let traf = [
            full_box(b"tfhd", 0, tfhd_flags, &tfhd),
            full_box(b"tfdt", 1, 0, &tfdt),
            full_box(b"trun", 0, trun_flags, &trun),
        ]
        .concat();
        let moof = [
            full_box(b"mfhd", 0, 0, &((index + 1) as u32).to_be_bytes()),
            plain_box(b"traf", &traf),
        ]
        .concat();
        let moof = plain_box(b"moof", &moof);
        debug_assert_eq!(moof.len(), moof_len);

        let payload: Vec<u8> = (0..durations.len() * self.sample_bytes)
            .map(|i| (i as u8).wrapping_add(index as u8))
            .collect();
        [moof, plain_box(b"mdat", &payload)].concat()
    }
}

fn ftyp() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend(*b"iso6");
    payload.extend(0u32.to_be_bytes());
    for brand in [b"iso6", b"mp41", b"dash"] {
        payload.extend(*brand);
    }
    plain_box(b"ftyp", &payload)
}

fn plain_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend(((payload.len() + 8) as u32).to_be_bytes());
    out.extend(*kind);
    out.extend_from_slice(payload);
    out
}

fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.extend(((u32::from(version) << 24) | (flags & 0x00ff_ffff)).to_be_bytes());
    body.extend_from_slice(payload);
    plain_box(kind, &body)
}
