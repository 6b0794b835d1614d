//! Container encoders
//!
//! Pure byte builders for the three output formats. Codec payloads are
//! written as they come; codec configuration records are the codec
//! collaborator's business and are not synthesized here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{AudioCodec, AudioFrame, VideoCodec, VideoFrame};

/// A media sample handed to a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Sample {
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Audio(f) => &f.data,
            Self::Video(f) => &f.data,
        }
    }

    #[must_use]
    pub const fn pts(&self) -> u32 {
        match self {
            Self::Audio(f) => f.pts,
            Self::Video(f) => f.pts,
        }
    }

    #[must_use]
    pub const fn is_key(&self) -> bool {
        match self {
            Self::Audio(_) => true,
            Self::Video(f) => f.is_key_frame,
        }
    }
}

// FLV

const FLV_TAG_HEADER_LEN: u32 = 11;
const FLV_TAG_AUDIO: u8 = 8;
const FLV_TAG_VIDEO: u8 = 9;
const FLV_SOUND_PCM_LE: u8 = 3;
const FLV_SOUND_AAC: u8 = 10;
const FLV_SOUND_OPUS: u8 = 13;
const FLV_VIDEO_AVC: u8 = 7;
const FLV_VIDEO_HEVC: u8 = 12;

/// File header followed by the zero PreviousTagSize
#[must_use]
pub fn flv_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(b"FLV");
    buf.put_u8(1);
    buf.put_u8(u8::from(has_audio) << 2 | u8::from(has_video));
    buf.put_u32(9);
    buf.put_u32(0);
    buf.freeze()
}

fn flv_sound_rate_index(sample_rate: u32) -> u8 {
    match sample_rate {
        0..=5_512 => 0,
        5_513..=11_025 => 1,
        11_026..=22_050 => 2,
        _ => 3,
    }
}

/// One tag plus its trailing PreviousTagSize
#[must_use]
pub fn flv_tag(sample: &Sample, timestamp_ms: u32) -> Bytes {
    let mut body = BytesMut::new();
    let tag_type = match sample {
        Sample::Audio(frame) => {
            match frame.codec {
                AudioCodec::Aac => {
                    body.put_u8(FLV_SOUND_AAC << 4 | 0x0F);
                    body.put_u8(1);
                }
                AudioCodec::Pcm => body.put_u8(
                    FLV_SOUND_PCM_LE << 4
                        | flv_sound_rate_index(frame.sample_rate) << 2
                        | u8::from(frame.bits_per_sample > 8) << 1
                        | u8::from(frame.channels > 1),
                ),
                AudioCodec::Opus => body.put_u8(FLV_SOUND_OPUS << 4 | 0x0F),
            }
            body.put_slice(&frame.data);
            FLV_TAG_AUDIO
        }
        Sample::Video(frame) => {
            let frame_type: u8 = if frame.is_key_frame { 1 } else { 2 };
            let codec_id = match frame.codec {
                VideoCodec::H264 => FLV_VIDEO_AVC,
                VideoCodec::H265 => FLV_VIDEO_HEVC,
            };
            body.put_u8(frame_type << 4 | codec_id);
            body.put_u8(1);
            let cts = frame.pts.wrapping_sub(frame.dts) & 0x00FF_FFFF;
            put_u24(&mut body, cts);
            body.put_slice(&frame.data);
            FLV_TAG_VIDEO
        }
    };

    let data_len = u32::try_from(body.len()).unwrap_or(u32::MAX) & 0x00FF_FFFF;
    let mut tag = BytesMut::with_capacity(body.len() + 15);
    tag.put_u8(tag_type);
    put_u24(&mut tag, data_len);
    put_u24(&mut tag, timestamp_ms & 0x00FF_FFFF);
    tag.put_u8((timestamp_ms >> 24) as u8);
    put_u24(&mut tag, 0);
    tag.put_slice(&body);
    tag.put_u32(data_len + FLV_TAG_HEADER_LEN);
    tag.freeze()
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

// MP4

const MP4_TIMESCALE: u32 = 1000;
/// 64-bit `mdat` header: size 1, type, largesize
pub const MP4_MDAT_HEADER_LEN: u64 = 16;

#[must_use]
pub fn mp4_ftyp() -> Bytes {
    let mut body = Vec::new();
    body.extend_from_slice(b"isom");
    body.extend_from_slice(&512u32.to_be_bytes());
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        body.extend_from_slice(brand);
    }
    Bytes::from(mp4_box(b"ftyp", &body))
}

/// `mdat` header with a largesize covering `payload_len` bytes
#[must_use]
pub fn mp4_mdat_header(payload_len: u64) -> [u8; 16] {
    let mut header = [0u8; 16];
    header[..4].copy_from_slice(&1u32.to_be_bytes());
    header[4..8].copy_from_slice(b"mdat");
    header[8..].copy_from_slice(&(payload_len + MP4_MDAT_HEADER_LEN).to_be_bytes());
    header
}

fn mp4_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = u32::try_from(body.len() + 8).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn mp4_full_box(kind: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(body.len() + 4);
    full.push(version);
    full.extend_from_slice(&flags.to_be_bytes()[1..]);
    full.extend_from_slice(body);
    mp4_box(kind, &full)
}

fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn put_matrix(body: &mut Vec<u8>) {
    for value in UNITY_MATRIX {
        body.extend_from_slice(&value.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackFormat {
    Video { codec: VideoCodec, width: u16, height: u16 },
    Audio { codec: AudioCodec, sample_rate: u32, channels: u16 },
}

#[derive(Debug, Clone)]
struct TrackIndex {
    format: TrackFormat,
    times: Vec<u32>,
    sizes: Vec<u32>,
    offsets: Vec<u64>,
    /// 1-based numbers of sync samples
    sync: Vec<u32>,
}

impl TrackIndex {
    fn new(format: TrackFormat) -> Self {
        Self {
            format,
            times: Vec::new(),
            sizes: Vec::new(),
            offsets: Vec::new(),
            sync: Vec::new(),
        }
    }

    fn deltas(&self) -> Vec<u32> {
        let mut deltas: Vec<u32> = self.times.windows(2).map(|w| w[1].saturating_sub(w[0])).collect();
        if !self.times.is_empty() {
            let last = deltas.last().copied().unwrap_or(match self.format {
                TrackFormat::Video { .. } => 33,
                TrackFormat::Audio { .. } => 20,
            });
            deltas.push(last);
        }
        deltas
    }

    fn duration(&self) -> u32 {
        self.deltas().iter().fold(0u32, |acc, d| acc.saturating_add(*d))
    }

    fn trak(&self, track_id: u32) -> Vec<u8> {
        let duration = self.duration();
        let is_video = matches!(self.format, TrackFormat::Video { .. });

        let mut tkhd = Vec::new();
        tkhd.extend_from_slice(&0u32.to_be_bytes());
        tkhd.extend_from_slice(&0u32.to_be_bytes());
        tkhd.extend_from_slice(&track_id.to_be_bytes());
        tkhd.extend_from_slice(&0u32.to_be_bytes());
        tkhd.extend_from_slice(&duration.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 8]);
        tkhd.extend_from_slice(&0u16.to_be_bytes());
        tkhd.extend_from_slice(&0u16.to_be_bytes());
        tkhd.extend_from_slice(&(if is_video { 0u16 } else { 0x0100 }).to_be_bytes());
        tkhd.extend_from_slice(&0u16.to_be_bytes());
        put_matrix(&mut tkhd);
        let (w, h) = match self.format {
            TrackFormat::Video { width, height, .. } => (u32::from(width), u32::from(height)),
            TrackFormat::Audio { .. } => (0, 0),
        };
        tkhd.extend_from_slice(&(w << 16).to_be_bytes());
        tkhd.extend_from_slice(&(h << 16).to_be_bytes());

        let mut mdhd = Vec::new();
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&MP4_TIMESCALE.to_be_bytes());
        mdhd.extend_from_slice(&duration.to_be_bytes());
        mdhd.extend_from_slice(&0x55C4u16.to_be_bytes());
        mdhd.extend_from_slice(&0u16.to_be_bytes());

        let (handler, name): (&[u8; 4], &[u8]) = if is_video {
            (b"vide", b"VideoHandler\0")
        } else {
            (b"soun", b"SoundHandler\0")
        };
        let mut hdlr = Vec::new();
        hdlr.extend_from_slice(&0u32.to_be_bytes());
        hdlr.extend_from_slice(handler);
        hdlr.extend_from_slice(&[0u8; 12]);
        hdlr.extend_from_slice(name);

        let media_header = if is_video {
            mp4_full_box(b"vmhd", 0, 1, &[0u8; 8])
        } else {
            mp4_full_box(b"smhd", 0, 0, &[0u8; 4])
        };
        let url = mp4_full_box(b"url ", 0, 1, &[]);
        let mut dref = 1u32.to_be_bytes().to_vec();
        dref.extend_from_slice(&url);
        let dinf = mp4_box(b"dinf", &mp4_full_box(b"dref", 0, 0, &dref));

        let minf = mp4_box(b"minf", &concat(&[media_header, dinf, self.stbl()]));
        let mdia = mp4_box(
            b"mdia",
            &concat(&[
                mp4_full_box(b"mdhd", 0, 0, &mdhd),
                mp4_full_box(b"hdlr", 0, 0, &hdlr),
                minf,
            ]),
        );
        mp4_box(b"trak", &concat(&[mp4_full_box(b"tkhd", 0, 3, &tkhd), mdia]))
    }

    fn sample_entry(&self) -> Vec<u8> {
        let mut entry = vec![0u8; 6];
        entry.extend_from_slice(&1u16.to_be_bytes());
        match self.format {
            TrackFormat::Video { codec, width, height } => {
                entry.extend_from_slice(&[0u8; 16]);
                entry.extend_from_slice(&width.to_be_bytes());
                entry.extend_from_slice(&height.to_be_bytes());
                entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
                entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
                entry.extend_from_slice(&0u32.to_be_bytes());
                entry.extend_from_slice(&1u16.to_be_bytes());
                entry.extend_from_slice(&[0u8; 32]);
                entry.extend_from_slice(&0x0018u16.to_be_bytes());
                entry.extend_from_slice(&0xFFFFu16.to_be_bytes());
                let kind = match codec {
                    VideoCodec::H264 => b"avc1",
                    VideoCodec::H265 => b"hvc1",
                };
                mp4_box(kind, &entry)
            }
            TrackFormat::Audio {
                codec,
                sample_rate,
                channels,
            } => {
                entry.extend_from_slice(&[0u8; 8]);
                entry.extend_from_slice(&channels.to_be_bytes());
                entry.extend_from_slice(&16u16.to_be_bytes());
                entry.extend_from_slice(&[0u8; 4]);
                entry.extend_from_slice(&(sample_rate.min(0xFFFF) << 16).to_be_bytes());
                let kind = match codec {
                    AudioCodec::Aac => b"mp4a",
                    AudioCodec::Opus => b"Opus",
                    AudioCodec::Pcm => b"sowt",
                };
                mp4_box(kind, &entry)
            }
        }
    }

    fn stbl(&self) -> Vec<u8> {
        let mut stsd = 1u32.to_be_bytes().to_vec();
        stsd.extend_from_slice(&self.sample_entry());

        // run-length encoded sample deltas
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for delta in self.deltas() {
            match runs.last_mut() {
                Some((count, d)) if *d == delta => *count += 1,
                _ => runs.push((1, delta)),
            }
        }
        let mut stts = u32::try_from(runs.len()).unwrap_or(u32::MAX).to_be_bytes().to_vec();
        for (count, delta) in runs {
            stts.extend_from_slice(&count.to_be_bytes());
            stts.extend_from_slice(&delta.to_be_bytes());
        }

        let mut stsc = 1u32.to_be_bytes().to_vec();
        for value in [1u32, 1, 1] {
            stsc.extend_from_slice(&value.to_be_bytes());
        }

        let count = u32::try_from(self.sizes.len()).unwrap_or(u32::MAX);
        let mut stsz = 0u32.to_be_bytes().to_vec();
        stsz.extend_from_slice(&count.to_be_bytes());
        for size in &self.sizes {
            stsz.extend_from_slice(&size.to_be_bytes());
        }

        let mut co64 = count.to_be_bytes().to_vec();
        for offset in &self.offsets {
            co64.extend_from_slice(&offset.to_be_bytes());
        }

        let mut boxes = vec![
            mp4_full_box(b"stsd", 0, 0, &stsd),
            mp4_full_box(b"stts", 0, 0, &stts),
        ];
        if matches!(self.format, TrackFormat::Video { .. }) {
            let mut stss = u32::try_from(self.sync.len()).unwrap_or(u32::MAX).to_be_bytes().to_vec();
            for number in &self.sync {
                stss.extend_from_slice(&number.to_be_bytes());
            }
            boxes.push(mp4_full_box(b"stss", 0, 0, &stss));
        }
        boxes.push(mp4_full_box(b"stsc", 0, 0, &stsc));
        boxes.push(mp4_full_box(b"stsz", 0, 0, &stsz));
        boxes.push(mp4_full_box(b"co64", 0, 0, &co64));
        mp4_box(b"stbl", &concat(&boxes))
    }
}

/// Sample tables of an MP4 file being written
#[derive(Debug, Clone)]
pub struct Mp4Index {
    video: Option<TrackIndex>,
    audio: Option<TrackIndex>,
    video_size: (u16, u16),
}

impl Mp4Index {
    /// `video_size` is recorded in the track header when known
    #[must_use]
    pub fn new(video_size: (u32, u32)) -> Self {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        Self {
            video: None,
            audio: None,
            video_size: (clamp(video_size.0), clamp(video_size.1)),
        }
    }

    /// Register a sample written at absolute file `offset`
    pub fn push(&mut self, sample: &Sample, timestamp_ms: u32, offset: u64) {
        let track = match sample {
            Sample::Video(frame) => self.video.get_or_insert_with(|| {
                TrackIndex::new(TrackFormat::Video {
                    codec: frame.codec,
                    width: self.video_size.0,
                    height: self.video_size.1,
                })
            }),
            Sample::Audio(frame) => self.audio.get_or_insert_with(|| {
                TrackIndex::new(TrackFormat::Audio {
                    codec: frame.codec,
                    sample_rate: frame.sample_rate,
                    channels: frame.channels,
                })
            }),
        };
        track.times.push(timestamp_ms);
        track
            .sizes
            .push(u32::try_from(sample.payload().len()).unwrap_or(u32::MAX));
        track.offsets.push(offset);
        if sample.is_key() {
            track
                .sync
                .push(u32::try_from(track.times.len()).unwrap_or(u32::MAX));
        }
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.video.as_ref().map_or(0, |t| t.times.len()) + self.audio.as_ref().map_or(0, |t| t.times.len())
    }

    /// The `moov` box describing every pushed sample
    #[must_use]
    pub fn moov(&self) -> Bytes {
        let tracks: Vec<&TrackIndex> = [self.video.as_ref(), self.audio.as_ref()]
            .into_iter()
            .flatten()
            .collect();
        let duration = tracks.iter().map(|t| t.duration()).max().unwrap_or(0);

        let mut mvhd = Vec::new();
        mvhd.extend_from_slice(&0u32.to_be_bytes());
        mvhd.extend_from_slice(&0u32.to_be_bytes());
        mvhd.extend_from_slice(&MP4_TIMESCALE.to_be_bytes());
        mvhd.extend_from_slice(&duration.to_be_bytes());
        mvhd.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        mvhd.extend_from_slice(&0x0100u16.to_be_bytes());
        mvhd.extend_from_slice(&[0u8; 10]);
        put_matrix(&mut mvhd);
        mvhd.extend_from_slice(&[0u8; 24]);
        let next_track = u32::try_from(tracks.len()).unwrap_or(0) + 1;
        mvhd.extend_from_slice(&next_track.to_be_bytes());

        let mut parts = vec![mp4_full_box(b"mvhd", 0, 0, &mvhd)];
        for (index, track) in tracks.iter().enumerate() {
            parts.push(track.trak(u32::try_from(index).unwrap_or(0) + 1));
        }
        Bytes::from(mp4_box(b"moov", &concat(&parts)))
    }
}
