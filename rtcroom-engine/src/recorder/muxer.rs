//! Segment files
//!
//! A segment is written under a hidden temporary name and renamed once
//! its stop timestamp is known, so a directory listing only ever shows
//! finished recordings.

use std::io::{Result, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

use super::container::{flv_header, flv_tag, mp4_ftyp, mp4_mdat_header, Mp4Index, Sample, MP4_MDAT_HEADER_LEN};
use super::params::{RecordFileFormat, RecordType};

pub struct SegmentWriter {
    format: RecordFileFormat,
    record_type: RecordType,
    file: BufWriter<fs::File>,
    temp_path: PathBuf,
    directory: PathBuf,
    /// File offset of the next byte
    position: u64,
    base_pts: Option<u32>,
    samples: u64,
    mp4: Option<(Mp4Index, u64)>,
}

impl SegmentWriter {
    /// Open a new segment in `directory`
    ///
    /// `video_size` only matters for MP4, where it goes into the track header.
    pub async fn create(
        directory: &Path,
        format: RecordFileFormat,
        record_type: RecordType,
        video_size: (u32, u32),
    ) -> Result<Self> {
        let temp_path = directory.join(format!(".rec_{}.part", nanoid::nanoid!(12)));
        let file = fs::File::create(&temp_path).await?;
        let mut writer = Self {
            format,
            record_type,
            file: BufWriter::new(file),
            temp_path,
            directory: directory.to_path_buf(),
            position: 0,
            base_pts: None,
            samples: 0,
            mp4: None,
        };

        match format {
            RecordFileFormat::Flv => {
                let header = flv_header(record_type.has_audio(), record_type.has_video());
                writer.put(&header).await?;
            }
            RecordFileFormat::Mp4 => {
                writer.put(&mp4_ftyp()).await?;
                let mdat_start = writer.position;
                writer.put(&mp4_mdat_header(0)).await?;
                writer.mp4 = Some((Mp4Index::new(video_size), mdat_start));
            }
            RecordFileFormat::Mp3 => {}
        }
        tracing::debug!(path = ?writer.temp_path, ?format, "Opened recording segment");
        Ok(writer)
    }

    async fn put(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Append one sample; samples the record type excludes are ignored
    pub async fn write(&mut self, sample: &Sample) -> Result<()> {
        let wanted = match sample {
            Sample::Audio(_) => self.record_type.has_audio(),
            Sample::Video(_) => self.record_type.has_video() && self.format != RecordFileFormat::Mp3,
        };
        if !wanted {
            return Ok(());
        }

        let base = *self.base_pts.get_or_insert(sample.pts());
        let timestamp = sample.pts().saturating_sub(base);

        match self.format {
            RecordFileFormat::Flv => {
                let tag = flv_tag(sample, timestamp);
                self.put(&tag).await?;
            }
            RecordFileFormat::Mp4 => {
                let offset = self.position;
                if let Some((index, _)) = self.mp4.as_mut() {
                    index.push(sample, timestamp, offset);
                }
                self.put(sample.payload()).await?;
            }
            RecordFileFormat::Mp3 => self.put(sample.payload()).await?,
        }
        self.samples += 1;
        Ok(())
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub const fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Timestamp of the first written sample
    #[must_use]
    pub const fn base_pts(&self) -> Option<u32> {
        self.base_pts
    }

    /// Close the segment and give it its final name
    pub async fn finish(mut self, file_name: &str) -> Result<PathBuf> {
        if let Some((index, mdat_start)) = self.mp4.take() {
            let payload_len = self.position - mdat_start - MP4_MDAT_HEADER_LEN;
            let moov = index.moov();
            self.put(&moov).await?;
            self.file.flush().await?;
            self.file.seek(SeekFrom::Start(mdat_start)).await?;
            self.file.write_all(&mp4_mdat_header(payload_len)).await?;
        }
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        drop(self.file);

        let path = self.directory.join(file_name);
        fs::rename(&self.temp_path, &path).await?;
        tracing::info!(path = ?path, bytes = self.position, "Recording segment finished");
        Ok(path)
    }

    /// Drop the segment without producing a file
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            tracing::warn!(path = ?self.temp_path, error = %e, "Failed to remove unfinished segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioFrame, VideoCodec, VideoFrame};
    use bytes::Bytes;

    fn video(pts: u32, key: bool) -> Sample {
        Sample::Video(VideoFrame::new(Bytes::from_static(b"frame"), VideoCodec::H264, pts, key))
    }

    #[tokio::test]
    async fn test_flv_segment_is_renamed_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), RecordFileFormat::Flv, RecordType::VideoOnly, (0, 0))
            .await
            .unwrap();
        writer.write(&video(1_000, true)).await.unwrap();
        writer.write(&video(1_040, false)).await.unwrap();
        assert_eq!(writer.sample_count(), 2);
        let size = writer.bytes_written();

        let path = writer.finish("out.flv").await.unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, size);
        assert_eq!(&data[..3], b"FLV");
        // second tag is 40 ms after the first
        let second = 13 + 25;
        assert_eq!(&data[second + 4..second + 7], &[0, 0, 40]);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["out.flv".to_string()]);
    }

    #[tokio::test]
    async fn test_mp4_segment_patches_mdat_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), RecordFileFormat::Mp4, RecordType::VideoOnly, (64, 48))
            .await
            .unwrap();
        writer.write(&video(0, true)).await.unwrap();
        writer.write(&video(50, false)).await.unwrap();
        let path = writer.finish("out.mp4").await.unwrap();

        let data = std::fs::read(&path).unwrap();
        let ftyp_len = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
        assert_eq!(&data[ftyp_len + 4..ftyp_len + 8], b"mdat");
        let mdat_len = u64::from_be_bytes(data[ftyp_len + 8..ftyp_len + 16].try_into().unwrap());
        assert_eq!(mdat_len, 16 + 10);
        let moov_at = ftyp_len + mdat_len as usize;
        assert_eq!(&data[moov_at + 4..moov_at + 8], b"moov");
    }

    #[tokio::test]
    async fn test_mp3_keeps_only_audio_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), RecordFileFormat::Mp3, RecordType::AudioOnly, (0, 0))
            .await
            .unwrap();
        let mut audio = AudioFrame::pcm(Bytes::from_static(&[1, 2, 3, 4]), 16_000, 1, 0);
        writer.write(&Sample::Audio(audio.clone())).await.unwrap();
        writer.write(&video(0, true)).await.unwrap();
        audio.pts = 20;
        writer.write(&Sample::Audio(audio)).await.unwrap();

        let path = writer.finish("out.mp3").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SegmentWriter::create(dir.path(), RecordFileFormat::Flv, RecordType::AudioAndVideo, (0, 0))
            .await
            .unwrap();
        writer.discard().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
