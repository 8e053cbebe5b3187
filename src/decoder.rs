//! Audio decoder implementation using Symphonia.
//!
//! Probes the container from the first bytes of the stream, optionally
//! guided by the file extension or content type of the URL, and decodes the
//! default track into interleaved `f32` samples.
//!
//! Network streams are usually not seekable and have no known length, so
//! seeking is always accurate and the duration is often unknown.

use std::time::Duration;

use rodio::source::SeekError;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::{MetadataOptions, StandardTagKey, Value},
    probe::Hint,
};

use crate::{
    error::{Error, Result},
    pipeline::AudioFormat,
    util::ToF32,
};

/// Sample type produced by the decoder and processed by every later stage.
pub type SampleFormat = f32;

/// Sample rate to assume when the codec does not tell.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Channel count to assume when the codec does not tell.
pub const DEFAULT_CHANNELS: u16 = 2;

/// Symphonia asserts at least 64 KiB for its ring buffer.
const BUFFER_LEN: usize = 64 * 1024;

/// Maximum number of consecutive corrupted packets to skip before giving up.
const MAX_RETRIES: usize = 3;

pub struct Decoder {
    demuxer: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,

    /// Reused across packets to avoid allocations.
    buffer: Option<SampleBuffer<SampleFormat>>,
    position: usize,

    channels: u16,
    sample_rate: u32,
    total_duration: Option<Duration>,
    total_samples: Option<usize>,
}

impl Decoder {
    /// Probes `source` and sets up a decoder for its default track.
    ///
    /// `extension` and `mime_type` narrow down probing when known.
    ///
    /// # Errors
    ///
    /// Returns `Unimplemented` when no demuxer or decoder supports the
    /// stream, and other errors when the stream cannot be read.
    pub fn new(
        source: Box<dyn MediaSource>,
        extension: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<Self> {
        let stream = MediaSourceStream::new(
            source,
            MediaSourceStreamOptions {
                buffer_len: BUFFER_LEN,
            },
        );

        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }
        if let Some(mime_type) = mime_type {
            hint.mime_type(mime_type);
        }

        let demuxer = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )?
            .format;
        let default_track = demuxer
            .default_track()
            .ok_or_else(|| Error::not_found("stream has no audio track"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&default_track.codec_params, &DecoderOptions::default())?;

        // The decoder may know more than the container.
        let codec_params = decoder.codec_params();
        let sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = codec_params.channels.map_or(DEFAULT_CHANNELS, |channels| {
            u16::try_from(channels.count()).unwrap_or(u16::MAX)
        });

        let total_duration = codec_params
            .time_base
            .zip(codec_params.n_frames)
            .map(|(time_base, frames)| time_base.calc_time(frames).into());
        let total_samples = codec_params.n_frames.and_then(|frames| {
            frames
                .checked_mul(channels.into())
                .and_then(|samples| usize::try_from(samples).ok())
        });

        Ok(Self {
            demuxer,
            decoder,

            buffer: None,
            position: 0,

            channels,
            sample_rate,
            total_duration,
            total_samples,
        })
    }

    /// The format announced downstream once decoding starts.
    #[must_use]
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// The `ReplayGain` track gain in dB, if the stream is tagged.
    pub fn replay_gain(&mut self) -> Option<f32> {
        self.demuxer
            .metadata()
            .skip_to_latest()
            .and_then(|metadata| {
                metadata.tags().iter().find_map(|tag| {
                    match (tag.std_key, &tag.value) {
                        (Some(StandardTagKey::ReplayGainTrackGain), Value::Float(gain)) => {
                            Some(gain.to_f32_lossy())
                        }
                        (Some(StandardTagKey::ReplayGainTrackGain), Value::String(gain)) => {
                            gain.trim_end_matches("dB").trim().parse().ok()
                        }
                        _ => None,
                    }
                })
            })
    }
}

impl rodio::Source for Decoder {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.buffer.as_ref().map(SampleBuffer::len)
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// `None` for live streams.
    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.total_duration
    }

    fn try_seek(&mut self, pos: Duration) -> std::result::Result<(), SeekError> {
        self.demuxer
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    track_id: None,
                    time: pos.into(),
                },
            )
            .map_err(|e| SeekError::Other(Box::new(e)))?;

        // The decoder cannot tell that the demuxer moved.
        self.decoder.reset();
        self.buffer = None;

        Ok(())
    }
}

impl Iterator for Decoder {
    type Item = SampleFormat;

    fn next(&mut self) -> Option<Self::Item> {
        if self
            .buffer
            .as_ref()
            .is_none_or(|buffer| self.position >= buffer.len())
        {
            let mut skipped = 0;
            loop {
                if skipped > MAX_RETRIES {
                    error!("skipped too many packets, giving up");
                    return None;
                }

                match self.demuxer.next_packet() {
                    Ok(packet) => {
                        let decoded = match self.decoder.decode(&packet) {
                            Ok(decoded) => decoded,
                            Err(SymphoniaError::DecodeError(e)) => {
                                warn!("skipping undecodable packet: {e}");
                                skipped += 1;
                                continue;
                            }
                            Err(e) => {
                                error!("{e}");
                                return None;
                            }
                        };
                        if self
                            .buffer
                            .as_ref()
                            .is_none_or(|buffer| buffer.capacity() < decoded.capacity())
                        {
                            self.buffer = Some(SampleBuffer::new(
                                decoded.capacity() as u64,
                                *decoded.spec(),
                            ));
                        }
                        let buffer = self.buffer.as_mut()?;
                        buffer.copy_interleaved_ref(decoded);
                        self.position = 0;
                        break;
                    }

                    Err(SymphoniaError::IoError(e)) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            error!("{e}");
                        }
                        return None;
                    }
                    Err(SymphoniaError::DecodeError(e)) => {
                        warn!("skipping malformed packet: {e}");
                        skipped += 1;
                    }
                    Err(SymphoniaError::ResetRequired) => {
                        self.decoder.reset();
                    }
                    Err(e) => {
                        error!("{e}");
                        return None;
                    }
                }
            }
        }

        let sample = *self
            .buffer
            .as_ref()
            .and_then(|buffer| buffer.samples().get(self.position))?;
        self.position += 1;

        Some(sample)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.total_samples)
    }
}
