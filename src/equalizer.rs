//! Ten band graphic equalizer.
//!
//! One peaking biquad per band (RBJ Audio EQ Cookbook), applied in series.
//! Gains live in the shared [`Bands`] and are picked up by the audio thread
//! at the next frame boundary. Bands at 0 dB are skipped entirely.

use std::{
    f32::consts::PI,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rodio::{source::SeekError, Source};

use crate::{
    pipeline::{EQ_BANDS, EQ_FREQUENCIES},
    util::{ToF32, ZERO_DB},
};

/// Octave-wide bands.
const Q: f32 = std::f32::consts::SQRT_2;

/// Band gains shared with the audio thread.
#[derive(Debug)]
pub struct Bands {
    gains: [AtomicU32; EQ_BANDS],
    version: AtomicU64,
}

impl Default for Bands {
    fn default() -> Self {
        Self {
            gains: std::array::from_fn(|_| AtomicU32::new(ZERO_DB.to_bits())),
            version: AtomicU64::new(0),
        }
    }
}

impl Bands {
    /// Sets the gain of `band` in dB. Out of range bands are ignored; the
    /// pipeline validates them before they get here.
    pub fn set(&self, band: usize, gain: f32) {
        if let Some(slot) = self.gains.get(band) {
            slot.store(gain.to_bits(), Ordering::Relaxed);
            self.version.fetch_add(1, Ordering::Release);
        }
    }

    #[must_use]
    pub fn get(&self, band: usize) -> f32 {
        self.gains
            .get(band)
            .map_or(ZERO_DB, |slot| f32::from_bits(slot.load(Ordering::Relaxed)))
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    /// Peaking filter, or `None` for a flat band.
    fn peaking(frequency: f32, gain_db: f32, sample_rate: f32) -> Option<Self> {
        if gain_db.abs() < 0.01 || sample_rate < 1.0 {
            return None;
        }

        // Keep clear of Nyquist, where the filter becomes unstable.
        let frequency = frequency.min(sample_rate * 0.45);

        let a = 10.0_f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * frequency / sample_rate;
        let (sin, cos) = omega.sin_cos();
        let alpha = sin / (2.0 * Q);

        let a0 = 1.0 + alpha / a;
        Some(Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha / a) / a0,
        })
    }
}

/// Direct form I history of one band on one channel.
#[derive(Copy, Clone, Debug, Default)]
struct History {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl History {
    #[inline]
    fn process(&mut self, c: &Coefficients, x: f32) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Wraps `input` in the equalizer stage.
pub fn equalize<I>(input: I, bands: Arc<Bands>) -> Equalizer<I>
where
    I: Source<Item = f32>,
{
    let channels = usize::from(input.channels().max(1));
    let mut equalizer = Equalizer {
        input,
        bands,
        version: None,
        filters: [None; EQ_BANDS],
        history: vec![[History::default(); EQ_BANDS]; channels],
        position: 0,
    };
    equalizer.refresh();
    equalizer
}

#[derive(Debug)]
pub struct Equalizer<I> {
    input: I,
    bands: Arc<Bands>,

    /// Band version the filters were computed for.
    version: Option<u64>,
    filters: [Option<Coefficients>; EQ_BANDS],
    history: Vec<[History; EQ_BANDS]>,

    position: usize,
}

impl<I> Equalizer<I>
where
    I: Source<Item = f32>,
{
    fn refresh(&mut self) {
        let version = self.bands.version();
        if self.version == Some(version) {
            return;
        }

        let sample_rate = self.input.sample_rate().to_f32_lossy();
        for (band, filter) in self.filters.iter_mut().enumerate() {
            *filter = Coefficients::peaking(EQ_FREQUENCIES[band], self.bands.get(band), sample_rate);
        }
        trace!("equalizer updated to version {version}");
        self.version = Some(version);
    }
}

impl<I> Iterator for Equalizer<I>
where
    I: Source<Item = f32>,
{
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<f32> {
        let mut sample = self.input.next()?;

        let channel = self.position % self.history.len();
        self.position = self.position.wrapping_add(1);
        if channel == 0 {
            self.refresh();
        }

        for (filter, history) in self.filters.iter().zip(self.history[channel].iter_mut()) {
            if let Some(filter) = filter {
                sample = history.process(filter, sample);
            }
        }

        Some(sample)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

impl<I> Source for Equalizer<I>
where
    I: Source<Item = f32>,
{
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.input.current_frame_len()
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.input.channels()
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.input.sample_rate()
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.input.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        self.input.try_seek(pos)?;
        for channel in &mut self.history {
            *channel = [History::default(); EQ_BANDS];
        }
        self.position = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rodio::buffer::SamplesBuffer;

    use super::*;

    fn sine(frequency: f32, len: usize) -> SamplesBuffer<f32> {
        let samples = (0..len)
            .map(|i| (2.0 * PI * frequency * i.to_f32_lossy() / 44_100.0).sin() * 0.25)
            .collect::<Vec<_>>();
        SamplesBuffer::new(1, 44_100, samples)
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0, |peak, sample| peak.max(sample.abs()))
    }

    #[test]
    fn flat_bands_pass_through() {
        let input: Vec<f32> = sine(1000.0, 512).collect();
        let output: Vec<f32> = equalize(sine(1000.0, 512), Arc::new(Bands::default())).collect();
        assert_eq!(input, output);
    }

    #[test]
    fn boosted_band_raises_its_frequency() {
        let bands = Arc::new(Bands::default());
        bands.set(5, 12.0);

        let output: Vec<f32> = equalize(sine(EQ_FREQUENCIES[5], 44_100), bands).collect();
        let settled = peak(&output[22_050..]);
        assert!(settled > 0.25 * 3.0, "peak {settled}");
    }

    #[test]
    fn changes_apply_while_playing() {
        let bands = Arc::new(Bands::default());
        let mut equalizer = equalize(sine(EQ_FREQUENCIES[5], 44_100), Arc::clone(&bands));

        let before: Vec<f32> = equalizer.by_ref().take(22_050).collect();
        bands.set(5, -24.0);
        let after: Vec<f32> = equalizer.collect();

        assert!(peak(&after[11_025..]) < peak(&before) / 4.0);
    }

    #[test]
    fn unknown_band_is_ignored() {
        let bands = Bands::default();
        bands.set(EQ_BANDS, 6.0);
        assert_eq!(bands.version(), 0);
        assert_eq!(bands.get(EQ_BANDS), ZERO_DB);
    }
}
