//! Loudness normalization and peak limiting.
//!
//! [`Normalize`] applies a static gain followed by a feedforward limiter in
//! the log domain, based on: Giannoulis, D., Massberg, M., & Reiss, J.D.
//! (2012). Digital Dynamic Range Compressor Design: A Tutorial and
//! Analysis. Journal of The Audio Engineering Society, 60, 399-408.
//!
//! The gain comes from the stream's `ReplayGain` tag when it has one and
//! from the configured fallback gain otherwise. Both stages can be switched
//! at runtime through the shared [`Controls`] without rebuilding the
//! source.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use rodio::{source::SeekError, Source};

use crate::util::{self, ToF32, ZERO_DB};

/// Level where limiting begins, in dBFS.
pub const THRESHOLD: f32 = -1.0;

/// Range over which limiting gradually increases, in dB.
pub const KNEE_WIDTH: f32 = 4.0;

pub const ATTACK: Duration = Duration::from_millis(5);
pub const RELEASE: Duration = Duration::from_millis(100);

/// Normalization and limiter settings shared with the audio thread.
#[derive(Debug)]
pub struct Controls {
    normalization: AtomicBool,
    fallback_gain: AtomicU32,
    limiter: AtomicBool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            normalization: AtomicBool::new(true),
            fallback_gain: AtomicU32::new(ZERO_DB.to_bits()),
            limiter: AtomicBool::new(true),
        }
    }
}

impl Controls {
    pub fn set_normalization(&self, enabled: bool, fallback_gain: f32) {
        self.fallback_gain
            .store(fallback_gain.to_bits(), Ordering::Relaxed);
        self.normalization.store(enabled, Ordering::Relaxed);
    }

    pub fn set_limiter(&self, enabled: bool) {
        self.limiter.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn normalization(&self) -> bool {
        self.normalization.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fallback_gain(&self) -> f32 {
        f32::from_bits(self.fallback_gain.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn limiter(&self) -> bool {
        self.limiter.load(Ordering::Relaxed)
    }

    /// Linear gain for a stream with the given `ReplayGain` in dB.
    #[must_use]
    pub fn gain(&self, replay_gain: Option<f32>) -> f32 {
        if self.normalization() {
            util::db_to_ratio(replay_gain.unwrap_or_else(|| self.fallback_gain()))
        } else {
            1.0
        }
    }
}

/// Wraps `input` in the normalization and limiter stages.
pub fn normalize<I>(input: I, replay_gain: Option<f32>, controls: Arc<Controls>) -> Normalize<I>
where
    I: Source<Item = f32>,
{
    let sample_rate = input.sample_rate();
    let channels = usize::from(input.channels().max(1));

    Normalize {
        gain: controls.gain(replay_gain),
        limiting: controls.limiter(),

        input,
        replay_gain,
        controls,

        attack: duration_to_coefficient(ATTACK, sample_rate),
        release: duration_to_coefficient(RELEASE, sample_rate),

        integrators: vec![ZERO_DB; channels],
        peaks: vec![ZERO_DB; channels],
        position: 0,
    }
}

/// Smoothing coefficient for a response time. Longer times give higher
/// coefficients and a slower response.
#[must_use]
fn duration_to_coefficient(duration: Duration, sample_rate: u32) -> f32 {
    f32::exp(-1.0 / (duration.as_secs_f32() * sample_rate.to_f32_lossy()))
}

#[derive(Debug)]
pub struct Normalize<I> {
    input: I,
    replay_gain: Option<f32>,
    controls: Arc<Controls>,

    /// Snapshot of the controls, refreshed once per frame.
    gain: f32,
    limiting: bool,

    attack: f32,
    release: f32,

    /// Per-channel peak detector integrator states (dB).
    integrators: Vec<f32>,
    /// Per-channel smoothed peak levels (dB).
    peaks: Vec<f32>,

    position: usize,
}

impl<I> Normalize<I> {
    #[inline]
    pub fn inner(&self) -> &I {
        &self.input
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.input
    }

    fn reset(&mut self) {
        self.integrators.fill(ZERO_DB);
        self.peaks.fill(ZERO_DB);
        self.position = 0;
    }

    /// Gain reduction in dB for one sample.
    fn limit(&mut self, channel: usize, sample: f32) -> f32 {
        // Exact silence needs no limiting, and `ratio_to_db(0.0)` is `-inf`,
        // which would get the peak detector stuck. NaN is caught the same way.
        let mut limiter_db = ZERO_DB;
        if sample.is_normal() {
            let bias_db = util::ratio_to_db(sample.abs()) - THRESHOLD;
            let knee_boundary_db = bias_db * 2.0;

            if knee_boundary_db < -KNEE_WIDTH {
                limiter_db = ZERO_DB;
            } else if knee_boundary_db.abs() <= KNEE_WIDTH {
                limiter_db = (knee_boundary_db + KNEE_WIDTH).powi(2) / (8.0 * KNEE_WIDTH);
            } else {
                limiter_db = bias_db;
            }
        }

        // Idle unless engaged or still in attack or release.
        if limiter_db <= ZERO_DB
            && self.integrators[channel] <= ZERO_DB
            && self.peaks[channel] <= ZERO_DB
        {
            return ZERO_DB;
        }

        self.integrators[channel] = f32::max(
            limiter_db,
            self.release * self.integrators[channel] - self.release * limiter_db + limiter_db,
        );
        self.peaks[channel] = self.attack * self.peaks[channel]
            - self.attack * self.integrators[channel]
            + self.integrators[channel];

        // Link channels so the stereo image does not shift.
        self.peaks.iter().copied().fold(ZERO_DB, f32::max)
    }
}

impl<I> Iterator for Normalize<I>
where
    I: Source<Item = f32>,
{
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<f32> {
        let sample = self.input.next()?;

        let channels = self.integrators.len();
        let channel = self.position % channels;
        self.position = self.position.wrapping_add(1);

        if channel == 0 {
            self.gain = self.controls.gain(self.replay_gain);
            let limiting = self.controls.limiter();
            if limiting != self.limiting {
                self.reset();
                self.position = 1;
                self.limiting = limiting;
            }
        }

        let sample = sample * self.gain;
        if !self.limiting {
            return Some(sample);
        }

        let reduction = self.limit(channel, sample);
        if reduction > ZERO_DB {
            Some(sample * util::db_to_ratio(-reduction))
        } else {
            Some(sample)
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

impl<I> Source for Normalize<I>
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

    /// Resets the limiter along with the seek to avoid artifacts.
    #[inline]
    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        self.input.try_seek(pos)?;
        self.reset();
        Ok(())
    }
}
