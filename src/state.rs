//! Playback states, engine states and the small value types shared by the
//! reconciler, the buffering monitor and the engine.

use std::fmt;

/// Playback state as seen by callers of [`Player`](crate::player::Player).
///
/// [`Buffering`](Self::Buffering) is a pseudo-state: callers never request
/// it. It is laid over the last requested state while the download buffer
/// refills, and the engine cannot tell it apart from
/// [`Paused`](Self::Paused).
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Paused,
    Playing,
    Buffering,
}

impl PlaybackState {
    /// The one engine state this playback state maps to.
    #[must_use]
    pub fn engine_state(self) -> EngineState {
        match self {
            Self::Stopped => EngineState::Null,
            Self::Paused | Self::Buffering => EngineState::Paused,
            Self::Playing => EngineState::Playing,
        }
    }

    #[must_use]
    pub fn is_buffering(self) -> bool {
        self == Self::Buffering
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Playing => write!(f, "playing"),
            Self::Buffering => write!(f, "buffering"),
        }
    }
}

/// State of the underlying media engine.
///
/// Ordered from fully torn down to running: `Null < Ready < Paused <
/// Playing`.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    /// No resources allocated.
    #[default]
    Null,
    /// Output device open, no stream data flowing.
    Ready,
    /// Stream prerolled or prerolling, clock stopped.
    Paused,
    /// Clock running, samples reach the sink.
    Playing,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Ready => write!(f, "READY"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Playing => write!(f, "PLAYING"),
        }
    }
}

/// How an accepted engine transition completes.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum StateChange {
    /// Completed before returning.
    Success,
    /// Completes in the background; an `AsyncDone` message follows.
    Async,
    /// Completed, but a live source cannot preroll while paused.
    NoPreroll,
}

/// Monotonic counter identifying the current stream.
///
/// Bumped on every stream start and stop. Anything tagged with an older
/// generation belongs to a superseded stream and is discarded.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A percentage clamped to `[0, 100]`.
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd)]
pub struct Percentage(f32);

impl Percentage {
    pub const FULL: Self = Self(100.0);

    #[must_use]
    pub fn from_percent(percent: f32) -> Self {
        if percent.is_nan() {
            return Self(0.0);
        }
        Self(percent.clamp(0.0, 100.0))
    }

    #[must_use]
    pub fn from_ratio(ratio: f32) -> Self {
        Self::from_percent(ratio * 100.0)
    }

    #[must_use]
    pub fn as_percent(self) -> f32 {
        self.0
    }

    #[must_use]
    pub fn as_ratio(self) -> f32 {
        self.0 / 100.0
    }

    #[must_use]
    pub fn is_full(self) -> bool {
        self.0 >= 100.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.0)
    }
}
