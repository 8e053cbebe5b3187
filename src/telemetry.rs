//! Position, duration and buffer-fill queries.
//!
//! The engine often cannot answer right after a stream starts. Queries
//! return "unknown" then rather than failing.

use std::{fmt, time::Duration};

use crate::{
    pipeline::{Engine, Pipeline},
    state::Percentage,
};

/// Fill level of the download buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BufferLevel {
    Percent(Percentage),
    /// The engine could not answer. Treated as full so that a stalled query
    /// never keeps playback paused.
    Unknown,
}

impl BufferLevel {
    #[must_use]
    pub fn is_full(self) -> bool {
        match self {
            Self::Percent(percent) => percent.is_full(),
            Self::Unknown => true,
        }
    }
}

impl fmt::Display for BufferLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(percent) => write!(f, "{percent}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl<E: Engine> Pipeline<E> {
    /// Playback position of the current stream.
    #[must_use]
    pub fn position(&self) -> Option<Duration> {
        let position = self.engine().query_position();
        if position.is_none() {
            trace!("position not available yet");
        }
        position
    }

    /// Duration of the current stream. Live streams never have one.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let duration = self.engine().query_duration();
        if duration.is_none() {
            trace!("duration not available yet");
        }
        duration
    }

    #[must_use]
    pub fn buffer_level(&self) -> BufferLevel {
        self.engine()
            .query_buffering()
            .map_or(BufferLevel::Unknown, BufferLevel::Percent)
    }
}
