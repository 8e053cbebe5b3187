//! Buffering monitor.
//!
//! Decides from a live buffer reading whether playback must be held in the
//! [`Buffering`](PlaybackState::Buffering) pseudo-state or may be released
//! to the state the caller asked for. A check runs immediately on every
//! buffering message and again on a short debounced timer for as long as
//! buffering is suspected.

use std::{pin::Pin, time::Duration};

use tokio::time::{self, Instant, Sleep};

use crate::{
    state::{Generation, PlaybackState},
    telemetry::BufferLevel,
};

/// Interval between re-checks while buffering is suspected.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of one buffering check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Readings are meaningless before preroll.
    Ignore,
    /// Buffer is full while buffering: release to the desired state.
    Resolve,
    /// Buffer ran low: hold playback. `force` is set when the engine is
    /// actually playing and must be paused.
    Enter { force: bool },
    /// Nothing to do.
    Hold,
}

/// Decides what to do with a buffer reading.
#[must_use]
pub fn decide(prerolled: bool, level: BufferLevel, actual: PlaybackState) -> Decision {
    if !prerolled {
        return Decision::Ignore;
    }

    match (level.is_full(), actual) {
        (true, PlaybackState::Buffering) => Decision::Resolve,
        (false, PlaybackState::Playing | PlaybackState::Paused) => Decision::Enter {
            force: actual == PlaybackState::Playing,
        },
        _ => Decision::Hold,
    }
}

/// The single re-check timer.
///
/// At most one check is outstanding: scheduling again pushes the deadline
/// out instead of adding a second timer.
#[derive(Debug)]
pub struct Monitor {
    /// Created on first use so that a monitor can be built outside a
    /// runtime.
    timer: Option<Pin<Box<Sleep>>>,
    armed: bool,
    generation: Generation,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timer: None,
            armed: false,
            generation: Generation::default(),
        }
    }

    /// (Re)schedules the check for `generation`, replacing any pending one.
    pub fn schedule(&mut self, generation: Generation) {
        if self.armed {
            trace!("rescheduling buffering check");
        }
        let deadline = Instant::now() + CHECK_INTERVAL;
        match &mut self.timer {
            Some(timer) => timer.as_mut().reset(deadline),
            None => self.timer = Some(Box::pin(time::sleep_until(deadline))),
        }
        self.generation = generation;
        self.armed = true;
    }

    /// Cancels the pending check, if any.
    pub fn cancel(&mut self) {
        if self.armed {
            trace!("buffering check cancelled");
        }
        self.armed = false;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Waits for the pending check and returns the generation it was
    /// scheduled for. Pends forever while nothing is scheduled, so guard
    /// it with [`is_armed`](Self::is_armed) in `select!`.
    pub async fn expired(&mut self) -> Generation {
        match &mut self.timer {
            Some(timer) if self.armed => timer.as_mut().await,
            _ => std::future::pending().await,
        }
        self.armed = false;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Percentage;

    fn percent(value: f32) -> BufferLevel {
        BufferLevel::Percent(Percentage::from_percent(value))
    }

    #[test]
    fn ignores_readings_before_preroll() {
        assert_eq!(
            decide(false, percent(10.0), PlaybackState::Playing),
            Decision::Ignore
        );
        assert_eq!(
            decide(false, percent(100.0), PlaybackState::Buffering),
            Decision::Ignore
        );
    }

    #[test]
    fn full_buffer_resolves_buffering() {
        assert_eq!(
            decide(true, percent(100.0), PlaybackState::Buffering),
            Decision::Resolve
        );
        assert_eq!(
            decide(true, BufferLevel::Unknown, PlaybackState::Buffering),
            Decision::Resolve
        );
        assert_eq!(
            decide(true, percent(100.0), PlaybackState::Playing),
            Decision::Hold
        );
    }

    #[test]
    fn low_buffer_enters_buffering() {
        assert_eq!(
            decide(true, percent(40.0), PlaybackState::Playing),
            Decision::Enter { force: true }
        );
        assert_eq!(
            decide(true, percent(40.0), PlaybackState::Paused),
            Decision::Enter { force: false }
        );
        assert_eq!(
            decide(true, percent(40.0), PlaybackState::Buffering),
            Decision::Hold
        );
        assert_eq!(
            decide(true, percent(40.0), PlaybackState::Stopped),
            Decision::Hold
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_debounces() {
        let generation = Generation::default().next();
        let mut monitor = Monitor::new();
        assert!(!monitor.is_armed());

        let start = Instant::now();
        monitor.schedule(generation);
        time::advance(CHECK_INTERVAL / 2).await;
        monitor.schedule(generation);

        assert_eq!(monitor.expired().await, generation);
        assert!(start.elapsed() >= CHECK_INTERVAL + CHECK_INTERVAL / 2);
        assert!(!monitor.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let mut monitor = Monitor::new();
        monitor.schedule(Generation::default());
        monitor.cancel();

        let fired = time::timeout(CHECK_INTERVAL * 5, monitor.expired()).await;
        assert!(fired.is_err());
    }
}
