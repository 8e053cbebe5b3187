//! Events emitted by the playback core.
//!
//! Events are fire-and-forget notifications for user interfaces, D-Bus
//! bridges and plugins. They are delivered over an unbounded channel in the
//! order they were raised. For one stream that order is:
//!
//! 1. [`StateChanged`](Event::StateChanged) into buffering
//! 2. [`DurationKnown`](Event::DurationKnown), exactly once
//! 3. [`BufferingFinished`](Event::BufferingFinished)
//!
//! # Example
//!
//! ```rust
//! use streamcore::events::{self, Event};
//!
//! async fn listen(mut events: events::Receiver) {
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::BufferingFinished(position) => println!("resumed at {position:?}"),
//!             Event::FatalError(message) => {
//!                 eprintln!("{message}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use std::{fmt, time::Duration};

use tokio::sync::mpsc;

/// Sending half of the event channel.
pub type Sender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event channel.
pub type Receiver = mpsc::UnboundedReceiver<Event>;

/// Creates an event channel.
#[must_use]
pub fn channel() -> (Sender, Receiver) {
    mpsc::unbounded_channel()
}

/// Notifications raised by [`Player`](crate::player::Player).
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Desired and/or actual state may have changed.
    ///
    /// Raised after every state request, even when nothing changed, so
    /// listeners can use it to refresh indicators. Re-read
    /// [`Player::desired`](crate::player::Player::desired) and
    /// [`Player::actual`](crate::player::Player::actual).
    StateChanged,

    /// Duration of the current stream, or `None` if the engine could not
    /// tell. Raised at most once per stream.
    DurationKnown(Option<Duration>),

    /// Buffering resolved; carries the playback position so clocks and
    /// scrobblers can resynchronize.
    BufferingFinished(Duration),

    /// Non-fatal engine warning.
    Warning {
        error: String,
        debug: Option<String>,
    },

    /// Recoverable failure. The stream is unaffected, or the caller may
    /// restart it, possibly with a fresh URL or a different quality.
    Error(String),

    /// The caller must terminate or fully reinitialize.
    FatalError(String),

    /// The stream completed; the caller decides what plays next.
    EndOfStream,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged => write!(f, "state changed"),
            Self::DurationKnown(Some(duration)) => write!(f, "duration {duration:?}"),
            Self::DurationKnown(None) => write!(f, "duration unknown"),
            Self::BufferingFinished(position) => {
                write!(f, "buffering finished at {position:?}")
            }
            Self::Warning { error, .. } => write!(f, "warning: {error}"),
            Self::Error(message) => write!(f, "error: {message}"),
            Self::FatalError(message) => write!(f, "fatal error: {message}"),
            Self::EndOfStream => write!(f, "end of stream"),
        }
    }
}
