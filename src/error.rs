//! Error handling for streamcore.
//!
//! Every failure is an [`Error`]: a coarse [`ErrorKind`] modelled on gRPC
//! status codes, plus the boxed underlying error. Engine and I/O failures are
//! converted at the pipeline boundary so that the reconciler only ever deals
//! with this one type.
//!
//! Two classifications matter to playback control:
//! * [`Error::is_stream_expired`]: the server refused the stream URL
//!   (HTTP 401/403). The caller should fetch a fresh URL and restart.
//! * [`Error::is_missing_codec`]: the decoder cannot handle the stream
//!   format.
//!
//! # Example
//!
//! ```rust
//! use streamcore::error::{Error, ErrorKind, Result};
//!
//! fn open(url: &str) -> Result<url::Url> {
//!     let url = url::Url::parse(url)?;
//!     if url.scheme() != "http" && url.scheme() != "https" {
//!         return Err(Error::invalid_argument("stream URL must be HTTP(S)"));
//!     }
//!     Ok(url)
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for streamcore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure categories, numbered after gRPC status codes.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    #[error("cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    /// Malformed URL, bitrate, property value or configuration.
    #[error("invalid argument")]
    InvalidArgument = 3,

    #[error("timed out")]
    DeadlineExceeded = 4,

    /// Missing output device or stream.
    #[error("not found")]
    NotFound = 5,

    /// The server refused the stream; its URL has likely expired.
    #[error("permission denied")]
    PermissionDenied = 7,

    #[error("resource exhausted")]
    ResourceExhausted = 8,

    /// The engine refused a transition or a request came too early.
    #[error("invalid state")]
    FailedPrecondition = 9,

    #[error("aborted")]
    Aborted = 10,

    /// Equalizer band index or similar outside its range.
    #[error("out of range")]
    OutOfRange = 11,

    /// No decoder for the stream format.
    #[error("unsupported")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    /// Network or audio device temporarily unreachable.
    #[error("unavailable")]
    Unavailable = 14,

    /// Truncated or corrupt stream data.
    #[error("data loss")]
    DataLoss = 15,

    /// The server wants credentials the stream URL no longer carries.
    #[error("unauthenticated")]
    Unauthenticated = 16,
}

/// Generates one constructor per [`ErrorKind`].
macro_rules! constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident,)*) => {
        impl Error {
            $(
                $(#[$doc])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

constructors! {
    /// Operation interrupted by conflicting changes.
    aborted => Aborted,
    /// Operation cancelled before completion, e.g. a superseded download.
    cancelled => Cancelled,
    /// Data corrupted or truncated beyond recovery.
    data_loss => DataLoss,
    /// Network or engine operation took too long.
    deadline_exceeded => DeadlineExceeded,
    /// Operation not possible in the current state, e.g. preroll without a
    /// stream.
    failed_precondition => FailedPrecondition,
    /// Invariant violated inside streamcore or the engine.
    internal => Internal,
    /// Caller supplied a malformed value.
    invalid_argument => InvalidArgument,
    /// Resource such as an output device does not exist.
    not_found => NotFound,
    /// Value outside its permitted range.
    out_of_range => OutOfRange,
    /// Access refused, e.g. HTTP 403 on an expired stream URL.
    permission_denied => PermissionDenied,
    /// Memory, disk or quota exhausted.
    resource_exhausted => ResourceExhausted,
    /// Missing or rejected credentials, e.g. HTTP 401.
    unauthenticated => Unauthenticated,
    /// Service or device temporarily unreachable.
    unavailable => Unavailable,
    /// Feature or format not supported, e.g. a missing codec.
    unimplemented => Unimplemented,
    /// Anything that fits no other category.
    unknown => Unknown,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether the server refused the stream because its URL expired or
    /// the session is no longer authorized.
    #[must_use]
    pub fn is_stream_expired(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::PermissionDenied | ErrorKind::Unauthenticated
        )
    }

    /// Whether the decoder lacks support for the stream's format.
    #[must_use]
    pub fn is_missing_codec(&self) -> bool {
        self.kind == ErrorKind::Unimplemented
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts HTTP client errors, keeping authorization failures apart so that
/// expired stream URLs can be recognized.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 => Self::unauthenticated(err),
                403 => Self::permission_denied(err),
                404 | 410 => Self::not_found(err),
                429 => Self::resource_exhausted(err),
                500..=599 => Self::unavailable(err),
                _ => Self::unknown(err),
            };
        }

        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_connect() || err.is_request() {
            return Self::unavailable(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if err.is_builder() {
            return Self::invalid_argument(err);
        }

        Self::unknown(err)
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts configuration parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts failed blocking tasks to `Internal`, or `Cancelled` when the
/// task was aborted.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

/// Converts stream initialization errors to `Internal`.
impl<S> From<stream_download::StreamInitializationError<S>> for Error
where
    S: stream_download::source::SourceStream,
{
    fn from(e: stream_download::StreamInitializationError<S>) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts HTTP stream errors.
///
/// * `FetchFailure` -> `DataLoss`
/// * `ResponseFailure` -> mapped by HTTP status, see `From<reqwest::Error>`
impl From<stream_download::http::HttpStreamError<reqwest::Client>> for Error {
    fn from(e: stream_download::http::HttpStreamError<reqwest::Client>) -> Self {
        use stream_download::http::HttpStreamError::*;
        match e {
            FetchFailure(e) => Self::data_loss(e.to_string()),
            ResponseFailure(e) => Self::from(e),
        }
    }
}

/// Converts audio output errors.
impl From<rodio::StreamError> for Error {
    fn from(e: rodio::StreamError) -> Self {
        use rodio::StreamError::*;
        match e {
            PlayStreamError(e) => Self::unavailable(e),
            DefaultStreamConfigError(e) => Self::unavailable(e),
            BuildStreamError(e) => Self::unavailable(e),
            SupportedStreamConfigsError(e) => Self::not_found(e),
            NoDevice => Self::not_found(e),
        }
    }
}

/// Converts sink creation errors.
impl From<rodio::PlayError> for Error {
    fn from(e: rodio::PlayError) -> Self {
        use rodio::PlayError::*;
        match e {
            DecoderError(e) => Self::data_loss(e),
            NoDevice => Self::not_found(e),
        }
    }
}

/// Converts device enumeration errors to `Unavailable`.
impl From<cpal::DevicesError> for Error {
    fn from(e: cpal::DevicesError) -> Self {
        Self::unavailable(e.to_string())
    }
}

/// Converts Symphonia errors.
///
/// * `IoError` → `DataLoss`
/// * `DecodeError` → `DataLoss`
/// * `LimitError` → `ResourceExhausted`
/// * `ResetRequired` → `Internal`
/// * `SeekError` → `Unavailable`
/// * `Unsupported` → `Unimplemented`, which marks a missing codec
impl From<symphonia::core::errors::Error> for Error {
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error::*;
        match e {
            IoError(e) => Self::data_loss(e),
            DecodeError(e) => Self::data_loss(e),
            LimitError(e) => Self::resource_exhausted(e),
            ResetRequired => Self::internal("reset required"),
            SeekError(e) => Self::unavailable(format!("seek error: {e:?}")),
            Unsupported(e) => Self::unimplemented(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_details() {
        let err = Error::not_found("no such device");
        assert_eq!(err.to_string(), "not found: no such device");
        assert_eq!(
            Error::unimplemented("opus").to_string(),
            "unsupported: opus"
        );
    }

    #[test]
    fn classifies_expired_streams() {
        assert!(Error::permission_denied("403").is_stream_expired());
        assert!(Error::unauthenticated("401").is_stream_expired());
        assert!(!Error::unavailable("503").is_stream_expired());
    }

    #[test]
    fn unsupported_format_is_missing_codec() {
        let err = Error::from(symphonia::core::errors::Error::Unsupported(
            "core (probe): no suitable format reader found",
        ));
        assert!(err.is_missing_codec());
        assert!(!Error::data_loss("truncated").is_missing_codec());
    }

    #[test]
    fn io_errors_keep_their_category() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    }
}
