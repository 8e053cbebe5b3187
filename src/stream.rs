//! The stream being played and the per-stream session flags.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// Bytes of download buffer per kbps of nominal bitrate.
///
/// A kbps is 125 bytes per second, so 375 bytes per kbps holds roughly three
/// seconds of compressed audio.
pub const BUFFER_BYTES_PER_KBPS: u64 = 375;

/// URL and nominal bitrate of a stream.
///
/// Created by every stream start and superseded by the next one.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StreamDescriptor {
    url: Url,
    bitrate: u32,
}

impl StreamDescriptor {
    /// Creates a descriptor for an HTTP(S) stream with a nominal bitrate in
    /// kbps.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a non-HTTP(S) URL or a zero bitrate.
    pub fn new(url: Url, bitrate: u32) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(Error::invalid_argument(format!(
                    "unsupported stream scheme {scheme}"
                )))
            }
        }

        if bitrate == 0 {
            return Err(Error::invalid_argument("bitrate must be positive"));
        }

        Ok(Self { url, bitrate })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Nominal bitrate in kbps.
    #[must_use]
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Download buffer size targeting about three seconds of audio.
    #[must_use]
    pub fn buffer_bytes(&self) -> u64 {
        u64::from(self.bitrate) * BUFFER_BYTES_PER_KBPS
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} kbps)", self.url, self.bitrate)
    }
}

/// Flags scoped to one stream. Reset exactly on stream start and stop.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct SessionFlags {
    /// The pipeline produced its first frame; buffer readings before this
    /// are meaningless.
    pub prerolled: bool,

    /// A `DurationKnown` event was emitted for the current stream.
    pub duration_known: bool,
}

impl SessionFlags {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_holds_three_seconds() {
        let url = Url::parse("http://radio.example/stream.mp3").unwrap();
        let stream = StreamDescriptor::new(url, 192).unwrap();
        assert_eq!(stream.buffer_bytes(), 72_000);
    }

    #[test]
    fn rejects_bad_streams() {
        let url = Url::parse("file:///tmp/song.mp3").unwrap();
        assert!(StreamDescriptor::new(url, 128).is_err());

        let url = Url::parse("https://radio.example/stream").unwrap();
        assert!(StreamDescriptor::new(url, 0).is_err());
    }

    #[test]
    fn reset_clears_both_flags() {
        let mut flags = SessionFlags {
            prerolled: true,
            duration_known: true,
        };
        flags.reset();
        assert_eq!(flags, SessionFlags::default());
    }
}
