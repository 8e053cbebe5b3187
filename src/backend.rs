//! The production [`Engine`]: HTTP download through `stream-download`,
//! decoding through Symphonia, and output through rodio.
//!
//! Moving to paused or playing with no session running starts a preroll
//! on the tokio runtime. The preroll connects, prefetches the download
//! buffer, probes the stream and queues the decoded source on a paused
//! sink. Each step is reported on the bus, ending in
//! [`Message::AsyncDone`]. Moving to null drops the session, which cancels
//! whatever is still in flight.
//!
//! The buffer level reported to the bus follows low and high watermarks:
//! it reads full once the buffer was filled, until it drains below
//! [`LOW_WATERMARK`].

use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait};
use reqwest::Client;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use stream_download::{
    http::HttpStream, source::SourceStream, storage::temp::TempStorageProvider, Settings,
    StreamDownload, StreamPhase, StreamState,
};
use symphonia::core::io::MediaSource;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    decoder::Decoder,
    equalizer::{self, Bands},
    error::{Error, Result},
    normalize::{self, Controls},
    pipeline::{Bus, BusSender, Engine, Message, Property, SinkKind},
    proxy::ProxySettings,
    state::{EngineState, Generation, Percentage, StateChange},
    stream::StreamDescriptor,
    util::ToF32,
};

/// Fill ratio below which a filled buffer reads as draining again.
pub const LOW_WATERMARK: f32 = 0.1;

/// Device name of the PulseAudio plugin on ALSA hosts.
const PULSE_DEVICE: &str = "pulse";

const UNKNOWN_DURATION: u64 = u64::MAX;

/// Download and consumption counters of one session.
#[derive(Debug)]
struct Gauge {
    capacity: Arc<AtomicU64>,
    downloaded: AtomicU64,
    consumed: AtomicU64,
    complete: AtomicBool,
    failed: AtomicBool,

    /// Set once the buffer reached capacity, cleared below the low
    /// watermark.
    filled: AtomicBool,
    reported: AtomicU32,

    duration_ms: AtomicU64,
}

impl Gauge {
    fn new(capacity: Arc<AtomicU64>) -> Self {
        Self {
            capacity,
            downloaded: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            complete: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            filled: AtomicBool::new(false),
            reported: AtomicU32::new(u32::MAX),
            duration_ms: AtomicU64::new(UNKNOWN_DURATION),
        }
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed).max(1)
    }

    fn level(&self) -> Percentage {
        if self.complete.load(Ordering::Relaxed) {
            return Percentage::FULL;
        }

        let buffered = self
            .downloaded
            .load(Ordering::Relaxed)
            .saturating_sub(self.consumed.load(Ordering::Relaxed));
        let ratio = buffered.to_f32_lossy() / self.capacity().to_f32_lossy();

        if self.filled.load(Ordering::Relaxed) {
            if ratio >= LOW_WATERMARK {
                return Percentage::FULL;
            }
            self.filled.store(false, Ordering::Relaxed);
        } else if ratio >= 1.0 {
            self.filled.store(true, Ordering::Relaxed);
        }

        Percentage::from_ratio(ratio)
    }

    /// Posts the level when its whole percentage changed.
    fn report(&self, bus: &Bus) {
        let level = self.level();
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = level.as_percent().round() as u32;
        if self.reported.swap(percent, Ordering::Relaxed) != percent {
            bus.post(Message::Buffering(level));
        }
    }

    fn duration(&self) -> Option<Duration> {
        match self.duration_ms.load(Ordering::Relaxed) {
            UNKNOWN_DURATION => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn set_duration(&self, duration: Option<Duration>) {
        let ms = duration.map_or(UNKNOWN_DURATION, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(UNKNOWN_DURATION - 1)
        });
        self.duration_ms.store(ms, Ordering::Relaxed);
    }
}

/// The download as seen by the decoder. Counts consumed bytes and reports
/// read failures to the bus.
struct Reader {
    inner: StreamDownload<TempStorageProvider>,
    length: Option<u64>,
    gauge: Arc<Gauge>,
    bus: Bus,
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(read) => {
                self.gauge
                    .consumed
                    .fetch_add(read as u64, Ordering::Relaxed);
                self.gauge.report(&self.bus);
                Ok(read)
            }
            Err(e) => {
                if !self.gauge.failed.swap(true, Ordering::Relaxed) {
                    self.bus.post(Message::Error {
                        error: Error::data_loss(e.to_string()),
                        debug: Some("reading from download buffer".to_owned()),
                    });
                }
                Err(e)
            }
        }
    }
}

impl Seek for Reader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.inner.seek(pos)?;
        self.gauge.consumed.store(position, Ordering::Relaxed);
        Ok(position)
    }
}

impl MediaSource for Reader {
    fn is_seekable(&self) -> bool {
        self.length.is_some()
    }

    fn byte_len(&self) -> Option<u64> {
        self.length
    }
}

/// Posts end of stream once the wrapped source runs dry, unless reading
/// failed.
struct Notify<I> {
    inner: I,
    gauge: Arc<Gauge>,
    bus: Bus,
    done: bool,
}

impl<I> Iterator for Notify<I>
where
    I: Source<Item = f32>,
{
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next();
        if sample.is_none() && !self.done {
            self.done = true;
            if !self.gauge.failed.load(Ordering::Relaxed) {
                self.bus.post(Message::EndOfStream);
            }
        }
        sample
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<I> Source for Notify<I>
where
    I: Source<Item = f32>,
{
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

/// Everything a preroll needs, moved onto the runtime.
struct Preroll {
    url: Url,
    bitrate: u32,
    proxy: ProxySettings,
    bus: Bus,
    gauge: Arc<Gauge>,
    sink: Arc<Sink>,
    controls: Arc<Controls>,
    bands: Arc<Bands>,
    cancel: CancellationToken,
}

impl Preroll {
    async fn run(self) -> Result<()> {
        let client = http_client(&self.proxy)?;
        let stream = HttpStream::new(client, self.url.clone()).await?;
        self.bus.post(Message::StreamStart);

        let length = stream.content_length();
        match length {
            Some(length) => debug!("downloading {length} bytes from {}", self.url),
            None => debug!("downloading live stream from {}", self.url),
        }

        let gauge = Arc::clone(&self.gauge);
        let bus = self.bus.clone();
        let on_progress = move |_: &HttpStream<Client>, state: StreamState, _: &CancellationToken| {
            match state.phase {
                StreamPhase::Complete => {
                    debug!("download of stream {} completed", bus.generation());
                    gauge.complete.store(true, Ordering::Relaxed);
                }
                _ => gauge
                    .downloaded
                    .store(state.current_position, Ordering::Relaxed),
            }
            gauge.report(&bus);
        };

        let download = StreamDownload::from_stream(
            stream,
            TempStorageProvider::default(),
            Settings::default()
                .on_progress(on_progress)
                .prefetch_bytes(self.gauge.capacity()),
        )
        .await?;

        let reader = Reader {
            inner: download,
            length,
            gauge: Arc::clone(&self.gauge),
            bus: self.bus.clone(),
        };
        let extension = extension(&self.url);
        let mut decoder = tokio::task::spawn_blocking(move || {
            Decoder::new(Box::new(reader), extension.as_deref(), None)
        })
        .await??;

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        self.bus.post(Message::DecoderOutput(decoder.format()));

        let duration = decoder
            .total_duration()
            .or_else(|| length.map(|length| estimate_duration(length, self.bitrate)));
        self.gauge.set_duration(duration);
        self.bus.post(Message::DurationChanged);

        let replay_gain = decoder.replay_gain();
        if let Some(gain) = replay_gain {
            debug!("stream replay gain: {gain:.1} dB");
        }

        let source = equalizer::equalize(
            normalize::normalize(decoder, replay_gain, self.controls),
            self.bands,
        );
        self.sink.append(Notify {
            inner: source,
            gauge: Arc::clone(&self.gauge),
            bus: self.bus.clone(),
            done: false,
        });

        self.bus.post(Message::AsyncDone);
        Ok(())
    }
}

async fn preroll(job: Preroll) {
    let bus = job.bus.clone();
    let cancel = job.cancel.clone();

    tokio::select! {
        () = cancel.cancelled() => trace!("preroll of stream {} cancelled", bus.generation()),
        result = job.run() => if let Err(error) = result {
            if error.is_missing_codec() {
                bus.post(Message::MissingPlugin {
                    description: error.to_string(),
                });
            } else {
                bus.post(Message::Error {
                    error,
                    debug: Some(format!("preroll of stream {}", bus.generation())),
                });
            }
        },
    }
}

fn http_client(proxy: &ProxySettings) -> Result<Client> {
    let mut builder = Client::builder();
    builder = match proxy.url() {
        Some(url) => {
            let mut proxy_config = reqwest::Proxy::all(url)?;
            if let Some(user) = proxy.user() {
                proxy_config = proxy_config.basic_auth(user, proxy.password().unwrap_or_default());
            }
            builder.proxy(proxy_config)
        }
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

/// File extension of the last path segment, as a probing hint.
fn extension(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()?
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .filter(|extension| !extension.is_empty())
}

/// Duration of `length` bytes at a constant `bitrate` in kbit/s.
fn estimate_duration(length: u64, bitrate: u32) -> Duration {
    let bytes_per_second = u64::from(bitrate).saturating_mul(125).max(1);
    Duration::from_millis(length.saturating_mul(1000) / bytes_per_second)
}

/// The running stream: its sink and everything the preroll shares.
struct Session {
    sink: Arc<Sink>,
    gauge: Arc<Gauge>,
    cancel: CancellationToken,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.sink.stop();
    }
}

struct Output {
    // Dropping the stream closes the device.
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

pub struct RodioEngine {
    runtime: Handle,
    bus: BusSender,
    sink_kind: SinkKind,
    device: Option<String>,

    output: Option<Output>,
    stream: Option<(StreamDescriptor, Generation)>,
    session: Option<Session>,

    proxy: ProxySettings,
    capacity: Arc<AtomicU64>,
    controls: Arc<Controls>,
    bands: Arc<Bands>,
    volume: f32,
}

impl RodioEngine {
    /// Creates an engine posting to `bus`. Must be called within a tokio
    /// runtime, on which prerolls will run.
    ///
    /// `device` names the output device; when unset, `sink_kind` decides.
    ///
    /// # Errors
    ///
    /// Fails outside a tokio runtime.
    pub fn new(bus: BusSender, sink_kind: SinkKind, device: Option<String>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::failed_precondition(e.to_string()))?;
        Ok(Self {
            runtime,
            bus,
            sink_kind,
            device,
            output: None,
            stream: None,
            session: None,
            proxy: ProxySettings::default(),
            capacity: Arc::new(AtomicU64::new(0)),
            controls: Arc::new(Controls::default()),
            bands: Arc::new(Bands::default()),
            volume: 1.0,
        })
    }

    fn open_output(&mut self) -> Result<&OutputStreamHandle> {
        if self.output.is_none() {
            let name = self.device.clone().or_else(|| {
                (self.sink_kind == SinkKind::Pulse).then(|| PULSE_DEVICE.to_owned())
            });

            let (stream, handle) = match name {
                Some(name) => {
                    let host = cpal::default_host();
                    let device = host
                        .output_devices()?
                        .find(|device| device.name().is_ok_and(|candidate| candidate == name));
                    match device {
                        Some(device) => {
                            info!("audio output: {name}");
                            OutputStream::try_from_device(&device)?
                        }
                        None if self.device.is_some() => {
                            return Err(Error::not_found(format!(
                                "audio output device {name} not found"
                            )));
                        }
                        None => {
                            debug!("no {name} device, using default output");
                            OutputStream::try_default()?
                        }
                    }
                }
                None => {
                    info!("audio output: default");
                    OutputStream::try_default()?
                }
            };

            self.output = Some(Output {
                _stream: stream,
                handle,
            });
        }

        self.output
            .as_ref()
            .map(|output| &output.handle)
            .ok_or_else(|| Error::internal("audio output not open"))
    }

    /// Starts a preroll unless a session runs already. Returns whether one
    /// was started.
    fn ensure_session(&mut self) -> Result<bool> {
        if self.session.is_some() {
            return Ok(false);
        }

        let (stream, generation) = self
            .stream
            .clone()
            .ok_or_else(|| Error::failed_precondition("no stream to play"))?;

        let sink = Sink::try_new(self.open_output()?)?;
        sink.pause();
        sink.set_volume(self.volume);
        let sink = Arc::new(sink);

        let gauge = Arc::new(Gauge::new(Arc::clone(&self.capacity)));
        let cancel = CancellationToken::new();

        debug!("prerolling stream {generation}");
        self.runtime.spawn(preroll(Preroll {
            url: stream.url().clone(),
            bitrate: stream.bitrate(),
            proxy: self.proxy.clone(),
            bus: Bus::new(self.bus.clone(), generation),
            gauge: Arc::clone(&gauge),
            sink: Arc::clone(&sink),
            controls: Arc::clone(&self.controls),
            bands: Arc::clone(&self.bands),
            cancel: cancel.clone(),
        }));

        self.session = Some(Session {
            sink,
            gauge,
            cancel,
        });
        Ok(true)
    }
}

impl Engine for RodioEngine {
    fn set_stream(&mut self, stream: &StreamDescriptor, generation: Generation) -> Result<()> {
        self.session = None;
        self.stream = Some((stream.clone(), generation));
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) -> Result<StateChange> {
        match state {
            EngineState::Null => {
                self.session = None;
                self.output = None;
            }
            EngineState::Ready => {
                self.session = None;
                self.open_output()?;
            }
            EngineState::Paused | EngineState::Playing => {
                let started = self.ensure_session()?;
                if let Some(session) = &self.session {
                    if state == EngineState::Playing {
                        session.sink.play();
                    } else {
                        session.sink.pause();
                    }
                }
                if started {
                    return Ok(StateChange::Async);
                }
            }
        }

        Ok(StateChange::Success)
    }

    fn configure(&mut self, property: &Property) -> Result<()> {
        match property {
            Property::Proxy(proxy) => {
                // Takes effect with the next connection.
                self.proxy = proxy.clone();
            }
            Property::MaxSizeBytes(bytes) => self.capacity.store(*bytes, Ordering::Relaxed),
            Property::Normalization {
                enabled,
                fallback_gain,
            } => self.controls.set_normalization(*enabled, *fallback_gain),
            Property::Limiter(enabled) => self.controls.set_limiter(*enabled),
            Property::EqualizerBand { band, gain } => self.bands.set(*band, *gain),
            Property::Volume(volume) => {
                self.volume = *volume;
                if let Some(session) = &self.session {
                    session.sink.set_volume(*volume);
                }
            }
        }
        Ok(())
    }

    fn query_position(&self) -> Option<Duration> {
        self.session.as_ref().map(|session| session.sink.get_pos())
    }

    fn query_duration(&self) -> Option<Duration> {
        self.session.as_ref()?.gauge.duration()
    }

    fn query_buffering(&self) -> Option<Percentage> {
        self.session.as_ref().map(|session| session.gauge.level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline;

    fn gauge(capacity: u64) -> Gauge {
        Gauge::new(Arc::new(AtomicU64::new(capacity)))
    }

    #[test]
    fn level_follows_watermarks() {
        let gauge = gauge(1000);
        gauge.downloaded.store(400, Ordering::Relaxed);
        assert_eq!(gauge.level(), Percentage::from_percent(40.0));

        gauge.downloaded.store(1000, Ordering::Relaxed);
        assert!(gauge.level().is_full());

        // Draining stays full until the low watermark.
        gauge.consumed.store(500, Ordering::Relaxed);
        assert!(gauge.level().is_full());

        gauge.consumed.store(950, Ordering::Relaxed);
        assert_eq!(gauge.level(), Percentage::from_percent(5.0));

        // And needs to fill up completely again.
        gauge.downloaded.store(1500, Ordering::Relaxed);
        assert_eq!(gauge.level(), Percentage::from_percent(55.0));
    }

    #[test]
    fn complete_download_is_full() {
        let gauge = gauge(1000);
        gauge.complete.store(true, Ordering::Relaxed);
        assert!(gauge.level().is_full());
    }

    #[test]
    fn reports_only_changes() {
        let (tx, mut rx) = pipeline::bus();
        let bus = Bus::new(tx, Generation::default());
        let gauge = gauge(1000);

        gauge.downloaded.store(400, Ordering::Relaxed);
        gauge.report(&bus);
        gauge.report(&bus);
        gauge.downloaded.store(401, Ordering::Relaxed);
        gauge.report(&bus);

        assert!(matches!(
            rx.try_recv().unwrap().message,
            Message::Buffering(level) if level == Percentage::from_percent(40.0)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duration_round_trips_unknown() {
        let gauge = gauge(1);
        assert_eq!(gauge.duration(), None);
        gauge.set_duration(Some(Duration::from_secs(3)));
        assert_eq!(gauge.duration(), Some(Duration::from_secs(3)));
        gauge.set_duration(None);
        assert_eq!(gauge.duration(), None);
    }

    #[test]
    fn probing_hints() {
        let url = Url::parse("https://cdn.example/audio/track.MP3?token=abc").unwrap();
        assert_eq!(extension(&url).as_deref(), Some("mp3"));

        let url = Url::parse("http://radio.example:8000/live").unwrap();
        assert_eq!(extension(&url), None);
    }

    #[test]
    fn duration_estimate_uses_bitrate() {
        // 128 kbit/s is 16000 bytes per second.
        assert_eq!(estimate_duration(160_000, 128), Duration::from_secs(10));
        assert_eq!(estimate_duration(0, 128), Duration::ZERO);
    }
}
