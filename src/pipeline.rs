//! The pipeline graph: a fixed chain of processing stages in front of a
//! black-box media [`Engine`].
//!
//! Stages are created once, in this order:
//!
//! ```text
//! Source → DownloadBuffer → Decoder ⇢ Convert → Normalize → Limiter → Equalizer → Volume → Sink
//! ```
//!
//! All links are made at construction except `Decoder ⇢ Convert`, which is
//! made when the decoder announces its output format through
//! [`Message::DecoderOutput`]. A new stream undoes that link again.
//!
//! The engine reports what happens asynchronously by posting
//! [`BusMessage`]s, each tagged with the [`Generation`] of the stream it
//! belongs to.

use std::{
    env,
    ffi::OsString,
    fmt,
    path::PathBuf,
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    error::{Error, Result},
    proxy::ProxySettings,
    state::{EngineState, Generation, Percentage, StateChange},
    stream::StreamDescriptor,
};

/// Number of equalizer bands.
pub const EQ_BANDS: usize = 10;

/// Center frequency of each equalizer band in Hz.
pub const EQ_FREQUENCIES: [f32; EQ_BANDS] = [
    29.0, 59.0, 119.0, 237.0, 474.0, 947.0, 1889.0, 3770.0, 7523.0, 15011.0,
];

/// Lowest equalizer band gain in dB.
pub const EQ_MIN_GAIN: f32 = -24.0;

/// Highest equalizer band gain in dB.
pub const EQ_MAX_GAIN: f32 = 12.0;

/// Processing stages, in pipeline order.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Source,
    DownloadBuffer,
    Decoder,
    Convert,
    Normalize,
    Limiter,
    Equalizer,
    Volume,
    Sink,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 9] = [
        Self::Source,
        Self::DownloadBuffer,
        Self::Decoder,
        Self::Convert,
        Self::Normalize,
        Self::Limiter,
        Self::Equalizer,
        Self::Volume,
        Self::Sink,
    ];

    /// Whether the link to the next stage waits for the decoder's output
    /// format.
    #[must_use]
    pub fn links_on_demand(self) -> bool {
        self == Self::Decoder
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::DownloadBuffer => "buffer",
            Self::Decoder => "decoder",
            Self::Convert => "convert",
            Self::Normalize => "normalize",
            Self::Limiter => "limiter",
            Self::Equalizer => "equalizer",
            Self::Volume => "volume",
            Self::Sink => "sink",
        };
        write!(f, "{name}")
    }
}

/// Output sink chosen by [`detect_sink`].
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub enum SinkKind {
    /// A PulseAudio-compatible sound server is running.
    Pulse,
    /// Let the audio host pick its default device.
    #[default]
    Auto,
}

/// Probes once for a PulseAudio-compatible sound server.
///
/// Checks `PULSE_SERVER`, then the native socket under `XDG_RUNTIME_DIR`.
#[must_use]
pub fn detect_sink() -> SinkKind {
    detect_sink_from(
        env::var_os("PULSE_SERVER"),
        env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
    )
}

fn detect_sink_from(pulse_server: Option<OsString>, runtime_dir: Option<PathBuf>) -> SinkKind {
    if pulse_server.is_some_and(|server| !server.is_empty()) {
        debug!("sound server configured through PULSE_SERVER");
        return SinkKind::Pulse;
    }

    if let Some(dir) = runtime_dir {
        let socket = dir.join("pulse").join("native");
        if socket.exists() {
            debug!("sound server socket found at {}", socket.display());
            return SinkKind::Pulse;
        }
    }

    SinkKind::Auto
}

/// PCM format produced by the decoder.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz, {} ch", self.sample_rate, self.channels)
    }
}

/// A stage property pushed into the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Property {
    /// Proxy used by the network source.
    Proxy(ProxySettings),
    /// Download buffer capacity.
    MaxSizeBytes(u64),
    /// Loudness normalization and the gain (dB) applied to streams without
    /// loudness metadata.
    Normalization { enabled: bool, fallback_gain: f32 },
    /// Peak limiter after normalization.
    Limiter(bool),
    /// Gain of one equalizer band in dB.
    EqualizerBand { band: usize, gain: f32 },
    /// Linear output volume in `[0.0, 1.0]`.
    Volume(f32),
}

impl Property {
    /// The stage this property belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Proxy(_) => Stage::Source,
            Self::MaxSizeBytes(_) => Stage::DownloadBuffer,
            Self::Normalization { .. } => Stage::Normalize,
            Self::Limiter(_) => Stage::Limiter,
            Self::EqualizerBand { .. } => Stage::Equalizer,
            Self::Volume(_) => Stage::Volume,
        }
    }
}

/// Asynchronous life-cycle messages posted by the engine.
#[derive(Debug)]
pub enum Message {
    /// Data of a new stream started flowing.
    StreamStart,
    /// An asynchronous state change finished; the pipeline prerolled.
    AsyncDone,
    /// The download buffer level changed.
    Buffering(Percentage),
    /// The pipeline clock became unusable and must be reacquired.
    ClockLost,
    /// The stream duration may now be known.
    DurationChanged,
    /// The decoder announced its output format.
    DecoderOutput(AudioFormat),
    /// The stream ran out of data.
    EndOfStream,
    /// Something went wrong but playback continues.
    Warning { error: Error, debug: Option<String> },
    /// Something went wrong and the stream cannot continue.
    Error { error: Error, debug: Option<String> },
    /// No decoder is available for the stream format.
    MissingPlugin { description: String },
}

/// A [`Message`] tagged with the stream generation it belongs to.
#[derive(Debug)]
pub struct BusMessage {
    pub generation: Generation,
    pub message: Message,
}

/// Sending half of the engine bus.
pub type BusSender = mpsc::UnboundedSender<BusMessage>;

/// Receiving half of the engine bus, owned by the reconciler.
pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

/// Creates the engine bus.
#[must_use]
pub fn bus() -> (BusSender, BusReceiver) {
    mpsc::unbounded_channel()
}

/// Posts messages for one stream generation. Cheap to clone into worker
/// threads.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: BusSender,
    generation: Generation,
}

impl Bus {
    #[must_use]
    pub fn new(tx: BusSender, generation: Generation) -> Self {
        Self { tx, generation }
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Posts a message. A closed bus means the reconciler is gone, so the
    /// message is dropped.
    pub fn post(&self, message: Message) {
        trace!("posting {message:?} for stream {}", self.generation);
        if self
            .tx
            .send(BusMessage {
                generation: self.generation,
                message,
            })
            .is_err()
        {
            trace!("bus closed, message dropped");
        }
    }
}

/// The media engine behind the pipeline.
///
/// Implementations run their own worker threads and report back only by
/// posting to the bus they were constructed with.
pub trait Engine {
    /// Binds a new stream. Messages about it must carry `generation`.
    fn set_stream(&mut self, stream: &StreamDescriptor, generation: Generation) -> Result<()>;

    /// Requests a state transition. `Err` means the engine refused it.
    fn set_state(&mut self, state: EngineState) -> Result<StateChange>;

    /// Pushes a stage property.
    fn configure(&mut self, property: &Property) -> Result<()>;

    /// Links two adjacent stages.
    fn link(&mut self, from: Stage, to: Stage) -> Result<()> {
        trace!("linked {from} → {to}");
        Ok(())
    }

    /// Current playback position, if the engine can tell.
    fn query_position(&self) -> Option<Duration>;

    /// Duration of the current stream, if the engine can tell.
    fn query_duration(&self) -> Option<Duration>;

    /// Fill level of the download buffer. `None` when the query cannot be
    /// answered right now.
    fn query_buffering(&self) -> Option<Percentage>;
}

#[derive(Copy, Clone, Debug)]
struct StageHandle {
    stage: Stage,
    linked: bool,
}

/// Loudness normalization settings.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Normalization {
    pub enabled: bool,
    pub fallback_gain: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_gain: 0.0,
        }
    }
}

/// The stage graph and its configuration.
///
/// Exclusively owned by the reconciler: nothing else may request engine
/// transitions.
pub struct Pipeline<E: Engine> {
    engine: E,
    stages: Vec<StageHandle>,
    sink: SinkKind,
    state: EngineState,

    stream: Option<StreamDescriptor>,
    format: Option<AudioFormat>,

    proxy: ProxySettings,
    max_buffer_bytes: u64,
    normalization: Normalization,
    limiter: bool,
    equalizer: [f32; EQ_BANDS],
    volume: f32,
}

impl<E: Engine> Pipeline<E> {
    /// Builds the stage arena and makes every static link.
    ///
    /// # Errors
    ///
    /// Fails when the engine refuses a link.
    pub fn new(mut engine: E, sink: SinkKind) -> Result<Self> {
        let mut stages: Vec<StageHandle> = Stage::ALL
            .iter()
            .map(|&stage| StageHandle {
                stage,
                linked: false,
            })
            .collect();

        for pair in Stage::ALL.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if from.links_on_demand() {
                continue;
            }
            engine.link(from, to)?;
            if let Some(handle) = stages.iter_mut().find(|handle| handle.stage == from) {
                handle.linked = true;
            }
        }
        debug!("pipeline built with {sink:?} sink");

        Ok(Self {
            engine,
            stages,
            sink,
            state: EngineState::Null,
            stream: None,
            format: None,
            proxy: ProxySettings::default(),
            max_buffer_bytes: 0,
            normalization: Normalization::default(),
            limiter: true,
            equalizer: [0.0; EQ_BANDS],
            volume: 1.0,
        })
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().map(|handle| handle.stage)
    }

    /// Whether `stage` is linked to the stage after it.
    #[must_use]
    pub fn is_linked(&self, stage: Stage) -> bool {
        self.stages
            .iter()
            .any(|handle| handle.stage == stage && handle.linked)
    }

    /// Whether every stage is linked to its successor.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stages
            .iter()
            .filter(|handle| handle.stage != Stage::Sink)
            .all(|handle| handle.linked)
    }

    #[must_use]
    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    /// The last engine state that was successfully requested.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Requests an engine transition and records it on success.
    pub fn set_state(&mut self, state: EngineState) -> Result<StateChange> {
        let change = self.engine.set_state(state)?;
        trace!("engine {} -> {state}: {change:?}", self.state);
        self.state = state;
        Ok(change)
    }

    /// The stream bound to the source stage.
    #[must_use]
    pub fn stream(&self) -> Option<&StreamDescriptor> {
        self.stream.as_ref()
    }

    /// Binds a new stream, sizes the download buffer for it and undoes the
    /// decoder link of the previous stream.
    pub fn set_stream(&mut self, stream: StreamDescriptor, generation: Generation) -> Result<()> {
        self.engine.set_stream(&stream, generation)?;
        self.set_max_buffer_bytes(stream.buffer_bytes())?;

        if let Some(decoder) = self
            .stages
            .iter_mut()
            .find(|handle| handle.stage.links_on_demand())
        {
            decoder.linked = false;
        }
        self.format = None;

        debug!("stream {generation}: {stream}");
        self.stream = Some(stream);
        Ok(())
    }

    /// Links the decoder to the converter once its output format is known.
    /// Later announcements for the same stream are ignored.
    pub fn link_decoder(&mut self, format: AudioFormat) -> Result<()> {
        if self.is_linked(Stage::Decoder) {
            trace!("decoder already linked, ignoring {format}");
            return Ok(());
        }

        self.engine.link(Stage::Decoder, Stage::Convert)?;
        if let Some(decoder) = self
            .stages
            .iter_mut()
            .find(|handle| handle.stage == Stage::Decoder)
        {
            decoder.linked = true;
        }

        debug!("decoder output: {format}");
        self.format = Some(format);
        Ok(())
    }

    /// Format negotiated between decoder and converter.
    #[must_use]
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    #[must_use]
    pub fn proxy(&self) -> &ProxySettings {
        &self.proxy
    }

    pub fn set_proxy(&mut self, proxy: ProxySettings) -> Result<()> {
        self.engine.configure(&Property::Proxy(proxy.clone()))?;
        self.proxy = proxy;
        Ok(())
    }

    #[must_use]
    pub fn max_buffer_bytes(&self) -> u64 {
        self.max_buffer_bytes
    }

    pub fn set_max_buffer_bytes(&mut self, bytes: u64) -> Result<()> {
        self.engine.configure(&Property::MaxSizeBytes(bytes))?;
        self.max_buffer_bytes = bytes;
        Ok(())
    }

    #[must_use]
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn set_normalization(&mut self, enabled: bool, fallback_gain: f32) -> Result<()> {
        if !fallback_gain.is_finite() {
            return Err(Error::invalid_argument(format!(
                "fallback gain {fallback_gain} is not a number"
            )));
        }

        self.engine.configure(&Property::Normalization {
            enabled,
            fallback_gain,
        })?;
        self.normalization = Normalization {
            enabled,
            fallback_gain,
        };
        Ok(())
    }

    #[must_use]
    pub fn limiter(&self) -> bool {
        self.limiter
    }

    pub fn set_limiter(&mut self, enabled: bool) -> Result<()> {
        self.engine.configure(&Property::Limiter(enabled))?;
        self.limiter = enabled;
        Ok(())
    }

    #[must_use]
    pub fn equalizer(&self) -> [f32; EQ_BANDS] {
        self.equalizer
    }

    /// Sets one band, clamping the gain to the supported range.
    pub fn set_equalizer_band(&mut self, band: usize, gain: f32) -> Result<()> {
        if band >= EQ_BANDS {
            return Err(Error::out_of_range(format!(
                "equalizer band {band} does not exist"
            )));
        }
        if gain.is_nan() {
            return Err(Error::invalid_argument("equalizer gain is not a number"));
        }

        let gain = gain.clamp(EQ_MIN_GAIN, EQ_MAX_GAIN);
        self.engine
            .configure(&Property::EqualizerBand { band, gain })?;
        self.equalizer[band] = gain;
        Ok(())
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the linear output volume, clamped to `[0.0, 1.0]`.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if volume.is_nan() {
            return Err(Error::invalid_argument("volume is not a number"));
        }

        let volume = volume.clamp(0.0, 1.0);
        self.engine.configure(&Property::Volume(volume))?;
        self.volume = volume;
        Ok(())
    }
}
