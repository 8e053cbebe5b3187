//! The state reconciler.
//!
//! [`Player`] owns two states:
//!
//! * **desired**: what the caller asked for through [`Player::play`],
//!   [`Player::pause`], [`Player::stop`] and [`Player::start_stream`].
//!   Buffering never changes it.
//! * **actual**: what the pipeline is in. This may be
//!   [`Buffering`](PlaybackState::Buffering) while desired is
//!   [`Playing`](PlaybackState::Playing).
//!
//! Every engine transition goes through one choke point,
//! `set_player_state`. Play and pause requests made while buffering are
//! recorded in the desired state and applied once the buffer has refilled;
//! stop always takes effect immediately.
//!
//! All of this runs on one task. Engine worker threads only post
//! [`BusMessage`]s, which [`Player::run`] picks up together with caller
//! [`Command`]s, the buffering timer and codec installation results.
//! Messages tagged with the generation of a superseded stream are dropped.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use url::Url;

use crate::{
    buffering::{self, Decision},
    codec::{CodecInstaller, Codecs},
    config::Config,
    error::{Error, Result},
    events::{self, Event},
    pipeline::{BusMessage, BusReceiver, Engine, Message, Pipeline},
    proxy,
    state::{Generation, PlaybackState, Percentage},
    stream::{SessionFlags, StreamDescriptor},
    telemetry::BufferLevel,
};

/// Requests accepted by [`Player::run`].
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    StartStream { url: Url, bitrate: u32 },
    Play,
    Pause,
    Stop,
    /// External settings changed; re-evaluate the proxy. Carries the
    /// explicit proxy preference, if any.
    SettingsChanged { proxy: Option<String> },
    SetVolume(f32),
    /// Applies a re-read configuration to every stage.
    ApplyConfig(Box<Config>),
    Shutdown,
}

/// Sending half of the command channel.
pub type CommandSender = mpsc::UnboundedSender<Command>;

/// Receiving half of the command channel.
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub struct Player<E: Engine> {
    pipeline: Pipeline<E>,
    bus: BusReceiver,
    events: events::Sender,

    /// `None` until the first buffering of a fresh stream resolves, unless
    /// the caller asked for something meanwhile.
    desired: Option<PlaybackState>,
    actual: PlaybackState,

    flags: SessionFlags,
    generation: Generation,

    monitor: buffering::Monitor,
    codecs: Codecs,
    proxy: proxy::Configurator,
}

impl<E: Engine> Player<E> {
    #[must_use]
    pub fn new(pipeline: Pipeline<E>, bus: BusReceiver, events: events::Sender) -> Self {
        Self {
            pipeline,
            bus,
            events,
            desired: None,
            actual: PlaybackState::Stopped,
            flags: SessionFlags::default(),
            generation: Generation::default(),
            monitor: buffering::Monitor::new(),
            codecs: Codecs::default(),
            proxy: proxy::Configurator::new(),
        }
    }

    /// Lets missing codecs be installed on demand.
    #[must_use]
    pub fn with_codec_installer(mut self, installer: Arc<dyn CodecInstaller>) -> Self {
        self.codecs = Codecs::new(Some(installer));
        self
    }

    /// The state the caller asked for, if any.
    #[must_use]
    pub fn desired(&self) -> Option<PlaybackState> {
        self.desired
    }

    /// The state the pipeline is in.
    #[must_use]
    pub fn actual(&self) -> PlaybackState {
        self.actual
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline<E> {
        &self.pipeline
    }

    /// Access to the engine, for scripting test engines and for
    /// engine-specific queries. State transitions must still go through
    /// the player.
    #[must_use]
    pub fn engine_mut(&mut self) -> &mut E {
        self.pipeline.engine_mut()
    }

    #[must_use]
    pub fn position(&self) -> Option<Duration> {
        self.pipeline.position()
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.pipeline.duration()
    }

    #[must_use]
    pub fn buffer_level(&self) -> BufferLevel {
        self.pipeline.buffer_level()
    }

    /// Starts a new stream.
    ///
    /// Sizes the download buffer for about three seconds of audio, enters
    /// buffering and clears the desired state, so that playback starts
    /// once the buffer is full unless the caller pauses first.
    ///
    /// # Errors
    ///
    /// Fails on an invalid URL or bitrate, or when the engine refuses the
    /// new stream. Playback is stopped in the latter case.
    pub fn start_stream(&mut self, url: Url, bitrate: u32) -> Result<()> {
        let stream = StreamDescriptor::new(url, bitrate)?;
        info!("starting stream {stream}");
        self.open(stream)
    }

    fn open(&mut self, stream: StreamDescriptor) -> Result<()> {
        self.generation = self.generation.next();
        self.flags.reset();
        self.monitor.cancel();

        if let Err(e) = self.bind_stream(stream) {
            error!("failed to start stream: {e}");
            self.actual = PlaybackState::Stopped;
            self.desired = Some(PlaybackState::Stopped);
            self.emit(Event::StateChanged);
            return Err(e);
        }

        self.desired = None;
        if let Err(e) = self.set_player_state(PlaybackState::Buffering, true) {
            self.actual = PlaybackState::Stopped;
            self.desired = Some(PlaybackState::Stopped);
            self.emit(Event::StateChanged);
            return Err(e);
        }
        self.acquire_duration(false);

        Ok(())
    }

    fn bind_stream(&mut self, stream: StreamDescriptor) -> Result<()> {
        let null = PlaybackState::Stopped.engine_state();
        if self.pipeline.state() != null {
            self.pipeline.set_state(null)?;
        }
        self.pipeline.set_stream(stream, self.generation)
    }

    /// Asks for playback. Deferred while buffering.
    pub fn play(&mut self) -> Result<()> {
        self.request(PlaybackState::Playing)
    }

    /// Asks for pause. Deferred while buffering.
    pub fn pause(&mut self) -> Result<()> {
        self.request(PlaybackState::Paused)
    }

    /// Play and pause from `Stopped` reopen the last stream from the start,
    /// buffering first.
    fn request(&mut self, target: PlaybackState) -> Result<()> {
        if self.actual == PlaybackState::Stopped {
            let stream = self
                .pipeline
                .stream()
                .cloned()
                .ok_or_else(|| Error::failed_precondition("no stream to resume"))?;
            info!("reopening stream {stream}");
            self.open(stream)?;
        }

        self.set_player_state(target, false)
    }

    /// Stops immediately, even while buffering, and invalidates everything
    /// still in flight for the current stream.
    pub fn stop(&mut self) -> Result<()> {
        self.generation = self.generation.next();
        self.flags.reset();
        self.monitor.cancel();
        self.set_player_state(PlaybackState::Stopped, true)
    }

    /// Stops and releases the engine.
    pub fn shutdown(&mut self) {
        debug!("shutting down player");
        if let Err(e) = self.stop() {
            warn!("could not stop cleanly: {e}");
        }
    }

    /// The single choke point for engine transitions.
    ///
    /// The engine is touched when `force_engine_change` is set or when not
    /// buffering, and only if the target engine state differs from the
    /// current one. Otherwise the request is only recorded in the desired
    /// state. On refusal nothing is changed. `StateChanged` is emitted on
    /// every accepted request, changed or not.
    fn set_player_state(&mut self, target: PlaybackState, force_engine_change: bool) -> Result<()> {
        let change_engine = force_engine_change || !self.actual.is_buffering();

        if change_engine {
            let engine_target = target.engine_state();
            if engine_target != self.pipeline.state() {
                if let Err(e) = self.pipeline.set_state(engine_target) {
                    error!(
                        "failed to change state {} ({}) -> {target} ({engine_target}): {e}",
                        self.actual,
                        self.pipeline.state(),
                    );
                    return Err(e);
                }
            }

            if self.actual != target {
                debug!("state {} -> {target}", self.actual);
            }
            self.actual = target;
        } else {
            debug!("buffering, deferring {target}");
        }

        if !target.is_buffering() {
            self.desired = Some(target);
        }

        self.emit(Event::StateChanged);
        Ok(())
    }

    /// Applies one engine message.
    pub fn handle_message(&mut self, message: BusMessage) {
        let BusMessage {
            generation,
            message,
        } = message;
        if generation != self.generation {
            trace!(
                "dropping {message:?} of stream {generation}, current is {}",
                self.generation
            );
            return;
        }

        match message {
            Message::StreamStart => debug!("stream {generation} started"),
            Message::AsyncDone => self.on_preroll(),
            Message::Buffering(percent) => self.on_buffering(percent),
            Message::ClockLost => self.recover_clock(),
            Message::DurationChanged => self.acquire_duration(false),
            Message::DecoderOutput(format) => {
                if let Err(e) = self.pipeline.link_decoder(format) {
                    self.on_error(e, Some(format!("linking decoder output {format}")));
                }
            }
            Message::EndOfStream => {
                info!("end of stream {generation}");
                self.emit(Event::EndOfStream);
            }
            Message::Warning { error, debug } => {
                warn!("{error}");
                self.emit(Event::Warning {
                    error: error.to_string(),
                    debug,
                });
            }
            Message::Error { error, debug } => self.on_error(error, debug),
            Message::MissingPlugin { description } => self.on_missing_codec(description),
        }
    }

    fn on_preroll(&mut self) {
        if !self.flags.prerolled {
            debug!("stream {} prerolled", self.generation);
            self.flags.prerolled = true;
        }

        self.acquire_duration(false);
        if self.actual.is_buffering() {
            self.monitor.schedule(self.generation);
        }
        self.check_buffering();
    }

    fn on_buffering(&mut self, percent: Percentage) {
        if !self.flags.prerolled {
            trace!("dropping buffering level {percent} before preroll");
            return;
        }

        trace!("buffering level {percent}");
        self.monitor.schedule(self.generation);
        self.check_buffering();
    }

    /// Runs the check the buffering timer was scheduled for.
    pub fn on_buffering_timer(&mut self, generation: Generation) {
        if generation != self.generation {
            trace!("dropping buffering check of stream {generation}");
            return;
        }

        self.check_buffering();
        if self.actual.is_buffering() {
            self.monitor.schedule(generation);
        }
    }

    fn check_buffering(&mut self) {
        let level = self.pipeline.buffer_level();
        match buffering::decide(self.flags.prerolled, level, self.actual) {
            Decision::Ignore | Decision::Hold => {}
            Decision::Resolve => {
                let target = self.desired.unwrap_or(PlaybackState::Playing);
                debug!("buffer full ({level}), continuing to {target}");
                if self.set_player_state(target, true).is_err() {
                    return;
                }
                self.monitor.cancel();

                self.acquire_duration(true);
                let position = self.position().unwrap_or_default();
                self.emit(Event::BufferingFinished(position));
            }
            Decision::Enter { force } => {
                debug!("buffer low ({level}), buffering");
                if let Err(e) = self.set_player_state(PlaybackState::Buffering, force) {
                    debug!("staying {} until the next check: {e}", self.actual);
                }
            }
        }
    }

    /// Emits `DurationKnown` once per stream. Without `force` nothing is
    /// emitted until the engine knows the duration; with `force` an
    /// unknown duration is reported as such.
    fn acquire_duration(&mut self, force: bool) {
        if self.flags.duration_known {
            return;
        }

        let duration = self.pipeline.duration();
        if duration.is_none() && !force {
            return;
        }

        debug!("duration of stream {}: {duration:?}", self.generation);
        self.flags.duration_known = true;
        self.emit(Event::DurationKnown(duration));
    }

    /// Cycles the engine through pause so it picks a fresh clock. The
    /// desired state is left as the caller set it.
    fn recover_clock(&mut self) {
        if self.actual != PlaybackState::Playing {
            trace!("clock lost while {}, ignoring", self.actual);
            return;
        }

        info!("pipeline clock lost, reacquiring");
        let desired = self.desired;
        let result = self
            .set_player_state(PlaybackState::Paused, true)
            .and_then(|()| self.set_player_state(PlaybackState::Playing, true));
        self.desired = desired;

        if let Err(e) = result {
            warn!("could not reacquire clock, now {}: {e}", self.actual);
        }
    }

    fn on_error(&mut self, error: Error, debug: Option<String>) {
        if self.codecs.is_installing() {
            debug!("suppressing error during codec installation: {error}");
            return;
        }

        if error.is_missing_codec() {
            self.on_missing_codec(error.to_string());
            return;
        }

        error!("{error}");
        if let Some(debug) = debug {
            debug!("{debug}");
        }

        let message = if error.is_stream_expired() {
            "The stream has expired. Fetch a new stream URL and try again.".to_owned()
        } else {
            format!("Playback failed: {error}")
        };
        self.emit(Event::Error(message));
    }

    fn on_missing_codec(&mut self, description: String) {
        if let Some(event) = self.codecs.missing(description) {
            self.emit(event);
        }
    }

    /// Re-evaluates the proxy after an external settings change and pushes
    /// it into the network source when it changed.
    pub fn on_settings_changed(&mut self, explicit_proxy: Option<&str>) -> Result<()> {
        match self.proxy.settings_changed(explicit_proxy) {
            Some(settings) => self.pipeline.set_proxy(settings),
            None => Ok(()),
        }
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.pipeline.set_volume(volume)
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.pipeline.volume()
    }

    pub fn set_max_buffer_bytes(&mut self, bytes: u64) -> Result<()> {
        self.pipeline.set_max_buffer_bytes(bytes)
    }

    pub fn set_normalization(&mut self, enabled: bool, fallback_gain: f32) -> Result<()> {
        self.pipeline.set_normalization(enabled, fallback_gain)
    }

    pub fn set_limiter(&mut self, enabled: bool) -> Result<()> {
        self.pipeline.set_limiter(enabled)
    }

    pub fn set_equalizer_band(&mut self, band: usize, gain: f32) -> Result<()> {
        self.pipeline.set_equalizer_band(band, gain)
    }

    /// Applies every setting of `config`, including the proxy.
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        self.on_settings_changed(config.proxy.as_deref())?;
        self.set_normalization(config.normalization, config.fallback_gain)?;
        self.set_limiter(config.limiter)?;
        for (band, gain) in config.equalizer.iter().enumerate() {
            self.set_equalizer_band(band, *gain)?;
        }
        self.set_volume(config.volume)
    }

    /// Executes one caller command. Failures are logged; stream start
    /// failures are also reported as [`Event::Error`].
    pub fn execute(&mut self, command: Command) {
        trace!("command: {command:?}");
        let result = match command {
            Command::StartStream { url, bitrate } => {
                let result = self.start_stream(url, bitrate);
                if let Err(e) = &result {
                    self.emit(Event::Error(format!("Could not start stream: {e}")));
                }
                result
            }
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Stop => self.stop(),
            Command::SettingsChanged { proxy } => self.on_settings_changed(proxy.as_deref()),
            Command::SetVolume(volume) => self.set_volume(volume),
            Command::ApplyConfig(config) => self.apply_config(&config),
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("{e}");
        }
    }

    /// Runs the control loop until [`Command::Shutdown`] arrives or every
    /// command sender is dropped.
    pub async fn run(&mut self, mut commands: CommandReceiver) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(command) => self.execute(command),
                },

                Some(message) = self.bus.recv() => self.handle_message(message),

                Some(outcome) = self.codecs.completed() => {
                    let event = self.codecs.finish(outcome);
                    self.emit(event);
                }

                generation = self.monitor.expired(), if self.monitor.is_armed() => {
                    self.on_buffering_timer(generation);
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        trace!("event: {event}");
        if self.events.send(event).is_err() {
            trace!("no event listener");
        }
    }
}
