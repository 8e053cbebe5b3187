use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;

use streamcore::{
    events::{self, Event},
    mock::{Call, MockEngine},
    pipeline::{self, BusMessage, BusSender, Message, Pipeline, Property, SinkKind},
    player::{Command, Player},
    state::{EngineState, Generation, Percentage, PlaybackState},
};

struct Harness {
    player: Player<MockEngine>,
    events: events::Receiver,
    // Keeps the bus open.
    _bus: BusSender,
}

impl Harness {
    fn new() -> Self {
        let (bus_tx, bus_rx) = pipeline::bus();
        let (events_tx, events) = events::channel();
        let pipeline = Pipeline::new(MockEngine::default(), SinkKind::Auto).unwrap();
        Self {
            player: Player::new(pipeline, bus_rx, events_tx),
            events,
            _bus: bus_tx,
        }
    }

    fn post(&mut self, message: Message) {
        let generation = self.player.generation();
        self.player.handle_message(BusMessage {
            generation,
            message,
        });
    }

    fn set_level(&mut self, percent: f32) {
        self.player.engine_mut().buffering = Some(Percentage::from_percent(percent));
    }

    fn events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn engine_transitions(&mut self) -> Vec<EngineState> {
        let transitions = self.player.pipeline().engine().transitions();
        self.player.engine_mut().clear();
        transitions
    }

    /// Starts a stream and prerolls it with a half full buffer.
    fn start_buffering(&mut self) {
        self.player.start_stream(url(), 128).unwrap();
        self.set_level(50.0);
        self.post(Message::AsyncDone);
        assert_eq!(self.player.actual(), PlaybackState::Buffering);
        self.events();
        self.engine_transitions();
    }
}

fn url() -> Url {
    Url::parse("https://stream.example/radio.mp3").unwrap()
}

fn count_duration_known(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, Event::DurationKnown(_)))
        .count()
}

#[tokio::test]
async fn play_and_pause_are_deferred_while_buffering() {
    let mut harness = Harness::new();
    harness.start_buffering();

    harness.player.play().unwrap();
    assert_eq!(harness.player.desired(), Some(PlaybackState::Playing));
    harness.player.pause().unwrap();
    assert_eq!(harness.player.desired(), Some(PlaybackState::Paused));
    harness.player.play().unwrap();
    assert_eq!(harness.player.desired(), Some(PlaybackState::Playing));

    assert_eq!(harness.player.actual(), PlaybackState::Buffering);
    assert!(harness.engine_transitions().is_empty());
    assert_eq!(harness.events(), vec![Event::StateChanged; 3]);
}

#[tokio::test]
async fn play_then_pause_while_buffering_resolves_to_paused() {
    let mut harness = Harness::new();
    harness.start_buffering();

    harness.player.play().unwrap();
    harness.player.pause().unwrap();

    harness.set_level(100.0);
    harness.post(Message::Buffering(Percentage::FULL));

    assert_eq!(harness.player.actual(), PlaybackState::Paused);
    assert_eq!(harness.player.desired(), Some(PlaybackState::Paused));
    // Buffering is paused to the engine already.
    assert!(harness.engine_transitions().is_empty());
}

#[tokio::test]
async fn stop_takes_effect_while_buffering() {
    let mut harness = Harness::new();
    harness.start_buffering();
    assert!(harness.player.flags().prerolled);

    harness.player.stop().unwrap();

    assert_eq!(harness.player.actual(), PlaybackState::Stopped);
    assert_eq!(harness.player.desired(), Some(PlaybackState::Stopped));
    assert_eq!(harness.engine_transitions(), vec![EngineState::Null]);
    assert!(!harness.player.flags().prerolled);
    assert!(!harness.player.flags().duration_known);
    assert_eq!(harness.events(), vec![Event::StateChanged]);
}

#[tokio::test]
async fn stop_resets_duration_for_the_next_stream() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.post(Message::AsyncDone);
    assert_eq!(count_duration_known(&harness.events()), 1);

    harness.player.stop().unwrap();
    harness.player.start_stream(url(), 128).unwrap();
    harness.post(Message::AsyncDone);
    assert_eq!(count_duration_known(&harness.events()), 1);
}

#[tokio::test]
async fn play_after_stop_reopens_the_stream() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.post(Message::AsyncDone);
    harness.player.stop().unwrap();
    let stopped = harness.player.generation();
    harness.events();
    harness.engine_transitions();

    harness.player.play().unwrap();

    assert_ne!(harness.player.generation(), stopped);
    assert_eq!(harness.player.actual(), PlaybackState::Buffering);
    assert_eq!(harness.player.desired(), Some(PlaybackState::Playing));
    assert_eq!(harness.engine_transitions(), vec![EngineState::Paused]);
    assert_eq!(harness.events(), vec![Event::StateChanged; 2]);

    harness.post(Message::AsyncDone);
    assert_eq!(harness.player.actual(), PlaybackState::Playing);
    assert_eq!(count_duration_known(&harness.events()), 1);
}

#[tokio::test]
async fn play_without_stream_fails() {
    let mut harness = Harness::new();
    assert!(harness.player.play().is_err());
    assert_eq!(harness.player.actual(), PlaybackState::Stopped);
    assert!(harness.events().is_empty());
}

#[tokio::test]
async fn first_resolution_plays() {
    let mut harness = Harness::new();
    harness.start_buffering();
    assert_eq!(harness.player.desired(), None);

    harness.set_level(100.0);
    harness.post(Message::Buffering(Percentage::FULL));

    assert_eq!(harness.player.actual(), PlaybackState::Playing);
    assert_eq!(harness.player.desired(), Some(PlaybackState::Playing));
    assert_eq!(harness.engine_transitions(), vec![EngineState::Playing]);
}

#[tokio::test]
async fn duration_known_fires_once_even_if_unknown() {
    let mut harness = Harness::new();
    harness.start_buffering();

    harness.set_level(100.0);
    harness.post(Message::Buffering(Percentage::FULL));
    harness.post(Message::DurationChanged);

    // Buffering again and resolving again does not repeat it.
    harness.set_level(20.0);
    harness.post(Message::Buffering(Percentage::from_percent(20.0)));
    harness.set_level(100.0);
    harness.post(Message::Buffering(Percentage::FULL));

    let events = harness.events();
    assert_eq!(count_duration_known(&events), 1);
    assert!(events.contains(&Event::DurationKnown(None)));
}

#[tokio::test]
async fn known_duration_is_reported_before_buffering_finishes() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.player.engine_mut().duration = Some(Duration::from_secs(215));
    harness.post(Message::DurationChanged);
    harness.post(Message::AsyncDone);

    assert_eq!(
        harness.events(),
        vec![
            Event::StateChanged,
            Event::DurationKnown(Some(Duration::from_secs(215))),
            Event::StateChanged,
            Event::BufferingFinished(Duration::ZERO),
        ]
    );
}

#[tokio::test]
async fn superseded_stream_messages_are_ignored() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    let stale = harness.player.generation();
    harness.start_buffering();
    assert_ne!(stale, harness.player.generation());

    harness.set_level(100.0);
    for message in [
        Message::Buffering(Percentage::FULL),
        Message::AsyncDone,
        Message::ClockLost,
        Message::EndOfStream,
    ] {
        harness.player.handle_message(BusMessage {
            generation: stale,
            message,
        });
    }

    assert_eq!(harness.player.actual(), PlaybackState::Buffering);
    assert!(harness.engine_transitions().is_empty());
    assert!(harness.events().is_empty());
}

#[tokio::test]
async fn buffer_sized_for_bitrate_then_resolves_to_playing() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 192).unwrap();
    assert_eq!(harness.player.pipeline().max_buffer_bytes(), 72_000);
    assert!(harness
        .player
        .pipeline()
        .engine()
        .calls
        .contains(&Call::Configure(Property::MaxSizeBytes(72_000))));

    harness.player.engine_mut().position = Some(Duration::from_millis(120));
    harness.set_level(40.0);
    harness.post(Message::AsyncDone);
    harness.post(Message::Buffering(Percentage::from_percent(40.0)));
    assert_eq!(harness.player.actual(), PlaybackState::Buffering);

    harness.set_level(100.0);
    harness.post(Message::Buffering(Percentage::FULL));

    let events = harness.events();
    let changed = events
        .iter()
        .rposition(|event| *event == Event::StateChanged)
        .unwrap();
    let finished = events
        .iter()
        .position(|event| matches!(event, Event::BufferingFinished(_)))
        .unwrap();
    assert!(changed < finished);
    assert_eq!(
        events[finished],
        Event::BufferingFinished(Duration::from_millis(120))
    );
    assert_eq!(harness.player.actual(), PlaybackState::Playing);
    assert_eq!(harness.player.pipeline().state(), EngineState::Playing);
    assert_eq!(harness.player.pipeline().engine().state, EngineState::Playing);
}

#[tokio::test]
async fn double_play_repeats_identical_state() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.post(Message::AsyncDone);
    harness.player.pause().unwrap();
    harness.events();
    harness.engine_transitions();

    harness.player.play().unwrap();
    let first = (harness.player.desired(), harness.player.actual());
    harness.player.play().unwrap();
    let second = (harness.player.desired(), harness.player.actual());

    assert_eq!(first, second);
    assert_eq!(harness.events(), vec![Event::StateChanged; 2]);
    // Only the first call reached the engine.
    assert_eq!(harness.engine_transitions(), vec![EngineState::Playing]);
}

#[tokio::test]
async fn clock_loss_cycles_through_pause() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.post(Message::AsyncDone);
    assert_eq!(harness.player.actual(), PlaybackState::Playing);
    harness.engine_transitions();

    harness.post(Message::ClockLost);

    assert_eq!(
        harness.engine_transitions(),
        vec![EngineState::Paused, EngineState::Playing]
    );
    assert_eq!(harness.player.actual(), PlaybackState::Playing);
    assert_eq!(harness.player.desired(), Some(PlaybackState::Playing));
}

#[tokio::test]
async fn clock_loss_while_paused_is_ignored() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.player.pause().unwrap();
    harness.post(Message::AsyncDone);
    harness.engine_transitions();

    harness.post(Message::ClockLost);
    assert!(harness.engine_transitions().is_empty());
}

#[tokio::test]
async fn refused_play_leaves_state_unchanged() {
    let mut harness = Harness::new();
    harness.player.start_stream(url(), 128).unwrap();
    harness.player.pause().unwrap();
    harness.post(Message::AsyncDone);
    harness.events();

    harness.player.engine_mut().refuse_transitions = true;
    assert!(harness.player.play().is_err());
    assert_eq!(harness.player.actual(), PlaybackState::Paused);
    assert_eq!(harness.player.desired(), Some(PlaybackState::Paused));
    assert!(harness.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_loop_drives_commands_and_bus() {
    let (bus_tx, bus_rx) = pipeline::bus();
    let (events_tx, mut events) = events::channel();
    let pipeline = Pipeline::new(MockEngine::default(), SinkKind::Auto).unwrap();
    let mut player = Player::new(pipeline, bus_rx, events_tx);

    let (commands, command_rx) = mpsc::unbounded_channel();
    commands
        .send(Command::StartStream {
            url: url(),
            bitrate: 128,
        })
        .unwrap();
    commands.send(Command::Pause).unwrap();
    commands.send(Command::SetVolume(0.25)).unwrap();
    bus_tx
        .send(BusMessage {
            generation: Generation::default().next(),
            message: Message::AsyncDone,
        })
        .unwrap();

    let driver = async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let finished = matches!(event, Event::BufferingFinished(_));
            seen.push(event);
            if finished {
                break;
            }
        }
        commands.send(Command::Shutdown).unwrap();
        seen
    };

    let ((), seen) = tokio::join!(player.run(command_rx), driver);

    assert_eq!(
        seen,
        vec![
            Event::StateChanged,
            Event::StateChanged,
            Event::StateChanged,
            Event::DurationKnown(None),
            Event::BufferingFinished(Duration::ZERO),
        ]
    );
    assert_eq!(player.actual(), PlaybackState::Stopped);
    assert_eq!(player.volume(), 0.25);
    assert_eq!(
        player.pipeline().engine().transitions(),
        vec![EngineState::Paused, EngineState::Null]
    );
}
