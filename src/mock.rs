//! A scriptable, recording [`Engine`] for tests.
//!
//! Answers are read from public fields and every request is appended to
//! [`MockEngine::calls`], so tests can assert exactly what the reconciler
//! asked of the engine. Messages are injected by the test itself through
//! the bus.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    pipeline::{Engine, Property, Stage},
    state::{EngineState, Generation, Percentage, StateChange},
    stream::StreamDescriptor,
};

/// A request received by [`MockEngine`].
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    SetStream { url: String, generation: Generation },
    SetState(EngineState),
    Configure(Property),
    Link(Stage, Stage),
}

#[derive(Debug, Default)]
pub struct MockEngine {
    /// Every request, oldest first.
    pub calls: Vec<Call>,

    /// Current engine state; follows accepted transitions.
    pub state: EngineState,

    /// Refuse every state transition while set.
    pub refuse_transitions: bool,

    /// Refuse transitions into these states only.
    pub refused: Vec<EngineState>,

    pub position: Option<Duration>,
    pub duration: Option<Duration>,
    pub buffering: Option<Percentage>,
}

impl MockEngine {
    /// Engine states requested so far, oldest first.
    #[must_use]
    pub fn transitions(&self) -> Vec<EngineState> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::SetState(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Forgets recorded calls.
    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

impl Engine for MockEngine {
    fn set_stream(&mut self, stream: &StreamDescriptor, generation: Generation) -> Result<()> {
        self.calls.push(Call::SetStream {
            url: stream.url().to_string(),
            generation,
        });
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) -> Result<StateChange> {
        self.calls.push(Call::SetState(state));
        if self.refuse_transitions || self.refused.contains(&state) {
            return Err(Error::failed_precondition(format!(
                "transition {} -> {state} refused",
                self.state
            )));
        }

        let change = if state == EngineState::Paused && self.state < EngineState::Paused {
            StateChange::Async
        } else {
            StateChange::Success
        };
        self.state = state;
        Ok(change)
    }

    fn configure(&mut self, property: &Property) -> Result<()> {
        self.calls.push(Call::Configure(property.clone()));
        Ok(())
    }

    fn link(&mut self, from: Stage, to: Stage) -> Result<()> {
        self.calls.push(Call::Link(from, to));
        Ok(())
    }

    fn query_position(&self) -> Option<Duration> {
        self.position
    }

    fn query_duration(&self) -> Option<Duration> {
        self.duration
    }

    fn query_buffering(&self) -> Option<Percentage> {
        self.buffering
    }
}
