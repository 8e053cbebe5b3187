//! Playback control core for network audio streams.
//!
//! Drives a pipeline of the shape HTTP source → download buffer → decoder →
//! DSP chain → output sink, and reconciles the state a caller *wants* with
//! the state the pipeline is *actually* in:
//!
//! * [`player::Player`] owns the desired and actual [`state::PlaybackState`]
//!   and is the single place that requests engine transitions.
//! * [`buffering`] decides when playback must pause to refill the download
//!   buffer and when it may resume.
//! * [`telemetry`] answers position, duration and buffer-fill queries.
//! * [`proxy`] applies proxy settings to the network source.
//! * [`events::Event`] is the outward notification surface.
//!
//! The media engine itself is a black box behind [`pipeline::Engine`].
//! [`backend::RodioEngine`] implements it on top of `stream-download`,
//! `symphonia` and `rodio`; [`mock::MockEngine`] is a scriptable stand-in.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod backend;
pub mod buffering;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod equalizer;
pub mod error;
pub mod events;
pub mod mock;
pub mod normalize;
pub mod pipeline;
pub mod player;
pub mod proxy;
pub mod signal;
pub mod state;
pub mod stream;
pub mod telemetry;
pub mod util;
pub mod volume;
