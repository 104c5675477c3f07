//! Adaptive bitrate control.
//!
//! [`controller`] holds the pure state machine, [`actor`] serialises
//! network events into it on a single task and pushes the resulting
//! [`VideoSettings`] to the stream output.

pub mod actor;
pub mod controller;

pub use actor::{BitrateHandle, EVENT_QUEUE_DEPTH, SettingsSink, spawn_controller};
pub use controller::{BitrateConfig, BitrateController, BitrateState, NetworkEvent, VideoSettings};
