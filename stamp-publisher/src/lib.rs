//! # stamp-publisher: Stamped Stream Publisher
//!
//! Runs the stamping pipeline end to end: a synthetic camera feeds the
//! renderer, every frame carries its identifier strip, minted frames
//! are kept in an on-disk snapshot ring, and a simulated uplink feeds
//! network health back into the adaptive bitrate controller.
//!
//! ## Modes
//!
//! - **Publish** (default): run until Ctrl-C or the configured duration.
//! - **Decode** (`--decode <image>`): print the identifier stamped in an
//!   image file.
//! - **Gen-config** (`--gen-config`): print the default configuration.

pub mod config;
pub mod service;
