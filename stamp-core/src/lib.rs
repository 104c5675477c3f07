//! # stamp-core
//!
//! Frame identification and stream control for a live video publisher.
//!
//! This crate contains:
//! - **Frame**: `VideoFrame`, `PixelFormat`, `Rgb`, `Rect`: the in-memory frame buffer
//! - **Strip**: `StripSpec`, `encode`, `decode`: identifier ⇄ pixel-cell strip codec
//! - **Counter**: `FrameCounter`, `FrameIdentifier`, `ThrottledCounter`: identifier minting
//!   with device-condition throttling
//! - **Bitrate**: `BitrateController` and its serialised actor: adaptive bitrate control
//! - **Snapshot**: `SnapshotCache`, `FileStore`, `SnapshotWorker`: bounded on-disk ring of
//!   minted frames
//! - **Session**: `SessionSupervisor`, `ReconnectPolicy`: reconnect with exponential backoff
//! - **Render**: `StreamRenderer`, `RendererControls`, `VideoEffect`: the per-frame pipeline
//! - **Task**: `Background`: tracked background execution context
//! - **Error**: `StampError`: typed, `thiserror`-based error hierarchy

pub mod bitrate;
pub mod counter;
pub mod error;
pub mod frame;
pub mod render;
pub mod session;
pub mod snapshot;
pub mod strip;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bitrate::{
    BitrateConfig, BitrateController, BitrateHandle, BitrateState, NetworkEvent, SettingsSink,
    VideoSettings, spawn_controller,
};
pub use counter::{
    DeviceCondition, DeviceSensor, FrameCounter, FrameIdentifier, StreamMode, ThermalState,
    ThrottlePolicy, ThrottledCounter,
};
pub use error::StampError;
pub use frame::{PixelFormat, Rect, Rgb, VideoFrame};
pub use render::{Exposure, Monochrome, RenderOutcome, RendererControls, StreamRenderer, VideoEffect};
pub use session::{ReconnectPolicy, SessionEvent, SessionSupervisor, StreamSession};
pub use snapshot::{FileStore, SnapshotCache, SnapshotCacheConfig, SnapshotWorker};
pub use strip::{BandPosition, EncodedStrip, StripCache, StripSpec, Threshold, decode, decode_string, encode};
pub use task::Background;
