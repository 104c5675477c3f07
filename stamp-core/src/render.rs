//! Per-frame orchestration.
//!
//! For every captured frame [`StreamRenderer::render`]:
//!
//! 1. asks the counter whether a new identifier is minted,
//! 2. applies exposure, then the registered effects in order,
//! 3. hands a copy to the snapshot worker when an identifier was minted,
//! 4. draws the identifier strip last.
//!
//! Nothing here waits on disk or network I/O.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{Span, debug};

use crate::counter::{FrameCounter, FrameIdentifier, StreamMode, ThrottledCounter};
use crate::error::StampError;
use crate::frame::{Rgb, VideoFrame};
use crate::snapshot::SnapshotWorker;
use crate::strip::{StripCache, StripSpec};

/// Exposure adjustments smaller than this are skipped.
pub const EXPOSURE_EPSILON: f32 = 1e-3;

// ── Effects ──────────────────────────────────────────────────────

/// An in-place frame transform applied before the strip is drawn.
pub trait VideoEffect: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, frame: &mut VideoFrame);
}

/// Converts the frame to BT.709 grey.
#[derive(Debug, Clone, Copy, Default)]
pub struct Monochrome;

impl VideoEffect for Monochrome {
    fn name(&self) -> &str {
        "monochrome"
    }

    fn apply(&self, frame: &mut VideoFrame) {
        frame.map_pixels(|px| {
            let v = (px.luma() * 255.0).round().clamp(0.0, 255.0) as u8;
            Rgb::new(v, v, v)
        });
    }
}

/// Scales every channel by `2^ev`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Exposure {
    pub ev: f32,
}

impl Exposure {
    pub fn new(ev: f32) -> Self {
        Self { ev }
    }

    pub fn is_identity(&self) -> bool {
        !self.ev.is_finite() || self.ev.abs() < EXPOSURE_EPSILON
    }
}

impl VideoEffect for Exposure {
    fn name(&self) -> &str {
        "exposure"
    }

    fn apply(&self, frame: &mut VideoFrame) {
        if self.is_identity() {
            return;
        }
        let gain = self.ev.exp2();
        let scale = |c: u8| (c as f32 * gain).round().clamp(0.0, 255.0) as u8;
        frame.map_pixels(|px| Rgb::new(scale(px.r), scale(px.g), scale(px.b)));
    }
}

// ── RendererControls ─────────────────────────────────────────────

#[derive(Default)]
struct ControlState {
    effects: Vec<Arc<dyn VideoEffect>>,
    exposure: Exposure,
    spec: StripSpec,
}

/// Thread-safe handle for changing how frames are rendered while the
/// renderer runs. Changes apply from the next rendered frame.
#[derive(Clone)]
pub struct RendererControls {
    state: Arc<Mutex<ControlState>>,
    counter: Arc<FrameCounter>,
}

impl std::fmt::Debug for RendererControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RendererControls")
            .field("effects", &state.effects.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("exposure", &state.exposure)
            .field("counter", &self.counter.snapshot())
            .finish()
    }
}

impl RendererControls {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the effect chain. Effects run in the given order.
    pub fn set_effects(&self, effects: Vec<Arc<dyn VideoEffect>>) {
        self.lock().effects = effects;
    }

    pub fn add_effect(&self, effect: Arc<dyn VideoEffect>) {
        self.lock().effects.push(effect);
    }

    pub fn clear_effects(&self) {
        self.lock().effects.clear();
    }

    pub fn effect_names(&self) -> Vec<String> {
        self.lock().effects.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn set_exposure(&self, ev: f32) {
        self.lock().exposure = Exposure::new(ev);
    }

    pub fn exposure(&self) -> f32 {
        self.lock().exposure.ev
    }

    /// Swap the strip layout; the strip is re-rendered on the next frame.
    pub fn set_strip_spec(&self, spec: StripSpec) -> Result<(), StampError> {
        spec.validate()?;
        self.lock().spec = spec;
        Ok(())
    }

    pub fn strip_spec(&self) -> StripSpec {
        self.lock().spec.clone()
    }

    /// The next frame mints a new identifier with `mode`'s suffix.
    pub fn set_mode(&self, mode: StreamMode) {
        self.counter.set_mode(mode);
    }

    /// Manual override of the minting period.
    pub fn set_frames_per_code(&self, frames_per_code: u32) {
        self.counter.update_frames_per_code(frames_per_code);
    }

    pub fn counter(&self) -> &Arc<FrameCounter> {
        &self.counter
    }
}

// ── StreamRenderer ───────────────────────────────────────────────

/// Result of rendering one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOutcome {
    /// Identifier stamped on the frame, if any was drawn.
    pub identifier: Option<FrameIdentifier>,
    /// `true` when the identifier was minted on this frame.
    pub minted: bool,
}

enum Minter {
    Plain(Arc<FrameCounter>),
    Throttled(ThrottledCounter),
}

impl Minter {
    fn on_frame(&self) -> Option<FrameIdentifier> {
        match self {
            Minter::Plain(counter) => counter.on_frame(),
            Minter::Throttled(throttled) => throttled.on_frame(),
        }
    }
}

/// Render-path state: owns the strip cache and the last identifier.
pub struct StreamRenderer {
    minter: Minter,
    controls: RendererControls,
    strips: StripCache,
    snapshots: Option<SnapshotWorker>,
    current: Option<FrameIdentifier>,
    span: Span,
}

impl StreamRenderer {
    /// Renderer minting from `counter` without device throttling.
    pub fn new(counter: Arc<FrameCounter>, spec: StripSpec) -> Result<Self, StampError> {
        Self::build(Arc::clone(&counter), Minter::Plain(counter), spec)
    }

    /// Renderer whose minting period follows device condition.
    pub fn throttled(counter: ThrottledCounter, spec: StripSpec) -> Result<Self, StampError> {
        let inner = Arc::clone(counter.counter());
        Self::build(inner, Minter::Throttled(counter), spec)
    }

    fn build(counter: Arc<FrameCounter>, minter: Minter, spec: StripSpec) -> Result<Self, StampError> {
        spec.validate()?;
        Ok(Self {
            minter,
            controls: RendererControls {
                state: Arc::new(Mutex::new(ControlState {
                    spec,
                    ..ControlState::default()
                })),
                counter,
            },
            strips: StripCache::new(),
            snapshots: None,
            current: None,
            span: tracing::info_span!("renderer"),
        })
    }

    /// Store a copy of every frame that mints an identifier.
    pub fn with_snapshots(mut self, worker: SnapshotWorker) -> Self {
        self.snapshots = Some(worker);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn controls(&self) -> RendererControls {
        self.controls.clone()
    }

    /// Identifier drawn on the most recent frame.
    pub fn current(&self) -> Option<FrameIdentifier> {
        self.current
    }

    pub fn strip_rebuilds(&self) -> u64 {
        self.strips.rebuilds()
    }

    /// Stamp `frame` in place.
    pub fn render(&mut self, frame: &mut VideoFrame) -> RenderOutcome {
        let minted = self.minter.on_frame();
        if let Some(id) = minted {
            debug!(parent: &self.span, identifier = %id, "identifier minted");
            self.current = Some(id);
        }

        let (exposure, effects, spec) = {
            let state = self.controls.lock();
            (state.exposure, state.effects.clone(), state.spec.clone())
        };
        exposure.apply(frame);
        for effect in &effects {
            effect.apply(frame);
        }

        if let (Some(id), Some(worker)) = (minted, &self.snapshots) {
            worker.submit(id, frame);
        }

        let mut drawn = None;
        if let Some(id) = self.current {
            if let Some(strip) = self.strips.get_or_encode(id.value(), &spec, frame.width) {
                strip.draw(frame);
                drawn = Some(id);
            }
        }

        RenderOutcome {
            identifier: drawn,
            minted: minted.is_some(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
