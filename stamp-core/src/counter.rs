//! Frame counter and identifier minting.
//!
//! Every rendered frame asks the [`FrameCounter`] whether a new
//! [`FrameIdentifier`] is due. One identifier is minted per cycle of
//! `frames_per_code` frames; the frames in between reuse it.
//!
//! The [`ThrottledCounter`] wraps a counter and, every
//! `check_interval_frames` frames, polls an injected [`DeviceSensor`]
//! on the background context and adjusts `frames_per_code` per the
//! [`ThrottlePolicy`]. The poll never runs on the render path.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, info, warn};

use crate::error::StampError;
use crate::task::Background;

// ── StreamMode ───────────────────────────────────────────────────

/// Stream mode, carried as a two-digit decimal suffix of every identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// A companion photo pipeline is capturing alongside the stream.
    #[default]
    PhotoEnabled,
    PhotoDisabled,
}

impl StreamMode {
    pub const fn code(self) -> &'static str {
        match self {
            StreamMode::PhotoEnabled => "01",
            StreamMode::PhotoDisabled => "02",
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(StreamMode::PhotoEnabled),
            2 => Some(StreamMode::PhotoDisabled),
            _ => None,
        }
    }
}

// ── FrameIdentifier ──────────────────────────────────────────────

/// Identifier stamped into a frame: the decimal concatenation of a
/// sequence number and a [`StreamMode`] suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameIdentifier(u64);

impl FrameIdentifier {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Build the identifier for `sequence` in `mode`.
    ///
    /// Falls back to the raw sequence number when the concatenated
    /// decimal does not fit in 64 bits.
    pub fn compose(sequence: u64, mode: StreamMode) -> Self {
        let text = format!("{sequence}{}", mode.code());
        Self(text.parse().unwrap_or(sequence))
    }

    /// Split back into `(sequence, mode)` when the two trailing digits
    /// are a known mode suffix.
    pub fn split(self) -> Option<(u64, StreamMode)> {
        let mode = StreamMode::from_code(self.0 % 100)?;
        Some((self.0 / 100, mode))
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FrameIdentifier {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ── FrameCounter ─────────────────────────────────────────────────

#[derive(Debug)]
struct CounterState {
    frames_per_code: u32,
    /// Override waiting for the next cycle boundary.
    pending_frames_per_code: Option<u32>,
    sample_counter: u32,
    sequence: u64,
    mode: StreamMode,
}

impl CounterState {
    fn on_frame(&mut self) -> Option<FrameIdentifier> {
        let minted = if self.sample_counter == 0 {
            if let Some(n) = self.pending_frames_per_code.take() {
                self.frames_per_code = n;
            }
            self.sequence += 1;
            Some(FrameIdentifier::compose(self.sequence, self.mode))
        } else {
            None
        };
        self.sample_counter = (self.sample_counter + 1) % self.frames_per_code.max(1);
        minted
    }
}

/// Point-in-time view of a [`FrameCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub frames_per_code: u32,
    pub sequence: u64,
    pub mode: StreamMode,
}

/// Per-session minting state behind a single lock.
///
/// `on_frame`, `set_mode` and `update_frames_per_code` are the only
/// entry points; manual overrides and the throttle go through the same
/// lock so no update is lost.
#[derive(Debug)]
pub struct FrameCounter {
    state: Mutex<CounterState>,
}

impl FrameCounter {
    pub fn new(frames_per_code: u32, mode: StreamMode) -> Self {
        Self {
            state: Mutex::new(CounterState {
                frames_per_code: frames_per_code.max(1),
                pending_frames_per_code: None,
                sample_counter: 0,
                sequence: 0,
                mode,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance by one rendered frame. Returns the identifier minted on
    /// this frame, or `None` if the frame reuses the previous one.
    pub fn on_frame(&self) -> Option<FrameIdentifier> {
        self.lock().on_frame()
    }

    /// Switch mode; the next frame mints immediately with the new suffix.
    pub fn set_mode(&self, mode: StreamMode) {
        let mut state = self.lock();
        state.mode = mode;
        state.sample_counter = 0;
    }

    /// Change the minting period (clamped to ≥ 1) from the next cycle on.
    pub fn update_frames_per_code(&self, frames_per_code: u32) {
        let mut state = self.lock();
        let n = frames_per_code.max(1);
        if state.frames_per_code == n {
            state.pending_frames_per_code = None;
        } else {
            state.pending_frames_per_code = Some(n);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let state = self.lock();
        CounterSnapshot {
            frames_per_code: state.pending_frames_per_code.unwrap_or(state.frames_per_code),
            sequence: state.sequence,
            mode: state.mode,
        }
    }
}

// ── Device condition ─────────────────────────────────────────────

/// Thermal pressure reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// Sampled device condition.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceCondition {
    pub thermal: ThermalState,
    /// Battery charge in `0.0..=1.0`, `None` when unknown.
    pub battery_level: Option<f32>,
}

/// Source of device thermal/battery readings.
#[async_trait]
pub trait DeviceSensor: Send + Sync {
    async fn condition(&self) -> Result<DeviceCondition, StampError>;
}

// ── ThrottlePolicy ───────────────────────────────────────────────

/// Maps device condition to a `frames_per_code` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    pub baseline_frames_per_code: u32,
    /// Battery at or below `low_battery_level`.
    pub low_battery_frames_per_code: u32,
    /// Battery at or below `critical_battery_level`.
    pub critical_battery_frames_per_code: u32,
    /// Thermal state `fair`.
    pub fair_thermal_frames_per_code: u32,
    pub low_battery_level: f32,
    pub critical_battery_level: f32,
    /// Rendered frames between two device polls.
    pub check_interval_frames: u32,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            baseline_frames_per_code: 3,
            low_battery_frames_per_code: 6,
            critical_battery_frames_per_code: 15,
            fair_thermal_frames_per_code: 6,
            low_battery_level: 0.20,
            critical_battery_level: 0.10,
            check_interval_frames: 1800,
        }
    }
}

impl ThrottlePolicy {
    pub fn frames_per_code(&self, condition: DeviceCondition) -> u32 {
        let n = match condition.thermal {
            ThermalState::Fair => self.fair_thermal_frames_per_code,
            ThermalState::Serious | ThermalState::Critical => self.critical_battery_frames_per_code,
            ThermalState::Nominal => match condition.battery_level {
                Some(level) if level <= self.critical_battery_level => {
                    self.critical_battery_frames_per_code
                }
                Some(level) if level <= self.low_battery_level => self.low_battery_frames_per_code,
                _ => self.baseline_frames_per_code,
            },
        };
        n.max(1)
    }

    pub fn validate(&self) -> Result<(), StampError> {
        if self.check_interval_frames == 0 {
            return Err(StampError::InvalidConfig(
                "throttle check interval must be non-zero".into(),
            ));
        }
        if self.critical_battery_level > self.low_battery_level {
            return Err(StampError::InvalidConfig(
                "critical battery level must not exceed the low battery level".into(),
            ));
        }
        Ok(())
    }
}

// ── ThrottledCounter ─────────────────────────────────────────────

/// A [`FrameCounter`] that re-evaluates its minting period from device
/// condition every `check_interval_frames` frames.
pub struct ThrottledCounter {
    counter: Arc<FrameCounter>,
    policy: ThrottlePolicy,
    sensor: Arc<dyn DeviceSensor>,
    background: Background,
    frames_until_check: AtomicU32,
    span: Span,
}

impl ThrottledCounter {
    pub fn new(
        counter: Arc<FrameCounter>,
        policy: ThrottlePolicy,
        sensor: Arc<dyn DeviceSensor>,
        background: Background,
    ) -> Result<Self, StampError> {
        policy.validate()?;
        Ok(Self {
            frames_until_check: AtomicU32::new(policy.check_interval_frames),
            counter,
            policy,
            sensor,
            background,
            span: tracing::info_span!("throttle"),
        })
    }

    /// Replace the span background polls are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn counter(&self) -> &Arc<FrameCounter> {
        &self.counter
    }

    /// Advance the counter; schedules a device poll when due.
    pub fn on_frame(&self) -> Option<FrameIdentifier> {
        let minted = self.counter.on_frame();

        let before = self
            .frames_until_check
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(if left <= 1 { self.policy.check_interval_frames } else { left - 1 })
            })
            .unwrap_or(1);
        if before <= 1 {
            self.schedule_check();
        }

        minted
    }

    fn schedule_check(&self) {
        let counter = Arc::clone(&self.counter);
        let sensor = Arc::clone(&self.sensor);
        let policy = self.policy.clone();
        self.background.spawn(
            async move {
                match sensor.condition().await {
                    Ok(condition) => {
                        let n = policy.frames_per_code(condition);
                        let current = counter.snapshot().frames_per_code;
                        if n != current {
                            info!(from = current, to = n, ?condition, "throttle: frames per code changed");
                        } else {
                            debug!(frames_per_code = n, "throttle: unchanged");
                        }
                        counter.update_frames_per_code(n);
                    }
                    Err(e) => warn!("throttle: device condition unavailable: {e}"),
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSensor(DeviceCondition);

    #[async_trait]
    impl DeviceSensor for FixedSensor {
        async fn condition(&self) -> Result<DeviceCondition, StampError> {
            Ok(self.0)
        }
    }

    struct BrokenSensor;

    #[async_trait]
    impl DeviceSensor for BrokenSensor {
        async fn condition(&self) -> Result<DeviceCondition, StampError> {
            Err(StampError::Other("sensor offline".into()))
        }
    }

    #[test]
    fn compose_concatenates_decimal_suffix() {
        assert_eq!(FrameIdentifier::compose(12, StreamMode::PhotoEnabled).value(), 1201);
        assert_eq!(FrameIdentifier::compose(7, StreamMode::PhotoDisabled).value(), 702);
        assert_eq!(FrameIdentifier::compose(0, StreamMode::PhotoEnabled).value(), 1);
    }

    #[test]
    fn compose_overflow_falls_back_to_sequence() {
        let id = FrameIdentifier::compose(u64::MAX, StreamMode::PhotoEnabled);
        assert_eq!(id.value(), u64::MAX);
    }

    #[test]
    fn split_inverts_compose() {
        let id = FrameIdentifier::compose(4242, StreamMode::PhotoDisabled);
        assert_eq!(id.split(), Some((4242, StreamMode::PhotoDisabled)));
        assert_eq!(FrameIdentifier::new(4299).split(), None);
        assert_eq!(id.to_string(), "424202");
    }

    #[test]
    fn mints_once_per_cycle() {
        let counter = FrameCounter::new(3, StreamMode::PhotoEnabled);
        let results: Vec<_> = (0..6).map(|_| counter.on_frame()).collect();
        assert_eq!(
            results,
            vec![
                Some(FrameIdentifier::new(101)),
                None,
                None,
                Some(FrameIdentifier::new(201)),
                None,
                None,
            ]
        );
    }

    #[test]
    fn zero_frames_per_code_clamps_to_every_frame() {
        let counter = FrameCounter::new(0, StreamMode::PhotoEnabled);
        assert!(counter.on_frame().is_some());
        assert!(counter.on_frame().is_some());
    }

    #[test]
    fn set_mode_mints_immediately_with_new_suffix() {
        let counter = FrameCounter::new(5, StreamMode::PhotoEnabled);
        assert_eq!(counter.on_frame(), Some(FrameIdentifier::new(101)));
        assert_eq!(counter.on_frame(), None);
        counter.set_mode(StreamMode::PhotoDisabled);
        assert_eq!(counter.on_frame(), Some(FrameIdentifier::new(202)));
        assert_eq!(counter.snapshot().mode, StreamMode::PhotoDisabled);
    }

    #[test]
    fn frames_per_code_update_waits_for_cycle_boundary() {
        let counter = FrameCounter::new(3, StreamMode::PhotoEnabled);
        assert!(counter.on_frame().is_some()); // 1
        assert!(counter.on_frame().is_none()); // 2
        counter.update_frames_per_code(1);
        assert!(counter.on_frame().is_none()); // 3 finishes the old cycle
        assert!(counter.on_frame().is_some()); // 4
        assert!(counter.on_frame().is_some()); // 5
        assert_eq!(counter.snapshot().frames_per_code, 1);
    }

    #[test]
    fn policy_maps_conditions() {
        let policy = ThrottlePolicy::default();
        let at = |thermal, battery| DeviceCondition {
            thermal,
            battery_level: battery,
        };
        assert_eq!(policy.frames_per_code(at(ThermalState::Nominal, Some(0.9))), 3);
        assert_eq!(policy.frames_per_code(at(ThermalState::Nominal, None)), 3);
        assert_eq!(policy.frames_per_code(at(ThermalState::Nominal, Some(0.2))), 6);
        assert_eq!(policy.frames_per_code(at(ThermalState::Nominal, Some(0.05))), 15);
        assert_eq!(policy.frames_per_code(at(ThermalState::Fair, Some(0.05))), 6);
        assert_eq!(policy.frames_per_code(at(ThermalState::Critical, Some(1.0))), 15);
    }

    #[tokio::test]
    async fn throttle_applies_policy_after_check_interval() {
        let counter = Arc::new(FrameCounter::new(3, StreamMode::PhotoEnabled));
        let policy = ThrottlePolicy {
            check_interval_frames: 4,
            ..ThrottlePolicy::default()
        };
        let sensor = Arc::new(FixedSensor(DeviceCondition {
            thermal: ThermalState::Nominal,
            battery_level: Some(0.15),
        }));
        let bg = Background::current().unwrap();
        let throttled =
            ThrottledCounter::new(Arc::clone(&counter), policy, sensor, bg.clone()).unwrap();

        for _ in 0..3 {
            throttled.on_frame();
        }
        bg.flush().await;
        assert_eq!(counter.snapshot().frames_per_code, 3);

        throttled.on_frame();
        bg.flush().await;
        assert_eq!(counter.snapshot().frames_per_code, 6);
    }

    #[tokio::test]
    async fn throttle_keeps_period_when_sensor_fails() {
        let counter = Arc::new(FrameCounter::new(3, StreamMode::PhotoEnabled));
        let policy = ThrottlePolicy {
            check_interval_frames: 1,
            ..ThrottlePolicy::default()
        };
        let bg = Background::current().unwrap();
        let throttled =
            ThrottledCounter::new(Arc::clone(&counter), policy, Arc::new(BrokenSensor), bg.clone())
                .unwrap();
        throttled.on_frame();
        bg.flush().await;
        assert_eq!(counter.snapshot().frames_per_code, 3);
    }

    #[tokio::test]
    async fn throttle_rejects_zero_interval() {
        let policy = ThrottlePolicy {
            check_interval_frames: 0,
            ..ThrottlePolicy::default()
        };
        let result = ThrottledCounter::new(
            Arc::new(FrameCounter::new(3, StreamMode::PhotoEnabled)),
            policy,
            Arc::new(BrokenSensor),
            Background::current().unwrap(),
        );
        assert!(result.is_err());
    }
}
