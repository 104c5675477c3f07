//! Adaptive bitrate state machine.
//!
//! Pure and synchronous: [`BitrateController::handle`] consumes one
//! [`NetworkEvent`] and returns the [`VideoSettings`] to push to the
//! stream, if any. Serialisation and I/O live in [`super::actor`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StampError;

// ── BitrateConfig ────────────────────────────────────────────────

/// Fixed bounds and tuning of the controller. Bitrates in bits/second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    /// Hard ceiling; `current_max` never exceeds it.
    pub max_video_bitrate: u64,
    /// Starting bitrate and the target of `Reset`.
    pub default_video_bitrate: u64,
    /// Floor; the bitrate never drops below it.
    pub min_video_bitrate: u64,
    /// Audio share subtracted from measured throughput.
    pub audio_bitrate: u64,
    /// Consecutive `Status` events required before a step up.
    pub increase_threshold: u32,
    /// Bitrate added per step up.
    pub increase_step: u64,
    /// Ceiling multiplier applied on congestion (e.g. 0.9).
    pub learn_down_factor: f64,
    /// Ceiling multiplier applied after a stable run (e.g. 1.05).
    pub learn_up_factor: f64,
    /// Consecutive `Status` events required before raising the ceiling.
    pub stable_for_learn_up: u32,
    /// Frame interval after the 2nd consecutive zero-throughput report.
    pub coarse_frame_interval_secs: f64,
    /// Frame interval after the 4th consecutive zero-throughput report.
    pub degraded_frame_interval_secs: f64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            max_video_bitrate: 6_000_000,
            default_video_bitrate: 3_000_000,
            min_video_bitrate: 300_000,
            audio_bitrate: 64_000,
            increase_threshold: 5,
            increase_step: 250_000,
            learn_down_factor: 0.9,
            learn_up_factor: 1.05,
            stable_for_learn_up: 30,
            coarse_frame_interval_secs: 0.1,
            degraded_frame_interval_secs: 0.2,
        }
    }
}

impl BitrateConfig {
    pub fn validate(&self) -> Result<(), StampError> {
        if self.min_video_bitrate > self.default_video_bitrate
            || self.default_video_bitrate > self.max_video_bitrate
        {
            return Err(StampError::InvalidConfig(format!(
                "bitrates must satisfy min ≤ default ≤ max, got {} / {} / {}",
                self.min_video_bitrate, self.default_video_bitrate, self.max_video_bitrate
            )));
        }
        if !(self.learn_down_factor > 0.0 && self.learn_down_factor <= 1.0) {
            return Err(StampError::InvalidConfig(
                "learn_down_factor must be in (0, 1]".into(),
            ));
        }
        if !(self.learn_up_factor >= 1.0 && self.learn_up_factor.is_finite()) {
            return Err(StampError::InvalidConfig("learn_up_factor must be ≥ 1".into()));
        }
        if self.coarse_frame_interval_secs < 0.0 || self.degraded_frame_interval_secs < 0.0 {
            return Err(StampError::InvalidConfig(
                "frame intervals must not be negative".into(),
            ));
        }
        Ok(())
    }
}

// ── Events and settings ──────────────────────────────────────────

/// Network health feedback from the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Periodic report: the link kept up.
    Status,
    /// The link could not carry the requested bitrate.
    InsufficientBandwidth { observed_bytes_per_second: u64 },
    /// The connection was re-established.
    Reset,
}

/// Settings pushed to the stream output in one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSettings {
    pub bitrate: u64,
    /// Minimum time between encoded frames; zero means native rate.
    pub frame_interval: Duration,
}

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateState {
    pub bitrate: u64,
    pub current_max: u64,
    pub frame_interval: Duration,
    pub sufficient_bw_counts: u32,
    pub zero_throughput_counts: u32,
    pub stable_counts: u32,
}

// ── BitrateController ────────────────────────────────────────────

/// Single-writer control loop state.
///
/// Invariant after every event: `min ≤ bitrate ≤ current_max ≤ max`.
#[derive(Debug, Clone)]
pub struct BitrateController {
    config: BitrateConfig,
    bitrate: u64,
    current_max: u64,
    frame_interval: Duration,
    sufficient_bw_counts: u32,
    zero_throughput_counts: u32,
    stable_counts: u32,
}

impl BitrateController {
    /// Start at the default bitrate with the ceiling at the hard max.
    pub fn new(config: BitrateConfig) -> Result<Self, StampError> {
        config.validate()?;
        Ok(Self {
            bitrate: config.default_video_bitrate,
            current_max: config.max_video_bitrate,
            frame_interval: Duration::ZERO,
            sufficient_bw_counts: 0,
            zero_throughput_counts: 0,
            stable_counts: 0,
            config,
        })
    }

    pub fn config(&self) -> &BitrateConfig {
        &self.config
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    pub fn settings(&self) -> VideoSettings {
        VideoSettings {
            bitrate: self.bitrate,
            frame_interval: self.frame_interval,
        }
    }

    pub fn state(&self) -> BitrateState {
        BitrateState {
            bitrate: self.bitrate,
            current_max: self.current_max,
            frame_interval: self.frame_interval,
            sufficient_bw_counts: self.sufficient_bw_counts,
            zero_throughput_counts: self.zero_throughput_counts,
            stable_counts: self.stable_counts,
        }
    }

    /// Apply one event. Returns the settings to push when the bitrate
    /// or frame interval changed.
    pub fn handle(&mut self, event: NetworkEvent) -> Option<VideoSettings> {
        let before = self.settings();
        match event {
            NetworkEvent::Status => self.on_status(),
            NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second,
            } => self.on_insufficient_bandwidth(observed_bytes_per_second),
            NetworkEvent::Reset => self.on_reset(),
        }
        self.debug_check_invariant();

        let after = self.settings();
        (after != before).then_some(after)
    }

    fn on_status(&mut self) {
        self.stable_counts += 1;
        if self.stable_counts >= self.config.stable_for_learn_up {
            let raised = (self.current_max as f64 * self.config.learn_up_factor) as u64;
            self.current_max = raised.min(self.config.max_video_bitrate);
            self.stable_counts = 0;
            debug!(current_max = self.current_max, "status: ceiling raised");
        }

        if self.bitrate < self.current_max {
            if self.sufficient_bw_counts >= self.config.increase_threshold {
                self.bitrate = (self.bitrate + self.config.increase_step).min(self.current_max);
                self.sufficient_bw_counts = 0;
                debug!(bitrate = self.bitrate, "status: bitrate stepped up");
            } else {
                self.sufficient_bw_counts += 1;
            }
        } else {
            self.sufficient_bw_counts = 0;
        }
    }

    fn on_insufficient_bandwidth(&mut self, observed: u64) {
        self.stable_counts = 0;
        self.sufficient_bw_counts = 0;

        if observed > 0 {
            let previous = self.bitrate;
            let after_zero_run = self.zero_throughput_counts > 0;
            let mut candidate =
                observed.saturating_mul(8) / (self.zero_throughput_counts as u64 + 1);
            if after_zero_run {
                candidate = (candidate as f64 * self.config.learn_down_factor) as u64;
            }
            let target = candidate
                .saturating_sub(self.config.audio_bitrate)
                .max(self.config.min_video_bitrate)
                .min(self.config.max_video_bitrate);

            self.bitrate = target;
            self.frame_interval = Duration::ZERO;
            self.zero_throughput_counts = 0;
            let learned = (previous as f64 * self.config.learn_down_factor) as u64;
            self.current_max = self
                .bitrate
                .max(learned)
                .max(self.config.min_video_bitrate);
            debug!(
                observed_bps = observed.saturating_mul(8),
                candidate,
                bitrate = self.bitrate,
                current_max = self.current_max,
                "insufficient bandwidth: bitrate lowered"
            );
        } else {
            self.zero_throughput_counts += 1;
            match self.zero_throughput_counts {
                2 => {
                    self.frame_interval =
                        Duration::from_secs_f64(self.config.coarse_frame_interval_secs)
                }
                4 => {
                    self.frame_interval =
                        Duration::from_secs_f64(self.config.degraded_frame_interval_secs)
                }
                _ => {}
            }
            debug!(
                zero_counts = self.zero_throughput_counts,
                frame_interval = ?self.frame_interval,
                "insufficient bandwidth: no throughput"
            );
        }
    }

    fn on_reset(&mut self) {
        self.sufficient_bw_counts = 0;
        self.zero_throughput_counts = 0;
        self.stable_counts = 0;
        self.current_max = self.config.max_video_bitrate;
        self.bitrate = self.config.default_video_bitrate;
    }

    fn debug_check_invariant(&self) {
        debug_assert!(
            self.config.min_video_bitrate <= self.bitrate
                && self.bitrate <= self.current_max
                && self.current_max <= self.config.max_video_bitrate,
            "bitrate invariant violated: {:?}",
            self.state()
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BitrateConfig {
        BitrateConfig {
            max_video_bitrate: 2000,
            default_video_bitrate: 1000,
            min_video_bitrate: 100,
            audio_bitrate: 0,
            increase_threshold: 3,
            increase_step: 100,
            learn_down_factor: 0.9,
            learn_up_factor: 1.05,
            stable_for_learn_up: 1000,
            ..BitrateConfig::default()
        }
    }

    fn assert_invariant(c: &BitrateController) {
        let s = c.state();
        let cfg = c.config();
        assert!(cfg.min_video_bitrate <= s.bitrate, "{s:?}");
        assert!(s.bitrate <= s.current_max, "{s:?}");
        assert!(s.current_max <= cfg.max_video_bitrate, "{s:?}");
    }

    #[test]
    fn status_steps_up_after_threshold() {
        let mut c = BitrateController::new(small_config()).unwrap();
        assert_eq!(c.state().current_max, 2000);
        for expected_count in 1..=3 {
            assert_eq!(c.handle(NetworkEvent::Status), None);
            assert_eq!(c.bitrate(), 1000);
            assert_eq!(c.state().sufficient_bw_counts, expected_count);
        }
        let update = c.handle(NetworkEvent::Status).unwrap();
        assert_eq!(update.bitrate, 1100);
        assert_eq!(c.state().sufficient_bw_counts, 0);
    }

    #[test]
    fn status_never_exceeds_ceiling() {
        let mut c = BitrateController::new(BitrateConfig {
            increase_threshold: 0,
            increase_step: 700,
            ..small_config()
        })
        .unwrap();
        c.handle(NetworkEvent::Status);
        c.handle(NetworkEvent::Status);
        assert_eq!(c.bitrate(), 2000);
        c.handle(NetworkEvent::Status);
        assert_eq!(c.state().sufficient_bw_counts, 0);
        assert_invariant(&c);
    }

    #[test]
    fn stable_run_raises_ceiling() {
        let mut c = BitrateController::new(BitrateConfig {
            stable_for_learn_up: 2,
            ..small_config()
        })
        .unwrap();
        c.handle(NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: 150,
        });
        let ceiling = c.state().current_max;
        c.handle(NetworkEvent::Status);
        c.handle(NetworkEvent::Status);
        assert_eq!(c.state().current_max, (ceiling as f64 * 1.05) as u64);
        assert_eq!(c.state().stable_counts, 0);
    }

    #[test]
    fn insufficient_bandwidth_floors_at_minimum() {
        let mut c = BitrateController::new(BitrateConfig {
            max_video_bitrate: 6_000_000,
            default_video_bitrate: 3_000_000,
            min_video_bitrate: 100_000,
            audio_bitrate: 64_000,
            ..BitrateConfig::default()
        })
        .unwrap();
        // 20 kB/s → 160 kbps - 64 kbps audio = 96 kbps, below the floor.
        let update = c
            .handle(NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second: 20_000,
            })
            .unwrap();
        assert_eq!(update.bitrate, 100_000);
        assert_eq!(c.state().current_max, 2_700_000);
        assert_invariant(&c);
    }

    #[test]
    fn insufficient_bandwidth_subtracts_audio() {
        let mut c = BitrateController::new(BitrateConfig {
            max_video_bitrate: 6_000_000,
            default_video_bitrate: 3_000_000,
            min_video_bitrate: 100_000,
            audio_bitrate: 64_000,
            ..BitrateConfig::default()
        })
        .unwrap();
        c.handle(NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: 50_000,
        });
        assert_eq!(c.bitrate(), (50_000 * 8 - 64_000).max(100_000));
        assert_eq!(c.bitrate(), 336_000);
    }

    #[test]
    fn insufficient_bandwidth_resets_counters() {
        let mut c = BitrateController::new(small_config()).unwrap();
        c.handle(NetworkEvent::Status);
        c.handle(NetworkEvent::Status);
        c.handle(NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: 100,
        });
        let s = c.state();
        assert_eq!(s.sufficient_bw_counts, 0);
        assert_eq!(s.stable_counts, 0);
        assert_eq!(s.bitrate, 800);
        assert_eq!(s.current_max, 900);
    }

    #[test]
    fn zero_throughput_degrades_frame_interval() {
        let mut c = BitrateController::new(small_config()).unwrap();
        let zero = NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: 0,
        };
        assert_eq!(c.handle(zero), None);
        let coarse = c.handle(zero).unwrap();
        assert_eq!(coarse.frame_interval, Duration::from_millis(100));
        assert_eq!(coarse.bitrate, 1000);
        assert_eq!(c.handle(zero), None);
        let degraded = c.handle(zero).unwrap();
        assert_eq!(degraded.frame_interval, Duration::from_millis(200));
        assert_eq!(c.state().zero_throughput_counts, 4);
    }

    #[test]
    fn recovery_after_zero_run_divides_and_learns_down() {
        let mut c = BitrateController::new(small_config()).unwrap();
        let zero = NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: 0,
        };
        c.handle(zero);
        c.handle(zero);
        let update = c
            .handle(NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second: 150,
            })
            .unwrap();
        // 150 B/s × 8 / (2 + 1) = 400, × 0.9 = 360.
        assert_eq!(update.bitrate, 360);
        assert_eq!(update.frame_interval, Duration::ZERO);
        assert_eq!(c.state().zero_throughput_counts, 0);
    }

    #[test]
    fn reset_restores_defaults_and_only_emits_on_change() {
        let mut c = BitrateController::new(small_config()).unwrap();
        assert_eq!(c.handle(NetworkEvent::Reset), None);

        c.handle(NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: 50,
        });
        let update = c.handle(NetworkEvent::Reset).unwrap();
        assert_eq!(update.bitrate, 1000);
        let s = c.state();
        assert_eq!(s.current_max, 2000);
        assert_eq!(
            (s.sufficient_bw_counts, s.zero_throughput_counts, s.stable_counts),
            (0, 0, 0)
        );
    }

    #[test]
    fn huge_throughput_is_clamped_to_hard_max() {
        let mut c = BitrateController::new(small_config()).unwrap();
        c.handle(NetworkEvent::InsufficientBandwidth {
            observed_bytes_per_second: u64::MAX,
        });
        assert_eq!(c.bitrate(), 2000);
        assert_invariant(&c);
    }

    #[test]
    fn invariant_holds_over_mixed_sequence() {
        let mut c = BitrateController::new(BitrateConfig {
            stable_for_learn_up: 3,
            increase_threshold: 1,
            ..small_config()
        })
        .unwrap();
        let pattern = [0u64, 40, 0, 0, 0, 0, 500, 10, 0, 90_000];
        for (i, observed) in pattern.iter().cycle().take(200).enumerate() {
            let event = match i % 4 {
                0 | 1 => NetworkEvent::Status,
                2 => NetworkEvent::InsufficientBandwidth {
                    observed_bytes_per_second: *observed,
                },
                _ if i % 37 == 0 => NetworkEvent::Reset,
                _ => NetworkEvent::Status,
            };
            c.handle(event);
            assert_invariant(&c);
        }
    }

    #[test]
    fn config_validation() {
        assert!(BitrateConfig::default().validate().is_ok());
        let inverted = BitrateConfig {
            min_video_bitrate: 5_000_000,
            ..BitrateConfig::default()
        };
        assert!(BitrateController::new(inverted).is_err());
        let bad_factor = BitrateConfig {
            learn_down_factor: 1.5,
            ..BitrateConfig::default()
        };
        assert!(bad_factor.validate().is_err());
    }
}
