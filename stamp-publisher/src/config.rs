//! Configuration for the publisher service.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stamp_core::{
    BitrateConfig, DeviceCondition, ReconnectPolicy, SnapshotCacheConfig, StampError, StreamMode,
    StripSpec, ThermalState, ThrottlePolicy,
};

/// Largest accepted stream width, in pixels (8K UHD).
pub const MAX_FRAME_WIDTH: u32 = 7680;
/// Largest accepted stream height, in pixels.
pub const MAX_FRAME_HEIGHT: u32 = 4320;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Stream geometry and identity.
    pub stream: StreamConfig,
    /// Identifier strip layout.
    pub strip: StripSpec,
    /// Device-condition throttling of identifier minting.
    pub throttle: ThrottlePolicy,
    /// Adaptive bitrate bounds and tuning.
    pub bitrate: BitrateConfig,
    /// On-disk snapshot ring.
    pub snapshots: SnapshotConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Simulated uplink behaviour.
    pub uplink: UplinkConfig,
    /// Static device condition reported to the throttle.
    pub device: DeviceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Directory name for this stream's snapshots.
    pub stream_id: String,
    /// Camera frames per second.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Photo mode encoded in every identifier suffix.
    pub mode: StreamMode,
    /// Decode every stamped frame and warn on mismatch.
    pub self_check: bool,
    /// Stop after this many seconds; 0 runs until Ctrl-C.
    pub duration_secs: u64,
}

/// Snapshot ring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// Root directory; frames go to `<directory>/<stream_id>/`.
    pub directory: PathBuf,
    /// Seconds of minted frames to keep.
    pub retention_secs: u32,
    /// Extra entries on top of the retention window.
    pub margin: u32,
    /// JPEG quality, 1–100.
    pub jpeg_quality: u8,
    /// Delete every stored frame when the publisher exits.
    pub clear_on_exit: bool,
}

/// Simulated uplink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Link capacity in bits/second, one entry per report interval,
    /// cycled.
    pub capacity_profile: Vec<u64>,
    /// Milliseconds between two network health reports.
    pub report_interval_ms: u64,
    /// Consecutive zero-capacity reports after which the link drops.
    /// 0 never drops.
    pub drop_after_zero_reports: u32,
    /// Connect attempts refused before the uplink accepts one.
    pub refused_connects: u32,
}

/// Device condition reported by the static sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub thermal: ThermalState,
    /// Battery charge in `0.0..=1.0`; omit when unknown.
    pub battery_level: Option<f32>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_id: "default".into(),
            fps: 30,
            width: 1280,
            height: 720,
            mode: StreamMode::PhotoEnabled,
            self_check: true,
            duration_secs: 0,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let cache = SnapshotCacheConfig::default();
        Self {
            enabled: true,
            directory: PathBuf::from("snapshots"),
            retention_secs: cache.retention_secs,
            margin: cache.margin,
            jpeg_quality: stamp_core::snapshot::DEFAULT_JPEG_QUALITY,
            clear_on_exit: false,
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            capacity_profile: vec![
                6_000_000, 6_000_000, 6_000_000, 2_000_000, 2_000_000, 0, 0, 1_200_000,
                4_000_000, 6_000_000,
            ],
            report_interval_ms: 1000,
            drop_after_zero_reports: 3,
            refused_connects: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl PublisherConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Render as a TOML document (for `--gen-config`).
    pub fn to_toml(&self) -> Result<String, StampError> {
        toml::to_string_pretty(self).map_err(|e| StampError::InvalidConfig(e.to_string()))
    }

    /// Check every section; the first problem is returned.
    pub fn validate(&self) -> Result<(), StampError> {
        if self.stream.fps == 0 || self.stream.fps > 240 {
            return Err(StampError::InvalidConfig(format!(
                "stream fps must be in 1..=240, got {}",
                self.stream.fps
            )));
        }
        if self.stream.width < 2 || self.stream.height < 2 {
            return Err(StampError::InvalidConfig("stream must be at least 2×2 pixels".into()));
        }
        if self.stream.width > MAX_FRAME_WIDTH || self.stream.height > MAX_FRAME_HEIGHT {
            return Err(StampError::InvalidConfig(format!(
                "stream {}×{} exceeds {MAX_FRAME_WIDTH}×{MAX_FRAME_HEIGHT}",
                self.stream.width, self.stream.height
            )));
        }
        if (self.stream.width as usize) < self.strip.cell_count() {
            return Err(StampError::InvalidConfig(format!(
                "stream width {} is narrower than the {} strip cells",
                self.stream.width,
                self.strip.cell_count()
            )));
        }
        if self.uplink.capacity_profile.is_empty() || self.uplink.report_interval_ms == 0 {
            return Err(StampError::InvalidConfig(
                "uplink needs a capacity profile and a non-zero report interval".into(),
            ));
        }
        self.strip.validate()?;
        self.throttle.validate()?;
        self.bitrate.validate()?;
        self.cache_config().validate()
    }

    /// Snapshot ring sizing for the configured frame rate and
    /// baseline minting period.
    pub fn cache_config(&self) -> SnapshotCacheConfig {
        SnapshotCacheConfig::for_stream(
            self.stream.fps,
            self.throttle.baseline_frames_per_code,
            self.snapshots.retention_secs,
            self.snapshots.margin,
        )
    }

    pub fn device_condition(&self) -> DeviceCondition {
        DeviceCondition {
            thermal: self.device.thermal,
            battery_level: self.device.battery_level.map(|b| b.clamp(0.0, 1.0)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = PublisherConfig::default();
        let text = cfg.to_toml().unwrap();
        assert!(text.contains("capacity_profile"));
        assert!(text.contains("max_video_bitrate"));
        assert!(text.contains("band_height"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = PublisherConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: PublisherConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.stream.fps, 30);
        assert_eq!(parsed.strip, StripSpec::default());
        assert_eq!(parsed.bitrate, BitrateConfig::default());
        assert_eq!(parsed.reconnect.max_retry_count, 5);
        assert!(parsed.device.battery_level.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: PublisherConfig = toml::from_str(
            r#"
            [stream]
            fps = 60
            mode = "photo_disabled"

            [strip]
            position = "top"

            [device]
            thermal = "fair"
            battery_level = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(parsed.stream.fps, 60);
        assert_eq!(parsed.stream.width, 1280);
        assert_eq!(parsed.stream.mode, StreamMode::PhotoDisabled);
        assert_eq!(parsed.strip.bits, 32);
        assert_eq!(parsed.device_condition().thermal, ThermalState::Fair);
        assert_eq!(parsed.device_condition().battery_level, Some(0.5));
    }

    #[test]
    fn default_cache_holds_ninety_seconds() {
        let cfg = PublisherConfig::default();
        assert_eq!(cfg.cache_config().capacity(), 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_sections() {
        let mut cfg = PublisherConfig::default();
        cfg.stream.fps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PublisherConfig::default();
        cfg.stream.width = 16;
        assert!(cfg.validate().is_err());

        let mut cfg = PublisherConfig::default();
        cfg.bitrate.min_video_bitrate = cfg.bitrate.max_video_bitrate + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = PublisherConfig::default();
        cfg.uplink.capacity_profile.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = PublisherConfig::default();
        cfg.stream.height = MAX_FRAME_HEIGHT + 1;
        assert!(cfg.validate().is_err());
        cfg.stream.height = MAX_FRAME_HEIGHT;
        cfg.stream.width = MAX_FRAME_WIDTH;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "stream = [").unwrap();
        assert_eq!(PublisherConfig::load(&path).stream.fps, 30);

        let good = dir.path().join("good.toml");
        std::fs::write(&good, PublisherConfig::default().to_toml().unwrap()).unwrap();
        assert_eq!(PublisherConfig::load(&good).snapshots.jpeg_quality, 100);
    }
}
