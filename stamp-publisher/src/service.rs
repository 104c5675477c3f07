//! Publisher service core logic.
//!
//! Wires the stamping pipeline to a synthetic camera and a simulated
//! uplink: frames are rendered at the configured rate, minted frames
//! are stored as snapshots, and the uplink's health reports drive the
//! bitrate controller. The uplink connection is supervised with
//! exponential backoff; giving up is fatal for the service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use stamp_core::{
    Background, BitrateController, BitrateHandle, DeviceCondition, DeviceSensor, FileStore,
    FrameCounter, FrameIdentifier, NetworkEvent, PixelFormat, SessionEvent, SessionSupervisor,
    SettingsSink, SnapshotCache, SnapshotWorker, StampError, StreamRenderer, StreamSession,
    StripSpec, Threshold, ThrottledCounter, VideoFrame, VideoSettings, decode, spawn_controller,
};

use crate::config::{PublisherConfig, UplinkConfig};

// ── SyntheticCamera ──────────────────────────────────────────────

/// Produces a moving diagonal test pattern.
#[derive(Debug)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    tick: u32,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }

    /// Capture the next BGRA frame.
    pub fn next_frame(&mut self) -> VideoFrame {
        let (w, h) = (self.width, self.height);
        let row_len = w as usize * 4;
        let mut data = vec![0u8; row_len * h as usize];
        let shift = u64::from(self.tick) * 4;
        for (y, row) in data.chunks_exact_mut(row_len.max(4)).enumerate() {
            let y = y as u64;
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let x = x as u64;
                let band = ((x + y + shift) / 32) % 2;
                let r = (x * 255 / u64::from(w.max(1))) as u8;
                let g = (y * 255 / u64::from(h.max(1))) as u8;
                let b = if band == 0 { 60 } else { 190 };
                px.copy_from_slice(&[b, g, r, 255]);
            }
        }
        self.tick = self.tick.wrapping_add(1);
        VideoFrame {
            width: w,
            height: h,
            stride: w * 4,
            format: PixelFormat::Bgra8,
            data,
            timestamp: std::time::Instant::now(),
        }
    }
}

// ── SimulatedUplink ──────────────────────────────────────────────

/// One network health report from the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkReport {
    Health(NetworkEvent),
    /// The link dropped; the session must reconnect.
    Dropped,
}

#[derive(Debug)]
struct UplinkState {
    connected: bool,
    settings: VideoSettings,
    report: usize,
    zero_run: u32,
    refused_left: u32,
    bits_sent: u64,
}

/// In-process stand-in for the stream output: accepts settings,
/// connects and closes, and reports health against a capacity profile.
#[derive(Debug)]
pub struct SimulatedUplink {
    config: UplinkConfig,
    audio_bitrate: u64,
    state: Mutex<UplinkState>,
}

impl SimulatedUplink {
    pub fn new(config: UplinkConfig, initial: VideoSettings, audio_bitrate: u64) -> Self {
        Self {
            state: Mutex::new(UplinkState {
                connected: false,
                settings: initial,
                report: 0,
                zero_run: 0,
                refused_left: config.refused_connects,
                bits_sent: 0,
            }),
            config,
            audio_bitrate,
        }
    }

    fn state(&self) -> MutexGuard<'_, UplinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> VideoSettings {
        self.state().settings
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn bits_sent(&self) -> u64 {
        self.state().bits_sent
    }

    /// Advance one report interval. `None` while disconnected.
    pub fn tick(&self) -> Option<UplinkReport> {
        let mut state = self.state();
        if !state.connected || self.config.capacity_profile.is_empty() {
            return None;
        }
        let capacity = self.config.capacity_profile[state.report % self.config.capacity_profile.len()];
        state.report += 1;

        let interval_secs = self.config.report_interval_ms as f64 / 1000.0;
        let demand = state.settings.bitrate + self.audio_bitrate;
        state.bits_sent += (demand.min(capacity) as f64 * interval_secs) as u64;

        if capacity == 0 {
            state.zero_run += 1;
            let limit = self.config.drop_after_zero_reports;
            if limit > 0 && state.zero_run >= limit {
                state.connected = false;
                state.zero_run = 0;
                return Some(UplinkReport::Dropped);
            }
            return Some(UplinkReport::Health(NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second: 0,
            }));
        }

        state.zero_run = 0;
        let event = if demand <= capacity {
            NetworkEvent::Status
        } else {
            NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second: capacity / 8,
            }
        };
        Some(UplinkReport::Health(event))
    }
}

#[async_trait]
impl SettingsSink for SimulatedUplink {
    async fn apply(&self, settings: VideoSettings) -> Result<(), StampError> {
        self.state().settings = settings;
        Ok(())
    }
}

#[async_trait]
impl StreamSession for SimulatedUplink {
    async fn connect(&self) -> Result<(), StampError> {
        let mut state = self.state();
        if state.refused_left > 0 {
            state.refused_left -= 1;
            return Err(StampError::Session("uplink refused connection".into()));
        }
        state.connected = true;
        state.zero_run = 0;
        Ok(())
    }

    async fn close(&self) -> Result<(), StampError> {
        self.state().connected = false;
        Ok(())
    }
}

// ── StaticSensor ─────────────────────────────────────────────────

/// Reports a fixed device condition.
#[derive(Debug, Clone, Copy)]
pub struct StaticSensor(pub DeviceCondition);

#[async_trait]
impl DeviceSensor for StaticSensor {
    async fn condition(&self) -> Result<DeviceCondition, StampError> {
        Ok(self.0)
    }
}

// ── PublisherService ─────────────────────────────────────────────

/// Counters reported when the service stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub frames_rendered: u64,
    /// Frames dropped to honour a degraded frame interval.
    pub frames_skipped: u64,
    pub identifiers_minted: u64,
    pub self_check_failures: u64,
    pub last_identifier: Option<FrameIdentifier>,
    pub final_bitrate: u64,
    pub reconnects: u32,
}

// ── NetworkFeed ──────────────────────────────────────────────────

/// Non-blocking path from the run loop to the bitrate controller.
///
/// Events are queued without bound and forwarded in order by their own
/// task, so a busy controller never stalls the frame ticker.
struct NetworkFeed {
    tx: mpsc::UnboundedSender<NetworkEvent>,
    forwarder: JoinHandle<Result<(), StampError>>,
}

impl NetworkFeed {
    fn spawn(bitrate: BitrateHandle) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let forwarder = tokio::spawn(async move { bitrate.forward(rx).await });
        Self { tx, forwarder }
    }

    fn push(&self, event: NetworkEvent) -> Result<(), StampError> {
        self.tx
            .unbounded_send(event)
            .map_err(|_| StampError::ChannelClosed)
    }

    /// Stop accepting events and wait until every queued one reached
    /// the controller.
    async fn close(self) {
        drop(self.tx);
        match self.forwarder.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("bitrate feed ended early: {e}"),
            Err(e) => warn!("bitrate feed task ended abnormally: {e}"),
        }
    }
}

/// Per-frame state owned by the run loop.
struct Pipeline {
    camera: SyntheticCamera,
    renderer: StreamRenderer,
    uplink: Arc<SimulatedUplink>,
    spec: StripSpec,
    self_check: bool,
    last_rendered: Option<Instant>,
    summary: PublishSummary,
}

impl Pipeline {
    fn on_frame(&mut self) {
        let mut frame = self.camera.next_frame();

        let interval = self.uplink.settings().frame_interval;
        if let Some(last) = self.last_rendered {
            if !interval.is_zero() && last.elapsed() < interval {
                self.summary.frames_skipped += 1;
                return;
            }
        }
        self.last_rendered = Some(Instant::now());

        let outcome = self.renderer.render(&mut frame);
        self.summary.frames_rendered += 1;
        if outcome.minted {
            self.summary.identifiers_minted += 1;
        }
        self.summary.last_identifier = outcome.identifier;

        if self.self_check {
            if let Some(id) = outcome.identifier {
                let decoded = decode(&frame, &self.spec, Threshold::Dynamic);
                if decoded != Some(id.value()) {
                    self.summary.self_check_failures += 1;
                    warn!(identifier = %id, ?decoded, "self-check decode mismatch");
                }
            }
        }
    }
}

/// The top-level publisher service.
pub struct PublisherService {
    config: PublisherConfig,
    running: Arc<AtomicBool>,
}

impl PublisherService {
    /// Create a service; the configuration is validated up front.
    pub fn new(config: PublisherConfig) -> Result<Self, StampError> {
        config.validate()?;
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until stopped, the configured duration elapses, or the
    /// uplink cannot be re-established.
    pub async fn run(&self) -> Result<PublishSummary, StampError> {
        self.running.store(true, Ordering::SeqCst);
        let cfg = &self.config;
        let background = Background::current()?;

        // Bitrate control loop, serialised on its own task.
        let controller = BitrateController::new(cfg.bitrate.clone())?;
        let uplink = Arc::new(SimulatedUplink::new(
            cfg.uplink.clone(),
            controller.settings(),
            cfg.bitrate.audio_bitrate,
        ));
        let (bitrate, bitrate_task) = spawn_controller(
            controller,
            uplink.clone(),
            tracing::info_span!("bitrate", stream = %cfg.stream.stream_id),
        );

        let feed = NetworkFeed::spawn(bitrate.clone());

        // Snapshot ring.
        let cache = if cfg.snapshots.enabled {
            let store = FileStore::open(&cfg.snapshots.directory, &cfg.stream.stream_id).await?;
            let cache = SnapshotCache::new(store, &cfg.cache_config(), background.clone())?;
            info!(
                dir = %cache.store_handle().dir().display(),
                capacity = cache.capacity(),
                "snapshot cache ready"
            );
            Some(cache)
        } else {
            None
        };

        // Render path.
        let counter = Arc::new(FrameCounter::new(
            cfg.throttle.baseline_frames_per_code,
            cfg.stream.mode,
        ));
        let throttled = ThrottledCounter::new(
            counter,
            cfg.throttle.clone(),
            Arc::new(StaticSensor(cfg.device_condition())),
            background.clone(),
        )?;
        let mut renderer = StreamRenderer::throttled(throttled, cfg.strip.clone())?;
        if let Some(cache) = &cache {
            renderer =
                renderer.with_snapshots(SnapshotWorker::new(cache.clone(), cfg.snapshots.jpeg_quality));
        }
        let mut pipeline = Pipeline {
            camera: SyntheticCamera::new(cfg.stream.width, cfg.stream.height),
            renderer,
            uplink: uplink.clone(),
            spec: cfg.strip.clone(),
            self_check: cfg.stream.self_check,
            last_rendered: None,
            summary: PublishSummary::default(),
        };

        // Uplink session.
        let (supervisor, mut session_events) =
            SessionSupervisor::new(uplink.clone(), cfg.reconnect.clone());
        if let Err(e) = supervisor.start().await {
            warn!("initial connect failed: {e}");
        }

        let mut frame_ticker =
            tokio::time::interval(Duration::from_secs_f64(1.0 / cfg.stream.fps as f64));
        frame_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report_ticker =
            tokio::time::interval(Duration::from_millis(cfg.uplink.report_interval_ms));
        report_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = (cfg.stream.duration_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(cfg.stream.duration_secs));
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        info!(
            fps = cfg.stream.fps,
            width = cfg.stream.width,
            height = cfg.stream.height,
            mode = ?cfg.stream.mode,
            "publisher started"
        );

        let mut connected_before = false;
        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = frame_ticker.tick() => pipeline.on_frame(),
                _ = report_ticker.tick() => {
                    match uplink.tick() {
                        Some(UplinkReport::Health(event)) => {
                            if let Err(e) = feed.push(event) {
                                error!("bitrate controller unavailable: {e}");
                                outcome = Err(e);
                                break;
                            }
                        }
                        Some(UplinkReport::Dropped) => supervisor.notify_disconnected("uplink lost"),
                        None => {}
                    }
                }
                Some(event) = session_events.recv() => {
                    match event {
                        SessionEvent::Connected => {
                            if connected_before {
                                pipeline.summary.reconnects += 1;
                                if let Err(e) = feed.push(NetworkEvent::Reset) {
                                    outcome = Err(e);
                                    break;
                                }
                            }
                            connected_before = true;
                        }
                        SessionEvent::Terminal(e) => {
                            error!("{e}");
                            outcome = Err(e);
                            break;
                        }
                        other => debug!(?other, "session event"),
                    }
                }
                _ = Self::wait_for_stop(&self.running) => break,
                _ = &mut expiry => {
                    info!("configured duration elapsed");
                    break;
                }
            }
        }

        // ── Shutdown ─────────────────────────────────────────────
        if let Err(e) = supervisor.stop().await {
            warn!("closing uplink failed: {e}");
        }
        feed.close().await;
        let mut final_bitrate = bitrate.state().bitrate;
        drop(bitrate);
        match bitrate_task.await {
            Ok(controller) => final_bitrate = controller.bitrate(),
            Err(e) => warn!("bitrate task ended abnormally: {e}"),
        }
        background.flush().await;
        if let Some(cache) = &cache {
            info!(stored = cache.len(), "snapshots kept");
            if cfg.snapshots.clear_on_exit {
                cache.stop();
                cache.flush().await;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let mut summary = pipeline.summary;
        summary.final_bitrate = final_bitrate;
        info!(
            frames = summary.frames_rendered,
            skipped = summary.frames_skipped,
            minted = summary.identifiers_minted,
            self_check_failures = summary.self_check_failures,
            bitrate = summary.final_bitrate,
            sent_bits = uplink.bits_sent(),
            "publisher stopped"
        );
        outcome.map(|()| summary)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
