//! Serialised delivery of network events to the controller.
//!
//! Events from any task are funnelled through one mpsc channel into a
//! single owner task, so the controller's state is never touched
//! concurrently. Resulting settings are pushed to a [`SettingsSink`] in
//! one call per change.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, warn};

use super::controller::{BitrateController, BitrateState, NetworkEvent, VideoSettings};
use crate::error::StampError;

/// Queue depth between event producers and the controller task.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Stream output that accepts bitrate and frame-interval updates.
#[async_trait]
pub trait SettingsSink: Send + Sync {
    /// Apply both values atomically.
    async fn apply(&self, settings: VideoSettings) -> Result<(), StampError>;
}

/// Producer side of the controller task.
#[derive(Debug, Clone)]
pub struct BitrateHandle {
    tx: mpsc::Sender<NetworkEvent>,
    state: watch::Receiver<BitrateState>,
}

impl BitrateHandle {
    /// Queue an event, waiting for room if the queue is full.
    pub async fn send(&self, event: NetworkEvent) -> Result<(), StampError> {
        self.tx.send(event).await?;
        Ok(())
    }

    /// Queue an event without waiting.
    pub fn try_send(&self, event: NetworkEvent) -> Result<(), StampError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StampError::Other("bitrate event queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => StampError::ChannelClosed,
        })
    }

    /// Latest state published by the controller task.
    pub fn state(&self) -> BitrateState {
        *self.state.borrow()
    }

    /// Wait until the controller publishes a state change.
    pub async fn changed(&mut self) -> Result<BitrateState, StampError> {
        self.state
            .changed()
            .await
            .map_err(|_| StampError::ChannelClosed)?;
        Ok(*self.state.borrow_and_update())
    }

    /// Forward every event of `events` into the controller. Returns when
    /// the stream ends or the controller task is gone.
    pub async fn forward<S>(&self, events: S) -> Result<(), StampError>
    where
        S: Stream<Item = NetworkEvent>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            self.send(event).await?;
        }
        Ok(())
    }
}

/// Spawn the controller task on the current runtime.
///
/// The task runs until every [`BitrateHandle`] is dropped. Sink errors
/// are logged and do not stop the loop.
pub fn spawn_controller(
    controller: BitrateController,
    sink: Arc<dyn SettingsSink>,
    span: Span,
) -> (BitrateHandle, JoinHandle<BitrateController>) {
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(controller.state());

    let task = tokio::spawn(
        async move {
            let mut controller = controller;
            info!(
                bitrate = controller.bitrate(),
                "bitrate controller started"
            );
            while let Some(event) = rx.recv().await {
                let update = controller.handle(event);
                state_tx.send_replace(controller.state());
                let Some(settings) = update else {
                    continue;
                };
                debug!(
                    ?event,
                    bitrate = settings.bitrate,
                    frame_interval = ?settings.frame_interval,
                    "pushing video settings"
                );
                if let Err(e) = sink.apply(settings).await {
                    warn!(error = %e, "failed to apply video settings");
                }
            }
            info!("bitrate controller stopped");
            controller
        }
        .instrument(span),
    );

    (
        BitrateHandle {
            tx,
            state: state_rx,
        },
        task,
    )
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitrate::BitrateConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<VideoSettings>>,
    }

    #[async_trait]
    impl SettingsSink for RecordingSink {
        async fn apply(&self, settings: VideoSettings) -> Result<(), StampError> {
            self.applied.lock().unwrap().push(settings);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl SettingsSink for FailingSink {
        async fn apply(&self, _settings: VideoSettings) -> Result<(), StampError> {
            Err(StampError::Session("output gone".into()))
        }
    }

    fn controller() -> BitrateController {
        BitrateController::new(BitrateConfig {
            max_video_bitrate: 2000,
            default_video_bitrate: 1000,
            min_video_bitrate: 100,
            audio_bitrate: 0,
            increase_threshold: 3,
            increase_step: 100,
            stable_for_learn_up: 1000,
            ..BitrateConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn events_are_applied_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, task) = spawn_controller(controller(), sink.clone(), Span::none());

        for _ in 0..4 {
            handle.send(NetworkEvent::Status).await.unwrap();
        }
        handle
            .send(NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second: 50,
            })
            .await
            .unwrap();
        handle.send(NetworkEvent::Reset).await.unwrap();
        drop(handle);

        let final_controller = task.await.unwrap();
        assert_eq!(final_controller.bitrate(), 1000);

        let applied: Vec<u64> = sink
            .applied
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.bitrate)
            .collect();
        assert_eq!(applied, vec![1100, 400, 1000]);
    }

    #[tokio::test]
    async fn forward_drains_a_stream() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, task) = spawn_controller(controller(), sink.clone(), Span::none());

        let events = futures::stream::iter(vec![NetworkEvent::Status; 8]);
        handle.forward(events).await.unwrap();
        drop(handle);
        task.await.unwrap();

        // Steps on the 4th and 8th status.
        let applied = sink.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].bitrate, 1200);
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_the_loop() {
        let (mut handle, task) = spawn_controller(controller(), Arc::new(FailingSink), Span::none());
        handle
            .send(NetworkEvent::InsufficientBandwidth {
                observed_bytes_per_second: 50,
            })
            .await
            .unwrap();
        let state = handle.changed().await.unwrap();
        assert_eq!(state.bitrate, 400);
        handle.send(NetworkEvent::Reset).await.unwrap();
        drop(handle);
        assert_eq!(task.await.unwrap().bitrate(), 1000);
    }

    #[tokio::test]
    async fn send_after_task_exit_reports_closed() {
        let (handle, task) = spawn_controller(
            controller(),
            Arc::new(RecordingSink::default()),
            Span::none(),
        );
        task.abort();
        let _ = task.await;
        assert!(matches!(
            handle.send(NetworkEvent::Status).await,
            Err(StampError::ChannelClosed)
        ));
    }
}
