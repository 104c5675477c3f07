//! JPEG snapshot producer.
//!
//! The render path hands over a packed RGB copy of the frame; encoding
//! runs on the blocking pool and the result is stored through the
//! [`SnapshotCache`].

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};
use tracing::{Instrument, Span};

use super::cache::SnapshotCache;
use crate::counter::FrameIdentifier;
use crate::error::StampError;
use crate::frame::VideoFrame;

/// Default JPEG quality for stored frames.
pub const DEFAULT_JPEG_QUALITY: u8 = 100;

/// Encode packed RGB bytes as a JPEG image.
pub fn encode_jpeg(rgb: Vec<u8>, width: u32, height: u32, quality: u8) -> Result<Bytes, StampError> {
    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| StampError::Image(format!("buffer does not match {width}x{height}")))?;

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    img.write_with_encoder(encoder)?;
    Ok(Bytes::from(buf.into_inner()))
}

/// Decode a stored snapshot (any format `image` recognises) back into
/// a frame.
pub fn decode_image(bytes: &[u8]) -> Result<VideoFrame, StampError> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    let (width, height) = img.dimensions();
    VideoFrame::from_rgb8(width, height, img.into_raw())
        .ok_or_else(|| StampError::Image("decoded buffer has unexpected size".into()))
}

/// Copies frames on the render path and stores them as JPEG.
#[derive(Debug, Clone)]
pub struct SnapshotWorker {
    cache: SnapshotCache,
    quality: u8,
    span: Span,
}

impl SnapshotWorker {
    pub fn new(cache: SnapshotCache, quality: u8) -> Self {
        Self {
            cache,
            quality: quality.clamp(1, 100),
            span: tracing::info_span!("snapshot_worker"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Queue `frame` for storage under `id`. The only render-path cost
    /// is the pixel copy; the frame's place in the ring is fixed now,
    /// whenever its encode finishes.
    pub fn submit(&self, id: FrameIdentifier, frame: &VideoFrame) {
        if self.cache.is_stopped() {
            return;
        }
        let (width, height) = (frame.width, frame.height);
        let rgb = frame.to_rgb8();
        let quality = self.quality;
        let encoding = self
            .cache
            .background()
            .spawn_blocking(move || encode_jpeg(rgb, width, height, quality));

        self.cache.store_with(
            id,
            async move {
                match encoding.await {
                    Ok(encoded) => encoded,
                    Err(e) => Err(StampError::Other(format!("snapshot encode task failed: {e}"))),
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
    use crate::frame::{PixelFormat, Rect, Rgb};
    use crate::snapshot::FileStore;
    use crate::task::Background;

    #[test]
    fn jpeg_roundtrip_keeps_dimensions() {
        let mut frame = VideoFrame::filled(64, 48, PixelFormat::Bgra8, Rgb::WHITE);
        frame.fill_rect(Rect::new(0, 0, 32, 48), Rgb::BLACK);

        let jpeg = encode_jpeg(frame.to_rgb8(), 64, 48, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let back = decode_image(&jpeg).unwrap();
        assert_eq!((back.width, back.height), (64, 48));
        assert!(back.rgb_at(4, 24).luma() < 0.1);
        assert!(back.rgb_at(60, 24).luma() > 0.9);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        assert!(matches!(
            encode_jpeg(vec![0; 10], 4, 4, 100),
            Err(StampError::Image(_))
        ));
        assert!(decode_image(b"not an image").is_err());
    }

    #[tokio::test]
    async fn submit_stores_a_jpeg() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::open(root.path(), "w").await.unwrap();
        let cache = SnapshotCache::with_capacity(store, 4, Background::current().unwrap());
        let worker = SnapshotWorker::new(cache.clone(), DEFAULT_JPEG_QUALITY);

        let frame = VideoFrame::filled(16, 16, PixelFormat::Rgba8, Rgb::new(200, 10, 10));
        worker.submit(FrameIdentifier::new(101), &frame);
        cache.flush().await;

        let (id, bytes) = cache.latest().unwrap();
        assert_eq!(id, FrameIdentifier::new(101));
        let on_disk = cache.store_handle().read(id).await.unwrap();
        assert_eq!(on_disk, bytes.to_vec());
        assert_eq!(decode_image(&on_disk).unwrap().width, 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submissions_keep_call_order() {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::open(root.path(), "w").await.unwrap();
        let cache = SnapshotCache::with_capacity(store, 8, Background::current().unwrap());
        let worker = SnapshotWorker::new(cache.clone(), DEFAULT_JPEG_QUALITY);

        // Alternate large and tiny frames so later encodes often finish first.
        for n in 1..=20u64 {
            let side = if n % 2 == 1 { 256 } else { 8 };
            let frame = VideoFrame::filled(side, side, PixelFormat::Bgra8, Rgb::new(n as u8, 0, 0));
            worker.submit(FrameIdentifier::new(n), &frame);
        }
        cache.flush().await;

        let expected: Vec<_> = (13..=20).map(FrameIdentifier::new).collect();
        assert_eq!(cache.identifiers(), expected);
        assert_eq!(cache.latest().map(|(id, _)| id), Some(FrameIdentifier::new(20)));
        assert_eq!(cache.store_handle().list().await.unwrap(), expected);
    }
}
