//! On-disk snapshot cache of recently minted frames.

pub mod cache;
pub mod store;
pub mod worker;

pub use cache::{SnapshotCache, SnapshotCacheConfig};
pub use store::FileStore;
pub use worker::{DEFAULT_JPEG_QUALITY, SnapshotWorker, decode_image, encode_jpeg};
