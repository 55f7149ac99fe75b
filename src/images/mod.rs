//! Violation image persistence.
//!
//! Images go to an object store first. When the upload fails for any reason
//! the same JPEG is written to a local directory instead, and the alert
//! carries the local URL.

pub mod local;
pub mod object_store;
pub mod s3;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};

pub use local::{LocalFallback, DEFAULT_FALLBACK_DIR, DEFAULT_FALLBACK_URL_PREFIX};
pub use object_store::{InMemoryObjectStore, ObjectStore, StoredObject};
pub use s3::{S3Config, S3ObjectStore};

pub const DEFAULT_BUCKET: &str = "city-monitoring";
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Where a saved image ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageLocation {
    ObjectStore,
    LocalFallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredImage {
    pub url: String,
    pub location: ImageLocation,
}

/// Per-worker image writer. The object store client may be shared.
pub struct ImageStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    fallback: LocalFallback,
    bucket_ready: bool,
    jpeg_quality: u8,
}

impl ImageStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, fallback: LocalFallback) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            fallback,
            bucket_ready: false,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn fallback(&self) -> &LocalFallback {
        &self.fallback
    }

    /// Persist `frame` and return a URL it can be fetched from.
    ///
    /// Errors only when the frame cannot be encoded or both the object store
    /// and the fallback directory refuse the image.
    pub fn save(&mut self, frame: &Frame, camera_id: i64) -> Result<StoredImage> {
        let jpeg = frame
            .encode_jpeg(self.jpeg_quality)
            .with_context(|| format!("encode frame {} for camera {}", frame.seq, camera_id))?;
        let filename = image_filename(camera_id, frame);

        let key = format!("violations/{}", filename);
        let primary = match self.upload(&key, &jpeg) {
            Ok(url) => {
                log::debug!("camera {}: stored image {}", camera_id, url);
                return Ok(StoredImage {
                    url,
                    location: ImageLocation::ObjectStore,
                });
            }
            Err(e) => e,
        };
        log::warn!(
            "camera {}: object store upload failed, using local fallback: {:#}",
            camera_id,
            primary
        );

        match self.fallback.save(&filename, &jpeg) {
            Ok(url) => Ok(StoredImage {
                url,
                location: ImageLocation::LocalFallback,
            }),
            Err(local) => Err(anyhow!(
                "image for camera {} not stored: upload failed ({:#}); fallback failed ({:#})",
                camera_id,
                primary,
                local
            )),
        }
    }

    fn upload(&mut self, key: &str, jpeg: &[u8]) -> Result<String> {
        if !self.bucket_ready {
            if !self.store.bucket_exists(&self.bucket)? {
                self.store.make_bucket(&self.bucket)?;
                log::info!("created bucket {}", self.bucket);
            }
            self.bucket_ready = true;
        }
        self.store
            .put_object(&self.bucket, key, jpeg, IMAGE_CONTENT_TYPE)?;
        Ok(self.store.public_url(&self.bucket, key))
    }
}

/// `camera_{id}_{YYYYmmdd_HHMMSS}_{seq}.jpg`, timestamped with the capture
/// time in UTC. The sequence number keeps names unique within one second.
pub fn image_filename(camera_id: i64, frame: &Frame) -> String {
    let captured: DateTime<Utc> = frame.captured_at.into();
    format!(
        "camera_{}_{}_{}.jpg",
        camera_id,
        captured.format("%Y%m%d_%H%M%S"),
        frame.seq
    )
}
