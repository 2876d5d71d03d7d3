//! Square thumbnail generation for every token in the collection mapping.
//!
//! Images are pulled through the [`Loader`], so gateway fallback, ranking,
//! retries and the concurrency cap all apply. Existing thumbnails are skipped,
//! which makes the job resumable.

use crate::batch::{BatchStats, ItemOutcome, run_batches};
use crate::collection::{ContentRef, MappingEntry};
use crate::config::ThumbnailConfig;
use crate::loader::key::{Endpoint, Variant};
use crate::loader::{LoadOutcome, Loader};
use crate::utils::log_if_slow;
use anyhow::{Context, Result};
use bytes::Bytes;
use image::ImageFormat;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decoding and resizing above this is worth a warning.
const SLOW_ENCODE_THRESHOLD: Duration = Duration::from_secs(2);

pub struct ThumbnailJob {
    loader: Loader,
    gateways: Arc<[Endpoint]>,
    config: ThumbnailConfig,
}

impl ThumbnailJob {
    pub fn new(loader: Loader, gateways: Vec<Endpoint>, config: &ThumbnailConfig) -> Self {
        Self {
            loader,
            gateways: gateways.into(),
            config: config.clone(),
        }
    }

    pub fn output_path(&self, id: u32) -> PathBuf {
        self.config.output_dir.join(format!("{id}.png"))
    }

    pub async fn run(
        &self,
        entries: Vec<MappingEntry>,
        cancel: &CancellationToken,
    ) -> Result<BatchStats> {
        let output_dir = &self.config.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let stats = run_batches(
            "thumbnails",
            entries,
            self.config.batch_size,
            self.config.batch_pause,
            cancel,
            |entry| self.process(entry, cancel),
        )
        .await;
        Ok(stats)
    }

    async fn process(&self, entry: MappingEntry, cancel: &CancellationToken) -> ItemOutcome {
        let id = entry.id;
        let final_path = self.output_path(id);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!(token_id = id, "thumbnail exists, skipping");
            return ItemOutcome::Skipped;
        }

        let Some(content) = ContentRef::parse(&entry.metadata.image) else {
            warn!(token_id = id, image = %entry.metadata.image, "unsupported image reference");
            return ItemOutcome::Failed;
        };

        let body = match self.fetch(&content, cancel).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                return if cancel.is_cancelled() {
                    ItemOutcome::Cancelled
                } else {
                    warn!(
                        token_id = id,
                        image = %entry.metadata.image,
                        "image unavailable on every gateway"
                    );
                    ItemOutcome::Failed
                };
            }
            Err(e) => {
                warn!(token_id = id, error = ?e, "failed to load image");
                return ItemOutcome::Failed;
            }
        };

        let temp_path = self.config.output_dir.join(format!("temp_{id}.png"));
        let size = self.config.size;
        let encode_started = Instant::now();
        let written = {
            let temp_path = temp_path.clone();
            let final_path = final_path.clone();
            tokio::task::spawn_blocking(move || {
                write_thumbnail(&body, size, &temp_path, &final_path)
            })
            .await
        };
        log_if_slow(encode_started, SLOW_ENCODE_THRESHOLD, "thumbnail encode");

        match written {
            Ok(Ok(())) => {
                debug!(token_id = id, path = %final_path.display(), "thumbnail written");
                ItemOutcome::Done
            }
            Ok(Err(e)) => {
                warn!(token_id = id, error = ?e, "thumbnail generation failed");
                let _ = tokio::fs::remove_file(&temp_path).await;
                ItemOutcome::Failed
            }
            Err(e) => {
                warn!(token_id = id, error = ?e, "thumbnail task panicked");
                let _ = tokio::fs::remove_file(&temp_path).await;
                ItemOutcome::Failed
            }
        }
    }

    /// Load the image bytes. `Ok(None)` means unavailable or cancelled.
    async fn fetch(
        &self,
        content: &ContentRef,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        let key = content.key(Variant::Normal)?;
        let candidates = content.candidates(&self.gateways);

        for _ in 0..2 {
            match self.loader.load(&key, content.path(), &candidates, cancel).await? {
                LoadOutcome::Resolved { body: Some(body), .. } => return Ok(Some(body)),
                // Resolved from cache by an earlier token sharing this image: the
                // URI is known but the bytes are not, so go back to the network once.
                LoadOutcome::Resolved { body: None, .. } => {
                    self.loader.cache().invalidate(&key);
                }
                LoadOutcome::Unavailable | LoadOutcome::Cancelled => return Ok(None),
            }
        }
        Ok(None)
    }
}

/// Decode, cover-resize to `size`x`size` with Lanczos3, and write a PNG atomically.
pub fn write_thumbnail(body: &[u8], size: u32, temp_path: &Path, final_path: &Path) -> Result<()> {
    let img = image::load_from_memory(body).context("Failed to decode image")?;
    let thumb = img.resize_to_fill(size, size, FilterType::Lanczos3);
    thumb
        .save_with_format(temp_path, ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    std::fs::rename(temp_path, final_path)
        .with_context(|| format!("Failed to move thumbnail into {}", final_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GenericImageView, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([200, 40, 40, 255]),
        ));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn writes_square_thumbnail_from_wide_source() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_1.png");
        let dest = dir.path().join("1.png");

        write_thumbnail(&png_bytes(300, 200), 64, &temp, &dest).unwrap();

        let written = image::open(&dest).unwrap();
        assert_eq!((written.width(), written.height()), (64, 64));
        assert!(!temp.exists());
    }

    #[test]
    fn rejects_undecodable_payload() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_2.png");
        let dest = dir.path().join("2.png");

        assert!(write_thumbnail(b"<html>gateway error</html>", 64, &temp, &dest).is_err());
        assert!(!dest.exists());
    }
}
