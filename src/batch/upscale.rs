//! In-place upscaling of undersized pixel-art thumbnails.
//!
//! Only files named `<digits>.png` are touched. Each upgrade backs up the
//! original first and restores it if anything goes wrong.

use crate::batch::{BatchStats, ItemOutcome, run_batches};
use crate::config::UpscaleConfig;
use anyhow::{Context, Result, bail};
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// List `<digits>.png` files in `dir`, ordered by numeric id.
pub fn scan_numbered_pngs(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if let Some(id) = numbered_png_id(&path) {
            files.push((id, path));
        }
    }
    files.sort_by_key(|(id, _)| *id);
    Ok(files)
}

fn numbered_png_id(path: &Path) -> Option<u32> {
    if path.extension()? != "png" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

pub async fn run(config: &UpscaleConfig, cancel: &CancellationToken) -> Result<BatchStats> {
    let input_dir = config.input_dir.clone();
    let files = tokio::task::spawn_blocking(move || scan_numbered_pngs(&input_dir))
        .await
        .context("directory scan panicked")??;
    if files.is_empty() {
        bail!("no numbered PNG files found in {}", config.input_dir.display());
    }

    tokio::fs::create_dir_all(&config.backup_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.backup_dir.display()))?;
    info!(
        files = files.len(),
        input = %config.input_dir.display(),
        backup = %config.backup_dir.display(),
        size = config.size,
        "upscaling thumbnails"
    );

    let stats = run_batches(
        "upscale",
        files,
        config.batch_size,
        config.batch_pause,
        cancel,
        |(id, path)| {
            let backup_dir = config.backup_dir.clone();
            let size = config.size;
            async move {
                let task =
                    tokio::task::spawn_blocking(move || upscale_file(id, &path, &backup_dir, size));
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(token_id = id, error = ?e, "upscale task panicked");
                        ItemOutcome::Failed
                    }
                }
            }
        },
    )
    .await;
    Ok(stats)
}

/// Upscale one file in place, restoring the backup on failure.
pub fn upscale_file(id: u32, path: &Path, backup_dir: &Path, size: u32) -> ItemOutcome {
    if !path.exists() {
        debug!(token_id = id, "file vanished, skipping");
        return ItemOutcome::Skipped;
    }

    let Some(file_name) = path.file_name() else {
        return ItemOutcome::Failed;
    };
    let backup_path = backup_dir.join(file_name);
    let temp_path = path.with_file_name(format!("temp_{}", file_name.to_string_lossy()));

    match try_upscale(path, &backup_path, &temp_path, size) {
        Ok(true) => {
            debug!(token_id = id, size, "upscaled");
            ItemOutcome::Done
        }
        Ok(false) => {
            debug!(token_id = id, "already at target size, skipping");
            ItemOutcome::Skipped
        }
        Err(e) => {
            warn!(token_id = id, error = ?e, "upscale failed");
            if temp_path.exists() {
                let _ = std::fs::remove_file(&temp_path);
            }
            if backup_path.exists() {
                match std::fs::copy(&backup_path, path) {
                    Ok(_) => info!(token_id = id, "restored original from backup"),
                    Err(e) => error!(token_id = id, error = ?e, "failed to restore original"),
                }
            }
            ItemOutcome::Failed
        }
    }
}

/// Returns `Ok(false)` when the image already meets the target size.
fn try_upscale(path: &Path, backup_path: &Path, temp_path: &Path, size: u32) -> Result<bool> {
    let img = image::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let (width, height) = img.dimensions();
    if width >= size && height >= size {
        return Ok(false);
    }

    std::fs::copy(path, backup_path)
        .with_context(|| format!("Failed to back up to {}", backup_path.display()))?;

    img.resize_exact(size, size, FilterType::Nearest)
        .save_with_format(temp_path, ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    std::fs::rename(temp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn write_png(path: &Path, size: u32) {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(size, size, image::Rgba([0, 0, 0, 255])))
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    #[test]
    fn scan_keeps_numbered_pngs_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["10.png", "2.png", "temp_3.png", "notes.txt", "1.jpg", "x1.png"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let ids: Vec<u32> = scan_numbered_pngs(dir.path())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![2, 10]);
    }

    #[test]
    fn upscales_small_image_and_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.png");
        write_png(&path, 32);

        assert_eq!(upscale_file(7, &path, backup.path(), 64), ItemOutcome::Done);

        assert_eq!(image::open(&path).unwrap().dimensions(), (64, 64));
        assert_eq!(
            image::open(backup.path().join("7.png")).unwrap().dimensions(),
            (32, 32)
        );
        assert!(!dir.path().join("temp_7.png").exists());
    }

    #[test]
    fn skips_images_already_large_enough() {
        let dir = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let path = dir.path().join("8.png");
        write_png(&path, 64);

        assert_eq!(upscale_file(8, &path, backup.path(), 64), ItemOutcome::Skipped);
        assert!(!backup.path().join("8.png").exists());
    }

    #[test]
    fn corrupt_file_fails_and_is_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let path = dir.path().join("9.png");
        std::fs::write(&path, b"not a png").unwrap();

        assert_eq!(upscale_file(9, &path, backup.path(), 64), ItemOutcome::Failed);
        assert_eq!(std::fs::read(&path).unwrap(), b"not a png");
    }

    #[tokio::test]
    async fn run_reports_stats_for_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("0.png"), 32);
        write_png(&dir.path().join("1.png"), 64);

        let config = UpscaleConfig {
            input_dir: dir.path().to_path_buf(),
            backup_dir: backup.path().to_path_buf(),
            size: 64,
            batch_size: 1,
            batch_pause: std::time::Duration::ZERO,
        };
        let stats = run(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn run_fails_on_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpscaleConfig {
            input_dir: dir.path().to_path_buf(),
            ..UpscaleConfig::default()
        };
        assert!(run(&config, &CancellationToken::new()).await.is_err());
    }
}
