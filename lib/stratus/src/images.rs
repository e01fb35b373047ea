// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk image helpers built on `qemu-img` and friends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::exec::{Cmd, ExecError, ProcessRunner};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("image I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("image {image_id} is unacceptable: {reason}")]
    Unacceptable { image_id: String, reason: String },

    #[error("image service failed for {image_id}: {reason}")]
    Service { image_id: String, reason: String },
}

/// Source of image contents, keyed by an opaque id.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn download(
        &self,
        image_id: &str,
        dest: &Path,
    ) -> Result<(), ImageError>;
}

/// Serves images stored as `<root>/<image id>` on a local filesystem.
pub struct LocalImageService {
    root: PathBuf,
}

impl LocalImageService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageService for LocalImageService {
    async fn download(
        &self,
        image_id: &str,
        dest: &Path,
    ) -> Result<(), ImageError> {
        let source = self.root.join(image_id);
        tokio::fs::copy(&source, dest).await.map_err(|e| {
            ImageError::Service {
                image_id: image_id.to_string(),
                reason: format!("{}: {e}", source.display()),
            }
        })?;
        Ok(())
    }
}

/// Cache key for a fetched image: the hex SHA-1 of its id.
pub fn image_key(image_id: &str) -> String {
    let digest = ring::digest::digest(
        &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
        image_id.as_bytes(),
    );
    hex::encode(digest.as_ref())
}

/// The fields of `qemu-img info` output the driver cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: Option<String>,
    pub virtual_size: Option<u64>,
    pub backing_file: Option<String>,
}

impl ImageInfo {
    pub fn parse(output: &str) -> Self {
        let mut info = ImageInfo::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "file format" => info.format = Some(value.to_string()),
                "virtual size" => {
                    // "20G (21474836480 bytes)"
                    info.virtual_size = value
                        .split_once('(')
                        .and_then(|(_, rest)| rest.split_whitespace().next())
                        .and_then(|bytes| bytes.parse().ok());
                }
                "backing file" => {
                    let path = match value.split_once("(actual path:") {
                        Some((_, actual)) => {
                            actual.trim().trim_end_matches(')').trim()
                        }
                        None => value,
                    };
                    info.backing_file = Some(path.to_string());
                }
                _ => {}
            }
        }
        info
    }
}

pub async fn qemu_img_info(
    runner: &dyn ProcessRunner,
    path: &Path,
) -> Result<ImageInfo, ImageError> {
    let out = runner
        .run(Cmd::new("qemu-img").arg("info").arg(path.display().to_string()))
        .await?;
    Ok(ImageInfo::parse(&out.stdout))
}

/// Creates a qcow2 overlay at `target` backed by `base`.
pub async fn create_cow_image(
    runner: &dyn ProcessRunner,
    base: &Path,
    target: &Path,
) -> Result<(), ImageError> {
    runner
        .run(Cmd::new("qemu-img").args([
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-o".to_string(),
            format!("cluster_size=2M,backing_file={}", base.display()),
            target.display().to_string(),
        ]))
        .await?;
    Ok(())
}

/// Grows a raw image to at least `size` bytes.
pub async fn extend(
    runner: &dyn ProcessRunner,
    image: &Path,
    size: u64,
) -> Result<(), ImageError> {
    let current = tokio::fs::metadata(image).await?.len();
    if current >= size {
        return Ok(());
    }
    runner
        .run(
            Cmd::new("qemu-img")
                .args(["resize".to_string(), image.display().to_string()])
                .arg(size.to_string()),
        )
        .await?;
    Ok(())
}

/// Creates a sparse local disk, formatting it when `fs_format` is given.
pub async fn create_local(
    runner: &dyn ProcessRunner,
    target: &Path,
    size: u64,
    unit: char,
    fs_format: Option<&str>,
) -> Result<(), ImageError> {
    let format = fs_format.map(|fs| Cmd::new("mkfs").args(["-t", fs]));
    create_blank(runner, target, format!("{size}{unit}"), format).await
}

pub async fn create_swap(
    runner: &dyn ProcessRunner,
    target: &Path,
    swap_mb: u64,
) -> Result<(), ImageError> {
    create_blank(runner, target, format!("{swap_mb}M"), Some(Cmd::new("mkswap")))
        .await
}

/// Sizes and formats a blank disk at `<target>.part`, then renames it to
/// `target`. A failed format leaves nothing at `target`.
async fn create_blank(
    runner: &dyn ProcessRunner,
    target: &Path,
    size: String,
    format: Option<Cmd>,
) -> Result<(), ImageError> {
    let part = with_suffix(target, ".part");
    let part_arg = part.display().to_string();
    let built = async {
        runner
            .run(Cmd::new("truncate").args([part_arg.clone(), "-s".to_string(), size]))
            .await?;
        if let Some(format) = format {
            runner.run(format.arg(part_arg.clone())).await?;
        }
        Ok::<(), ImageError>(())
    }
    .await;
    if let Err(e) = built {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e);
    }
    tokio::fs::rename(&part, target).await?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Downloads an image to `path`, converting it to raw format.
///
/// The download lands in `<path>.part` and only reaches `path` through a
/// rename, so an interrupted fetch never leaves a file at `path`.
pub async fn fetch_to_raw(
    runner: &dyn ProcessRunner,
    service: &dyn ImageService,
    image_id: &str,
    path: &Path,
) -> Result<(), ImageError> {
    let part = with_suffix(path, ".part");
    service.download(image_id, &part).await?;

    let unacceptable = |reason: String| ImageError::Unacceptable {
        image_id: image_id.to_string(),
        reason,
    };

    let info = qemu_img_info(runner, &part).await?;
    let Some(format) = info.format else {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(unacceptable("'qemu-img info' parsing failed.".into()));
    };
    if let Some(backing) = info.backing_file {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(unacceptable(format!(
            "fmt={format} backed by: {backing}"
        )));
    }

    if format == "raw" {
        tokio::fs::rename(&part, path).await?;
        return Ok(());
    }

    let staged = with_suffix(path, ".converted");
    runner
        .run(Cmd::new("qemu-img").args([
            "convert".to_string(),
            "-O".to_string(),
            "raw".to_string(),
            part.display().to_string(),
            staged.display().to_string(),
        ]))
        .await?;
    tokio::fs::remove_file(&part).await?;

    let converted = qemu_img_info(runner, &staged).await?;
    if converted.format.as_deref() != Some("raw") {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(unacceptable(format!(
            "Converted to raw, but format is now {}",
            converted.format.unwrap_or_default()
        )));
    }
    tokio::fs::rename(&staged, path).await?;
    Ok(())
}

/// Renders a byte count in the largest unit that holds it, rounding up.
///
/// Block migration needs a destination image at least as large as the
/// source, so sizes are never rounded down.
pub fn format_size(size: u64) -> String {
    for (unit, divisor) in [("G", 1u64 << 30), ("M", 1 << 20), ("K", 1 << 10)]
    {
        if size / divisor == 0 {
            continue;
        }
        return format!("{}{unit}", size.div_ceil(divisor));
    }
    size.to_string()
}
