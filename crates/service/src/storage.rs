//! Captured image persistence
//!
//! The capture core only decides where an image goes; encoding and writing
//! are delegated to an [`ImageSink`].

use crate::scanner::CapturedImage;
use chrono::NaiveDateTime;
use common::Result;
use driver::ImageFormat;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Encodes and writes one image
pub trait ImageSink: Send + Sync {
    /// Write `data` to `path` encoded as `format`
    fn write(&self, data: &[u8], format: ImageFormat, path: &Path) -> Result<()>;
}

/// Writes images to the local filesystem
///
/// Bytes already in the target encoding are written untouched; anything
/// else is decoded and re-encoded with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImageSink;

impl ImageSink for FileImageSink {
    fn write(&self, data: &[u8], format: ImageFormat, path: &Path) -> Result<()> {
        let target = codec_format(format);
        let bytes = match image::guess_format(data) {
            Ok(source) if source == target => data.to_vec(),
            _ => reencode(data, format)?,
        };
        fs::write(path, bytes)?;
        Ok(())
    }
}

fn reencode(data: &[u8], format: ImageFormat) -> Result<Vec<u8>> {
    let mut decoded = image::load_from_memory(data).map_err(invalid_data)?;
    if format == ImageFormat::Jpeg {
        // No alpha channel in JPEG
        decoded = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    }

    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, codec_format(format))
        .map_err(invalid_data)?;
    Ok(out.into_inner())
}

fn invalid_data(e: image::ImageError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn codec_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Bmp => image::ImageFormat::Bmp,
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Tiff => image::ImageFormat::Tiff,
        ImageFormat::Gif => image::ImageFormat::Gif,
    }
}

/// Deterministic target path for a captured image
///
/// `<dir>/<device id>/<YYYYMMDD-HHMMSS-mmm>_<index>.<ext>`, with every character
/// of the device identifier outside `[A-Za-z0-9_-]` replaced by `_`.
pub fn image_path(
    dir: &Path,
    image: &CapturedImage,
    timestamp: NaiveDateTime,
    format: ImageFormat,
) -> PathBuf {
    dir.join(sanitise(image.device_id.as_str())).join(format!(
        "{}_{}.{}",
        timestamp.format("%Y%m%d-%H%M%S-%3f"),
        image.index,
        format.extension()
    ))
}

fn sanitise(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "device".to_string()
    } else {
        cleaned
    }
}

/// Saves captured images below one output directory
pub struct ImageStore {
    directory: PathBuf,
    format: ImageFormat,
    sink: Box<dyn ImageSink>,
}

impl ImageStore {
    pub fn new(directory: impl Into<PathBuf>, format: ImageFormat) -> Self {
        Self::with_sink(directory, format, Box::new(FileImageSink))
    }

    pub fn with_sink(
        directory: impl Into<PathBuf>,
        format: ImageFormat,
        sink: Box<dyn ImageSink>,
    ) -> Self {
        Self {
            directory: directory.into(),
            format,
            sink,
        }
    }

    /// Write one image, creating its parent directories first
    ///
    /// An existing file is never overwritten; the name gets a numeric
    /// suffix instead.
    pub fn save(&self, image: &CapturedImage, timestamp: NaiveDateTime) -> Result<PathBuf> {
        let path = image_path(&self.directory, image, timestamp, self.format);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let path = unused_path(path);
        self.sink.write(&image.data, self.format, &path)?;
        debug!("Saved {} ({} bytes captured)", path.display(), image.data.len());
        Ok(path)
    }
}

fn unused_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{}-{}.{}", stem, n, extension));
        if !candidate.exists() {
            warn!("{} already exists, saving as {}", path.display(), candidate.display());
            return candidate;
        }
        n += 1;
    }
}
