//! Persistence of the accepted frame.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{ImageFormat, RgbaImage};
use stillcap_core::{EncodeError, Frame};
use tracing::debug;

/// Encodes a frame and stores it somewhere the caller can reach.
///
/// Called from a blocking thread, once per session at most.
pub trait FrameWriter: Send + Sync {
    fn write(&self, frame: &Frame) -> Result<PathBuf, EncodeError>;
}

/// Writes `<prefix>_<unix-millis>_<n>.png` files into a directory.
#[derive(Debug)]
pub struct PngFileWriter {
    dir: PathBuf,
    prefix: String,
    counter: AtomicU64,
}

impl PngFileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), prefix: "screenshot".to_owned(), counter: AtomicU64::new(0) }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self) -> Result<PathBuf, EncodeError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}_{}.png", self.prefix, ts_ms(), n);
        let path = self.dir.join(name);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }
}

impl FrameWriter for PngFileWriter {
    fn write(&self, frame: &Frame) -> Result<PathBuf, EncodeError> {
        let image = frame_to_rgba(frame)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.next_path()?;
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| EncodeError::Encoding(e.to_string()))?;
        debug!("Frame #{} saved to {}", frame.sequence(), path.display());
        Ok(path)
    }
}

/// Tightly packed, opaque RGBA copy of `frame` with row padding stripped.
pub fn frame_to_rgba(frame: &Frame) -> Result<RgbaImage, EncodeError> {
    let (w, h) = (frame.width(), frame.height());
    let mut pixels = Vec::with_capacity(w as usize * h as usize * 4);
    for y in 0..h {
        for x in 0..w {
            let [r, g, b] = frame.rgb_at(x, y);
            pixels.extend_from_slice(&[r, g, b, 255]);
        }
    }
    RgbaImage::from_raw(w, h, pixels)
        .ok_or_else(|| EncodeError::Encoding(format!("pixel buffer does not fit {w}x{h}")))
}

fn ts_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
