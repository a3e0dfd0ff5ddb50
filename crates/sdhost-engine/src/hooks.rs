//! Global engine hooks.
//!
//! The native library reports log lines, denoising progress, and decoded
//! preview frames through process-wide callbacks. The worker installs its
//! sinks around each job and uninstalls them on every exit path, so a later
//! job never observes a stale hook. Engine implementations call the
//! `emit_*` functions from wherever their compute loop lives.

use std::io::Cursor;
use std::sync::Mutex;

use image::ImageEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::{PreviewMode, RawImage};

/// `(step, total_steps)` from the denoising or model-loading loop.
pub type ProgressHook = Box<dyn Fn(i32, i32) + Send + Sync>;

/// `(step, frame_count, jpeg_bytes, width, height, is_noisy)`; the frame is
/// already resized and JPEG-encoded per the installed [`PreviewSettings`].
pub type PreviewHook = Box<dyn Fn(i32, i32, &[u8], u32, u32, bool) + Send + Sync>;

/// Log line from the native library.
pub type LogHook = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Controls how raw preview frames are reduced before delivery.
#[derive(Debug, Clone, Copy)]
pub struct PreviewSettings {
    pub mode: PreviewMode,
    /// Deliver every Nth step.
    pub interval: i32,
    /// Longest output dimension in pixels, aspect preserved.
    pub max_size: u32,
    /// JPEG quality 1-100.
    pub quality: u8,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            mode: PreviewMode::Tae,
            interval: 1,
            max_size: 256,
            quality: 75,
        }
    }
}

static PROGRESS: Mutex<Option<ProgressHook>> = Mutex::new(None);
static PREVIEW: Mutex<Option<(PreviewHook, PreviewSettings)>> = Mutex::new(None);
static LOG: Mutex<Option<LogHook>> = Mutex::new(None);

pub fn set_progress_hook(hook: ProgressHook) {
    *PROGRESS.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
}

pub fn clear_progress_hook() {
    *PROGRESS.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

pub fn set_preview_hook(hook: PreviewHook, settings: PreviewSettings) {
    *PREVIEW.lock().unwrap_or_else(|e| e.into_inner()) = Some((hook, settings));
}

pub fn clear_preview_hook() {
    *PREVIEW.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

pub fn set_log_hook(hook: LogHook) {
    *LOG.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
}

pub fn clear_log_hook() {
    *LOG.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

/// Installed preview mode, or `None` when no hook is set. Engines use this
/// to skip preview decoding entirely when nobody is listening.
pub fn preview_mode() -> Option<PreviewMode> {
    PREVIEW
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(|(_, s)| s.mode)
}

/// Called by engine implementations on every progress tick.
pub fn emit_progress(step: i32, total: i32) {
    if let Some(hook) = PROGRESS.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
        hook(step, total);
    }
}

/// Called by engine implementations with a freshly decoded preview frame.
///
/// Applies the installed interval, resizes to `max_size` (aspect preserved)
/// and JPEG-encodes before invoking the hook. A frame that fails to encode
/// is dropped silently; previews are best-effort.
pub fn emit_preview(step: i32, frame_count: i32, frame: &RawImage, is_noisy: bool) {
    let guard = PREVIEW.lock().unwrap_or_else(|e| e.into_inner());
    let Some((hook, settings)) = guard.as_ref() else {
        return;
    };
    if settings.mode == PreviewMode::None {
        return;
    }
    if settings.interval > 1 && step % settings.interval != 0 {
        return;
    }
    if let Some((jpeg, w, h)) = encode_preview(frame, settings.max_size, settings.quality) {
        hook(step, frame_count, &jpeg, w, h, is_noisy);
    }
}

/// Called by engine implementations for every native log line.
pub fn emit_log(level: LogLevel, message: &str) {
    if let Some(hook) = LOG.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
        hook(level, message);
    }
}

fn encode_preview(frame: &RawImage, max_size: u32, quality: u8) -> Option<(Vec<u8>, u32, u32)> {
    if frame.channels != 3 || frame.data.is_empty() {
        return None;
    }
    let img = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())?;

    let longest = frame.width.max(frame.height);
    let (img, w, h) = if longest > max_size && max_size > 0 {
        let scale = max_size as f32 / longest as f32;
        let w = ((frame.width as f32 * scale) as u32).max(1);
        let h = ((frame.height as f32 * scale) as u32).max(1);
        (image::imageops::resize(&img, w, h, FilterType::Triangle), w, h)
    } else {
        (img, frame.width, frame.height)
    };

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .write_image(img.as_raw(), w, h, image::ExtendedColorType::Rgb8)
        .ok()?;
    Some((out.into_inner(), w, h))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn gradient(w: u32, h: u32) -> RawImage {
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128]);
            }
        }
        RawImage {
            width: w,
            height: h,
            channels: 3,
            data,
        }
    }

    #[test]
    fn progress_hook_installs_and_clears() {
        let seen = Arc::new(AtomicI32::new(0));
        let s = Arc::clone(&seen);
        set_progress_hook(Box::new(move |step, _| {
            s.store(step, Ordering::SeqCst);
        }));
        emit_progress(7, 20);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        clear_progress_hook();
        emit_progress(9, 20);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    // The preview hook is process-global, so both behaviours are exercised
    // in a single sequential test.
    #[test]
    fn preview_resize_and_interval() {
        let seen = Arc::new(Mutex::new((0u32, 0u32, 0usize)));
        let s = Arc::clone(&seen);
        set_preview_hook(
            Box::new(move |_, _, jpeg, w, h, _| {
                *s.lock().unwrap() = (w, h, jpeg.len());
            }),
            PreviewSettings {
                max_size: 64,
                ..PreviewSettings::default()
            },
        );
        emit_preview(1, 1, &gradient(256, 128), true);
        clear_preview_hook();

        let (w, h, len) = *seen.lock().unwrap();
        assert_eq!(w, 64);
        assert_eq!(h, 32);
        assert!(len > 0, "expected a non-empty JPEG");

        let count = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&count);
        set_preview_hook(
            Box::new(move |_, _, _, _, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            PreviewSettings {
                interval: 5,
                ..PreviewSettings::default()
            },
        );
        for step in 1..=10 {
            emit_preview(step, 1, &gradient(8, 8), false);
        }
        clear_preview_hook();
        assert_eq!(count.load(Ordering::SeqCst), 2); // steps 5 and 10
    }
}
