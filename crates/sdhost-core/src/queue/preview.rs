//! Latest-preview cache for out-of-band HTTP fetch.
//!
//! The worker's preview hook stores every frame here regardless of the
//! WebSocket throttle; `GET /jobs/{id}/preview` reads the newest one
//! without ever touching the worker.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub step: i32,
    pub frame_count: i32,
    pub is_noisy: bool,
}

#[derive(Debug, Default)]
pub struct PreviewBuffer {
    frames: Mutex<HashMap<String, PreviewFrame>>,
}

impl PreviewBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, job_id: &str, frame: PreviewFrame) {
        if frame.jpeg.is_empty() {
            return;
        }
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), frame);
    }

    pub fn get(&self, job_id: &str) -> Option<PreviewFrame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Called by the worker when the job finalizes.
    pub fn clear(&self, job_id: &str) {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(step: i32) -> PreviewFrame {
        PreviewFrame {
            jpeg: vec![0xff, 0xd8],
            width: 64,
            height: 64,
            step,
            frame_count: 1,
            is_noisy: step < 10,
        }
    }

    #[test]
    fn latest_frame_wins() {
        let buf = PreviewBuffer::new();
        buf.store("a", frame(1));
        buf.store("a", frame(5));
        assert_eq!(buf.get("a").unwrap().step, 5);
    }

    #[test]
    fn clear_removes_entry() {
        let buf = PreviewBuffer::new();
        buf.store("a", frame(1));
        buf.clear("a");
        assert!(buf.get("a").is_none());
    }

    #[test]
    fn empty_jpeg_is_ignored() {
        let buf = PreviewBuffer::new();
        buf.store(
            "a",
            PreviewFrame {
                jpeg: Vec::new(),
                width: 0,
                height: 0,
                step: 0,
                frame_count: 0,
                is_noisy: false,
            },
        );
        assert!(buf.get("a").is_none());
    }
}
