//! Image codec helpers shared by engine implementations and the worker.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::{EngineError, RawImage};

/// Decode a base64 payload (raw or `data:image/...;base64,` URL) into RGB8.
pub fn decode_base64_image(data: &str) -> Result<RawImage, EngineError> {
    let payload = match data.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => data,
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| EngineError::Image(format!("invalid base64 image: {e}")))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| EngineError::Image(format!("unreadable image payload: {e}")))?
        .to_rgb8();
    Ok(RawImage {
        width: img.width(),
        height: img.height(),
        channels: 3,
        data: img.into_raw(),
    })
}

/// Read an image file into RGB8.
pub fn load_image(path: &Path) -> Result<RawImage, EngineError> {
    let img = image::open(path)
        .map_err(|e| EngineError::Image(format!("cannot read {}: {e}", path.display())))?
        .to_rgb8();
    Ok(RawImage {
        width: img.width(),
        height: img.height(),
        channels: 3,
        data: img.into_raw(),
    })
}

/// Write an RGB8 image as PNG.
pub fn save_png(path: &Path, image: &RawImage) -> Result<(), EngineError> {
    if image.channels != 3 {
        return Err(EngineError::Image(format!(
            "expected 3-channel image, got {}",
            image.channels
        )));
    }
    let buf = image::RgbImage::from_raw(image.width, image.height, image.data.clone())
        .ok_or_else(|| EngineError::Image("image buffer shorter than dimensions".into()))?;
    buf.save(path)
        .map_err(|e| EngineError::Image(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let img = RawImage {
            width: 4,
            height: 2,
            channels: 3,
            data: vec![10; 24],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        save_png(&path, &img).unwrap();

        let encoded = BASE64.encode(std::fs::read(&path).unwrap());
        let decoded = decode_base64_image(&encoded).unwrap();
        assert_eq!(decoded.width, 4);
        assert_eq!(decoded.height, 2);
        assert_eq!(decoded.data, img.data);
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        let img = RawImage {
            width: 1,
            height: 1,
            channels: 3,
            data: vec![1, 2, 3],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        save_png(&path, &img).unwrap();
        let url = format!(
            "data:image/png;base64,{}",
            BASE64.encode(std::fs::read(&path).unwrap())
        );
        assert!(decode_base64_image(&url).is_ok());
    }

    #[test]
    fn garbage_base64_is_rejected() {
        assert!(matches!(
            decode_base64_image("!!not-base64!!"),
            Err(EngineError::Image(_))
        ));
    }
}
