//! Deterministic stand-ins for the extractor used across unit tests.

use crate::extractor::{ExtractorError, FaceExtractor};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};

/// Top-left pixel value that makes the stub report a processing error.
pub(crate) const CORRUPT: u8 = 255;

/// Treats every non-zero pixel of the first row as one face whose embedding
/// is `[value / 10, 0]` (red channel). Values at or above `wide_from` get a
/// third component instead.
#[derive(Default)]
pub(crate) struct StubExtractor {
    pub detect_calls: usize,
    pub wide_from: Option<u8>,
}

impl FaceExtractor for StubExtractor {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractorError> {
        self.detect_calls += 1;
        if image.get_pixel(0, 0)[0] == CORRUPT {
            return Err(ExtractorError::Other("corrupt test image".into()));
        }
        Ok((0..image.width())
            .filter(|&x| image.get_pixel(x, 0)[0] > 0)
            .map(|x| BoundingBox {
                x: x as f32,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                confidence: 1.0,
                landmarks: None,
            })
            .collect())
    }

    fn encode(&mut self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, ExtractorError> {
        Ok(faces
            .iter()
            .map(|f| {
                let value = image.get_pixel(f.x as u32, 0)[0];
                let mut values = vec![value as f32 / 10.0, 0.0];
                if self.wide_from.is_some_and(|from| value >= from) {
                    values.push(0.0);
                }
                Embedding::new(values)
            })
            .collect())
    }
}

/// Image whose first row holds `faces`; an empty slice gives a faceless image.
pub(crate) fn face_image(faces: &[u8]) -> RgbImage {
    let width = faces.len().max(1) as u32;
    RgbImage::from_fn(width, 2, |x, y| {
        let v = if y == 0 { faces.get(x as usize).copied().unwrap_or(0) } else { 0 };
        Rgb([v, v, v])
    })
}
