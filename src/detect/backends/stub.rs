use anyhow::Result;
use image::RgbImage;
use std::collections::HashMap;

use crate::detect::backend::{FaceBackend, ENCODING_LEN};
use crate::frame::FaceRect;

/// Scripted backend for tests and camera bring-up.
///
/// Reports the faces it was told about (those that fit inside the image) and returns the
/// embedding registered for each rectangle. Rectangles without a registered embedding get
/// one derived from the mean colour of the crop, so repeated crops of the same pixels
/// always encode identically. With nothing registered it never finds a face.
#[derive(Default)]
pub struct StubBackend {
    faces: Vec<FaceRect>,
    encodings: HashMap<FaceRect, Vec<Vec<f64>>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `rect` from `locate` and answer `encode` for it with `encoding`.
    pub fn with_face(mut self, rect: FaceRect, encoding: Vec<f64>) -> Self {
        self.faces.push(rect);
        self.encodings.insert(rect, vec![encoding]);
        self
    }

    /// Answer `encode` for `rect` with exactly these vectors, without reporting it from `locate`.
    pub fn with_encodings(mut self, rect: FaceRect, encodings: Vec<Vec<f64>>) -> Self {
        self.encodings.insert(rect, encodings);
        self
    }
}

impl FaceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceRect>> {
        let (width, height) = image.dimensions();
        Ok(self
            .faces
            .iter()
            .copied()
            .filter(|rect| rect.right <= width && rect.bottom <= height)
            .collect())
    }

    fn encode(&mut self, image: &RgbImage, locations: &[FaceRect]) -> Result<Vec<Vec<f64>>> {
        let mut out = Vec::new();
        for rect in locations {
            match self.encodings.get(rect) {
                Some(encodings) => out.extend(encodings.iter().cloned()),
                None if !rect.is_empty() => out.push(color_encoding(&rect.crop(image))),
                None => {}
            }
        }
        Ok(out)
    }
}

/// Deterministic embedding from the mean RGB of `crop`, spread over all dimensions.
fn color_encoding(crop: &RgbImage) -> Vec<f64> {
    let mut sums = [0f64; 3];
    for pixel in crop.pixels() {
        for (sum, channel) in sums.iter_mut().zip(pixel.0) {
            *sum += channel as f64;
        }
    }
    let count = (crop.width() * crop.height()).max(1) as f64;
    (0..ENCODING_LEN)
        .map(|i| sums[i % 3] / count / 255.0 / ENCODING_LEN as f64)
        .collect()
}
