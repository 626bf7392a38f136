#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{FaceBackend, ENCODING_LEN};
use crate::detect::proposals;
use crate::frame::FaceRect;

type Plan = TypedRunnableModel<TypedModel>;

/// UltraFace RFB-320 input size.
pub const DETECTOR_INPUT: (u32, u32) = (320, 240);
/// Side of the square face crop fed to the embedding model.
pub const EMBEDDER_INPUT: u32 = 112;

const NMS_IOU: f32 = 0.3;

/// Face backend running two local ONNX models with tract.
///
/// The detector takes a `1x3x240x320` image normalized as `(p - 127) / 128` and returns
/// `scores [1, N, 2]` and `boxes [1, N, 4]`. The embedder takes a `1x3x112x112` crop
/// normalized as `(p - 127.5) / 128` and returns one 128-value vector, which is
/// L2-normalized before use. No network I/O; nothing is written to disk.
pub struct TractFaceBackend {
    detector: Plan,
    embedder: Plan,
    detection_threshold: f32,
}

impl TractFaceBackend {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(detector_path: P, embedder_path: Q) -> Result<Self> {
        let (width, height) = DETECTOR_INPUT;
        Ok(Self {
            detector: load_plan(detector_path.as_ref(), width, height)?,
            embedder: load_plan(embedder_path.as_ref(), EMBEDDER_INPUT, EMBEDDER_INPUT)?,
            detection_threshold: 0.7,
        })
    }

    /// Minimum face score for a detection to be reported.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.detection_threshold = threshold;
        self
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f64>> {
        let input = to_tensor(crop, EMBEDDER_INPUT, EMBEDDER_INPUT, 127.5, 128.0);
        let outputs = self
            .embedder
            .run(tvec!(input.into()))
            .context("embedding inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("embedding model produced no outputs"))?;
        let values = output
            .as_slice::<f32>()
            .context("embedding output tensor was not f32")?;
        if values.len() != ENCODING_LEN {
            return Err(anyhow!(
                "embedding model returned {} values, expected {}",
                values.len(),
                ENCODING_LEN
            ));
        }
        let norm = values.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
        if !norm.is_finite() || norm == 0.0 {
            return Err(anyhow!("embedding model returned a degenerate vector"));
        }
        Ok(values.iter().map(|v| *v as f64 / norm).collect())
    }
}

impl FaceBackend for TractFaceBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceRect>> {
        let (width, height) = DETECTOR_INPUT;
        let input = to_tensor(image, width, height, 127.0, 128.0);
        let outputs = self
            .detector
            .run(tvec!(input.into()))
            .context("detector inference failed")?;
        if outputs.len() < 2 {
            return Err(anyhow!("detector produced {} outputs, expected 2", outputs.len()));
        }
        let scores = outputs[0]
            .as_slice::<f32>()
            .context("detector scores were not f32")?;
        let boxes = outputs[1]
            .as_slice::<f32>()
            .context("detector boxes were not f32")?;

        let candidates = proposals::decode(scores, boxes, self.detection_threshold)?;
        let (image_width, image_height) = image.dimensions();
        Ok(proposals::suppress(candidates, NMS_IOU)
            .iter()
            .filter_map(|proposal| proposal.to_rect(image_width, image_height))
            .collect())
    }

    fn encode(&mut self, image: &RgbImage, locations: &[FaceRect]) -> Result<Vec<Vec<f64>>> {
        let mut encodings = Vec::with_capacity(locations.len());
        for rect in locations.iter().filter(|rect| !rect.is_empty()) {
            encodings.push(self.embed(&rect.crop(image))?);
        }
        Ok(encodings)
    }

    fn warm_up(&mut self) -> Result<()> {
        let (width, height) = DETECTOR_INPUT;
        self.locate(&RgbImage::new(width, height)).map(|_| ())
    }
}

fn load_plan(path: &Path, width: u32, height: u32) -> Result<Plan> {
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load ONNX model from {}", path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

/// Resize to the model input and lay out as normalized NCHW f32.
fn to_tensor(image: &RgbImage, width: u32, height: u32, mean: f32, scale: f32) -> Tensor {
    let resized = if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width, height, FilterType::Triangle)
    };
    tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, channel, y, x)| {
            (resized.get_pixel(x as u32, y as u32)[channel] as f32 - mean) / scale
        },
    )
    .into_tensor()
}
