use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{imageops, imageops::FilterType, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::IsolationConfig;
use crate::detection::{BoundingBox, PersonDetection};
use crate::errors::{IsolationError, Result};
use crate::imageops_ai::pad_to_square;
use crate::mask::Mask;
use crate::registry::ResourceRegistry;
use crate::traits::{ForegroundSegmenter, ManagedResource, PersonDetector, ResourceInstance};

pub const DETECTION_MODEL: &str = "person_detection_model";
pub const SEGMENTATION_MODEL: &str = "background_removal_model";

/// Tensor names of a model's single input and the output we read.
#[derive(Debug, Clone, Copy)]
pub struct ModelIo {
    pub input: &'static str,
    pub output: &'static str,
}

pub const SEGMENTATION_IO: ModelIo = ModelIo {
    input: "img",
    output: "mask",
};

pub const DETECTION_IO: ModelIo = ModelIo {
    input: "images",
    output: "output0",
};

/// ロード済みの ONNX セッション
pub struct ModelSession {
    pub image_size: u32,
    io: ModelIo,
    session: Mutex<Session>,
}

impl ModelSession {
    pub fn new(model_path: &Path, device_id: i32, io: ModelIo) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| IsolationError::model("セッションビルダー初期化", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| IsolationError::model("実行プロバイダー設定", e))?
            .with_memory_pattern(true)
            .map_err(|e| IsolationError::model("メモリパターン設定", e))?
            .commit_from_file(model_path)
            .map_err(|e| {
                IsolationError::model(format!("モデルファイル読み込み: {}", model_path.display()), e)
            })?;

        let image_size = session.inputs[0]
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(2).copied())
            .filter(|size| *size > 0)
            .ok_or_else(|| IsolationError::model("モデル入力形状取得", "テンソル形状が取得できません"))?
            as u32;

        // warm up
        let data = Array4::<f32>::zeros((1, 3, image_size as usize, image_size as usize));
        session
            .run(ort::inputs![io.input => TensorRef::from_array_view(&data)
                .map_err(|e| IsolationError::model("初期化テンソル作成", e))?])
            .map_err(|e| IsolationError::model("モデル初期化実行", e))?;

        Ok(Self {
            image_size,
            io,
            session: Mutex::new(session),
        })
    }

    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<ArrayD<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(
            ort::inputs![self.io.input => TensorRef::from_array_view(&tensor.as_standard_layout())?],
        )?;
        Ok(outputs[self.io.output].try_extract_array::<f32>()?.to_owned())
    }
}

/// Registry entry that opens an ONNX session on first use.
pub struct OnnxModelResource {
    name: String,
    model_path: PathBuf,
    device_id: i32,
    io: ModelIo,
}

impl OnnxModelResource {
    pub fn new(name: impl Into<String>, model_path: PathBuf, device_id: i32, io: ModelIo) -> Self {
        Self {
            name: name.into(),
            model_path,
            device_id,
            io,
        }
    }
}

impl ManagedResource for OnnxModelResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<ResourceInstance> {
        if !self.model_path.exists() {
            return Err(IsolationError::RequiredPrerequisite {
                message: format!("model file {} does not exist", self.model_path.display()),
            });
        }
        debug!(resource = %self.name, path = %self.model_path.display(), "opening onnx session");
        Ok(Arc::new(ModelSession::new(
            &self.model_path,
            self.device_id,
            self.io,
        )?))
    }
}

/// Registers a resource for every model path present in `config`.
pub fn register_models(registry: &ResourceRegistry, config: &IsolationConfig) -> Result<()> {
    if let Some(path) = &config.detection_model_path {
        registry.register(Arc::new(OnnxModelResource::new(
            DETECTION_MODEL,
            path.clone(),
            config.device_id,
            DETECTION_IO,
        )))?;
    }
    if let Some(path) = &config.segmentation_model_path {
        registry.register(Arc::new(OnnxModelResource::new(
            SEGMENTATION_MODEL,
            path.clone(),
            config.device_id,
            SEGMENTATION_IO,
        )))?;
    }
    Ok(())
}

/// Where the source image sits inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub offset: (u32, u32),
    pub side: u32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    /// Model pixels per source pixel.
    pub fn scale(&self, image_size: u32) -> f32 {
        image_size as f32 / self.side as f32
    }
}

/// Pads to a centered square, resizes to `image_size` and lays out as NCHW in `[0, 1]`.
///
/// Channels stay in RGB order. Both the person detector and the matting model take RGB,
/// unlike BGR-trained anime segmenters.
pub fn preprocess(image: &RgbImage, image_size: u32) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let (square, offset) = pad_to_square(image, Rgb([0, 0, 0]));
    let side = square.width();
    let resized = imageops::resize(&square, image_size, image_size, FilterType::Lanczos3);

    let tensor = resized
        .as_ndarray3()
        .slice_move(s![NewAxis, .., .., ..])
        .mapv(|v| v as f32 / 255.0);

    (
        tensor,
        Letterbox {
            offset,
            side,
            width,
            height,
        },
    )
}

/// Maps a `[1, 1, size, size]` model mask back onto the source image extent.
pub fn postprocess_mask(mask: Array4<f32>, image_size: u32, letterbox: Letterbox) -> Result<Mask> {
    let (raw, _) = mask.into_raw_vec_and_offset();
    let mask: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(image_size, image_size, raw)
        .ok_or_else(|| IsolationError::model("マスク後処理", "mask tensor has unexpected size"))?;

    let square = imageops::resize(&mask, letterbox.side, letterbox.side, FilterType::Lanczos3);
    let (x, y) = letterbox.offset;
    let cropped = imageops::crop_imm(&square, x, y, letterbox.width, letterbox.height).to_image();

    Ok(Mask::from_array(Array2::from_shape_fn(
        (letterbox.height as usize, letterbox.width as usize),
        |(row, col)| cropped.get_pixel(col as u32, row as u32)[0],
    )))
}

/// Decodes `[1, N, 6]` rows of `(x1, y1, x2, y2, score, class)` in model coordinates.
pub fn decode_detections(
    output: ArrayView3<f32>,
    image_size: u32,
    letterbox: Letterbox,
    min_score: f32,
    iou_threshold: f32,
) -> Vec<(BoundingBox, f32)> {
    let scale = letterbox.scale(image_size);
    let (ox, oy) = (letterbox.offset.0 as f32, letterbox.offset.1 as f32);

    let mut candidates: Vec<(BoundingBox, f32)> = output
        .index_axis(Axis(0), 0)
        .outer_iter()
        .filter(|row| row.len() >= 6 && row[4] >= min_score && row[5].round() as i64 == 0)
        .filter_map(|row| {
            let x1 = (row[0] / scale - ox).max(0.0);
            let y1 = (row[1] / scale - oy).max(0.0);
            let x2 = (row[2] / scale - ox).min(letterbox.width as f32);
            let y2 = (row[3] / scale - oy).min(letterbox.height as f32);
            if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
                return None;
            }
            let bbox = BoundingBox::new(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32)
                .clamp_to(letterbox.width, letterbox.height);
            Some((bbox, row[4].clamp(0.0, 1.0)))
        })
        .collect();

    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept: Vec<(BoundingBox, f32)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept
            .iter()
            .all(|(bbox, _)| bbox.intersection_over_union(&candidate.0) < iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Model-based background removal backed by the registry's segmentation session.
pub struct OnnxSegmenter {
    registry: Arc<ResourceRegistry>,
    timeout: Duration,
}

impl OnnxSegmenter {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        let timeout = registry.default_timeout();
        Self { registry, timeout }
    }
}

impl ForegroundSegmenter for OnnxSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<Mask> {
        let model = self
            .registry
            .get_as::<ModelSession>(SEGMENTATION_MODEL, self.timeout)?;
        let (tensor, letterbox) = preprocess(image, model.image_size);
        let output = model.predict(tensor.view())?.into_dimensionality::<Ix4>()?;
        postprocess_mask(output, model.image_size, letterbox)
    }
}

/// Primary person detector backed by the registry's detection session.
pub struct OnnxPersonDetector {
    registry: Arc<ResourceRegistry>,
    timeout: Duration,
    pub min_score: f32,
    pub iou_threshold: f32,
}

impl OnnxPersonDetector {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        let timeout = registry.default_timeout();
        Self {
            registry,
            timeout,
            min_score: 0.25,
            iou_threshold: 0.45,
        }
    }
}

impl PersonDetector for OnnxPersonDetector {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn detect(&self, image: &RgbImage) -> Result<PersonDetection> {
        let model = self
            .registry
            .get_as::<ModelSession>(DETECTION_MODEL, self.timeout)?;
        let (tensor, letterbox) = preprocess(image, model.image_size);
        let output = model.predict(tensor.view())?.into_dimensionality::<Ix3>()?;

        Ok(PersonDetection::from_boxes(decode_detections(
            output.view(),
            model.image_size,
            letterbox,
            self.min_score,
            self.iou_threshold,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_letterboxes_wide_image() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let (tensor, letterbox) = preprocess(&image, 64);

        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(letterbox.offset, (0, 50));
        assert_eq!(letterbox.side, 200);
        assert!(tensor[[0, 0, 32, 32]] > 0.9);
        assert!(tensor[[0, 0, 2, 32]] < 0.1);
    }

    #[test]
    fn test_postprocess_restores_source_extent() -> Result<()> {
        let letterbox = Letterbox {
            offset: (0, 25),
            side: 100,
            width: 100,
            height: 50,
        };
        let mask = Array4::<f32>::from_elem((1, 1, 32, 32), 0.75);
        let mask = postprocess_mask(mask, 32, letterbox)?;

        assert_eq!(mask.dimensions(), (100, 50));
        assert!((mask.get(50, 25) - 0.75).abs() < 0.01);
        Ok(())
    }

    #[test]
    fn test_decode_filters_class_and_suppresses_overlaps() {
        let letterbox = Letterbox {
            offset: (0, 0),
            side: 100,
            width: 100,
            height: 100,
        };
        let output = Array3::from_shape_vec(
            (1, 4, 6),
            vec![
                10.0, 10.0, 50.0, 90.0, 0.9, 0.0, // person
                12.0, 12.0, 52.0, 88.0, 0.8, 0.0, // duplicate of the first
                60.0, 10.0, 95.0, 90.0, 0.7, 0.0, // second person
                0.0, 0.0, 20.0, 20.0, 0.95, 3.0, // not a person
            ],
        )
        .unwrap();

        let boxes = decode_detections(output.view(), 100, letterbox, 0.25, 0.45);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0], (BoundingBox::new(10, 10, 40, 80), 0.9));
        assert_eq!(boxes[1].1, 0.7);
    }

    #[test]
    fn test_missing_model_file_fails_load() {
        let resource = OnnxModelResource::new(
            SEGMENTATION_MODEL,
            PathBuf::from("/nonexistent/model.onnx"),
            0,
            SEGMENTATION_IO,
        );
        assert!(matches!(
            resource.load(),
            Err(IsolationError::RequiredPrerequisite { .. })
        ));
    }
}
