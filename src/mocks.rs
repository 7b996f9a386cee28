//! テスト用のモックと合成画像
//!
//! Used by the unit tests of each module and by the integration tests under `tests/`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use crate::correction::RegenerationParameters;
use crate::detection::{BoundingBox, PersonDetection};
use crate::errors::{IsolationError, Result};
use crate::mask::Mask;
use crate::remote::{RemoteIsolation, RemoteIsolationRequest};
use crate::traits::{
    AuditSink, ForegroundSegmenter, ManagedResource, PersonDetector, RegenerationService,
    RemoteIsolationBackend, ResourceInstance,
};

/// 明るい背景に暗い楕円の人物シルエットを描いた合成画像
pub fn portrait_image(width: u32, height: u32) -> RgbImage {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let (rx, ry) = (width as f32 / 4.0, height as f32 * 0.35);

    RgbImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        if dx * dx + dy * dy <= 1.0 {
            let shade = 50 + (y * 20 / height.max(1)) as u8;
            Rgb([shade + 10, shade, shade - 5])
        } else {
            Rgb([200, 200, 200])
        }
    })
}

/// Adds deterministic uniform noise in `[-amplitude, amplitude]` to every channel.
pub fn add_noise(image: &RgbImage, amplitude: u8) -> RgbImage {
    let mut state: u32 = 0x2545_f491;
    let span = amplitude as i32 * 2 + 1;
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let offset = (state >> 16) as i32 % span - amplitude as i32;
            *channel = (*channel as i32 + offset).clamp(0, 255) as u8;
        }
    }
    out
}

/// Saves a [`portrait_image`] as `dir/name` and returns its path.
pub fn write_portrait(dir: &Path, name: &str, width: u32, height: u32) -> Result<PathBuf> {
    let path = dir.join(name);
    portrait_image(width, height).save(&path)?;
    Ok(path)
}

/// 固定の検出結果を返す検出器
#[derive(Debug, Clone, Default)]
pub struct MockPersonDetector {
    boxes: Vec<(BoundingBox, f32)>,
    delay: Option<Duration>,
}

impl MockPersonDetector {
    pub fn single(bbox: BoundingBox, confidence: f32) -> Self {
        Self::with_boxes(vec![(bbox, confidence)])
    }

    pub fn nobody() -> Self {
        Self::default()
    }

    pub fn with_boxes(boxes: Vec<(BoundingBox, f32)>) -> Self {
        Self { boxes, delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl PersonDetector for MockPersonDetector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn detect(&self, _image: &RgbImage) -> Result<PersonDetection> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.boxes.is_empty() {
            return Ok(PersonDetection::none());
        }
        Ok(PersonDetection::from_boxes(self.boxes.clone()))
    }
}

/// 常に失敗する検出器
#[derive(Debug, Clone, Copy)]
pub struct FailingDetector;

impl PersonDetector for FailingDetector {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&self, _image: &RgbImage) -> Result<PersonDetection> {
        Err(IsolationError::detection("mock detector failure"))
    }
}

/// Segmenter returning a full-foreground mask, or failing on every call.
#[derive(Debug, Default)]
pub struct MockSegmenter {
    fail: bool,
    calls: AtomicUsize,
}

impl MockSegmenter {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ForegroundSegmenter for MockSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<Mask> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(IsolationError::model("segmentation", "mock segmenter failure"));
        }
        let (width, height) = image.dimensions();
        Ok(Mask::from_array(ndarray::Array2::ones((
            height as usize,
            width as usize,
        ))))
    }
}

/// Registry resource that counts its loads and unloads.
///
/// The instance is an `Arc<usize>` holding the load generation, starting at 1.
#[derive(Debug)]
pub struct CountingResource {
    name: String,
    expensive: bool,
    delay: Option<Duration>,
    failures_remaining: AtomicUsize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl CountingResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expensive: true,
            delay: None,
            failures_remaining: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first `n` loads fail.
    pub fn failing_times(self, n: usize) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn cheap(mut self) -> Self {
        self.expensive = false;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl ManagedResource for CountingResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_expensive(&self) -> bool {
        self.expensive
    }

    fn load(&self) -> Result<ResourceInstance> {
        let generation = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(IsolationError::model("load", format!("{} refused to load", self.name)));
        }
        Ok(Arc::new(generation))
    }

    fn unload(&self, instance: ResourceInstance) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        drop(instance);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub user_id: String,
    pub action: String,
    pub details: serde_json::Value,
}

/// 監査ログを記録するだけのシンク
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn log_user_action(&self, user_id: &str, action: &str, details: &serde_json::Value) {
        self.records.lock().push(AuditRecord {
            user_id: user_id.to_string(),
            action: action.to_string(),
            details: details.clone(),
        });
    }
}

/// Regeneration service that records its calls and returns a fixed result.
#[derive(Debug, Default)]
pub struct RecordingRegenerationService {
    output: Option<PathBuf>,
    fail: bool,
    calls: Mutex<Vec<(String, PathBuf, RegenerationParameters)>>,
}

impl RecordingRegenerationService {
    pub fn producing(output: PathBuf) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, PathBuf, RegenerationParameters)> {
        self.calls.lock().clone()
    }
}

impl RegenerationService for RecordingRegenerationService {
    fn regenerate_with_feedback(
        &self,
        user_id: &str,
        original_image_path: &Path,
        parameters: &RegenerationParameters,
    ) -> Result<Option<PathBuf>> {
        self.calls.lock().push((
            user_id.to_string(),
            original_image_path.to_path_buf(),
            parameters.clone(),
        ));
        if self.fail {
            return Err(IsolationError::ServiceUnavailable {
                service: "image generation".to_string(),
                message: "mock generator offline".to_string(),
            });
        }
        Ok(self.output.clone())
    }
}

/// Remote backend that fails the first `n` calls with a transport error, or every call
/// with a malformed-response error.
#[derive(Debug, Default)]
pub struct MockRemoteBackend {
    failures_remaining: AtomicUsize,
    malformed: bool,
    calls: AtomicUsize,
}

impl MockRemoteBackend {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn unavailable_times(n: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn malformed() -> Self {
        Self {
            malformed: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteIsolationBackend for MockRemoteBackend {
    fn isolate(&self, request: &RemoteIsolationRequest) -> Result<RemoteIsolation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.malformed {
            return Err(IsolationError::PrerequisiteCheckFailed {
                message: "malformed response".to_string(),
            });
        }
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(IsolationError::ServiceUnavailable {
                service: "isolation endpoint".to_string(),
                message: "connection refused".to_string(),
            });
        }

        let stem = request
            .image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(RemoteIsolation {
            mask_path: request.image_path.with_file_name(format!("{}_mask.png", stem)),
            foreground_path: request.image_path.with_file_name(format!("{}_fg.png", stem)),
            stats: serde_json::json!({ "options": request.options.len() }),
            model_used: request.model.clone(),
        })
    }
}
