//! Person isolation orchestration.
//!
//! `validate → detect → mask → refine → remove background`, with the resilience policy
//! around everything after validation and a wall-clock budget around the whole call.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{check_format, IsolationConfig};
use crate::detection::{detect_with_fallback, EdgeDensityDetector};
use crate::errors::{IsolationError, Result};
use crate::mask::Mask;
use crate::model::{register_models, OnnxPersonDetector, OnnxSegmenter};
use crate::quality::QualityAnalyzer;
use crate::registry::ResourceRegistry;
use crate::remote::{HttpIsolationBackend, RemoteIsolation, RemoteIsolationRequest};
use crate::removal::{BackgroundRemover, RemovalMethod};
use crate::resilience::{CircuitState, ResiliencePolicy};
use crate::traits::{ForegroundSegmenter, PersonDetector, RemoteIsolationBackend};

pub const DISABLED_METHOD: &str = "disabled";
pub const ERROR_FALLBACK_METHOD: &str = "error_fallback";
pub const PIPELINE_CIRCUIT: &str = "person_isolation";
pub const REMOTE_CIRCUIT: &str = "remote_isolation";

pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif"];

/// Confidence multiplier when a method other than the configured one produced the output.
const FALLBACK_CONFIDENCE_FACTOR: f32 = 0.8;

/// 分離処理の結果
///
/// `success == false` always comes with `isolated_image_path == None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolationResult {
    pub success: bool,
    pub isolated_image_path: Option<PathBuf>,
    pub original_image_path: PathBuf,
    pub confidence_score: f32,
    /// Seconds.
    pub processing_time: f64,
    pub method_used: String,
    pub error_message: Option<String>,
}

impl IsolationResult {
    fn disabled(original: &Path) -> Self {
        Self {
            success: false,
            isolated_image_path: None,
            original_image_path: original.to_path_buf(),
            confidence_score: 0.0,
            processing_time: 0.0,
            method_used: DISABLED_METHOD.to_string(),
            error_message: None,
        }
    }

    fn error_fallback(original: &Path, elapsed: Duration, error: &IsolationError) -> Self {
        Self {
            success: false,
            isolated_image_path: None,
            original_image_path: original.to_path_buf(),
            confidence_score: 0.0,
            processing_time: elapsed.as_secs_f64(),
            method_used: ERROR_FALLBACK_METHOD.to_string(),
            error_message: Some(error.to_string()),
        }
    }
}

/// Output of one successful pipeline run.
#[derive(Debug)]
struct PipelineOutput {
    output_path: PathBuf,
    method: RemovalMethod,
    confidence: f32,
}

/// Checks existence, extension and size, then decodes.
///
/// Failures are `ImageCorruption` or `UnsupportedImageFormat` and are never retried.
pub fn load_validated_image(path: &Path) -> Result<RgbImage> {
    let metadata = fs::metadata(path).map_err(|e| IsolationError::ImageCorruption {
        path: path.to_path_buf(),
        reason: format!("cannot read file: {}", e),
    })?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(IsolationError::UnsupportedImageFormat {
            path: path.to_path_buf(),
            extension,
        });
    }

    if !metadata.is_file() || metadata.len() == 0 {
        return Err(IsolationError::ImageCorruption {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    image::open(path)
        .map(|image| image.into_rgb8())
        .map_err(|e| IsolationError::ImageCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn discard_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed late output"),
        Err(e) => debug!(path = %path.display(), error = %e, "could not remove late output"),
    }
}

struct EngineInner {
    config: IsolationConfig,
    registry: Arc<ResourceRegistry>,
    policy: ResiliencePolicy,
    primary: Option<Arc<dyn PersonDetector>>,
    secondary: Arc<dyn PersonDetector>,
    remover: BackgroundRemover,
    remote: Option<Arc<dyn RemoteIsolationBackend>>,
}

impl EngineInner {
    /// `abandoned` is raised by the caller once it stops waiting; nothing is written after that.
    fn run_pipeline(
        &self,
        source: &Path,
        image: &RgbImage,
        started: Instant,
        abandoned: &AtomicBool,
    ) -> Result<PipelineOutput> {
        let config = &self.config;
        let detection = detect_with_fallback(
            self.primary.as_deref(),
            self.secondary.as_ref(),
            image,
            config.detection_confidence_threshold,
        )?;

        let (width, height) = image.dimensions();
        let mut mask = Mask::from_detection(width, height, &detection);
        debug!(
            people = detection.count,
            coverage = mask.coverage(),
            "subject mask built"
        );
        if config.edge_refinement_enabled {
            mask = match mask.refine_with_edges(image) {
                Ok(refined) => refined,
                Err(e) => {
                    warn!(error = %e, "edge refinement failed, using unrefined mask");
                    mask
                }
            };
        }

        if abandoned.load(Ordering::SeqCst) {
            return Err(IsolationError::ImageTimeout {
                elapsed: started.elapsed(),
                budget: config.max_processing_duration(),
            });
        }
        let outcome = self
            .remover
            .remove(source, image, &mask, config.background_removal_method)?;

        let strongest = detection
            .strongest()
            .map(|(_, weight)| *weight)
            .unwrap_or(detection.confidence);
        let confidence = if outcome.used_fallback {
            strongest * FALLBACK_CONFIDENCE_FACTOR
        } else {
            strongest
        };

        Ok(PipelineOutput {
            output_path: outcome.output_path,
            method: outcome.method,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

/// 人物分離エンジン
///
/// Cheap to clone; clones share the registry, the circuit breakers and the detectors.
#[derive(Clone)]
pub struct IsolationEngine {
    inner: Arc<EngineInner>,
}

pub struct IsolationEngineBuilder {
    config: IsolationConfig,
    registry: Option<Arc<ResourceRegistry>>,
    primary: Option<Arc<dyn PersonDetector>>,
    secondary: Option<Arc<dyn PersonDetector>>,
    segmenter: Option<Arc<dyn ForegroundSegmenter>>,
    remote: Option<Arc<dyn RemoteIsolationBackend>>,
}

impl IsolationEngineBuilder {
    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn primary_detector(mut self, detector: Arc<dyn PersonDetector>) -> Self {
        self.primary = Some(detector);
        self
    }

    /// Replaces the default [`EdgeDensityDetector`].
    pub fn secondary_detector(mut self, detector: Arc<dyn PersonDetector>) -> Self {
        self.secondary = Some(detector);
        self
    }

    pub fn segmenter(mut self, segmenter: Arc<dyn ForegroundSegmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn remote_backend(mut self, backend: Arc<dyn RemoteIsolationBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    pub fn build(self) -> IsolationEngine {
        let config = self.config;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ResourceRegistry::from_config(&config)));
        let policy = ResiliencePolicy::new(config.retry_config(), config.breaker_config());
        let remover = BackgroundRemover::from_config(&config, self.segmenter);

        IsolationEngine {
            inner: Arc::new(EngineInner {
                registry,
                policy,
                primary: self.primary,
                secondary: self
                    .secondary
                    .unwrap_or_else(|| Arc::new(EdgeDensityDetector::default())),
                remover,
                remote: self.remote,
                config,
            }),
        }
    }
}

impl IsolationEngine {
    pub fn builder(config: IsolationConfig) -> IsolationEngineBuilder {
        IsolationEngineBuilder {
            config,
            registry: None,
            primary: None,
            secondary: None,
            segmenter: None,
            remote: None,
        }
    }

    /// Wires the ONNX models and the HTTP backend named in `config`.
    ///
    /// Models are only registered here; they load on first use.
    pub fn from_config(config: IsolationConfig) -> Result<Self> {
        check_format(&config.output_format)
            .map_err(|message| IsolationError::Configuration { message })?;

        let registry = Arc::new(ResourceRegistry::from_config(&config));
        register_models(&registry, &config)?;

        let mut builder = Self::builder(config.clone()).registry(Arc::clone(&registry));
        if config.detection_model_path.is_some() {
            builder = builder.primary_detector(Arc::new(OnnxPersonDetector::new(Arc::clone(
                &registry,
            ))));
        }
        if config.segmentation_model_path.is_some() {
            builder = builder.segmenter(Arc::new(OnnxSegmenter::new(Arc::clone(&registry))));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.remote_backend(Arc::new(HttpIsolationBackend::new(
                endpoint.clone(),
                Duration::from_secs(config.timeout_seconds),
            )?));
        }
        Ok(builder.build())
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.inner.registry
    }

    pub fn circuit_state(&self, circuit: &str) -> CircuitState {
        self.inner.policy.circuit_state(circuit)
    }

    pub fn reset_circuit(&self, circuit: &str) {
        self.inner.policy.reset(circuit)
    }

    /// Quality analyzer sharing this engine's primary detector, or the heuristic one.
    pub fn analyzer(&self) -> QualityAnalyzer {
        let detector = self
            .inner
            .primary
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.inner.secondary));
        QualityAnalyzer::new(detector)
    }

    pub fn release_idle_resources(&self, max_idle: Duration) -> Vec<String> {
        self.inner.registry.unload_unused(max_idle)
    }

    pub fn shutdown(&self) {
        self.inner.registry.shutdown();
    }

    /// 画像から人物を分離する
    ///
    /// Returns `Err` for input validation failures. Every other failure becomes a
    /// `method_used = "error_fallback"` result, unless `fallback_to_original` is off, in
    /// which case the terminal error is returned.
    pub fn isolate_person(&self, image_path: &Path) -> Result<IsolationResult> {
        let started = Instant::now();
        let config = &self.inner.config;

        if !config.enabled {
            debug!(path = %image_path.display(), "isolation disabled");
            return Ok(IsolationResult::disabled(image_path));
        }

        let image = load_validated_image(image_path)?;

        match self.run_with_deadline(image_path, image, started) {
            Ok(output) => {
                let elapsed = started.elapsed();
                info!(
                    path = %image_path.display(),
                    method = %output.method,
                    confidence = output.confidence,
                    ?elapsed,
                    "person isolated"
                );
                Ok(IsolationResult {
                    success: true,
                    isolated_image_path: Some(output.output_path),
                    original_image_path: image_path.to_path_buf(),
                    confidence_score: output.confidence,
                    processing_time: elapsed.as_secs_f64(),
                    method_used: output.method.as_str().to_string(),
                    error_message: None,
                })
            }
            Err(e) if config.fallback_to_original => {
                warn!(path = %image_path.display(), error = %e, "isolation failed, keeping original");
                Ok(IsolationResult::error_fallback(
                    image_path,
                    started.elapsed(),
                    &e,
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the pipeline on its own thread and stops waiting once the budget is spent.
    ///
    /// An overrunning worker is flagged as abandoned: it skips writing, and any output it
    /// produced anyway is removed. The timeout itself counts as a pipeline failure.
    fn run_with_deadline(
        &self,
        image_path: &Path,
        image: RgbImage,
        started: Instant,
    ) -> Result<PipelineOutput> {
        let budget = self.inner.config.max_processing_duration();
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let source = image_path.to_path_buf();
        let abandoned = Arc::new(AtomicBool::new(false));
        let worker_abandoned = Arc::clone(&abandoned);

        thread::Builder::new()
            .name("isolation-pipeline".to_string())
            .spawn(move || {
                let result = inner.policy.call(PIPELINE_CIRCUIT, || {
                    inner.run_pipeline(&source, &image, started, &worker_abandoned)
                });
                if let Err(mpsc::SendError(Ok(late))) = sender.send(result) {
                    discard_output(&late.output_path);
                }
            })
            .map_err(|e| IsolationError::FileSystem {
                path: image_path.to_path_buf(),
                operation: "spawn isolation worker".to_string(),
                source: e,
            })?;

        let remaining = budget.saturating_sub(started.elapsed());
        let output = match receiver.recv_timeout(remaining) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                // a result sent just after the deadline is still in the channel
                if let Ok(Ok(late)) = receiver.try_recv() {
                    discard_output(&late.output_path);
                }
                drop(receiver);
                self.inner.policy.record_failure(PIPELINE_CIRCUIT);
                return Err(IsolationError::ImageTimeout {
                    elapsed: started.elapsed(),
                    budget,
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(IsolationError::processing(
                    image_path.display().to_string(),
                    "isolation pipeline",
                    "worker exited without a result",
                ))
            }
        };

        let elapsed = started.elapsed();
        if elapsed > budget {
            discard_output(&output.output_path);
            return Err(IsolationError::ImageTimeout { elapsed, budget });
        }
        Ok(output)
    }

    /// 外部の分離サービスで処理する
    ///
    /// `model` falls back to `model_default`. Transport failures surface as
    /// `ServiceUnavailable`, malformed responses as `PrerequisiteCheckFailed`.
    pub fn isolate(
        &self,
        image_path: &Path,
        model: Option<&str>,
        options: serde_json::Map<String, serde_json::Value>,
    ) -> Result<RemoteIsolation> {
        let config = &self.inner.config;
        if config.endpoint.as_deref().map_or(true, str::is_empty) {
            return Err(IsolationError::RequiredPrerequisite {
                message: "no isolation endpoint configured".to_string(),
            });
        }
        let backend =
            self.inner
                .remote
                .as_ref()
                .ok_or_else(|| IsolationError::RequiredPrerequisite {
                    message: "no isolation backend available".to_string(),
                })?;

        if !image_path.is_file() {
            return Err(IsolationError::ImageCorruption {
                path: image_path.to_path_buf(),
                reason: "file does not exist".to_string(),
            });
        }

        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(config.model_default.as_str());
        let request = RemoteIsolationRequest {
            image_path: image_path.to_path_buf(),
            model: model.to_string(),
            options,
        };

        let retry = config.remote_retry_config();
        let isolation = self
            .inner
            .policy
            .call_with(REMOTE_CIRCUIT, &retry, || backend.isolate(&request))?;
        info!(path = %image_path.display(), model = %isolation.model_used, "remote isolation complete");
        Ok(isolation)
    }
}
