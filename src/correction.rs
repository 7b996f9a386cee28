//! Human correction of automatic isolation results.
//!
//! Each call applies one user decision and always returns a [`CorrectionResult`]. Every
//! attributed call is also recorded as [`LearningData`]; once a batch fills up it is folded into
//! [`LearningPatterns`] and the raw records are dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use image::GenericImageView;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CorrectionConfig;
use crate::errors::{IsolationError, Result};
use crate::traits::{AuditSink, RegenerationService};

pub const AUDIT_ACTION: &str = "image_correction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    AcceptProcessed,
    AcceptFallback,
    ManualCrop,
    AdjustFailed,
    UseOriginal,
    Regenerate,
    Error,
    Fallback,
}

impl ProcessingMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptProcessed => "accept_processed",
            Self::AcceptFallback => "accept_fallback",
            Self::ManualCrop => "manual_crop",
            Self::AdjustFailed => "adjust_failed",
            Self::UseOriginal => "use_original",
            Self::Regenerate => "regenerate",
            Self::Error => "error",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ProcessingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ユーザーの判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    Accept,
    Adjust,
    Original,
    Regenerate,
}

impl FromStr for UserDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "adjust" => Ok(Self::Adjust),
            "original" => Ok(Self::Original),
            "regenerate" => Ok(Self::Regenerate),
            other => Err(format!("unrecognized decision '{}'", other)),
        }
    }
}

/// Crop rectangle as requested by the user, possibly out of bounds or inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl CropRect {
    pub const fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Clamps into a `width × height` image.
    ///
    /// The result satisfies `0 <= left < right <= width` and `0 <= top < bottom <= height`
    /// for any non-empty image: a collapsed or inverted edge is pushed 1px past its
    /// opposite.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as i64, height.max(1) as i64);
        let left = self.left.clamp(0, w - 1);
        let top = self.top.clamp(0, h - 1);
        let mut right = self.right.clamp(0, w);
        let mut bottom = self.bottom.clamp(0, h);
        if right <= left {
            right = left + 1;
        }
        if bottom <= top {
            bottom = top + 1;
        }
        Self::new(left, top, right, bottom)
    }

    pub const fn width(&self) -> i64 {
        self.right - self.left
    }

    pub const fn height(&self) -> i64 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub user_id: String,
    pub original_image_path: PathBuf,
    pub processed_image_path: Option<PathBuf>,
    /// `accept`, `adjust`, `original` or `regenerate`.
    pub decision: String,
    pub crop_coordinates: Option<CropRect>,
    pub rejection_reason: Option<String>,
    pub suggested_modifications: Option<String>,
    pub processing_confidence: f32,
}

impl CorrectionRequest {
    pub fn new(
        user_id: impl Into<String>,
        original_image_path: impl Into<PathBuf>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            original_image_path: original_image_path.into(),
            processed_image_path: None,
            decision: decision.into(),
            crop_coordinates: None,
            rejection_reason: None,
            suggested_modifications: None,
            processing_confidence: 0.0,
        }
    }
}

/// 再生成サービスに渡すパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegenerationParameters {
    pub quality_boost: bool,
    pub resolution_multiplier: f32,
    pub single_person_emphasis: bool,
    pub background_simplification: bool,
    pub isolation_priority: bool,
    pub character_consistency: bool,
    pub appearance_refinement: bool,
    pub rejection_reason: Option<String>,
    pub modification_hints: Option<String>,
}

impl Default for RegenerationParameters {
    fn default() -> Self {
        Self {
            quality_boost: false,
            resolution_multiplier: 1.0,
            single_person_emphasis: false,
            background_simplification: false,
            isolation_priority: false,
            character_consistency: false,
            appearance_refinement: false,
            rejection_reason: None,
            modification_hints: None,
        }
    }
}

/// Keyword flags from the free-text rejection reason and modification hints.
pub fn derive_regeneration_parameters(
    rejection_reason: Option<&str>,
    suggested_modifications: Option<&str>,
) -> RegenerationParameters {
    let text = [rejection_reason, suggested_modifications]
        .iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let mut parameters = RegenerationParameters {
        rejection_reason: rejection_reason.map(str::to_string),
        modification_hints: suggested_modifications.map(str::to_string),
        ..RegenerationParameters::default()
    };
    if text.contains("quality") {
        parameters.quality_boost = true;
        parameters.resolution_multiplier = 1.5;
    }
    if text.contains("multiple people") {
        parameters.single_person_emphasis = true;
    }
    if text.contains("background") {
        parameters.background_simplification = true;
        parameters.isolation_priority = true;
    }
    if text.contains("character") || text.contains("person") {
        parameters.character_consistency = true;
        parameters.appearance_refinement = true;
    }
    parameters
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionResult {
    pub success: bool,
    pub final_image_path: PathBuf,
    pub processing_method: ProcessingMethod,
    /// Seconds.
    pub processing_time: f64,
    pub user_feedback_recorded: bool,
    pub regeneration_triggered: bool,
    pub error_message: Option<String>,
    pub regeneration_parameters: Option<RegenerationParameters>,
}

impl CorrectionResult {
    fn new(success: bool, final_image_path: &Path, processing_method: ProcessingMethod) -> Self {
        Self {
            success,
            final_image_path: final_image_path.to_path_buf(),
            processing_method,
            processing_time: 0.0,
            user_feedback_recorded: false,
            regeneration_triggered: false,
            error_message: None,
            regeneration_parameters: None,
        }
    }

    fn failed(final_image_path: &Path, processing_method: ProcessingMethod, message: String) -> Self {
        Self {
            error_message: Some(message),
            ..Self::new(false, final_image_path, processing_method)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningData {
    pub user_id: String,
    pub original_image_path: PathBuf,
    pub correction_type: String,
    pub user_decision: String,
    pub crop_coordinates: Option<CropRect>,
    pub rejection_reason: Option<String>,
    pub suggested_modifications: Option<String>,
    pub processing_confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate of one drained batch of [`LearningData`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningPatterns {
    pub batch_size: usize,
    pub decisions: BTreeMap<String, usize>,
    /// Lowercased, trimmed rejection reasons.
    pub rejection_reasons: BTreeMap<String, usize>,
    pub crop_coordinates: Vec<CropRect>,
    /// Per decision, records whose processing confidence was below the low-confidence threshold.
    pub low_confidence_decisions: BTreeMap<String, usize>,
    pub analyzed_at: DateTime<Utc>,
}

impl LearningPatterns {
    fn from_batch(batch: &[LearningData], low_confidence_threshold: f32) -> Self {
        let mut decisions = BTreeMap::new();
        let mut rejection_reasons = BTreeMap::new();
        let mut low_confidence_decisions = BTreeMap::new();
        let mut crop_coordinates = Vec::new();

        for record in batch {
            *decisions.entry(record.user_decision.clone()).or_insert(0) += 1;
            if let Some(reason) = &record.rejection_reason {
                let reason = reason.trim().to_lowercase();
                if !reason.is_empty() {
                    *rejection_reasons.entry(reason).or_insert(0) += 1;
                }
            }
            if let Some(crop) = record.crop_coordinates {
                crop_coordinates.push(crop);
            }
            if record.processing_confidence < low_confidence_threshold {
                *low_confidence_decisions
                    .entry(record.user_decision.clone())
                    .or_insert(0) += 1;
            }
        }

        Self {
            batch_size: batch.len(),
            decisions,
            rejection_reasons,
            crop_coordinates,
            low_confidence_decisions,
            analyzed_at: Utc::now(),
        }
    }

    fn reasons_mentioning(&self, keyword: &str) -> usize {
        self.rejection_reasons
            .iter()
            .filter(|(reason, _)| reason.contains(keyword))
            .map(|(_, count)| count)
            .sum()
    }

    fn recommendations(&self, frequent: usize) -> Vec<String> {
        let mut recommendations = Vec::new();
        if self.reasons_mentioning("quality") >= frequent {
            recommendations.push("raise default quality thresholds".to_string());
        }
        if self.reasons_mentioning("multiple people") >= frequent {
            recommendations.push("improve person-detection sensitivity".to_string());
        }
        if self.reasons_mentioning("background") >= frequent {
            recommendations.push("prefer model-based background removal".to_string());
        }
        if self.crop_coordinates.len() >= frequent {
            recommendations.push("review automatic framing of isolated subjects".to_string());
        }
        recommendations
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningInsights {
    /// Most recent aggregated batch, if any batch has completed.
    pub patterns: Option<LearningPatterns>,
    pub pending_records: usize,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct LearningCache {
    records: Vec<LearningData>,
    latest: Option<LearningPatterns>,
}

/// 監査ログを tracing の `audit` ターゲットに出力する
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_user_action(&self, user_id: &str, action: &str, details: &serde_json::Value) {
        info!(target: "audit", user_id, action, %details, "user action");
    }
}

/// 修正ワークフロー
pub struct CorrectionWorkflow {
    config: CorrectionConfig,
    audit: Arc<dyn AuditSink>,
    regeneration: Option<Arc<dyn RegenerationService>>,
    cache: Mutex<LearningCache>,
}

impl CorrectionWorkflow {
    pub fn new(config: CorrectionConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            audit,
            regeneration: None,
            cache: Mutex::new(LearningCache::default()),
        }
    }

    pub fn with_regeneration_service(mut self, service: Arc<dyn RegenerationService>) -> Self {
        self.regeneration = Some(service);
        self
    }

    /// Applies one decision. Never fails; errors are reported inside the result.
    pub fn process_user_correction(&self, request: &CorrectionRequest) -> CorrectionResult {
        let started = Instant::now();

        let mut result = self.apply_decision(request);
        result.processing_time = started.elapsed().as_secs_f64();
        result.user_feedback_recorded = self.record_learning(request, &result);

        if let Some(message) = &result.error_message {
            debug!(user_id = %request.user_id, method = %result.processing_method, message, "correction note");
        }
        self.audit.log_user_action(
            &request.user_id,
            AUDIT_ACTION,
            &serde_json::json!({
                "decision": request.decision,
                "success": result.success,
                "processing_method": result.processing_method.as_str(),
                "processing_time": result.processing_time,
                "final_image_path": result.final_image_path,
                "regeneration_triggered": result.regeneration_triggered,
            }),
        );
        result
    }

    fn apply_decision(&self, request: &CorrectionRequest) -> CorrectionResult {
        let original = request.original_image_path.as_path();
        if let Err(e) = image::image_dimensions(original) {
            warn!(path = %original.display(), error = %e, "original image is unreadable");
            return CorrectionResult::failed(
                original,
                ProcessingMethod::Error,
                format!("original image {} is unreadable: {}", original.display(), e),
            );
        }

        let decision = match request.decision.parse::<UserDecision>() {
            Ok(decision) => decision,
            Err(message) => {
                return CorrectionResult::failed(original, ProcessingMethod::Fallback, message)
            }
        };

        match decision {
            UserDecision::Accept => match &request.processed_image_path {
                Some(processed) if is_non_empty_file(processed) => {
                    CorrectionResult::new(true, processed, ProcessingMethod::AcceptProcessed)
                }
                _ => CorrectionResult {
                    error_message: Some(
                        "processed image not available, using original".to_string(),
                    ),
                    ..CorrectionResult::new(true, original, ProcessingMethod::AcceptFallback)
                },
            },
            UserDecision::Adjust => {
                let Some(crop) = request.crop_coordinates else {
                    return CorrectionResult::failed(
                        original,
                        ProcessingMethod::AdjustFailed,
                        "crop coordinates are required for adjust".to_string(),
                    );
                };
                match self.crop(original, crop) {
                    Ok(path) => CorrectionResult::new(true, &path, ProcessingMethod::ManualCrop),
                    Err(e) => CorrectionResult::failed(
                        original,
                        ProcessingMethod::AdjustFailed,
                        e.to_string(),
                    ),
                }
            }
            UserDecision::Original => {
                CorrectionResult::new(true, original, ProcessingMethod::UseOriginal)
            }
            UserDecision::Regenerate => self.regenerate(request),
        }
    }

    fn regenerate(&self, request: &CorrectionRequest) -> CorrectionResult {
        let original = request.original_image_path.as_path();
        let parameters = derive_regeneration_parameters(
            request.rejection_reason.as_deref(),
            request.suggested_modifications.as_deref(),
        );

        let mut result = CorrectionResult::new(true, original, ProcessingMethod::Regenerate);
        match &self.regeneration {
            Some(service) => {
                match service.regenerate_with_feedback(&request.user_id, original, &parameters) {
                    Ok(Some(path)) => {
                        result.final_image_path = path;
                        result.regeneration_triggered = true;
                    }
                    Ok(None) => result.regeneration_triggered = true,
                    Err(e) => {
                        warn!(user_id = %request.user_id, error = %e, "regeneration request failed");
                        result.success = false;
                        result.error_message = Some(e.to_string());
                    }
                }
            }
            None => result.regeneration_triggered = true,
        }
        result.regeneration_parameters = Some(parameters);
        result
    }

    /// Writes `<stem>_cropped_<id>.png` next to the original or into `output_dir`.
    fn crop(&self, original: &Path, requested: CropRect) -> Result<PathBuf> {
        let image = image::open(original).map_err(|e| {
            IsolationError::processing(original.display().to_string(), "open for crop", e)
        })?;
        let (width, height) = image.dimensions();
        let rect = requested.clamp_to(width, height);
        if rect != requested {
            debug!(?requested, clamped = ?rect, "crop clamped to image bounds");
        }

        let cropped = image.crop_imm(
            rect.left as u32,
            rect.top as u32,
            rect.width() as u32,
            rect.height() as u32,
        );

        let output_dir = match &self.config.output_dir {
            Some(dir) => dir.clone(),
            None => original.parent().unwrap_or(Path::new("")).to_path_buf(),
        };
        if !output_dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&output_dir).map_err(|e| IsolationError::FileSystem {
                path: output_dir.clone(),
                operation: "create crop directory".to_string(),
                source: e,
            })?;
        }
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let id = Uuid::new_v4().simple().to_string();
        let output = output_dir.join(format!("{}_cropped_{}.png", stem, &id[..8]));

        cropped.save(&output).map_err(|e| {
            IsolationError::processing(output.display().to_string(), "save crop", e)
        })?;
        Ok(output)
    }

    /// Whether the decision was added to the learning cache.
    ///
    /// Anonymous requests cannot be attributed and are left out.
    fn record_learning(&self, request: &CorrectionRequest, result: &CorrectionResult) -> bool {
        if !self.config.learning_enabled {
            return false;
        }
        if request.user_id.trim().is_empty() {
            debug!("correction without a user id, not kept for learning");
            return false;
        }

        let record = LearningData {
            user_id: request.user_id.clone(),
            original_image_path: request.original_image_path.clone(),
            correction_type: result.processing_method.as_str().to_string(),
            user_decision: request.decision.trim().to_ascii_lowercase(),
            crop_coordinates: request.crop_coordinates,
            rejection_reason: request.rejection_reason.clone(),
            suggested_modifications: request.suggested_modifications.clone(),
            processing_confidence: request.processing_confidence,
            timestamp: Utc::now(),
        };

        let mut cache = self.cache.lock();
        cache.records.push(record);
        if cache.records.len() >= self.config.learning_batch_size.max(1) {
            let batch = std::mem::take(&mut cache.records);
            let patterns =
                LearningPatterns::from_batch(&batch, self.config.low_confidence_threshold);
            info!(
                batch_size = patterns.batch_size,
                decisions = ?patterns.decisions,
                "learning batch analyzed"
            );
            cache.latest = Some(patterns);
        }
        true
    }

    pub fn pending_records(&self) -> usize {
        self.cache.lock().records.len()
    }

    pub fn get_learning_insights(&self) -> LearningInsights {
        let cache = self.cache.lock();
        let recommendations = cache
            .latest
            .as_ref()
            .map(|p| p.recommendations(self.config.frequent_reason_threshold))
            .unwrap_or_default();
        LearningInsights {
            patterns: cache.latest.clone(),
            pending_records: cache.records.len(),
            recommendations,
        }
    }
}

fn is_non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
