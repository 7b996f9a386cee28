use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;

use crate::correction::RegenerationParameters;
use crate::detection::PersonDetection;
use crate::errors::Result;
use crate::mask::Mask;
use crate::remote::{RemoteIsolation, RemoteIsolationRequest};

/// ロード済みリソースの実体（型は各リソースが決める）
pub type ResourceInstance = Arc<dyn Any + Send + Sync>;

/// 遅延ロードされる高コストなリソースの抽象化
///
/// The registry drives every state transition; implementations only know how to
/// produce and release their instance.
pub trait ManagedResource: Send + Sync {
    fn name(&self) -> &str;

    /// Expensive loads share a bounded number of concurrent load slots.
    fn is_expensive(&self) -> bool {
        true
    }

    fn load(&self) -> Result<ResourceInstance>;

    fn unload(&self, instance: ResourceInstance) -> Result<()> {
        drop(instance);
        Ok(())
    }
}

/// 人物検出器の抽象化
pub trait PersonDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, image: &RgbImage) -> Result<PersonDetection>;
}

/// モデルベースの前景セグメンテーション
pub trait ForegroundSegmenter: Send + Sync {
    /// Returns a mask with the same extent as `image`.
    fn segment(&self, image: &RgbImage) -> Result<Mask>;
}

/// Network isolation service. Transport failures map to `ServiceUnavailable`,
/// malformed responses to `PrerequisiteCheckFailed`.
pub trait RemoteIsolationBackend: Send + Sync {
    fn isolate(&self, request: &RemoteIsolationRequest) -> Result<RemoteIsolation>;
}

/// 監査ログの出力先
pub trait AuditSink: Send + Sync {
    fn log_user_action(&self, user_id: &str, action: &str, details: &serde_json::Value);
}

/// 画像再生成サービス
pub trait RegenerationService: Send + Sync {
    /// `Ok(Some(path))` when the service produced a replacement synchronously.
    fn regenerate_with_feedback(
        &self,
        user_id: &str,
        original_image_path: &Path,
        parameters: &RegenerationParameters,
    ) -> Result<Option<PathBuf>>;
}
