use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Args};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::removal::RemovalMethod;
use crate::resilience::{BreakerConfig, RetryConfig};

/// 分離パイプラインの設定
///
/// The surrounding application owns the values; the pipeline only reads them.
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enabled: bool,

    #[arg(long, default_value_t = 0.5)]
    pub detection_confidence_threshold: f32,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub edge_refinement_enabled: bool,

    #[arg(long, value_enum, default_value_t = RemovalMethod::Transparent)]
    pub background_removal_method: RemovalMethod,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fallback_to_original: bool,

    /// Wall-clock budget per image, in seconds.
    #[arg(long, default_value_t = 30)]
    pub max_processing_time: u64,

    #[arg(long, default_value = "png", value_parser = check_format)]
    pub output_format: String,

    #[arg(long, default_value = "255,255,255")]
    pub uniform_background_color: RgbColor,

    /// Base URL of the remote isolation service.
    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long, default_value_t = 30)]
    pub timeout_seconds: u64,

    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    #[arg(long, default_value = "u2net_human_seg")]
    pub model_default: String,

    #[arg(long)]
    pub detection_model_path: Option<PathBuf>,

    #[arg(long)]
    pub segmentation_model_path: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// Where derived images are written; next to the input when unset.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    pub max_concurrent_loads: usize,

    #[arg(long, default_value_t = 60)]
    pub resource_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub failure_threshold: u32,

    #[arg(long, default_value_t = 60)]
    pub recovery_timeout_secs: u64,

    #[arg(long, default_value_t = 500)]
    pub base_delay_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detection_confidence_threshold: 0.5,
            edge_refinement_enabled: true,
            background_removal_method: RemovalMethod::Transparent,
            fallback_to_original: true,
            max_processing_time: 30,
            output_format: "png".to_string(),
            uniform_background_color: RgbColor::WHITE,
            endpoint: None,
            timeout_seconds: 30,
            retries: 2,
            model_default: "u2net_human_seg".to_string(),
            detection_model_path: None,
            segmentation_model_path: None,
            device_id: 0,
            output_dir: None,
            max_concurrent_loads: 2,
            resource_timeout_secs: 60,
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            base_delay_ms: 500,
        }
    }
}

impl IsolationConfig {
    pub const fn max_processing_duration(&self) -> Duration {
        Duration::from_secs(self.max_processing_time)
    }

    pub const fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    /// ローカルパイプライン用のリトライ設定
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            ..RetryConfig::default()
        }
    }

    /// Remote calls only retry transport-level failures.
    pub fn remote_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            retry_on: vec![ErrorKind::Timeout, ErrorKind::Connection, ErrorKind::Io],
            ..RetryConfig::default()
        }
    }

    pub const fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

/// 修正ワークフローの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Crops are written here; next to the original when unset.
    pub output_dir: Option<PathBuf>,
    /// When off, decisions are still applied and audited but not kept for learning.
    pub learning_enabled: bool,
    pub learning_batch_size: usize,
    pub low_confidence_threshold: f32,
    /// Occurrences within one batch before a rejection keyword triggers a recommendation.
    pub frequent_reason_threshold: usize,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            learning_enabled: true,
            learning_batch_size: 10,
            low_confidence_threshold: 0.5,
            frequent_reason_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbColor(pub [u8; 3]);

impl RgbColor {
    pub const WHITE: Self = Self([255, 255, 255]);
}

impl FromStr for RgbColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let channels = s
            .split(',')
            .map(|c| c.trim().parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid color `{}`: {}", s, e))?;

        match channels.as_slice() {
            [r, g, b] => Ok(Self([*r, *g, *b])),
            _ => Err(format!("expected `r,g,b`, got `{}`", s)),
        }
    }
}

impl std::fmt::Display for RgbColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "{},{},{}", r, g, b)
    }
}

pub(crate) fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_parsing() {
        assert_eq!("0, 128,255".parse::<RgbColor>(), Ok(RgbColor([0, 128, 255])));
        assert!("0,128".parse::<RgbColor>().is_err());
        assert!("0,128,256".parse::<RgbColor>().is_err());
        assert_eq!(RgbColor([1, 2, 3]).to_string(), "1,2,3");
    }

    #[test]
    fn test_output_format_check() {
        assert_eq!(check_format("png"), Ok("png".to_string()));
        assert!(check_format("txt").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = IsolationConfig::default();
        assert!(config.enabled);
        assert!(config.fallback_to_original);
        assert_eq!(config.max_processing_duration(), Duration::from_secs(30));
        assert_eq!(config.retry_config().max_retries, 2);
        assert_eq!(config.breaker_config().failure_threshold, 5);
        assert!(!config
            .remote_retry_config()
            .retry_on
            .contains(&ErrorKind::Detection));

        let correction = CorrectionConfig::default();
        assert_eq!(correction.learning_batch_size, 10);
    }
}
