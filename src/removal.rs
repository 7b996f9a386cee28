use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{IsolationConfig, RgbColor};
use crate::errors::{IsolationError, Result};
use crate::imageops_ai::{composite_on_color, AlphaMaskApplicable};
use crate::mask::Mask;
use crate::traits::ForegroundSegmenter;

/// 背景除去の方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalMethod {
    /// Segmentation model output used as alpha.
    ModelBased,
    /// Soft mask used as alpha.
    Transparent,
    /// Foreground blended over a solid color.
    Uniform,
    /// Hard cutout at mask value 0.5.
    LegacyCv,
}

impl RemovalMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ModelBased => "model-based",
            Self::Transparent => "transparent",
            Self::Uniform => "uniform",
            Self::LegacyCv => "legacy-cv",
        }
    }
}

impl fmt::Display for RemovalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失敗時に試す順序
pub const FALLBACK_ORDER: [RemovalMethod; 3] = [
    RemovalMethod::ModelBased,
    RemovalMethod::Transparent,
    RemovalMethod::Uniform,
];

/// The preferred method first, then every fallback method not yet tried.
pub fn removal_chain(preferred: RemovalMethod) -> Vec<RemovalMethod> {
    std::iter::once(preferred)
        .chain(FALLBACK_ORDER.into_iter().filter(|m| *m != preferred))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemovalOutcome {
    pub method: RemovalMethod,
    pub output_path: PathBuf,
    /// A method other than the preferred one produced the output.
    pub used_fallback: bool,
}

pub struct BackgroundRemover {
    output_dir: Option<PathBuf>,
    output_format: String,
    background: RgbColor,
    segmenter: Option<Arc<dyn ForegroundSegmenter>>,
}

impl BackgroundRemover {
    pub fn from_config(
        config: &IsolationConfig,
        segmenter: Option<Arc<dyn ForegroundSegmenter>>,
    ) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            output_format: config.output_format.clone(),
            background: config.uniform_background_color,
            segmenter,
        }
    }

    /// Tries each method of [`removal_chain`] in turn and stops at the first success.
    ///
    /// When every method fails the error carries one `(method, message)` pair per attempt.
    pub fn remove(
        &self,
        source: &Path,
        image: &RgbImage,
        mask: &Mask,
        preferred: RemovalMethod,
    ) -> Result<RemovalOutcome> {
        let mut attempts = Vec::new();

        for method in removal_chain(preferred) {
            match self.apply(method, source, image, mask) {
                Ok(output_path) => {
                    debug!(%method, path = %output_path.display(), "background removed");
                    return Ok(RemovalOutcome {
                        method,
                        output_path,
                        used_fallback: method != preferred,
                    });
                }
                Err(e) => {
                    warn!(%method, error = %e, "background removal method failed");
                    attempts.push((method.as_str().to_string(), e.to_string()));
                }
            }
        }

        Err(IsolationError::BackgroundRemoval {
            message: format!("all {} methods failed", attempts.len()),
            attempts,
        })
    }

    fn apply(
        &self,
        method: RemovalMethod,
        source: &Path,
        image: &RgbImage,
        mask: &Mask,
    ) -> Result<PathBuf> {
        match method {
            RemovalMethod::ModelBased => {
                let segmenter = self.segmenter.as_ref().ok_or_else(|| {
                    IsolationError::RequiredPrerequisite {
                        message: "no segmentation model configured".to_string(),
                    }
                })?;
                let model_mask = segmenter.segment(image)?;
                let output = self.output_path(source, "rembg", "png")?;
                save(image.apply_alpha_mask(&model_mask)?, &output)
            }
            RemovalMethod::Transparent => {
                let output = self.output_path(source, "isolated", "png")?;
                save(image.apply_alpha_mask(mask)?, &output)
            }
            RemovalMethod::Uniform => {
                let output = self.output_path(source, "uniform_bg", &self.output_format)?;
                save(composite_on_color(image, mask, self.background.0)?, &output)
            }
            RemovalMethod::LegacyCv => {
                let output = self.output_path(source, "isolated", "png")?;
                save(image.apply_alpha_mask(&mask.binarize(0.5))?, &output)
            }
        }
    }

    fn output_path(&self, source: &Path, suffix: &str, extension: &str) -> Result<PathBuf> {
        let output_dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => source.parent().unwrap_or(Path::new("")).to_path_buf(),
        };
        if !output_dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&output_dir).map_err(|e| IsolationError::FileSystem {
                path: output_dir.clone(),
                operation: "create output directory".to_string(),
                source: e,
            })?;
        }

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy())
            .ok_or_else(|| IsolationError::Validation {
                field: "image path".to_string(),
                reason: format!("{:?} has no file name", source),
            })?;
        Ok(output_dir.join(format!("{}_{}.{}", stem, suffix, extension)))
    }
}

fn save<P, C>(image: image::ImageBuffer<P, C>, path: &Path) -> Result<PathBuf>
where
    P: image::PixelWithColorType,
    [P::Subpixel]: image::EncodableLayout,
    C: std::ops::Deref<Target = [P::Subpixel]>,
{
    image
        .save(path)
        .map_err(|e| IsolationError::processing(path.display().to_string(), "save", e))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{portrait_image, MockSegmenter};
    use tempfile::TempDir;

    fn remover(dir: &Path, segmenter: Option<Arc<dyn ForegroundSegmenter>>) -> BackgroundRemover {
        let config = IsolationConfig {
            output_dir: Some(dir.to_path_buf()),
            output_format: "jpg".to_string(),
            ..IsolationConfig::default()
        };
        BackgroundRemover::from_config(&config, segmenter)
    }

    #[test]
    fn test_chain_order() {
        assert_eq!(
            removal_chain(RemovalMethod::Uniform),
            vec![
                RemovalMethod::Uniform,
                RemovalMethod::ModelBased,
                RemovalMethod::Transparent
            ]
        );
        assert_eq!(removal_chain(RemovalMethod::LegacyCv).len(), 4);
        assert_eq!(removal_chain(RemovalMethod::ModelBased), FALLBACK_ORDER.to_vec());
    }

    #[test]
    fn test_transparent_writes_alpha_png() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let image = portrait_image(60, 80);
        let mask = Mask::centered_fallback(60, 80);

        let outcome = remover(temp_dir.path(), None).remove(
            Path::new("/in/person.jpg"),
            &image,
            &mask,
            RemovalMethod::Transparent,
        )?;

        assert_eq!(outcome.output_path, temp_dir.path().join("person_isolated.png"));
        assert!(!outcome.used_fallback);
        let saved = image::open(&outcome.output_path)?.to_rgba8();
        assert_eq!(saved.get_pixel(0, 0)[3], 0);
        assert!(saved.get_pixel(30, 40)[3] > 200);
        Ok(())
    }

    #[test]
    fn test_uniform_uses_output_format() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = remover(temp_dir.path(), None).remove(
            Path::new("shot.png"),
            &portrait_image(40, 40),
            &Mask::centered_fallback(40, 40),
            RemovalMethod::Uniform,
        )?;
        assert_eq!(outcome.output_path, temp_dir.path().join("shot_uniform_bg.jpg"));
        assert!(outcome.output_path.exists());
        Ok(())
    }

    #[test]
    fn test_model_based_uses_segmenter_mask() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = remover(temp_dir.path(), Some(Arc::new(MockSegmenter::full()))).remove(
            Path::new("a.png"),
            &portrait_image(40, 40),
            &Mask::new(40, 40),
            RemovalMethod::ModelBased,
        )?;

        assert_eq!(outcome.method, RemovalMethod::ModelBased);
        assert_eq!(outcome.output_path, temp_dir.path().join("a_rembg.png"));
        let saved = image::open(&outcome.output_path)?.to_rgba8();
        assert!(saved.pixels().all(|p| p[3] == 255));
        Ok(())
    }

    #[test]
    fn test_failing_method_falls_back() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = remover(temp_dir.path(), Some(Arc::new(MockSegmenter::failing()))).remove(
            Path::new("a.png"),
            &portrait_image(40, 40),
            &Mask::centered_fallback(40, 40),
            RemovalMethod::ModelBased,
        )?;

        assert_eq!(outcome.method, RemovalMethod::Transparent);
        assert!(outcome.used_fallback);
        Ok(())
    }

    #[test]
    fn test_total_failure_aggregates_attempts() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let result = remover(temp_dir.path(), None).remove(
            Path::new("a.png"),
            &portrait_image(40, 40),
            &Mask::new(10, 10),
            RemovalMethod::Transparent,
        );

        match result {
            Err(IsolationError::BackgroundRemoval { attempts, .. }) => {
                let methods: Vec<_> = attempts.iter().map(|(m, _)| m.as_str()).collect();
                assert_eq!(methods, vec!["transparent", "model-based", "uniform"]);
            }
            other => panic!("expected BackgroundRemoval, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_legacy_cv_cuts_hard_edges() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = remover(temp_dir.path(), None).remove(
            Path::new("a.png"),
            &portrait_image(60, 80),
            &Mask::centered_fallback(60, 80),
            RemovalMethod::LegacyCv,
        )?;

        let saved = image::open(&outcome.output_path)?.to_rgba8();
        assert!(saved.pixels().all(|p| p[3] == 0 || p[3] == 255));
        Ok(())
    }
}
