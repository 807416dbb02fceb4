// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测器 (Detector)
//! 职责: 图片/帧 → 模型推理 → 归一化 → DetectionResult
//!
//! A detector owns its model and its own configuration. Share one across
//! threads only behind a lock; the worker pool gives each worker its own.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::normalizer::{normalize, RawPrediction};
use super::types::DetectionResult;
use crate::config::DetectorSettings;
use crate::error::{Error, Result};
use crate::models::{InferenceOptions, Model};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// What to run a prediction on.
pub enum Source<'a> {
    Path(&'a Path),
    Image {
        image: &'a image::DynamicImage,
        name: &'a str,
    },
}

pub struct Detector<M> {
    model: M,
    settings: DetectorSettings,
}

impl<M: Model> Detector<M> {
    pub fn new(model: M, settings: DetectorSettings) -> Self {
        model.summary();
        Self { model, settings }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut DetectorSettings {
        &mut self.settings
    }

    pub fn options(&self) -> InferenceOptions {
        self.settings.inference_options()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Never fails: an unreadable file or a failing model yields an empty result.
    pub fn predict(&mut self, source: Source<'_>) -> DetectionResult {
        match source {
            Source::Path(path) => self.predict_path(path),
            Source::Image { image, name } => self.predict_image(image, name),
        }
    }

    pub fn predict_path(&mut self, path: &Path) -> DetectionResult {
        let name = path.to_string_lossy();
        match image::open(path) {
            Ok(image) => self.predict_image(&image, &name),
            Err(e) => {
                let err = Error::image(path, e);
                warn!("file cannot be read: {}", err);
                self.empty(&name)
            }
        }
    }

    pub fn predict_image(&mut self, image: &image::DynamicImage, name: &str) -> DetectionResult {
        match self.predict_raw(image, name) {
            Ok(raw) => {
                let result = normalize(raw);
                debug!("{}: {} detections", name, result.boxes().len());
                result
            }
            Err(e) => {
                warn!("{}: {}", name, e);
                self.empty(name)
            }
        }
    }

    /// The model's own output, before normalization.
    pub fn predict_raw(
        &mut self,
        image: &image::DynamicImage,
        name: &str,
    ) -> Result<RawPrediction> {
        let options = self.options();
        self.model
            .forward(image, name, &options)
            .map_err(|e| Error::ModelInvocation(format!("{:#}", e)))
    }

    /// Predict every image file (by extension) in `dir`, in file name order.
    ///
    /// Fails with [`Error::EmptyFolder`] before any prediction when no file
    /// qualifies.
    pub fn predict_folder<'d>(
        &'d mut self,
        dir: &Path,
    ) -> Result<impl Iterator<Item = DetectionResult> + 'd> {
        let images = list_images(dir)?;
        if images.is_empty() {
            return Err(Error::EmptyFolder(dir.to_path_buf()));
        }
        Ok(images.into_iter().map(move |path| self.predict_path(&path)))
    }

    fn empty(&self, name: &str) -> DetectionResult {
        DetectionResult::new(name, self.model.names().clone())
    }
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        } else {
            debug!("skipping {}", path.display());
        }
    }
    images.sort();
    Ok(images)
}
