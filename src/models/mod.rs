// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型统一接口 (Model adapters)
///
/// A model adapter turns one decoded image into a [`RawPrediction`]. Everything
/// downstream (normalizer, annotator, media pipeline) only sees that record,
/// so another detection library only needs a new implementation of [`Model`].
///
/// ## 核心流程
/// ```text
/// 原始图片 → preprocess → 张量 → run → 原始输出 → postprocess → RawPrediction
/// ```
use anyhow::Result;
use image::DynamicImage;

use crate::detection::{ClassNames, RawPrediction};

pub mod yolov8;

pub use yolov8::YOLOv8;

/// Per-call inference knobs. Owned by the detector, never by the model, so a
/// model instance holds no mutable configuration of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceOptions {
    /// minimum score for a detection to be reported
    pub conf: f32,
    pub iou: f32,
    /// test-time augmentation
    pub augment: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            conf: 0.25,
            iou: 0.45,
            augment: false,
        }
    }
}

pub trait Model: Send {
    /// Run the model on one image.
    ///
    /// `path` is recorded in the returned prediction; it may be a file path or
    /// a synthetic name such as `frame_00012`.
    fn forward(
        &mut self,
        image: &DynamicImage,
        path: &str,
        options: &InferenceOptions,
    ) -> Result<RawPrediction>;

    /// class id → label table reported by the model
    fn names(&self) -> &ClassNames;

    fn summary(&self) {}
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn forward(
        &mut self,
        image: &DynamicImage,
        path: &str,
        options: &InferenceOptions,
    ) -> Result<RawPrediction> {
        (**self).forward(image, path, options)
    }

    fn names(&self) -> &ClassNames {
        (**self).names()
    }

    fn summary(&self) {
        (**self).summary()
    }
}
