// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测系统 (Detection System)
///
/// - Normalizer: 模型原始输出 → DetectionResult
/// - Detector:   持有模型与配置, 单张图片/帧预测
pub mod detector;
pub mod normalizer;
pub mod types;

pub use detector::{is_image_file, Detector, Source, IMAGE_EXTENSIONS};
pub use normalizer::{normalize, normalize_box, RawBox, RawPrediction};
pub use types::{default_class_names, BoundingBox, ClassNames, DetectionResult};
