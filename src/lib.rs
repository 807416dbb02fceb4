// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 检测框与标签绘制
pub mod config; // JSON配置 + 命令行参数
pub mod detection; // 检测与结果归一化
pub mod error;
pub mod media; // 图片/视频标注流水线
pub mod models; // 模型接口与具体实现
pub mod records; // 上传与预测记录
pub mod worker; // 视频后台任务

pub mod ort_backend;

pub use crate::annotate::{label_for, Annotator, Palette};
pub use crate::config::{Args, Command, Settings};
pub use crate::detection::{BoundingBox, ClassNames, DetectionResult, Detector, Source};
pub use crate::error::{Error, MalformedBox, Result};
pub use crate::media::{MediaPipeline, VideoReport};
pub use crate::models::{InferenceOptions, Model, YOLOv8};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use crate::records::{MediaKind, MediaRecord, PredictionRecord};
pub use crate::worker::{VideoJobRunner, VideoOutcome, VideoWorkerPool};
