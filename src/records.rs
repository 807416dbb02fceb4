// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 上传与预测记录
//! Per-user storage layout and the JSON records handed back to callers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::{BoundingBox, DetectionResult};

pub const IMAGES_DIR: &str = "images";
pub const PREDICTIONS_DIR: &str = "images_predict";
pub const VIDEOS_DIR: &str = "videos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// A file a user uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub owner: String,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn new(owner: impl Into<String>, kind: MediaKind, path: impl Into<PathBuf>) -> Self {
        Self {
            owner: owner.into(),
            kind,
            path: path.into(),
            uploaded_at: Utc::now(),
        }
    }

    /// Where an upload named `file_name` lands under `root`.
    pub fn storage_path(root: &Path, kind: MediaKind, owner: &str, file_name: &str) -> PathBuf {
        let dir = match kind {
            MediaKind::Image => images_dir(owner),
            MediaKind::Video => videos_dir(owner),
        };
        root.join(dir).join(file_name)
    }
}

/// An original image, its annotated copy and the boxes drawn on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub original: PathBuf,
    pub annotated: PathBuf,
    pub boxes: Vec<BoundingBox>,
}

impl PredictionRecord {
    pub fn from_detection(
        original: impl Into<PathBuf>,
        annotated: impl Into<PathBuf>,
        result: &DetectionResult,
    ) -> Self {
        Self {
            original: original.into(),
            annotated: annotated.into(),
            boxes: result.boxes().to_vec(),
        }
    }
}

pub fn images_dir(owner: &str) -> PathBuf {
    Path::new(IMAGES_DIR).join(owner)
}

pub fn predictions_dir(owner: &str) -> PathBuf {
    Path::new(PREDICTIONS_DIR).join(owner)
}

pub fn videos_dir(owner: &str) -> PathBuf {
    Path::new(VIDEOS_DIR).join(owner)
}
