// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测数据结构
/// Detection data structures shared by the detector, annotator and records.
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// class id → label
pub type ClassNames = BTreeMap<u32, String>;

/// Labels used when the model carries no `names` metadata.
pub fn default_class_names() -> ClassNames {
    [(0, "person"), (1, "gun"), (2, "person")]
        .into_iter()
        .map(|(id, name)| (id, name.to_string()))
        .collect()
}

/// 检测框 (x1, y1, x2, y2), source-image pixel space.
///
/// Serialized as `{"cls": .., "conf": .., "xyxy": [..]}`, the layout stored in
/// prediction records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(rename = "cls")]
    class_id: u32,
    #[serde(rename = "conf")]
    confidence: f32,
    #[serde(rename = "xyxy")]
    coordinates: [f32; 4],
}

impl BoundingBox {
    /// Callers must uphold `x1 <= x2`, `y1 <= y2` and `0 <= confidence <= 1`;
    /// the normalizer is the only producer outside of tests.
    pub(crate) fn new(class_id: u32, confidence: f32, coordinates: [f32; 4]) -> Self {
        Self {
            class_id,
            confidence,
            coordinates,
        }
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn coordinates(&self) -> [f32; 4] {
        self.coordinates
    }

    pub fn x1(&self) -> f32 {
        self.coordinates[0]
    }

    pub fn y1(&self) -> f32 {
        self.coordinates[1]
    }

    pub fn x2(&self) -> f32 {
        self.coordinates[2]
    }

    pub fn y2(&self) -> f32 {
        self.coordinates[3]
    }

    pub fn width(&self) -> f32 {
        self.x2() - self.x1()
    }

    pub fn height(&self) -> f32 {
        self.y2() - self.y1()
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection_area(&self, another: &BoundingBox) -> f32 {
        let l = self.x1().max(another.x1());
        let r = self.x2().min(another.x2());
        let t = self.y1().max(another.y1());
        let b = self.y2().min(another.y2());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn iou(&self, another: &BoundingBox) -> f32 {
        let inter = self.intersection_area(another);
        let union = self.area() + another.area() - inter;
        if union <= 0. {
            return 0.;
        }
        inter / union
    }
}

/// Result of one predict call on one image or frame.
///
/// Everything except `boxes` is fixed at construction; boxes are attached
/// right after with [`DetectionResult::with_boxes`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    source_path: String,
    file_name: String,
    class_names: ClassNames,
    boxes: Vec<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    save_dir: Option<String>,
}

impl DetectionResult {
    pub fn new(source_path: impl Into<String>, class_names: ClassNames) -> Self {
        let source_path = source_path.into();
        let file_name = Path::new(&source_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            source_path,
            file_name,
            class_names,
            boxes: Vec::new(),
            save_dir: None,
        }
    }

    pub fn with_save_dir(mut self, save_dir: Option<String>) -> Self {
        self.save_dir = save_dir;
        self
    }

    pub fn with_boxes(mut self, boxes: Vec<BoundingBox>) -> Self {
        self.boxes = boxes;
        self
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn class_names(&self) -> &ClassNames {
        &self.class_names
    }

    pub fn class_name(&self, class_id: u32) -> Option<&str> {
        self.class_names.get(&class_id).map(String::as_str)
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn save_dir(&self) -> Option<&str> {
        self.save_dir.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
