// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 预测结果归一化 (Prediction normalizer)
//!
//! Model adapters hand over a [`RawPrediction`]: the minimal record of fields
//! the rest of the pipeline needs. Per-box fields are kept as loose tensors
//! (`cls`, `conf` hold one value each, `xyxy` holds four) so that an adapter
//! can pass its output through without validating it. Swapping the model
//! library only means writing a new adapter that fills this record.

use log::warn;

use super::types::{BoundingBox, ClassNames, DetectionResult};
use crate::error::{Error, MalformedBox};

/// One detected object as emitted by a model adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBox {
    pub cls: Vec<f32>,
    pub conf: Vec<f32>,
    pub xyxy: Vec<f32>,
}

impl RawBox {
    pub fn new(cls: f32, conf: f32, xyxy: [f32; 4]) -> Self {
        Self {
            cls: vec![cls],
            conf: vec![conf],
            xyxy: xyxy.to_vec(),
        }
    }
}

/// Raw model output for one image or frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPrediction {
    pub path: String,
    pub names: ClassNames,
    pub boxes: Vec<RawBox>,
    pub save_dir: Option<String>,
}

fn item(field: &'static str, values: &[f32]) -> Result<f32, MalformedBox> {
    match values {
        [v] if v.is_finite() => Ok(*v),
        [_] => Err(MalformedBox::NotFinite { field }),
        _ => Err(MalformedBox::Shape {
            field,
            len: values.len(),
            expected: 1,
        }),
    }
}

/// Validate a single raw box.
pub fn normalize_box(raw: &RawBox) -> Result<BoundingBox, MalformedBox> {
    let cls = item("cls", &raw.cls)?;
    let conf = item("conf", &raw.conf)?;

    let [x1, y1, x2, y2] = match raw.xyxy.as_slice() {
        &[x1, y1, x2, y2] => [x1, y1, x2, y2],
        other => {
            return Err(MalformedBox::Shape {
                field: "xyxy",
                len: other.len(),
                expected: 4,
            })
        }
    };
    if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
        return Err(MalformedBox::NotFinite { field: "xyxy" });
    }

    if cls < 0. || cls.fract() != 0. || cls > u32::MAX as f32 {
        return Err(MalformedBox::ClassId(cls));
    }
    if !(0.0..=1.0).contains(&conf) {
        return Err(MalformedBox::Confidence(conf));
    }
    if x1 > x2 || y1 > y2 {
        return Err(MalformedBox::Inverted { x1, y1, x2, y2 });
    }

    Ok(BoundingBox::new(cls as u32, conf, [x1, y1, x2, y2]))
}

/// Convert a raw prediction into a [`DetectionResult`].
///
/// Malformed boxes are logged and dropped; the rest keep the model's order.
pub fn normalize(raw: RawPrediction) -> DetectionResult {
    let RawPrediction {
        path,
        names,
        boxes,
        save_dir,
    } = raw;

    let result = DetectionResult::new(path, names).with_save_dir(save_dir);

    let boxes = boxes
        .iter()
        .enumerate()
        .filter_map(|(idx, raw)| match normalize_box(raw) {
            Ok(bbox) => Some(bbox),
            Err(e) => {
                warn!(
                    "dropping box #{} of {}: {}",
                    idx,
                    result.source_path(),
                    Error::MalformedDetection(e)
                );
                None
            }
        })
        .collect();

    result.with_boxes(boxes)
}
