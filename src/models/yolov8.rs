// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use log::debug;
use ndarray::{s, Array, Axis, IxDyn};

use super::{InferenceOptions, Model};
use crate::config::ModelSettings;
use crate::detection::{ClassNames, RawBox, RawPrediction};
use crate::{OrtBackend, OrtConfig};

const CXYWH_OFFSET: usize = 4;

/// Candidate box before NMS, corners in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    xyxy: [f32; 4],
    id: usize,
    confidence: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.xyxy[2] - self.xyxy[0]) * (self.xyxy[3] - self.xyxy[1])
    }

    fn iou(&self, another: &Candidate) -> f32 {
        let l = self.xyxy[0].max(another.xyxy[0]);
        let r = self.xyxy[2].min(another.xyxy[2]);
        let t = self.xyxy[1].max(another.xyxy[1]);
        let b = self.xyxy[3].min(another.xyxy[3]);
        let inter = (r - l).max(0.) * (b - t).max(0.);
        let union = self.area() + another.area() - inter;
        if union <= 0. {
            0.
        } else {
            inter / union
        }
    }

    /// Mirror around the vertical axis of an image `width` pixels wide.
    fn flip_x(mut self, width: f32) -> Self {
        let [x1, y1, x2, y2] = self.xyxy;
        self.xyxy = [width - x2, y1, width - x1, y2];
        self
    }
}

/// Class-aware NMS: boxes of different classes never suppress each other.
fn non_max_suppression(xs: &mut Vec<Candidate>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].id == xs[index].id && xs[prev_index].iou(&xs[index]) > iou_threshold
            {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// letterbox 缩放比例: (ratio, new_w, new_h)
fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

pub struct YOLOv8 {
    engine: OrtBackend,
    height: u32,
    width: u32,
    names: ClassNames,
}

impl YOLOv8 {
    /// Load weights; `fallback_names` is used when the model has no `names` metadata.
    pub fn new(config: &ModelSettings, fallback_names: ClassNames) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig {
            f: config.path.clone(),
            ep: config.ep,
            device_id: config.device_id,
            image_size: (config.height, config.width),
        })
        .with_context(|| format!("failed to build YOLOv8 from {}", config.path.display()))?;

        let names = engine.names().cloned().unwrap_or(fallback_names);
        let (height, width) = (engine.height(), engine.width());

        Ok(Self {
            engine,
            height,
            width,
            names,
        })
    }

    /// Letterbox into the top-left corner of a `width`×`height` canvas filled with gray.
    pub fn preprocess(&self, xs: &[DynamicImage]) -> Result<Array<f32, IxDyn>> {
        let mut ys = Array::ones((xs.len(), 3, self.height as usize, self.width as usize)).into_dyn();
        ys.fill(144.0 / 255.0);
        for (idx, x) in xs.iter().enumerate() {
            let (w0, h0) = x.dimensions();
            let (_, w_new, h_new) =
                scale_wh(w0 as f32, h0 as f32, self.width as f32, self.height as f32);
            let img = x.resize_exact(
                (w_new as u32).max(1),
                (h_new as u32).max(1),
                image::imageops::FilterType::Triangle,
            );

            for (x, y, rgb) in img.pixels() {
                let x = x as usize;
                let y = y as usize;
                let [r, g, b, _] = rgb.0;
                ys[[idx, 0, y, x]] = (r as f32) / 255.0;
                ys[[idx, 1, y, x]] = (g as f32) / 255.0;
                ys[[idx, 2, y, x]] = (b as f32) / 255.0;
            }
        }
        Ok(ys)
    }

    /// Decode `[batch, 4 + nc, anchors]` into per-image candidates after NMS.
    fn postprocess(
        &self,
        xs: &[Array<f32, IxDyn>],
        xs0: &[DynamicImage],
        options: &InferenceOptions,
    ) -> Result<Vec<Vec<Candidate>>> {
        let preds = xs.first().context("model produced no outputs")?;
        if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
            anyhow::bail!("unexpected detection output shape {:?}", preds.shape());
        }
        let nc = preds.shape()[1] - CXYWH_OFFSET;

        let mut ys = Vec::with_capacity(xs0.len());
        for (idx, anchor) in preds.axis_iter(Axis(0)).enumerate() {
            let image = xs0.get(idx).context("more predictions than images")?;
            let width_original = image.width() as f32;
            let height_original = image.height() as f32;
            let ratio =
                (self.width as f32 / width_original).min(self.height as f32 / height_original);

            let mut data = Vec::new();
            for pred in anchor.axis_iter(Axis(1)) {
                let bbox = pred.slice(s![0..CXYWH_OFFSET]);
                let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

                let Some((id, &confidence)) = clss
                    .into_iter()
                    .enumerate()
                    .reduce(|max, x| if x.1 > max.1 { x } else { max })
                else {
                    continue;
                };

                if confidence < options.conf {
                    continue;
                }

                let cx = bbox[0] / ratio;
                let cy = bbox[1] / ratio;
                let w = bbox[2] / ratio;
                let h = bbox[3] / ratio;
                let x1 = (cx - w / 2.).clamp(0., width_original);
                let y1 = (cy - h / 2.).clamp(0., height_original);
                let x2 = (cx + w / 2.).clamp(x1, width_original);
                let y2 = (cy + h / 2.).clamp(y1, height_original);

                data.push(Candidate {
                    xyxy: [x1, y1, x2, y2],
                    id,
                    confidence,
                });
            }

            non_max_suppression(&mut data, options.iou);
            ys.push(data);
        }

        Ok(ys)
    }

    fn infer(&mut self, images: &[DynamicImage], options: &InferenceOptions) -> Result<Vec<Vec<Candidate>>> {
        let t_pre = std::time::Instant::now();
        let xs = self.preprocess(images)?;
        debug!("[Model Preprocess]: {:?}", t_pre.elapsed());

        let ys = self.engine.run(xs)?;

        let t_post = std::time::Instant::now();
        let ys = self.postprocess(&ys, images, options)?;
        debug!("[Model Postprocess]: {:?}", t_post.elapsed());
        Ok(ys)
    }

    pub fn engine(&self) -> &OrtBackend {
        &self.engine
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Model for YOLOv8 {
    fn forward(
        &mut self,
        image: &DynamicImage,
        path: &str,
        options: &InferenceOptions,
    ) -> Result<RawPrediction> {
        let mut candidates = self
            .infer(std::slice::from_ref(image), options)?
            .pop()
            .unwrap_or_default();

        if options.augment {
            // 测试时增强: 水平翻转后再推理一次, 合并两组结果
            let flipped = image.fliph();
            let width = image.width() as f32;
            let mirrored = self
                .infer(std::slice::from_ref(&flipped), options)?
                .pop()
                .unwrap_or_default();
            candidates.extend(mirrored.into_iter().map(|c| c.flip_x(width)));
            non_max_suppression(&mut candidates, options.iou);
        }

        Ok(RawPrediction {
            path: path.to_string(),
            names: self.names.clone(),
            boxes: candidates
                .into_iter()
                .map(|c| RawBox::new(c.id as f32, c.confidence, c.xyxy))
                .collect(),
            save_dir: None,
        })
    }

    fn names(&self) -> &ClassNames {
        &self.names
    }

    fn summary(&self) {
        log::info!(
            "YOLOv8 > EP: {:?}, Height: {}, Width: {}, nc: {}",
            self.engine.ep(),
            self.height,
            self.width,
            self.names.len()
        );
    }
}
