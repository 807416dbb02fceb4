// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 标注 (Annotator)
//! 职责: DetectionResult + 原始图片 → 带检测框与标签的图片

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::{info, warn};
use phf::phf_map;

use crate::config::AnnotatorSettings;
use crate::detection::{BoundingBox, DetectionResult};
use crate::error::{Error, Result};

pub const PURPLE: Rgb<u8> = Rgb([128, 0, 128]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 128, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// 类别颜色: 0 person, 1 gun, 2 person
static CLASS_COLORS: phf::Map<u32, [u8; 3]> = phf_map! {
    0u32 => [128, 0, 128],
    1u32 => [255, 0, 0],
    2u32 => [0, 128, 0],
};

/// class id → box color, with an explicit default for unmapped ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    colors: BTreeMap<u32, Rgb<u8>>,
    default: Rgb<u8>,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: CLASS_COLORS
                .entries()
                .map(|(id, rgb)| (*id, Rgb(*rgb)))
                .collect(),
            default: WHITE,
        }
    }
}

impl Palette {
    pub fn with_overrides(overrides: &BTreeMap<u32, [u8; 3]>) -> Self {
        let mut palette = Self::default();
        for (id, rgb) in overrides {
            palette.colors.insert(*id, Rgb(*rgb));
        }
        palette
    }

    pub fn color(&self, class_id: u32) -> Rgb<u8> {
        self.colors.get(&class_id).copied().unwrap_or(self.default)
    }

    pub fn default_color(&self) -> Rgb<u8> {
        self.default
    }
}

/// `"<Label> <confidence>"`, first letter capitalized, two decimals.
///
/// Ids without a name fall back to the numeric id.
pub fn label_for(result: &DetectionResult, bbox: &BoundingBox) -> String {
    let text = match result.class_name(bbox.class_id()) {
        Some(name) => format!("{} {:.2}", name, bbox.confidence()),
        None => format!("{} {:.2}", bbox.class_id(), bbox.confidence()),
    };
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => text,
    }
}

pub struct Annotator {
    palette: Palette,
    line_width: u32,
    font: Option<FontVec>,
    font_scale: PxScale,
    jpeg_quality: u8,
}

impl Annotator {
    pub fn new(settings: &AnnotatorSettings, line_width: u32) -> Self {
        let font = settings.font_path.as_deref().and_then(load_font);
        if font.is_none() {
            warn!("no label font available, boxes will be drawn without labels");
        }
        Self {
            palette: Palette::with_overrides(&settings.palette),
            line_width: line_width.max(1),
            font,
            font_scale: PxScale::from(settings.font_size),
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
        }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn line_width(&self) -> u32 {
        self.line_width
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every box of `result` onto `canvas`.
    pub fn render_mut(&self, result: &DetectionResult, canvas: &mut RgbImage) {
        let lw = self.line_width as i32;
        // 坐标限制在画布外一个线宽以内, 画布外的边框仍不可见
        let margin = (lw + 1) as f32;
        let max_x = canvas.width() as f32 + margin;
        let max_y = canvas.height() as f32 + margin;
        for bbox in result.boxes() {
            let color = self.palette.color(bbox.class_id());

            let left = bbox.x1().round().clamp(-margin, max_x) as i32;
            let top = bbox.y1().round().clamp(-margin, max_y) as i32;
            let right = bbox.x2().round().clamp(-margin, max_x) as i32;
            let bottom = bbox.y2().round().clamp(-margin, max_y) as i32;

            // 线宽向内绘制
            for i in 0..lw {
                let w = right - left - 2 * i + 1;
                let h = bottom - top - 2 * i + 1;
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect = Rect::at(left + i, top + i).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(canvas, rect, color);
            }

            if let Some(font) = &self.font {
                let text = label_for(result, bbox);
                draw_text_mut(
                    canvas,
                    color,
                    left + lw,
                    top + lw,
                    self.font_scale,
                    font,
                    &text,
                );
            }
        }
    }

    /// Annotated copy of `image`, same dimensions.
    pub fn render(&self, result: &DetectionResult, image: &DynamicImage) -> RgbImage {
        let mut canvas = image.to_rgb8();
        self.render_mut(result, &mut canvas);
        canvas
    }

    /// Annotate and encode as JPEG.
    pub fn draw(&self, result: &DetectionResult, image: &DynamicImage) -> Result<Vec<u8>> {
        self.draw_as(result, image, ImageFormat::Jpeg)
    }

    pub fn draw_as(
        &self,
        result: &DetectionResult,
        image: &DynamicImage,
        format: ImageFormat,
    ) -> Result<Vec<u8>> {
        let canvas = self.render(result, image);
        self.encode(&canvas, format)
            .map_err(|e| Error::image(result.source_path(), e))
    }

    /// Re-open the image at the result's source path and annotate it in the
    /// format its extension names.
    pub fn draw_from_source(&self, result: &DetectionResult) -> Result<Vec<u8>> {
        let path = Path::new(result.source_path());
        let image = image::open(path).map_err(|e| Error::image(path, e))?;
        self.draw_as(result, &image, output_format(path))
    }

    fn encode(&self, canvas: &RgbImage, format: ImageFormat) -> image::ImageResult<Vec<u8>> {
        let mut buffer = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                let mut encoder = JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality);
                encoder.encode_image(canvas)?;
            }
            other => canvas.write_to(&mut Cursor::new(&mut buffer), other)?,
        }
        Ok(buffer)
    }
}

/// Format to write an annotated image in: the one named by the extension when
/// it can be encoded, JPEG otherwise.
pub fn output_format(path: &Path) -> ImageFormat {
    ImageFormat::from_path(path)
        .ok()
        .filter(|f| f.can_write())
        .unwrap_or(ImageFormat::Jpeg)
}

fn load_font(path: &Path) -> Option<FontVec> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("cannot read font {}: {}", path.display(), e);
            return None;
        }
    };
    match FontVec::try_from_vec(bytes) {
        Ok(font) => {
            info!("label font loaded from {}", path.display());
            Some(font)
        }
        Err(e) => {
            warn!("invalid font {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{default_class_names, normalize, RawBox, RawPrediction};
    use image::GenericImageView;

    fn no_font() -> AnnotatorSettings {
        AnnotatorSettings {
            font_path: None,
            ..AnnotatorSettings::default()
        }
    }

    fn scenario() -> DetectionResult {
        normalize(RawPrediction {
            path: "frame.jpg".into(),
            names: default_class_names(),
            boxes: vec![
                RawBox::new(0., 0.9, [10., 10., 50., 50.]),
                RawBox::new(1., 0.8, [60., 60., 120., 120.]),
            ],
            save_dir: None,
        })
    }

    #[test]
    fn test_palette_lookup() {
        let palette = Palette::default();
        assert_eq!(palette.color(0), PURPLE);
        assert_eq!(palette.color(1), RED);
        assert_eq!(palette.color(2), GREEN);
        assert_eq!(palette.color(42), WHITE);

        let mut overrides = BTreeMap::new();
        overrides.insert(1, [1, 2, 3]);
        overrides.insert(5, [4, 5, 6]);
        let palette = Palette::with_overrides(&overrides);
        assert_eq!(palette.color(1), Rgb([1, 2, 3]));
        assert_eq!(palette.color(5), Rgb([4, 5, 6]));
        assert_eq!(palette.color(0), PURPLE);
    }

    #[test]
    fn test_labels() {
        let r = scenario();
        assert_eq!(label_for(&r, &r.boxes()[0]), "Person 0.90");
        assert_eq!(label_for(&r, &r.boxes()[1]), "Gun 0.80");

        let unnamed = normalize(RawPrediction {
            path: "x.jpg".into(),
            boxes: vec![RawBox::new(9., 0.456, [0., 0., 1., 1.])],
            ..RawPrediction::default()
        });
        assert_eq!(label_for(&unnamed, &unnamed.boxes()[0]), "9 0.46");
    }

    #[test]
    fn test_two_detections_two_colors() {
        let annotator = Annotator::new(&no_font(), 2);
        let image = DynamicImage::new_rgb8(200, 160);
        let out = annotator.render(&scenario(), &image);

        assert_eq!(out.dimensions(), (200, 160));
        // outer and inner line of each border
        assert_eq!(*out.get_pixel(10, 30), PURPLE);
        assert_eq!(*out.get_pixel(11, 30), PURPLE);
        assert_eq!(*out.get_pixel(30, 50), PURPLE);
        assert_eq!(*out.get_pixel(60, 90), RED);
        assert_eq!(*out.get_pixel(120, 90), RED);
        assert_eq!(*out.get_pixel(119, 90), RED);
        // interiors untouched
        assert_eq!(*out.get_pixel(12, 30), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(90, 90), Rgb([0, 0, 0]));
        assert_ne!(PURPLE, RED);
    }

    #[test]
    fn test_box_outside_image_is_clipped() {
        let annotator = Annotator::new(&no_font(), 3);
        let r = normalize(RawPrediction {
            path: "x.jpg".into(),
            names: default_class_names(),
            boxes: vec![
                RawBox::new(1., 0.5, [-20., -20., 400., 400.]),
                RawBox::new(0., 0.5, [5., 5., 9., 9.]),
            ],
            save_dir: None,
        });
        let out = annotator.render(&r, &DynamicImage::new_rgb8(64, 48));
        assert_eq!(out.dimensions(), (64, 48));
        assert_eq!(*out.get_pixel(5, 7), PURPLE);
    }

    #[test]
    fn test_huge_box_is_bounded() {
        let annotator = Annotator::new(&no_font(), 3);
        let r = normalize(RawPrediction {
            path: "x.jpg".into(),
            names: default_class_names(),
            boxes: vec![
                RawBox::new(1., 0.5, [-1e10, -1e10, 1e10, 1e10]),
                RawBox::new(0., 0.5, [-1e10, 10., 20., 1e10]),
            ],
            save_dir: None,
        });
        let out = annotator.render(&r, &DynamicImage::new_rgb8(64, 48));
        assert_eq!(out.dimensions(), (64, 48));
        // edges of the first box stay off canvas
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(63, 47), Rgb([0, 0, 0]));
        // the second box only shows its finite top and right edges
        assert_eq!(*out.get_pixel(5, 10), PURPLE);
        assert_eq!(*out.get_pixel(20, 30), PURPLE);
        assert_eq!(*out.get_pixel(5, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_from_source_keeps_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.png");
        RgbImage::from_pixel(200, 160, Rgb([0, 0, 0])).save(&path).unwrap();

        let r = normalize(RawPrediction {
            path: path.to_string_lossy().into_owned(),
            names: default_class_names(),
            boxes: vec![RawBox::new(1., 0.8, [60., 60., 120., 120.])],
            save_dir: None,
        });
        let annotator = Annotator::new(&no_font(), 2);
        let bytes = annotator.draw_from_source(&r).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(*decoded.get_pixel(60, 90), RED);

        let missing = DetectionResult::new(
            dir.path().join("gone.png").to_string_lossy(),
            default_class_names(),
        );
        assert!(matches!(
            annotator.draw_from_source(&missing),
            Err(Error::Image { .. })
        ));
        assert_eq!(output_format(Path::new("a.webm")), ImageFormat::Jpeg);
    }

    #[test]
    fn test_encoded_output_keeps_dimensions() {
        let annotator = Annotator::new(&no_font(), 2);
        let image = DynamicImage::new_rgb8(200, 160);

        let jpeg = annotator.draw(&scenario(), &image).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (200, 160));

        let png = annotator
            .draw_as(&scenario(), &image, ImageFormat::Png)
            .unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(*decoded.get_pixel(60, 90), RED);
    }

    #[test]
    fn test_empty_result_is_passthrough() {
        let annotator = Annotator::new(&no_font(), 2);
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([7, 8, 9])));
        let empty = DetectionResult::new("x.jpg", default_class_names());
        assert_eq!(annotator.render(&empty, &image), image.to_rgb8());
    }

    #[test]
    fn test_missing_font_is_not_fatal() {
        let settings = AnnotatorSettings {
            font_path: Some("does/not/exist.ttf".into()),
            ..AnnotatorSettings::default()
        };
        let annotator = Annotator::new(&settings, 2);
        assert!(!annotator.has_font());
    }
}
