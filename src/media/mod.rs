// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 媒体流水线 (Media Pipeline)
//! 职责: 读取图片/视频 → 检测 → 标注 → 原子替换或写入目标目录
//!
//! Outputs are written to a sibling temp file and renamed over the target
//! only once complete, so a failed run never leaves a truncated file behind.

pub mod ffmpeg;
pub mod video;

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use log::{debug, info, warn};

use crate::annotate::{output_format, Annotator};
use crate::config::{Settings, VideoSettings};
use crate::detection::{DetectionResult, Detector};
use crate::error::{Error, Result};
use crate::models::Model;
use crate::records::PredictionRecord;

pub use self::ffmpeg::{probe, FfmpegFrameSink, FfmpegFrameSource};
pub use self::video::{FrameSink, FrameSource, VideoInfo, VideoReport};

pub struct MediaPipeline<M> {
    detector: Detector<M>,
    annotator: Annotator,
    video: VideoSettings,
}

impl<M: Model> MediaPipeline<M> {
    pub fn new(detector: Detector<M>, annotator: Annotator, video: VideoSettings) -> Self {
        Self {
            detector,
            annotator,
            video,
        }
    }

    pub fn from_settings(model: M, settings: &Settings) -> Self {
        let annotator = Annotator::new(&settings.annotator, settings.detector.line_width);
        let detector = Detector::new(model, settings.detector.clone());
        Self::new(detector, annotator, settings.video.clone())
    }

    pub fn detector(&self) -> &Detector<M> {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut Detector<M> {
        &mut self.detector
    }

    pub fn annotator(&self) -> &Annotator {
        &self.annotator
    }

    /// Annotate an image file and replace it with the annotated version.
    ///
    /// Fails only when the file cannot be opened or written; a model failure
    /// leaves an unannotated re-encode in place.
    pub fn annotate_image_in_place(&mut self, path: &Path) -> Result<DetectionResult> {
        let (image, format) = open_image(path)?;
        let result = self.detector.predict_image(&image, &path.to_string_lossy());
        let encoded = self.annotator.draw_as(&result, &image, format)?;
        replace_atomically(path, |temp| {
            fs::write(temp, &encoded).map_err(|e| Error::io(temp, e))
        })?;
        info!(
            "{}: {} detections drawn in place",
            path.display(),
            result.boxes().len()
        );
        Ok(result)
    }

    /// Write an annotated copy of `path` into `dest_dir` under the same file name.
    pub fn annotate_image_to(&mut self, path: &Path, dest_dir: &Path) -> Result<PredictionRecord> {
        let (image, format) = open_image(path)?;
        let result = self.detector.predict_image(&image, &path.to_string_lossy());
        let encoded = self.annotator.draw_as(&result, &image, format)?;

        let file_name = path
            .file_name()
            .ok_or_else(|| Error::io(path, std::io::ErrorKind::InvalidInput.into()))?;
        fs::create_dir_all(dest_dir).map_err(|e| Error::io(dest_dir, e))?;
        let annotated = dest_dir.join(file_name);
        replace_atomically(&annotated, |temp| {
            fs::write(temp, &encoded).map_err(|e| Error::io(temp, e))
        })?;

        Ok(PredictionRecord::from_detection(path, annotated, &result))
    }

    /// One outcome per input, in input order. A failing image does not stop
    /// the rest of the batch.
    pub fn annotate_images(
        &mut self,
        paths: &[PathBuf],
        dest_dir: &Path,
    ) -> Vec<Result<PredictionRecord>> {
        paths
            .iter()
            .map(|path| {
                let outcome = self.annotate_image_to(path, dest_dir);
                if let Err(e) = &outcome {
                    warn!("{}: {}", path.display(), e);
                }
                outcome
            })
            .collect()
    }

    /// Predict every image in `dir` and write annotated copies into `dest_dir`.
    ///
    /// Results carry only the source path, so each image is re-opened for
    /// drawing. Fails with [`Error::EmptyFolder`] when `dir` has no images.
    pub fn annotate_folder(
        &mut self,
        dir: &Path,
        dest_dir: &Path,
    ) -> Result<Vec<Result<PredictionRecord>>> {
        let annotator = &self.annotator;
        let results = self.detector.predict_folder(dir)?;
        fs::create_dir_all(dest_dir).map_err(|e| Error::io(dest_dir, e))?;

        Ok(results
            .map(|result| {
                let outcome = write_annotated(annotator, &result, dest_dir);
                if let Err(e) = &outcome {
                    warn!("{}: {}", result.source_path(), e);
                }
                outcome
            })
            .collect())
    }

    /// Annotate every frame of a video and swap the result over the original.
    ///
    /// Reading stops at the first frame that cannot be read; everything up to
    /// it is kept. Any write or encoder failure aborts and leaves the original
    /// untouched.
    pub fn annotate_video_in_place(&mut self, path: &Path) -> Result<VideoReport> {
        let info = probe(path)?;
        let queue = self.video.frame_queue;
        let codec = self.video.codec.clone();

        let report = replace_atomically(path, |temp| {
            let mut source = FfmpegFrameSource::open(path, info.clone(), queue)?;
            let mut sink = FfmpegFrameSink::create(temp, &info, &codec, queue)?;
            let report = self.annotate_frames(&mut source, &mut sink, &path.to_string_lossy())?;
            sink.finish()?;
            Ok(report)
        })?;

        info!(
            "{}: {} frames, {} with detections, {} boxes",
            path.display(),
            report.frames,
            report.annotated_frames,
            report.detections
        );
        Ok(report)
    }

    /// Frame loop: read → predict → draw (only when something was found) → write.
    pub fn annotate_frames<S, W>(
        &mut self,
        source: &mut S,
        sink: &mut W,
        name: &str,
    ) -> Result<VideoReport>
    where
        S: FrameSource + ?Sized,
        W: FrameSink + ?Sized,
    {
        let expected = source.info().frame_count;
        let progress_every = self.video.progress_every.max(1);
        let mut report = VideoReport::default();

        while let Some(frame) = source.read_frame() {
            let image = DynamicImage::ImageRgb8(frame);
            let result = self
                .detector
                .predict_image(&image, &format!("{}#{}", name, report.frames));

            let mut canvas = image.into_rgb8();
            if !result.is_empty() {
                self.annotator.render_mut(&result, &mut canvas);
                report.annotated_frames += 1;
                report.detections += result.boxes().len() as u64;
            }
            sink.write_frame(&canvas)?;
            report.frames += 1;

            if report.frames % progress_every == 0 {
                match expected {
                    Some(total) => debug!("{}: frame {}/{}", name, report.frames, total),
                    None => debug!("{}: frame {}", name, report.frames),
                }
            }
        }

        Ok(report)
    }
}

fn write_annotated(
    annotator: &Annotator,
    result: &DetectionResult,
    dest_dir: &Path,
) -> Result<PredictionRecord> {
    let encoded = annotator.draw_from_source(result)?;
    let annotated = dest_dir.join(result.file_name());
    replace_atomically(&annotated, |temp| {
        fs::write(temp, &encoded).map_err(|e| Error::io(temp, e))
    })?;
    Ok(PredictionRecord::from_detection(
        result.source_path(),
        annotated,
        result,
    ))
}

fn open_image(path: &Path) -> Result<(DynamicImage, ImageFormat)> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    let image = image::load_from_memory(&bytes).map_err(|e| Error::image(path, e))?;
    Ok((image, output_format(path)))
}

/// Run `write` against a temp file next to `target`, then rename it over
/// `target`. On error the temp file is removed and `target` is left as is.
pub fn replace_atomically<T>(target: &Path, write: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let suffix = target
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let temp = tempfile::Builder::new()
        .prefix(".annotating-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|e| Error::io(dir, e))?
        .into_temp_path();

    let value = write(&temp)?;
    match fs::metadata(target) {
        Ok(meta) => fs::set_permissions(&temp, meta.permissions()),
        Err(_) => fs::set_permissions(&temp, default_permissions(&temp)?),
    }
    .map_err(|e| Error::io(target, e))?;
    temp.persist(target).map_err(|e| Error::io(target, e.error))?;
    Ok(value)
}

/// Mode for a file that did not exist before: `rw-r--r--` instead of the
/// owner-only mode temp files are created with.
#[cfg(unix)]
fn default_permissions(_path: &Path) -> Result<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions(path: &Path) -> Result<fs::Permissions> {
    let mut permissions = fs::metadata(path)
        .map_err(|e| Error::io(path, e))?
        .permissions();
    permissions.set_readonly(false);
    Ok(permissions)
}

#[cfg(test)]
mod tests {
    use super::video::tests::{info, VecSink, VecSource};
    use super::*;
    use crate::config::{AnnotatorSettings, DetectorSettings};
    use crate::detection::detector::tests::{no_boxes, two_boxes, FakeModel};
    use crate::detection::RawBox;
    use image::{GenericImageView, Rgb, RgbImage};

    fn pipeline(model: FakeModel) -> MediaPipeline<FakeModel> {
        let annotator = Annotator::new(
            &AnnotatorSettings {
                font_path: None,
                ..AnnotatorSettings::default()
            },
            2,
        );
        MediaPipeline::new(
            Detector::new(model, DetectorSettings::default()),
            annotator,
            VideoSettings::default(),
        )
    }

    fn frame(shade: u8) -> RgbImage {
        RgbImage::from_pixel(160, 140, Rgb([shade, shade, shade]))
    }

    /// boxes only on bright frames
    fn bright_only(image: &DynamicImage) -> Vec<RawBox> {
        if image.to_rgb8().get_pixel(0, 0)[0] > 100 {
            two_boxes(image)
        } else {
            Vec::new()
        }
    }

    #[test]
    fn test_stops_at_first_unreadable_frame() {
        // frame 5 of 10 fails to decode
        let frames = (1..=10u8)
            .map(|i| if i == 5 { None } else { Some(frame(i)) })
            .collect();
        let mut source = VecSource::new(info(160, 140), frames);
        let mut sink = VecSink::default();

        let mut p = pipeline(FakeModel::new(two_boxes));
        let report = p.annotate_frames(&mut source, &mut sink, "clip.mp4").unwrap();

        assert_eq!(report.frames, 4);
        assert_eq!(report.annotated_frames, 4);
        assert_eq!(report.detections, 8);
        assert_eq!(sink.frames.len(), 4);
        assert_eq!(source.reads, 5);
        assert_eq!(p.detector().model().calls, 4);
        assert_eq!(*sink.frames[0].get_pixel(10, 30), crate::annotate::PURPLE);
    }

    #[test]
    fn test_frames_without_detections_pass_through() {
        let frames = vec![Some(frame(20)), Some(frame(200)), Some(frame(30))];
        let mut source = VecSource::new(info(160, 140), frames);
        let mut sink = VecSink::default();

        let mut p = pipeline(FakeModel::new(bright_only));
        let report = p.annotate_frames(&mut source, &mut sink, "clip.mp4").unwrap();

        assert_eq!(report.frames, 3);
        assert_eq!(report.annotated_frames, 1);
        assert_eq!(sink.frames[0], frame(20));
        assert_ne!(sink.frames[1], frame(200));
        assert_eq!(sink.frames[2], frame(30));
    }

    #[test]
    fn test_model_failure_on_frame_keeps_frame() {
        let frames = vec![Some(frame(200)), Some(frame(200))];
        let mut source = VecSource::new(info(160, 140), frames);
        let mut sink = VecSink::default();

        let mut model = FakeModel::new(two_boxes);
        model.fail_on.push("#1".into());
        let mut p = pipeline(model);
        let report = p.annotate_frames(&mut source, &mut sink, "clip.mp4").unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.annotated_frames, 1);
        assert_eq!(sink.frames[1], frame(200));
    }

    #[test]
    fn test_write_failure_aborts_without_swap() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clip.mp4");
        fs::write(&target, b"original video").unwrap();

        let mut p = pipeline(FakeModel::new(two_boxes));
        let frames = (0..6).map(|_| Some(frame(200))).collect();
        let mut source = VecSource::new(info(160, 140), frames);

        let err = replace_atomically(&target, |temp| {
            fs::write(temp, b"partial").unwrap();
            let mut sink = VecSink {
                fail_at: Some(3),
                ..VecSink::default()
            };
            let report = p.annotate_frames(&mut source, &mut sink, "clip.mp4")?;
            sink.finish()?;
            Ok(report)
        })
        .unwrap_err();

        assert!(matches!(err, Error::Video(_)));
        assert_eq!(fs::read(&target).unwrap(), b"original video");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_replace_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.jpg");
        fs::write(&target, b"old").unwrap();

        let n = replace_atomically(&target, |temp| {
            assert_eq!(temp.parent(), Some(dir.path()));
            assert_eq!(temp.extension().unwrap(), "jpg");
            fs::write(temp, b"new").unwrap();
            Ok(3)
        })
        .unwrap();

        assert_eq!(n, 3);
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_image_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.png");
        RgbImage::from_pixel(200, 160, Rgb([0, 0, 0])).save(&path).unwrap();

        let mut p = pipeline(FakeModel::new(two_boxes));
        let result = p.annotate_image_in_place(&path).unwrap();
        assert_eq!(result.boxes().len(), 2);

        let annotated = image::open(&path).unwrap();
        assert_eq!(annotated.dimensions(), (200, 160));
        let annotated = annotated.to_rgb8();
        assert_eq!(*annotated.get_pixel(10, 30), crate::annotate::PURPLE);
        assert_eq!(*annotated.get_pixel(60, 90), crate::annotate::RED);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_image_in_place_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(FakeModel::new(two_boxes));
        let err = p
            .annotate_image_in_place(&dir.path().join("gone.jpg"))
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(p.detector().model().calls, 0);
    }

    #[test]
    fn test_batch_keeps_order_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("predict");
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.jpg");
        let c = dir.path().join("c.png");
        RgbImage::from_pixel(200, 160, Rgb([0, 0, 0])).save(&a).unwrap();
        fs::write(&b, b"not an image").unwrap();
        RgbImage::from_pixel(64, 64, Rgb([0, 0, 0])).save(&c).unwrap();

        let mut p = pipeline(FakeModel::new(no_boxes));
        let outcomes = p.annotate_images(&[a.clone(), b, c.clone()], &out);

        assert_eq!(outcomes.len(), 3);
        let first = outcomes[0].as_ref().unwrap();
        assert_eq!(first.original, a);
        assert_eq!(first.annotated, out.join("a.jpg"));
        assert!(first.boxes.is_empty());
        assert!(matches!(outcomes[1], Err(Error::Image { .. })));
        assert_eq!(outcomes[2].as_ref().unwrap().annotated, out.join("c.png"));
        assert_eq!(
            image::open(out.join("c.png")).unwrap().dimensions(),
            (64, 64)
        );
        assert!(!out.join("b.jpg").exists());
    }

    #[cfg(unix)]
    fn mode(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[cfg(unix)]
    #[test]
    fn test_replace_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();

        let shared = dir.path().join("shared.jpg");
        fs::write(&shared, b"old").unwrap();
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o644)).unwrap();
        replace_atomically(&shared, |temp| {
            fs::write(temp, b"new").map_err(|e| Error::io(temp, e))
        })
        .unwrap();
        assert_eq!(mode(&shared), 0o644);

        let group = dir.path().join("group.jpg");
        fs::write(&group, b"old").unwrap();
        fs::set_permissions(&group, fs::Permissions::from_mode(0o664)).unwrap();
        replace_atomically(&group, |temp| {
            fs::write(temp, b"new").map_err(|e| Error::io(temp, e))
        })
        .unwrap();
        assert_eq!(mode(&group), 0o664);

        let fresh = dir.path().join("fresh.jpg");
        replace_atomically(&fresh, |temp| {
            fs::write(temp, b"new").map_err(|e| Error::io(temp, e))
        })
        .unwrap();
        assert_eq!(mode(&fresh), 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn test_annotated_files_are_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.png");
        RgbImage::from_pixel(200, 160, Rgb([0, 0, 0])).save(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut p = pipeline(FakeModel::new(two_boxes));
        p.annotate_image_in_place(&path).unwrap();
        assert_eq!(mode(&path), 0o644);

        let out = dir.path().join("predict");
        let record = p.annotate_image_to(&path, &out).unwrap();
        assert_eq!(mode(&record.annotated), 0o644);
    }

    #[test]
    fn test_annotate_folder() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("uploads");
        let out = dir.path().join("predict");
        fs::create_dir(&src).unwrap();
        RgbImage::from_pixel(200, 160, Rgb([0, 0, 0]))
            .save(src.join("b.png"))
            .unwrap();
        RgbImage::from_pixel(200, 160, Rgb([0, 0, 0]))
            .save(src.join("a.jpg"))
            .unwrap();
        fs::write(src.join("readme.txt"), "x").unwrap();

        let mut p = pipeline(FakeModel::new(two_boxes));
        let records: Vec<PredictionRecord> = p
            .annotate_folder(&src, &out)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original, src.join("a.jpg"));
        assert_eq!(records[0].annotated, out.join("a.jpg"));
        assert_eq!(records[1].annotated, out.join("b.png"));
        assert_eq!(records[1].boxes.len(), 2);

        let png = image::open(out.join("b.png")).unwrap().to_rgb8();
        assert_eq!(png.dimensions(), (200, 160));
        assert_eq!(*png.get_pixel(60, 90), crate::annotate::RED);

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        assert!(matches!(
            p.annotate_folder(&empty, &out),
            Err(Error::EmptyFolder(_))
        ));
    }

    #[test]
    fn test_video_in_place_keeps_stream() {
        use super::ffmpeg::tests::{count_frames, write_clip};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        write_clip(&path, 64, 48, 10);
        let before = probe(&path).unwrap();

        let mut p = pipeline(FakeModel::new(two_boxes));
        let report = p.annotate_video_in_place(&path).unwrap();
        assert_eq!(report.frames, 10);
        assert_eq!(report.annotated_frames, 10);
        assert_eq!(p.detector().model().calls, 10);

        let after = probe(&path).unwrap();
        assert_eq!((after.width, after.height), (before.width, before.height));
        assert!((after.fps() - before.fps()).abs() < 0.01);
        assert_eq!(count_frames(&path, after), 10);
        // only the swapped file remains
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_video_in_place_unreadable_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, b"not a video").unwrap();

        let mut p = pipeline(FakeModel::new(two_boxes));
        assert!(matches!(
            p.annotate_video_in_place(&path),
            Err(Error::Video(_))
        ));
        assert_eq!(fs::read(&path).unwrap(), b"not a video");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
