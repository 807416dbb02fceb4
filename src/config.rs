// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 配置 - 通过JSON文件调整参数, 命令行参数可覆盖

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::detection::{default_class_names, ClassNames};
use crate::error::{Error, Result};
use crate::models::InferenceOptions;
use crate::OrtEP;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub ep: OrtEP,
    pub device_id: i32,
    /// input size when the model's own input is dynamic
    pub height: Option<u32>,
    pub width: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weights/best.onnx"),
            ep: OrtEP::Cpu,
            device_id: 0,
            height: None,
            width: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub conf: f32,
    pub iou: f32,
    pub augment: bool,
    /// bounding box thickness (pixels)
    pub line_width: u32,
    pub class_names: ClassNames,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            conf: 0.25,
            iou: 0.45,
            augment: false,
            line_width: 2,
            class_names: default_class_names(),
        }
    }
}

impl DetectorSettings {
    pub fn inference_options(&self) -> InferenceOptions {
        InferenceOptions {
            conf: self.conf,
            iou: self.iou,
            augment: self.augment,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorSettings {
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub jpeg_quality: u8,
    /// class id → RGB, merged over the built-in palette
    pub palette: BTreeMap<u32, [u8; 3]>,
}

impl Default for AnnotatorSettings {
    fn default() -> Self {
        Self {
            font_path: Some(PathBuf::from("weights/arial.ttf")),
            font_size: 20.0,
            jpeg_quality: 90,
            palette: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// encoder for the rewritten video; `mpeg4` is the `mp4v` fourcc codec
    pub codec: String,
    /// decoded frames buffered between the decoder thread and the pipeline
    pub frame_queue: usize,
    pub progress_every: u64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: "mpeg4".to_string(),
            frame_queue: 8,
            progress_every: 100,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelSettings,
    pub detector: DetectorSettings,
    pub annotator: AnnotatorSettings,
    pub video: VideoSettings,
    pub workers: WorkerCount,
}

/// Number of video workers, at least one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerCount(pub usize);

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount(2)
    }
}

impl Settings {
    /// `<config dir>/weapon-detect/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("weapon-detect").join("settings.json"))
    }

    /// Load from JSON; a missing or unparsable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(settings) => {
                    info!("settings loaded from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("cannot read {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, json).map_err(|e| Error::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.conf) {
            return Err(Error::Config(format!("conf {} outside [0, 1]", d.conf)));
        }
        if !(0.0..=1.0).contains(&d.iou) {
            return Err(Error::Config(format!("iou {} outside [0, 1]", d.iou)));
        }
        if d.line_width == 0 {
            return Err(Error::Config("line_width must be positive".into()));
        }
        if !(1..=100).contains(&self.annotator.jpeg_quality) {
            return Err(Error::Config(format!(
                "jpeg_quality {} outside 1..=100",
                self.annotator.jpeg_quality
            )));
        }
        if self.video.frame_queue == 0 {
            return Err(Error::Config("frame_queue must be positive".into()));
        }
        if self.workers.0 == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        Ok(())
    }

    /// Apply command line overrides.
    pub fn merge_args(&mut self, args: &Args) {
        if let Some(model) = &args.model {
            self.model.path = model.clone();
        }
        if args.cuda {
            self.model.ep = OrtEP::Cuda;
        }
        if let Some(conf) = args.conf {
            self.detector.conf = conf;
        }
        if args.augment {
            self.detector.augment = true;
        }
        if let Some(line_width) = args.line_width {
            self.detector.line_width = line_width;
        }
        if let Some(font) = &args.font {
            self.annotator.font_path = Some(font.clone());
        }
        if let Some(workers) = args.workers {
            self.workers = WorkerCount(workers);
        }
    }
}

/// 武器检测 - 图片/视频标注
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Detect weapons and persons in images and videos", long_about = None)]
pub struct Args {
    /// JSON settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// ONNX model path
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// use the CUDA execution provider
    #[arg(long)]
    pub cuda: bool,

    /// confidence threshold
    #[arg(long)]
    pub conf: Option<f32>,

    /// test-time augmentation
    #[arg(long)]
    pub augment: bool,

    /// bounding box thickness (pixels)
    #[arg(long)]
    pub line_width: Option<u32>,

    /// TrueType font for labels
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// video workers
    #[arg(long)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Annotate images in place
    Image { paths: Vec<PathBuf> },
    /// Write annotated copies of uploaded images and print one record per image
    Upload {
        dest_dir: PathBuf,
        paths: Vec<PathBuf>,
    },
    /// Predict every image in a folder and print the detections
    Folder {
        dir: PathBuf,
        /// also write annotated copies here and print one record per image
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Annotate videos in place through the worker pool
    Video { paths: Vec<PathBuf> },
    /// Write the effective settings as JSON
    Settings { out: Option<PathBuf> },
}
