// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX Runtime 推理后端
//! Session construction, execution provider selection and model metadata.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info};
use ndarray::{Array, IxDyn};
use once_cell::sync::Lazy;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::Session;
use ort::value::{Tensor, ValueType};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detection::ClassNames;

static NAMES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\d+)\s*:\s*['"]([^'"]*)['"]"#).expect("static regex"));
static IMGSZ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

/// Execution provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrtEP {
    #[default]
    Cpu,
    Cuda,
    Trt,
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub device_id: i32,
    /// (height, width); only consulted when the model input is dynamic
    pub image_size: (Option<u32>, Option<u32>),
}

pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    height: u32,
    width: u32,
    names: Option<ClassNames>,
}

impl OrtBackend {
    pub fn build(args: OrtConfig) -> Result<Self> {
        let eps: Vec<ExecutionProviderDispatch> = match args.ep {
            OrtEP::Trt => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(args.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(args.device_id)
                    .build(),
            ],
            OrtEP::Cuda => vec![CUDAExecutionProvider::default()
                .with_device_id(args.device_id)
                .build()],
            OrtEP::Cpu => vec![CPUExecutionProvider::default().build()],
        };

        let session = Session::builder()
            .context("failed to create ORT session builder")?
            .with_execution_providers(eps)
            .context("failed to register execution providers")?
            .commit_from_file(&args.f)
            .with_context(|| format!("failed to load ONNX model {}", args.f.display()))?;

        // input: [batch, 3, height, width], -1 where dynamic
        let dims: Vec<i64> = match session.inputs.first().map(|input| &input.input_type) {
            Some(ValueType::Tensor { shape, .. }) => shape.iter().copied().collect(),
            _ => anyhow::bail!("model {} has no tensor input", args.f.display()),
        };
        if dims.len() != 4 {
            anyhow::bail!("expected a 4-d image input, got {:?}", dims);
        }

        let metadata = session.metadata().context("failed to read model metadata")?;
        let names = metadata
            .custom("names")
            .ok()
            .flatten()
            .map(|raw| parse_names(&raw))
            .filter(|names| !names.is_empty());
        let imgsz = metadata
            .custom("imgsz")
            .ok()
            .flatten()
            .and_then(|raw| parse_imgsz(&raw));

        let resolve = |dim: i64, from_args: Option<u32>, from_meta: Option<u32>| -> u32 {
            if dim > 0 {
                dim as u32
            } else {
                from_args.or(from_meta).unwrap_or(640)
            }
        };
        let height = resolve(dims[2], args.image_size.0, imgsz.map(|(h, _)| h));
        let width = resolve(dims[3], args.image_size.1, imgsz.map(|(_, w)| w));

        info!(
            "loaded {} ({:?}, input {}x{}, {} classes)",
            args.f.display(),
            args.ep,
            width,
            height,
            names.as_ref().map_or(0, |n| n.len())
        );

        Ok(Self {
            session,
            ep: args.ep,
            height,
            width,
            names,
        })
    }

    /// Run a single NCHW f32 batch and return every output as an owned array.
    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let t = std::time::Instant::now();
        let shape: [usize; 4] = match *xs.shape() {
            [n, c, h, w] => [n, c, h, w],
            ref other => anyhow::bail!("expected an NCHW batch, got {:?}", other),
        };
        let data = xs.into_raw_vec_and_offset().0;
        let input = Tensor::from_array((shape, data.into_boxed_slice()))
            .context("failed to create input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("inference failed")?;

        let mut ys = Vec::with_capacity(outputs.len());
        for (name, value) in outputs.iter() {
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .with_context(|| format!("failed to extract output `{}`", name))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            ys.push(Array::from_shape_vec(IxDyn(&dims), data.to_vec())?);
        }
        debug!("[ORT run]: {:?}", t.elapsed());
        Ok(ys)
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn names(&self) -> Option<&ClassNames> {
        self.names.as_ref()
    }
}

/// Parse the `names` metadata written by the exporter, e.g.
/// `{0: 'person', 1: 'gun', 2: 'person'}`.
pub fn parse_names(raw: &str) -> ClassNames {
    NAMES_RE
        .captures_iter(raw)
        .filter_map(|cap| Some((cap[1].parse::<u32>().ok()?, cap[2].to_string())))
        .collect()
}

/// Parse the `imgsz` metadata, e.g. `[640, 640]` → (height, width).
pub fn parse_imgsz(raw: &str) -> Option<(u32, u32)> {
    let mut it = IMGSZ_RE.find_iter(raw).filter_map(|m| m.as_str().parse().ok());
    let h = it.next()?;
    let w = it.next().unwrap_or(h);
    Some((h, w))
}
