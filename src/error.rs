// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::path::PathBuf;

/// Why a single raw box could not be turned into a `BoundingBox`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedBox {
    #[error("field `{field}` holds {len} values, expected {expected}")]
    Shape {
        field: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("field `{field}` is not finite")]
    NotFinite { field: &'static str },

    #[error("class id {0} is not a non-negative integer")]
    ClassId(f32),

    #[error("confidence {0} outside [0, 1]")]
    Confidence(f32),

    #[error("corners ({x1}, {y1}, {x2}, {y2}) are inverted")]
    Inverted { x1: f32, y1: f32, x2: f32, y2: f32 },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("model invocation failed: {0}")]
    ModelInvocation(String),

    #[error("malformed detection: {0}")]
    MalformedDetection(#[from] MalformedBox),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error on {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no image files found in {}", .0.display())]
    EmptyFolder(PathBuf),

    #[error("video error: {0}")]
    Video(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Error::Image {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
