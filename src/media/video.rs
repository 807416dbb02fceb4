// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频帧读写接口
/// Frame-level seams between the annotation loop and the codec backend.
use image::RgbImage;

use crate::error::Result;

/// Stream parameters read when a video is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// frame rate as a rational `num / den`
    pub fps_num: i32,
    pub fps_den: i32,
    /// container's frame count; informational, never a loop bound
    pub frame_count: Option<u64>,
}

impl VideoInfo {
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            self.fps_num as f64 / self.fps_den as f64
        }
    }

    /// `30000/1001` style string understood by ffmpeg options
    pub fn frame_rate(&self) -> String {
        format!("{}/{}", self.fps_num, self.fps_den)
    }
}

/// Decoded frames in presentation order.
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    /// Next frame, or `None` once no more frames can be read. A frame that
    /// fails to decode ends the stream the same way.
    fn read_frame(&mut self) -> Option<RgbImage>;
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close the output. Only a successful `finish` means the
    /// output is complete.
    fn finish(&mut self) -> Result<()>;
}

/// Totals for one annotated video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoReport {
    /// frames read and written
    pub frames: u64,
    /// frames that carried at least one detection
    pub annotated_frames: u64,
    pub detections: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;

    /// Frames served from memory; a `None` entry simulates a failed read.
    pub(crate) struct VecSource {
        pub info: VideoInfo,
        pub frames: std::vec::IntoIter<Option<RgbImage>>,
        pub reads: usize,
    }

    impl VecSource {
        pub fn new(info: VideoInfo, frames: Vec<Option<RgbImage>>) -> Self {
            Self {
                info,
                frames: frames.into_iter(),
                reads: 0,
            }
        }
    }

    impl FrameSource for VecSource {
        fn info(&self) -> &VideoInfo {
            &self.info
        }

        fn read_frame(&mut self) -> Option<RgbImage> {
            self.reads += 1;
            self.frames.next().flatten()
        }
    }

    #[derive(Default)]
    pub(crate) struct VecSink {
        pub frames: Vec<RgbImage>,
        pub fail_at: Option<usize>,
        pub finished: bool,
    }

    impl FrameSink for VecSink {
        fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
            if self.fail_at == Some(self.frames.len()) {
                return Err(Error::Video("disk full".into()));
            }
            self.frames.push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    pub(crate) fn info(width: u32, height: u32) -> VideoInfo {
        VideoInfo {
            width,
            height,
            fps_num: 30000,
            fps_den: 1001,
            frame_count: Some(10),
        }
    }

    #[test]
    fn test_frame_rate() {
        let info = info(64, 48);
        assert!((info.fps() - 29.97).abs() < 0.01);
        assert_eq!(info.frame_rate(), "30000/1001");

        let broken = VideoInfo {
            fps_den: 0,
            ..info
        };
        assert_eq!(broken.fps(), 0.0);
    }
}
