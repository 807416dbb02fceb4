// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// FFmpeg视频读写 (ez-ffmpeg)
/// Decoder: file → RGB24 frames through a frame filter and a bounded channel.
/// Encoder: RGB24 frames → raw video read callback → codec → file.
use std::path::Path;

use crossbeam_channel::{Receiver, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::core::scheduler::ffmpeg_scheduler::{FfmpegScheduler, Running};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::stream_info::{find_video_stream_info, StreamInfo};
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input, Output};
use image::RgbImage;
use log::{debug, warn};

use super::video::{FrameSink, FrameSource, VideoInfo};
use crate::error::{Error, Result};

/// FFERRTAG('E','O','F',' ')
const AVERROR_EOF: i32 = -0x2046_4F45;

fn video_err(path: &Path, what: &str, e: impl std::fmt::Display) -> Error {
    Error::Video(format!("{} {}: {}", what, path.display(), e))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Video(format!("non UTF-8 path {}", path.display())))
}

/// Read width, height, frame rate and frame count of the first video stream.
pub fn probe(path: &Path) -> Result<VideoInfo> {
    let info = find_video_stream_info(path_str(path)?)
        .map_err(|e| video_err(path, "cannot open", e))?;
    match info {
        Some(StreamInfo::Video {
            width,
            height,
            avg_frame_rate,
            r_frame_rate,
            nb_frames,
            ..
        }) => {
            let rate = if avg_frame_rate.num > 0 && avg_frame_rate.den > 0 {
                avg_frame_rate
            } else {
                r_frame_rate
            };
            if width <= 0 || height <= 0 || rate.num <= 0 || rate.den <= 0 {
                return Err(Error::Video(format!(
                    "{}: unusable stream {}x{} @ {}/{}",
                    path.display(),
                    width,
                    height,
                    rate.num,
                    rate.den
                )));
            }
            Ok(VideoInfo {
                width: width as u32,
                height: height as u32,
                fps_num: rate.num,
                fps_den: rate.den,
                frame_count: u64::try_from(nb_frames).ok().filter(|n| *n > 0),
            })
        }
        _ => Err(Error::Video(format!("{}: no video stream", path.display()))),
    }
}

/// 解码过滤器: 每帧拷贝为RGB24后发送
#[derive(Clone)]
struct CaptureFilter {
    tx: Option<Sender<RgbImage>>,
}

impl FrameFilter for CaptureFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        let Some(tx) = &self.tx else {
            return Ok(Some(frame));
        };
        unsafe {
            if frame.as_ptr().is_null() {
                return Ok(Some(frame));
            }

            let w = (*frame.as_ptr()).width as usize;
            let h = (*frame.as_ptr()).height as usize;
            let data = (*frame.as_ptr()).data[0];
            let stride = (*frame.as_ptr()).linesize[0] as usize;
            if data.is_null() || stride < w * 3 {
                return Err(format!("unexpected frame layout {}x{} stride {}", w, h, stride));
            }

            // 去掉行尾填充
            let mut rgb = Vec::with_capacity(w * h * 3);
            for y in 0..h {
                rgb.extend_from_slice(std::slice::from_raw_parts(data.add(y * stride), w * 3));
            }

            let image = RgbImage::from_raw(w as u32, h as u32, rgb)
                .ok_or_else(|| "frame buffer size mismatch".to_string())?;
            tx.send(image).map_err(|_| "frame consumer gone".to_string())?;
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        // closes the channel so the reader sees the end of stream
        self.tx.take();
    }
}

pub struct FfmpegFrameSource {
    info: VideoInfo,
    rx: Receiver<RgbImage>,
    scheduler: Option<FfmpegScheduler<Running>>,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path, info: VideoInfo, queue: usize) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(queue.max(1));

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("capture", Box::new(CaptureFilter { tx: Some(tx) }));
        let out = create_null_output().add_frame_pipeline(pipe);

        let ctx = FfmpegContext::builder()
            .input(Input::new(path_str(path)?))
            .filter_descs(["format=rgb24"].into())
            .output(out)
            .build()
            .map_err(|e| video_err(path, "cannot build decoder for", e))?;
        let scheduler = ctx
            .start()
            .map_err(|e| video_err(path, "cannot start decoder for", e))?;
        debug!(
            "decoding {} ({}x{} @ {:.2} fps)",
            path.display(),
            info.width,
            info.height,
            info.fps()
        );

        Ok(Self {
            info,
            rx,
            scheduler: Some(scheduler),
        })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Option<RgbImage> {
        match self.rx.recv() {
            Ok(frame) => Some(frame),
            Err(_) => {
                if let Some(scheduler) = self.scheduler.take() {
                    if let Err(e) = scheduler.wait() {
                        warn!("decoder stopped early: {}", e);
                    }
                }
                None
            }
        }
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        // unblock a filter waiting on a full queue before stopping ffmpeg
        drop(std::mem::replace(&mut self.rx, crossbeam_channel::never()));
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
        }
    }
}

/// Raw RGB24 frames piped into an ffmpeg encoder.
pub struct FfmpegFrameSink {
    width: u32,
    height: u32,
    tx: Option<Sender<Vec<u8>>>,
    scheduler: Option<FfmpegScheduler<Running>>,
}

impl FfmpegFrameSink {
    pub fn create(path: &Path, info: &VideoInfo, codec: &str, queue: usize) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(queue.max(1));

        let mut pending: Vec<u8> = Vec::new();
        let mut offset = 0;
        let read = move |buf: &mut [u8]| -> i32 {
            while offset >= pending.len() {
                match rx.recv() {
                    Ok(next) => {
                        pending = next;
                        offset = 0;
                    }
                    Err(_) => return AVERROR_EOF,
                }
            }
            let n = (pending.len() - offset).min(buf.len());
            buf[..n].copy_from_slice(&pending[offset..offset + n]);
            offset += n;
            n as i32
        };

        let video_size = format!("{}x{}", info.width, info.height);
        let frame_rate = info.frame_rate();
        let input = Input::new_by_read_callback(read)
            .set_format("rawvideo")
            .set_input_opts(
                [
                    ("pixel_format", "rgb24"),
                    ("video_size", video_size.as_str()),
                    ("framerate", frame_rate.as_str()),
                ]
                .into(),
            );
        let output = Output::from(path_str(path)?).set_video_codec(codec);

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_descs(["format=yuv420p"].into())
            .output(output)
            .build()
            .map_err(|e| video_err(path, "cannot build encoder for", e))?;
        let scheduler = ctx
            .start()
            .map_err(|e| video_err(path, "cannot start encoder for", e))?;
        debug!("encoding {} with {} ({})", path.display(), codec, video_size);

        Ok(Self {
            width: info.width,
            height: info.height,
            tx: Some(tx),
            scheduler: Some(scheduler),
        })
    }
}

impl FrameSink for FfmpegFrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(Error::Video(format!(
                "frame {}x{} does not match output {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Video("encoder already finished".into()))?;
        tx.send(frame.as_raw().clone())
            .map_err(|_| Error::Video("encoder stopped".into()))
    }

    fn finish(&mut self) -> Result<()> {
        // EOF for the read callback
        self.tx.take();
        match self.scheduler.take() {
            Some(scheduler) => scheduler
                .wait()
                .map_err(|e| Error::Video(format!("encoder failed: {}", e))),
            None => Ok(()),
        }
    }
}

impl Drop for FfmpegFrameSink {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
        }
        self.tx.take();
    }
}
