// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频任务线程池
/// Background video annotation: each worker owns its own pipeline (model,
/// annotator) and pulls paths off a shared job queue.
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use log::{error, info};

use crate::error::{Error, Result};
use crate::media::{MediaPipeline, VideoReport};
use crate::models::Model;

pub trait VideoJobRunner {
    fn run_video_job(&mut self, path: &Path) -> Result<VideoReport>;
}

impl<M: Model> VideoJobRunner for MediaPipeline<M> {
    fn run_video_job(&mut self, path: &Path) -> Result<VideoReport> {
        self.annotate_video_in_place(path)
    }
}

#[derive(Debug)]
pub struct VideoOutcome {
    pub path: PathBuf,
    pub worker: usize,
    pub result: Result<VideoReport>,
}

pub struct VideoWorkerPool {
    jobs: Option<Sender<PathBuf>>,
    outcomes: Receiver<VideoOutcome>,
    handles: Vec<JoinHandle<()>>,
}

impl VideoWorkerPool {
    /// Build `workers` runners with `factory` (worker index as argument) and
    /// start one thread per runner. Fails if any runner cannot be built.
    pub fn spawn<R, F>(workers: usize, factory: F) -> anyhow::Result<Self>
    where
        R: VideoJobRunner + Send + 'static,
        F: Fn(usize) -> anyhow::Result<R>,
    {
        let workers = workers.max(1);
        let runners = (0..workers).map(&factory).collect::<anyhow::Result<Vec<_>>>()?;

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<PathBuf>();
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();

        let mut handles = Vec::with_capacity(workers);
        for (worker, mut runner) in runners.into_iter().enumerate() {
            let jobs = job_rx.clone();
            let outcomes = outcome_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("video-worker-{}", worker))
                .spawn(move || {
                    for path in jobs.iter() {
                        info!("[worker {}] annotating {}", worker, path.display());
                        let result = runner.run_video_job(&path);
                        if let Err(e) = &result {
                            error!("[worker {}] {}: {}", worker, path.display(), e);
                        }
                        if outcomes
                            .send(VideoOutcome {
                                path,
                                worker,
                                result,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                })?;
            handles.push(handle);
        }
        info!("video worker pool started with {} workers", workers);

        Ok(Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            handles,
        })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn submit(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::Video("worker pool closed".into()))?;
        jobs.send(path)
            .map_err(|e| Error::Video(format!("worker pool gone, dropped {}", e.0.display())))
    }

    /// Outcomes as they complete, in completion order.
    pub fn outcomes(&self) -> &Receiver<VideoOutcome> {
        &self.outcomes
    }

    /// Stop accepting jobs, wait for queued ones and return the outcomes not
    /// yet taken from [`VideoWorkerPool::outcomes`].
    pub fn close(mut self) -> Vec<VideoOutcome> {
        self.shutdown();
        self.outcomes.try_iter().collect()
    }

    fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("video worker panicked");
            }
        }
    }
}

impl Drop for VideoWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
