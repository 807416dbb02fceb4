// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 武器检测 (Weapon Detect)
///
/// 图片: 原地标注 / 上传后写入标注副本
/// 文件夹: 逐张预测并输出检测框
/// 视频: 后台线程池逐帧标注后原子替换
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use weapon_detect::detection::ClassNames;
use weapon_detect::{Args, Command, MediaPipeline, Settings, VideoWorkerPool, YOLOv8};

fn build_model(settings: &Settings) -> Result<YOLOv8> {
    let fallback: ClassNames = settings.detector.class_names.clone();
    YOLOv8::new(&settings.model, fallback)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config_path = args.config.clone().or_else(Settings::default_path);
    let mut settings = match &config_path {
        Some(path) => Settings::load(path),
        None => Settings::default(),
    };
    settings.merge_args(&args);
    settings.validate()?;

    match args.command {
        Command::Settings { out } => match out.or(config_path) {
            Some(path) => {
                settings.save(&path)?;
                info!("settings written to {}", path.display());
            }
            None => println!("{}", serde_json::to_string_pretty(&settings)?),
        },

        Command::Image { paths } => {
            let mut pipeline = MediaPipeline::from_settings(build_model(&settings)?, &settings);
            let mut failed = 0;
            for path in &paths {
                match pipeline.annotate_image_in_place(path) {
                    Ok(result) => print_json(&result)?,
                    Err(e) => {
                        error!("{}", e);
                        failed += 1;
                    }
                }
            }
            anyhow::ensure!(failed == 0, "{} of {} images failed", failed, paths.len());
        }

        Command::Upload { dest_dir, paths } => {
            let mut pipeline = MediaPipeline::from_settings(build_model(&settings)?, &settings);
            let outcomes = pipeline.annotate_images(&paths, &dest_dir);
            let failed = outcomes.iter().filter(|o| o.is_err()).count();
            for record in outcomes.into_iter().flatten() {
                print_json(&record)?;
            }
            anyhow::ensure!(failed == 0, "{} of {} uploads failed", failed, paths.len());
        }

        Command::Folder { dir, save } => {
            let mut pipeline = MediaPipeline::from_settings(build_model(&settings)?, &settings);
            match save {
                Some(dest_dir) => {
                    let outcomes = pipeline
                        .annotate_folder(&dir, &dest_dir)
                        .with_context(|| format!("cannot annotate folder {}", dir.display()))?;
                    let total = outcomes.len();
                    let failed = outcomes.iter().filter(|o| o.is_err()).count();
                    for record in outcomes.into_iter().flatten() {
                        print_json(&record)?;
                    }
                    anyhow::ensure!(failed == 0, "{} of {} images failed", failed, total);
                }
                None => {
                    let results = pipeline
                        .detector_mut()
                        .predict_folder(&dir)
                        .with_context(|| format!("cannot predict folder {}", dir.display()))?;
                    for result in results {
                        print_json(&result)?;
                    }
                }
            }
        }

        Command::Video { paths } => run_videos(&settings, &paths)?,
    }

    Ok(())
}

fn run_videos(settings: &Settings, paths: &[impl AsRef<Path>]) -> Result<()> {
    let shared = settings.clone();
    let pool = VideoWorkerPool::spawn(settings.workers.0, move |worker| {
        let model = build_model(&shared)
            .with_context(|| format!("cannot load model for worker {}", worker))?;
        Ok(MediaPipeline::from_settings(model, &shared))
    })?;

    for path in paths {
        pool.submit(path.as_ref())?;
    }

    let mut failed = 0;
    for outcome in pool.close() {
        match outcome.result {
            Ok(report) => print_json(&serde_json::json!({
                "path": outcome.path,
                "frames": report.frames,
                "annotated_frames": report.annotated_frames,
                "detections": report.detections,
            }))?,
            Err(e) => {
                error!("{}: {}", outcome.path.display(), e);
                failed += 1;
            }
        }
    }
    anyhow::ensure!(failed == 0, "{} of {} videos failed", failed, paths.len());
    Ok(())
}
