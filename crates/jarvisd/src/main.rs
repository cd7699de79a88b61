use anyhow::{Context, Result};
use clap::Parser;
use jarvis_core::dataset::load_dataset;
use jarvis_core::retrain::RetrainError;
use jarvis_core::{
    AudioCache, DatasetWriter, Model, ModelStore, NearestNeighborTrainer, Retrainer, SpeechPool, Tracker,
    UltraFaceDetector,
};
use jarvis_hw::{Camera, CloudSpeech};
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod viewer;

use config::Config;
use engine::{spawn_engine, Engine, EngineError};
use viewer::SnapshotViewer;

#[derive(Parser, Debug)]
#[command(name = "jarvisd", version, about = "Live face recognition with spoken greetings")]
struct Args {
    /// Model file: loaded at startup, rewritten after every retrain
    model: PathBuf,

    /// Photo dataset to train from (one subfolder per person)
    #[arg(short = 't', long = "train")]
    dataset: Option<PathBuf>,

    /// Face size used for training and prediction, WIDTHxHEIGHT
    #[arg(short = 'r', long = "resize")]
    resize: Option<String>,

    /// Camera index N, opened as /dev/videoN
    #[arg(short = 'i', long = "id")]
    camera_id: Option<u32>,

    /// Face detector model (ONNX)
    #[arg(short = 'c', long = "cascade")]
    cascade: Option<PathBuf>,

    /// Cross-validate the dataset with K folds before starting
    #[arg(short = 'v', long = "validate", value_name = "K")]
    validate: Option<usize>,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) -> Result<(), config::ConfigError> {
        config.model_path = self.model.clone();
        if let Some(dir) = &self.dataset {
            config.dataset_dir = Some(dir.clone());
        }
        if let Some(size) = &self.resize {
            config.image_size = size.parse()?;
        }
        if let Some(id) = self.camera_id {
            config.camera_index = id;
        }
        if let Some(path) = &self.cascade {
            config.detector_model = path.clone();
        }
        if self.validate.is_some() {
            config.validate_folds = self.validate;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config)?;
    config.check_startup()?;

    tracing::info!(
        model = %config.model_path.display(),
        dataset = ?config.dataset_dir,
        size = %config.image_size,
        camera = config.camera_index,
        "jarvisd starting"
    );

    if let Some(k) = config.validate_folds {
        validate(&config, k).await?;
    }

    let store = ModelStore::new();
    warm_start(&config, &store)?;

    let detector = UltraFaceDetector::load(&config.detector_model)?.with_confidence(config.detector_confidence);
    tracing::info!(
        path = %config.detector_model.display(),
        confidence = config.detector_confidence,
        "face detector loaded"
    );
    let camera = Camera::open_index(config.camera_index)?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        "camera opened"
    );

    // The blocking HTTP client must be built and dropped off the async runtime.
    let lang = config.speech_lang.clone();
    let player = config.speech_player.clone();
    let audio_dir = config.audio_dir.clone();
    let workers = config.speech_workers;
    let pool = tokio::task::spawn_blocking(move || {
        let speech = CloudSpeech::new(&lang)?.with_player(player);
        SpeechPool::spawn(speech, AudioCache::new(audio_dir), workers)
    })
    .await??;
    let announcer = pool.announcer();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut viewer = SnapshotViewer::new(config.snapshot_path.clone())?;
    let mut retrainer = None;
    if let Some(retrain) = config.retrainer_config() {
        let task = Retrainer::new(retrain, NearestNeighborTrainer, store.clone(), announcer.clone());
        viewer = viewer.with_retrain_state(task.state());
        retrainer = Some(task.spawn(shutdown_rx.clone()));
    }

    let writer = match &config.dataset_dir {
        Some(dir) => DatasetWriter::new(dir.clone(), config.review_dir.clone(), config.photo_cap),
        None => DatasetWriter::review_only(config.review_dir.clone()),
    };
    let engine = Engine::new(detector, Tracker::new(config.tracker_config()?), announcer, writer);
    let mut pipeline = spawn_engine(engine, camera, viewer, store.clone(), shutdown_rx)?;

    tracing::info!("jarvisd ready");

    let mut pipeline_result = None;
    let mut retrainer_result = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupted");
        }
        result = &mut pipeline => {
            pipeline_result = Some(result.unwrap_or(Err(EngineError::ChannelClosed)));
        }
        result = retrainer_exit(&mut retrainer) => {
            retrainer_result = Some(result);
        }
    }

    tracing::info!("jarvisd shutting down");
    shutdown_tx.send_replace(true);

    let pipeline_result = match pipeline_result {
        Some(r) => r,
        None => pipeline.await.unwrap_or(Err(EngineError::ChannelClosed)),
    };
    let retrainer_result = match (retrainer_result, retrainer.take()) {
        (Some(r), _) => r,
        (None, Some(task)) => joined(task.await),
        (None, None) => Ok(()),
    };
    tokio::task::spawn_blocking(move || pool.shutdown()).await?;

    pipeline_result.context("frame pipeline failed")?;
    retrainer_result.context("retrainer failed")?;
    tracing::info!("jarvisd stopped");
    Ok(())
}

/// Resolves when the retrainer task ends; never resolves without one.
async fn retrainer_exit(task: &mut Option<JoinHandle<Result<(), RetrainError>>>) -> Result<()> {
    let result = match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    };
    *task = None;
    joined(result)
}

fn joined(result: Result<Result<(), RetrainError>, tokio::task::JoinError>) -> Result<()> {
    Ok(result.context("retrainer task panicked")??)
}

/// Publish the saved model, if any, so recognition starts before the first
/// retrain completes.
fn warm_start(config: &Config, store: &ModelStore) -> Result<()> {
    if !config.model_path.is_file() {
        return Ok(());
    }
    match Model::load(&config.model_path) {
        Ok(model) => {
            let generation = store.publish(model);
            tracing::info!(path = %config.model_path.display(), generation, "loaded saved model");
            Ok(())
        }
        Err(e) if config.dataset_dir.is_some() => {
            tracing::warn!(error = %e, "ignoring unreadable saved model; retraining");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to load model {}", config.model_path.display())),
    }
}

async fn validate(config: &Config, k: usize) -> Result<()> {
    let Some(dir) = config.dataset_dir.clone() else {
        return Ok(());
    };
    let size = config.image_size;
    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let set = load_dataset(&dir, size)?;
        Ok(jarvis_core::validate::kfold(&NearestNeighborTrainer, &set, k)?)
    })
    .await??;
    tracing::info!(folds = k, accuracy = report.accuracy(), "cross validation finished");
    println!("{report}");
    Ok(())
}
