use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jarvis_core::dataset::load_dataset;
use jarvis_core::{AudioCache, ImageSize, Model, NearestNeighborTrainer, SpeechBackend, Trainer};
use jarvis_hw::{Camera, CloudSpeech};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "jarvis", version, about = "Jarvis face recognition tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a photo dataset and save it
    Train {
        /// Dataset root (one subfolder per person)
        dataset: PathBuf,
        /// Output model file
        model: PathBuf,
        /// Face size, WIDTHxHEIGHT
        #[arg(short, long, default_value = "100x100")]
        resize: ImageSize,
    },
    /// Cross-validate a dataset with k folds
    Validate {
        dataset: PathBuf,
        #[arg(short, default_value_t = 5)]
        k: usize,
        #[arg(short, long, default_value = "100x100")]
        resize: ImageSize,
    },
    /// Print a summary of a saved model as JSON
    Info { model: PathBuf },
    /// List video capture devices
    Devices,
    /// Speak a phrase through the announcement backend
    Say {
        text: String,
        #[arg(long, default_value = "en")]
        lang: String,
        /// Rendered audio cache
        #[arg(long, default_value = "audio")]
        audio_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { dataset, model, resize } => {
            let set = load_dataset(&dataset, resize)
                .with_context(|| format!("failed to load dataset {}", dataset.display()))?;
            let trained = NearestNeighborTrainer.train(&set)?;
            trained.save(&model)?;
            println!(
                "Trained {} subjects from {} photos -> {}",
                trained.subject_names().len(),
                trained.sample_count(),
                model.display()
            );
        }
        Commands::Validate { dataset, k, resize } => {
            let set = load_dataset(&dataset, resize)
                .with_context(|| format!("failed to load dataset {}", dataset.display()))?;
            let report = jarvis_core::validate::kfold(&NearestNeighborTrainer, &set, k)?;
            println!("{report}");
        }
        Commands::Info { model } => {
            let loaded = Model::load(&model).with_context(|| format!("failed to load {}", model.display()))?;
            let subjects: Vec<&str> = loaded.subject_names().iter().map(|(_, name)| name).collect();
            let summary = serde_json::json!({
                "path": model.display().to_string(),
                "image_size": loaded.image_size().to_string(),
                "samples": loaded.sample_count(),
                "subjects": subjects,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.card, d.driver, d.bus);
            }
        }
        Commands::Say { text, lang, audio_dir } => {
            let speech = CloudSpeech::new(&lang)?;
            let cache = AudioCache::new(audio_dir);
            let audio = cache.get_or_render(&text, &speech)?;
            speech.play(&audio)?;
        }
    }

    Ok(())
}
