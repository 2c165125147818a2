//! Crop Disease Trainer CLI
//!
//! Entry point for training a frozen-backbone MobileNetV2 classifier on a
//! directory-per-class image dataset, and for using the trained artifact.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use crop_disease_trainer::backend::backend_name;
use crop_disease_trainer::dataset::CorruptImagePolicy;
use crop_disease_trainer::model::BackboneWeights;
use crop_disease_trainer::pipeline;
use crop_disease_trainer::utils::logging::{init_logging, LogConfig};
use crop_disease_trainer::TrainerConfig;

/// Crop Disease Classifier Trainer
///
/// Trains a dense classification head on top of a frozen, pretrained
/// MobileNetV2 using the Burn framework.
#[derive(Parser, Debug)]
#[command(name = "crop_disease_trainer")]
#[command(version)]
#[command(about = "Transfer-learning crop disease classifier trainer with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the classification head and save the model
    Train {
        /// TOML configuration file (defaults are used for anything it omits)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Training split root (one subdirectory per class)
        #[arg(long)]
        train_dir: Option<PathBuf>,

        /// Validation split root (same class subdirectories)
        #[arg(long)]
        validation_dir: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training and validation
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Image height and width the inputs are resized to
        #[arg(long, num_args = 2, value_names = ["HEIGHT", "WIDTH"])]
        image_size: Option<Vec<u32>>,

        /// Base path of the saved model (`.mpk` + `.json`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pretrained backbone record
        #[arg(long, conflicts_with = "seeded_backbone")]
        weights: Option<PathBuf>,

        /// Use a seeded random backbone instead of pretrained weights
        #[arg(long)]
        seeded_backbone: Option<u64>,

        /// Random seed for shuffling and augmentation
        #[arg(long)]
        seed: Option<u64>,

        /// Write the per-epoch history to this CSV file
        #[arg(long)]
        metrics_csv: Option<PathBuf>,

        /// Abort on the first unreadable image instead of skipping it
        #[arg(long, default_value = "false")]
        fail_on_corrupt: bool,
    },

    /// Scan a dataset root and print per-class image counts
    Inspect {
        /// Dataset root (one subdirectory per class)
        dir: PathBuf,

        /// TOML configuration file (for the accepted extensions)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Classify images with a trained model
    Predict {
        /// Base path of the saved model
        #[arg(short, long, default_value = "crop_disease_mobilenetv2")]
        model: PathBuf,

        /// Image files to classify
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Write the default configuration as TOML
    InitConfig {
        /// Destination file
        #[arg(short, long, default_value = "trainer.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value = "false")]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    match cli.command {
        Commands::Train {
            config,
            train_dir,
            validation_dir,
            epochs,
            batch_size,
            learning_rate,
            image_size,
            output,
            weights,
            seeded_backbone,
            seed,
            metrics_csv,
            fail_on_corrupt,
        } => {
            print_banner();

            let mut cfg = load_config(config)?;
            if let Some(dir) = train_dir {
                cfg.data.train_dir = dir;
            }
            if let Some(dir) = validation_dir {
                cfg.data.validation_dir = dir;
            }
            if let Some(epochs) = epochs {
                cfg.training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                cfg.data.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                cfg.optimizer.learning_rate = lr;
            }
            if let Some(size) = image_size {
                if let [height, width] = size[..] {
                    cfg.data.image_height = height;
                    cfg.data.image_width = width;
                }
            }
            if let Some(output) = output {
                cfg.output.artifact_path = output;
            }
            if let Some(path) = weights {
                cfg.model.weights = BackboneWeights::File { path };
            }
            if let Some(seed) = seeded_backbone {
                cfg.model.weights = BackboneWeights::Seeded { seed };
            }
            if let Some(seed) = seed {
                cfg.training.seed = seed;
            }
            if metrics_csv.is_some() {
                cfg.output.metrics_csv = metrics_csv;
            }
            if fail_on_corrupt {
                cfg.data.corrupt_images = CorruptImagePolicy::Fail;
            }

            cmd_train(&cfg)?;
        }

        Commands::Inspect { dir, config } => {
            let cfg = load_config(config)?;
            let stats = pipeline::inspect(&dir, &cfg.data.extensions)
                .with_context(|| format!("Failed to scan {}", dir.display()))?;
            stats.print(&dir.display().to_string());
        }

        Commands::Predict { model, images } => {
            cmd_predict(model, &images)?;
        }

        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    output.display()
                );
            }
            TrainerConfig::default().save(&output)?;
            println!(
                "{} {}",
                "Wrote default configuration to".green(),
                output.display()
            );
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════╗
 ║   🌱 Crop Disease Trainer                                     ║
 ║   Frozen MobileNetV2 + dense head, with Burn + Rust          ║
 ╚══════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn load_config(path: Option<PathBuf>) -> Result<TrainerConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TrainerConfig::load(&path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))
        }
        None => Ok(TrainerConfig::default()),
    }
}

fn cmd_train(cfg: &TrainerConfig) -> Result<()> {
    let weights = match &cfg.model.weights {
        BackboneWeights::File { path } => path.display().to_string(),
        BackboneWeights::Seeded { seed } => format!("seeded ({})", seed),
    };

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  📂 Train dir:         {}", cfg.data.train_dir.display());
    println!("  📂 Validation dir:    {}", cfg.data.validation_dir.display());
    println!("  🖼️  Image size:        {}", cfg.image_size());
    println!("  🧠 Backbone:          {} (width {})", cfg.model.architecture, cfg.model.width_multiplier);
    println!("  ⚖️  Weights:           {}", weights);
    println!("  🔄 Epochs:            {}", cfg.training.epochs);
    println!("  📦 Batch size:        {}", cfg.data.batch_size);
    println!("  📈 Learning rate:     {}", cfg.optimizer.learning_rate);
    println!("  💻 Backend:           {}", backend_name());
    println!("  💾 Output:            {}", cfg.output.artifact_path.display());
    println!();

    let summary = pipeline::run(cfg)?;

    println!();
    if let Some(best) = summary.history.best() {
        println!(
            "  🎉 Best validation accuracy: {:.2}% (epoch {})",
            best.val_accuracy * 100.0,
            best.epoch
        );
    }
    println!("{}", "Next steps:".cyan().bold());
    println!(
        "  • Run prediction: crop_disease_trainer predict --model {} <image>...",
        cfg.output.artifact_path.display()
    );

    Ok(())
}

fn cmd_predict(model: PathBuf, images: &[PathBuf]) -> Result<()> {
    let predictions = pipeline::predict_default(&model, images)
        .with_context(|| format!("Prediction with {} failed", model.display()))?;

    println!("{}", "Predictions:".cyan().bold());
    for p in predictions {
        println!(
            "  {} → {} ({:.2}%)",
            p.path.display(),
            p.class_name.green(),
            p.probability * 100.0
        );
    }
    Ok(())
}
