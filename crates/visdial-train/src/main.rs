//! CLI entry point for visdial-train.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use visdial_train::checkpoint::load_meta;
use visdial_train::config::{Split, TrainConfig, WeightInit, DEFAULT_SAVE_PATH};
use visdial_train::data::{SyntheticSpec, VisDialDataset};
use visdial_train::eval::{evaluate, load_model};
use visdial_train::logging::{init_logging, log_config, log_evaluation};
use visdial_train::train::Trainer;

fn resolve_device(device: &str) -> Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        #[cfg(feature = "cuda")]
        "cuda" => Device::new_cuda(0).context("Failed to initialize CUDA device 0"),
        #[cfg(feature = "cuda")]
        s if s.starts_with("cuda:") => {
            let id: usize = s["cuda:".len()..]
                .parse()
                .with_context(|| format!("Invalid CUDA device id in '{}'", s))?;
            Device::new_cuda(id).with_context(|| format!("Failed to initialize CUDA device {}", id))
        }
        other => bail!("Unknown device: {}. Use 'cpu', 'cuda', or 'cuda:N'.", other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DataSource {
    /// Preprocessed VisDial files
    Visdial,
    /// Generated dialogs for smoke runs
    Synthetic,
}

#[derive(Args, Debug)]
struct DataArgs {
    #[arg(long, value_enum, default_value = "visdial")]
    dataset: DataSource,

    /// Image features (safetensors, `images_{split}`)
    #[arg(long, default_value = "data/data_img.safetensors")]
    input_img: String,

    /// Preprocessed dialogs (safetensors)
    #[arg(long, default_value = "data/visdial_data.safetensors")]
    input_ques: String,

    /// Vocabulary and image index
    #[arg(long, default_value = "data/visdial_params.json")]
    input_json: String,

    /// Number of generated dialogs per split with --dataset synthetic
    #[arg(long, default_value = "64")]
    synthetic_dialogs: usize,

    /// Words in the generated vocabulary with --dataset synthetic
    #[arg(long, default_value = "64")]
    synthetic_words: usize,
}

impl DataArgs {
    fn apply(&self, cfg: &mut TrainConfig) {
        cfg.input_img = self.input_img.clone();
        cfg.input_ques = self.input_ques.clone();
        cfg.input_json = self.input_json.clone();
    }

    fn load(&self, cfg: &TrainConfig, splits: &[Split]) -> Result<VisDialDataset> {
        let dataset = match self.dataset {
            DataSource::Visdial => VisDialDataset::load(cfg, splits)?,
            DataSource::Synthetic => {
                let mut spec = SyntheticSpec::from_config(cfg, self.synthetic_dialogs);
                if cfg.vocab_size == 0 {
                    spec.num_words = self.synthetic_words.max(2);
                }
                VisDialDataset::synthetic(&spec, splits, cfg.concat_history)?
            }
        };
        Ok(dataset)
    }
}

#[derive(Parser)]
#[command(
    name = "visdial-train",
    about = "Train and evaluate late-fusion visual dialog models in Rust"
)]
struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an encoder-decoder model
    Train {
        #[command(flatten)]
        data: DataArgs,

        /// L2-normalize image features
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        img_norm: bool,

        #[arg(long, default_value = "4096")]
        img_feature_size: usize,

        #[arg(long, default_value = "300")]
        embed_size: usize,

        #[arg(long, default_value = "512")]
        rnn_hidden_size: usize,

        #[arg(long, default_value = "2")]
        num_layers: usize,

        #[arg(long, default_value = "0.5")]
        dropout: f32,

        #[arg(long, value_enum, default_value = "xavier")]
        weight_init: WeightInit,

        #[arg(long, default_value = "20")]
        num_epochs: usize,

        /// Overrides the saved batch size when resuming
        #[arg(long, default_value = "16")]
        batch_size: usize,

        #[arg(long, default_value = "1e-3")]
        lr: f64,

        /// Multiplied into the learning rate after every iteration
        #[arg(long, default_value = "0.9997592083")]
        lr_decay_rate: f64,

        #[arg(long, default_value = "5e-5")]
        min_lr: f64,

        /// Checkpoint directory; the default gets a start-time suffix
        #[arg(long, default_value = DEFAULT_SAVE_PATH)]
        save_path: String,

        /// Save a checkpoint every N epochs
        #[arg(long, default_value = "2")]
        save_step: usize,

        /// Resume from a checkpoint directory
        #[arg(long)]
        load_path: Option<PathBuf>,

        #[arg(long, default_value = "1234")]
        seed: u64,

        /// Log every N iterations
        #[arg(long, default_value = "100")]
        log_interval: usize,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Rank answer options with a trained checkpoint
    Evaluate {
        #[command(flatten)]
        data: DataArgs,

        /// Checkpoint directory
        #[arg(long)]
        load_path: PathBuf,

        #[arg(long, value_enum, default_value = "val")]
        split: Split,

        /// Defaults to the batch size the checkpoint was trained with
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn run_train(
    mut cfg: TrainConfig,
    data: &DataArgs,
    load_path: Option<&Path>,
    device: Device,
) -> Result<()> {
    if let Some(dir) = load_path {
        let meta = load_meta(dir)?;
        cfg.adopt_model_args(&meta.config);
        tracing::info!("Resuming from checkpoint: {}", dir.display());
    }

    let dataset = data.load(&cfg, &[Split::Train])?;
    cfg.absorb_dataset(&dataset);
    cfg.stamp_save_path(chrono::Utc::now());

    tracing::info!("=== visdial-train ===");
    log_config(&cfg);
    tracing::info!(
        "Model params: ~{:.1}M",
        cfg.param_count_estimate() as f64 / 1e6
    );
    tracing::info!("Iterations per epoch: {}", cfg.iter_per_epoch());

    let mut trainer = match load_path {
        Some(dir) => Trainer::from_checkpoint(dir, cfg, device)?,
        None => Trainer::new(cfg, device)?,
    };
    trainer.train_loop(dataset.split(Split::Train)?)?;
    tracing::info!("Training complete. Checkpoints in {}", trainer.config.save_path);
    Ok(())
}

fn run_evaluate(
    data: &DataArgs,
    load_path: &Path,
    split: Split,
    batch_size: Option<usize>,
    device: Device,
) -> Result<()> {
    if !split.has_labels() {
        bail!("split '{}' has no ground-truth answers to rank against", split);
    }
    let (model, meta) = load_model(load_path, &device)
        .with_context(|| format!("Failed to load checkpoint {}", load_path.display()))?;

    let mut cfg = meta.config;
    data.apply(&mut cfg);
    let dataset = data.load(&cfg, &[split])?;

    let batch_size = batch_size.unwrap_or(cfg.batch_size);
    if batch_size == 0 {
        bail!("--batch-size must be > 0");
    }
    tracing::info!(
        "Evaluating epoch {} checkpoint on {} ({} dialogs)",
        meta.epoch,
        split,
        dataset.num_data_points().get(&split).copied().unwrap_or(0)
    );
    let metrics = evaluate(&model, dataset.split(split)?, batch_size, &device, true)?;
    log_evaluation(split.as_str(), &metrics);
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Train {
            data,
            img_norm,
            img_feature_size,
            embed_size,
            rnn_hidden_size,
            num_layers,
            dropout,
            weight_init,
            num_epochs,
            batch_size,
            lr,
            lr_decay_rate,
            min_lr,
            save_path,
            save_step,
            load_path,
            seed,
            log_interval,
            device,
        } => {
            let device = resolve_device(&device)?;
            let mut cfg = TrainConfig {
                img_norm,
                // late fusion always reads the full dialog so far
                concat_history: true,
                img_feature_size,
                embed_size,
                rnn_hidden_size,
                num_layers,
                dropout,
                weight_init,
                num_epochs,
                batch_size,
                lr,
                lr_decay_rate,
                min_lr,
                save_path,
                save_step,
                seed,
                log_interval,
                ..TrainConfig::default()
            };
            data.apply(&mut cfg);
            run_train(cfg, &data, load_path.as_deref(), device)
        }
        Commands::Evaluate {
            data,
            load_path,
            split,
            batch_size,
            device,
        } => {
            let device = resolve_device(&device)?;
            run_evaluate(&data, &load_path, split, batch_size, device)
        }
    }
}
