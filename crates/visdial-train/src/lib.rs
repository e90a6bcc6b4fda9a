//! # VisDial Training Library
//!
//! Visual dialog answer ranking on candle: a late-fusion encoder over image
//! features, the current question and the dialog history, and a
//! discriminative decoder that scores the candidate answers of every round.
//!
//! ## Architecture Overview
//!
//! - **Data**: safetensors dialog arrays, vocabulary from the params JSON,
//!   concatenated history, per-batch length trimming
//! - **Model**: word embeddings + stacked LSTMs, linear fusion with `tanh`,
//!   dot-product option scoring
//! - **Training**: AdamW (no weight decay) on cross-entropy, per-iteration
//!   exponential lr decay with a floor, epoch checkpoints with resume
//! - **Evaluation**: recall@{1,5,10}, mean rank and MRR
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use visdial_train::config::{Split, TrainConfig};
//! use visdial_train::data::{SyntheticSpec, VisDialDataset};
//! use visdial_train::train::Trainer;
//! use candle_core::Device;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = TrainConfig::tiny_cpu();
//! let dataset = VisDialDataset::synthetic(
//!     &SyntheticSpec::from_config(&config, 64),
//!     &[Split::Train],
//!     true,
//! )?;
//! config.absorb_dataset(&dataset);
//!
//! let mut trainer = Trainer::new(config, Device::Cpu)?;
//! trainer.train_loop(dataset.split(Split::Train)?)?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod eval;
pub mod layers;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod train;
