//! Training loop: AdamW on cross-entropy over option scores, per-iteration
//! learning-rate decay and epoch checkpoints.

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::checkpoint::{epoch_dir, final_dir, load_meta, load_weights, save_checkpoint, CheckpointMeta};
use crate::config::{TrainConfig, TIMESTAMP_FORMAT};
use crate::data::{Batch, DataLoader, Dataset};
use crate::error::{config_error, data_error, TrainError, TrainResult};
use crate::layers::reseed_vars;
use crate::logging::{log_checkpoint_save, log_training_step, StepReport};
use crate::model::{param_count, VisDialModel};
use crate::optim::{adam_params, LrDecay};

/// Weight of the newest loss in the running average.
const RUNNING_LOSS_MOMENTUM: f64 = 0.95;

/// Statistics for one optimizer step.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub loss: f64,
    /// Learning rate the step was taken with
    pub lr: f64,
}

/// Exponential moving average seeded with the first loss.
pub fn update_running_loss(running: Option<f64>, loss: f64) -> f64 {
    match running {
        None => loss,
        Some(r) => RUNNING_LOSS_MOMENTUM * r + (1.0 - RUNNING_LOSS_MOMENTUM) * loss,
    }
}

fn seed_device(device: &Device, seed: u64) {
    if let Err(e) = device.set_seed(seed) {
        debug!(seed = seed, "device rng not seeded: {}", e);
    }
}

/// Main trainer holding model + optimizer.
pub struct Trainer {
    pub model: VisDialModel,
    pub varmap: VarMap,
    optimizer: AdamW,
    decay: LrDecay,
    pub config: TrainConfig,
    pub device: Device,
    pub global_step: usize,
    /// First epoch `train_loop` runs (1-based)
    pub start_epoch: usize,
    pub running_loss: Option<f64>,
}

impl Trainer {
    pub fn new(config: TrainConfig, device: Device) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;
        seed_device(&device, config.seed);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VisDialModel::new(&config, vb)?;
        reseed_vars(&varmap, config.weight_init, config.seed)?;
        let optimizer = AdamW::new(varmap.all_vars(), adam_params(config.lr))?;
        let decay = LrDecay::new(config.lr_decay_rate, config.min_lr);

        info!(
            params = param_count(&varmap),
            device = ?device,
            "Built late-fusion encoder with discriminative decoder"
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            decay,
            config,
            device,
            global_step: 0,
            start_epoch: 1,
            running_loss: None,
        })
    }

    /// Resume from a checkpoint directory.
    ///
    /// The saved model arguments replace those in `config`; the batch size,
    /// epoch count and save path from `config` are kept.
    pub fn from_checkpoint(dir: &Path, mut config: TrainConfig, device: Device) -> TrainResult<Self> {
        let meta = load_meta(dir)?;
        config.adopt_model_args(&meta.config);

        let mut trainer = Self::new(config, device)?;
        load_weights(&mut trainer.varmap, dir)?;
        trainer.optimizer.set_learning_rate(meta.lr);
        trainer.global_step = meta.global_step;
        trainer.start_epoch = meta.epoch + 1;
        trainer.running_loss = meta.running_loss;

        info!(
            path = %dir.display(),
            epoch = meta.epoch,
            lr = meta.lr,
            "Loaded checkpoint"
        );
        Ok(trainer)
    }

    pub fn lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// One optimizer step on a labeled batch, followed by lr decay.
    pub fn train_step(&mut self, batch: &Batch) -> TrainResult<StepStats> {
        let targets = batch
            .ans_ind
            .as_ref()
            .ok_or_else(|| data_error("training batch has no answer indices"))?;

        let scores = self.model.forward(batch, true)?;
        let loss = candle_nn::loss::cross_entropy(&scores, targets)?;
        let loss_val = loss.to_scalar::<f32>()? as f64;
        if !loss_val.is_finite() {
            return Err(TrainError::Divergence {
                loss: loss_val,
                step: self.global_step,
            });
        }

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;

        let lr = self.optimizer.learning_rate();
        self.optimizer.set_learning_rate(self.decay.next(lr));
        self.global_step += 1;

        Ok(StepStats { loss: loss_val, lr })
    }

    /// Write weights and metadata for the state after `epoch`.
    pub fn save(&self, dir: &Path, epoch: usize) -> TrainResult<()> {
        let meta = CheckpointMeta {
            config: self.config.clone(),
            epoch,
            global_step: self.global_step,
            lr: self.lr(),
            running_loss: self.running_loss,
        };
        save_checkpoint(&self.varmap, &meta, dir)?;
        log_checkpoint_save(epoch, &dir.display().to_string(), meta.lr);
        Ok(())
    }

    /// Train from `start_epoch` through `num_epochs`, checkpointing every
    /// `save_step` epochs and once more at the end.
    pub fn train_loop(&mut self, dataset: &dyn Dataset) -> TrainResult<()> {
        if dataset.is_empty() {
            return Err(data_error("training split is empty"));
        }
        if self.start_epoch > self.config.num_epochs {
            warn!(
                start_epoch = self.start_epoch,
                num_epochs = self.config.num_epochs,
                "Nothing left to train"
            );
        }

        let iter_per_epoch = dataset.len().div_ceil(self.config.batch_size.max(1));
        let log_interval = self.config.log_interval.max(1);
        let save_step = self.config.save_step.max(1);
        let save_path = self.config.save_path.clone();

        info!(
            "Training start time: {}",
            chrono::Utc::now().format(TIMESTAMP_FORMAT)
        );
        info!(
            iter_per_epoch = iter_per_epoch,
            start_epoch = self.start_epoch,
            num_epochs = self.config.num_epochs,
            "Starting training"
        );

        let train_start = Instant::now();
        let mut last_epoch = self.start_epoch - 1;
        for epoch in self.start_epoch..=self.config.num_epochs {
            let loader = DataLoader::new(
                dataset,
                self.config.batch_size,
                true,
                self.config.seed.wrapping_add(epoch as u64),
                &self.device,
            );

            for (i, batch) in loader.enumerate() {
                let batch = batch?;
                let stats = self.train_step(&batch)?;
                let running = update_running_loss(self.running_loss, stats.loss);
                self.running_loss = Some(running);

                if i % log_interval == 0 {
                    log_training_step(&StepReport {
                        elapsed: train_start.elapsed(),
                        epoch,
                        iteration: (epoch - 1) * iter_per_epoch + i,
                        running_loss: running,
                        lr: self.lr(),
                    });
                }
            }

            last_epoch = epoch;
            if epoch % save_step == 0 {
                self.save(&epoch_dir(&save_path, epoch), epoch)?;
            }
        }

        self.save(&final_dir(&save_path), last_epoch)
    }
}
