//! Training configuration for the late-fusion visual dialog model.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::VisDialDataset;

/// Save path that gets a start-time suffix so runs never overwrite each other.
pub const DEFAULT_SAVE_PATH: &str = "checkpoints/";

/// Format used for the save-path suffix and the start-time log line.
pub const TIMESTAMP_FORMAT: &str = "%d-%b-%Y-%H:%M:%S";

fn default_input_img() -> String {
    "data/data_img.safetensors".to_string()
}

fn default_input_ques() -> String {
    "data/visdial_data.safetensors".to_string()
}

fn default_input_json() -> String {
    "data/visdial_params.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_save_path() -> String {
    DEFAULT_SAVE_PATH.to_string()
}

fn default_save_step() -> usize {
    2
}

fn default_seed() -> u64 {
    1234
}

fn default_log_interval() -> usize {
    100
}

/// Dataset split names as they appear in the data files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    /// The test split ships without ground-truth answer indices.
    pub fn has_labels(&self) -> bool {
        !matches!(self, Split::Test)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initialization of the fusion layer weights.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum WeightInit {
    #[default]
    Xavier,
    Kaiming,
}

/// Model + data + optimization configuration.
///
/// Stored verbatim inside every checkpoint so a resumed run rebuilds the same
/// encoder and decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    // Data
    #[serde(default = "default_input_img")]
    pub input_img: String,
    #[serde(default = "default_input_ques")]
    pub input_ques: String,
    #[serde(default = "default_input_json")]
    pub input_json: String,
    /// L2-normalize image features on load
    #[serde(default = "default_true")]
    pub img_norm: bool,
    /// Concatenate all previous rounds into the history (late fusion needs this)
    #[serde(default = "default_true")]
    pub concat_history: bool,

    // Encoder / decoder
    pub img_feature_size: usize,
    pub embed_size: usize,
    pub rnn_hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f32,
    #[serde(default)]
    pub weight_init: WeightInit,

    // Filled in from the loaded dataset
    pub vocab_size: usize,
    pub max_ques_count: usize,
    pub max_ques_len: usize,
    pub max_ans_len: usize,
    pub num_options: usize,
    #[serde(default)]
    pub num_data_points: BTreeMap<Split, usize>,

    // Optimization
    pub num_epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub lr_decay_rate: f64,
    pub min_lr: f64,

    // Checkpointing
    #[serde(default = "default_save_path")]
    pub save_path: String,
    #[serde(default = "default_save_step")]
    pub save_step: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            input_img: default_input_img(),
            input_ques: default_input_ques(),
            input_json: default_input_json(),
            img_norm: true,
            concat_history: true,
            img_feature_size: 4096,
            embed_size: 300,
            rnn_hidden_size: 512,
            num_layers: 2,
            dropout: 0.5,
            weight_init: WeightInit::Xavier,
            vocab_size: 0,
            max_ques_count: 10,
            max_ques_len: 20,
            max_ans_len: 20,
            num_options: 100,
            num_data_points: BTreeMap::new(),
            num_epochs: 20,
            batch_size: 16,
            lr: 1e-3,
            lr_decay_rate: 0.9997592083,
            min_lr: 5e-5,
            save_path: default_save_path(),
            save_step: default_save_step(),
            seed: default_seed(),
            log_interval: default_log_interval(),
        }
    }
}

impl TrainConfig {
    /// Small CPU config for smoke runs on synthetic dialogs.
    pub fn tiny_cpu() -> Self {
        Self {
            img_feature_size: 16,
            embed_size: 16,
            rnn_hidden_size: 24,
            num_layers: 2,
            dropout: 0.1,
            vocab_size: 32,
            max_ques_count: 3,
            max_ques_len: 5,
            max_ans_len: 4,
            num_options: 6,
            num_epochs: 4,
            batch_size: 4,
            lr: 1e-2,
            min_lr: 1e-4,
            save_step: 2,
            log_interval: 1,
            ..Self::default()
        }
    }

    /// Validate configuration, returning every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (name, value) in [
            ("img_feature_size", self.img_feature_size),
            ("embed_size", self.embed_size),
            ("rnn_hidden_size", self.rnn_hidden_size),
            ("num_layers", self.num_layers),
            ("vocab_size", self.vocab_size),
            ("max_ques_count", self.max_ques_count),
            ("num_options", self.num_options),
            ("batch_size", self.batch_size),
            ("save_step", self.save_step),
            ("log_interval", self.log_interval),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than 0", name));
            }
        }

        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("dropout ({}) must be in [0, 1)", self.dropout));
        }

        if self.lr <= 0.0 {
            errors.push(format!("learning rate ({}) must be positive", self.lr));
        }

        if self.lr_decay_rate <= 0.0 || self.lr_decay_rate > 1.0 {
            errors.push(format!(
                "lr_decay_rate ({}) must be in (0, 1]",
                self.lr_decay_rate
            ));
        }

        if self.min_lr < 0.0 {
            errors.push(format!("min_lr ({}) must be non-negative", self.min_lr));
        }

        if self.min_lr > self.lr {
            errors.push(format!(
                "min_lr ({}) must not exceed lr ({})",
                self.min_lr, self.lr
            ));
        }

        if !self.concat_history {
            warnings.push(
                "concat_history is off; late fusion only sees the previous round".to_string(),
            );
        }

        if self.batch_size * self.max_ques_count * self.num_options > 50_000 {
            warnings.push(format!(
                "Large batch * rounds * options ({}), option encoding may be slow or OOM",
                self.batch_size * self.max_ques_count * self.num_options
            ));
        }

        for warning in &warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Number of dialogs recorded for a split (0 if not loaded).
    pub fn num_points(&self, split: Split) -> usize {
        self.num_data_points.get(&split).copied().unwrap_or(0)
    }

    /// Iterations per training epoch: ceil(train dialogs / batch_size).
    pub fn iter_per_epoch(&self) -> usize {
        self.num_points(Split::Train).div_ceil(self.batch_size.max(1))
    }

    /// Append the run start time to the default save path.
    pub fn stamp_save_path(&mut self, now: DateTime<Utc>) {
        if self.save_path == DEFAULT_SAVE_PATH {
            self.save_path
                .push_str(&now.format(TIMESTAMP_FORMAT).to_string());
        }
    }

    /// Copy sizes that only the loaded dataset knows.
    pub fn absorb_dataset(&mut self, dataset: &VisDialDataset) {
        self.vocab_size = dataset.vocab_size();
        self.max_ques_count = dataset.max_ques_count();
        self.max_ques_len = dataset.max_ques_len();
        self.max_ans_len = dataset.max_ans_len();
        self.num_options = dataset.num_options();
        self.img_feature_size = dataset.img_feature_size();
        self.num_data_points = dataset.num_data_points();
    }

    /// Take over the architecture of a saved run. Data paths, epochs and
    /// batch size stay as given on the command line.
    pub fn adopt_model_args(&mut self, saved: &TrainConfig) {
        self.img_feature_size = saved.img_feature_size;
        self.embed_size = saved.embed_size;
        self.rnn_hidden_size = saved.rnn_hidden_size;
        self.num_layers = saved.num_layers;
        self.dropout = saved.dropout;
        self.weight_init = saved.weight_init;
        self.vocab_size = saved.vocab_size;
        self.max_ques_count = saved.max_ques_count;
        self.max_ques_len = saved.max_ques_len;
        self.max_ans_len = saved.max_ans_len;
        self.num_options = saved.num_options;
        self.img_norm = saved.img_norm;
        self.concat_history = saved.concat_history;
    }

    /// Rough parameter count of encoder + decoder.
    pub fn param_count_estimate(&self) -> usize {
        let lstm = |input: usize, hidden: usize| 4 * hidden * (input + hidden + 2);
        let embed = self.vocab_size * self.embed_size;
        let mut rnn = 0;
        for layer in 0..self.num_layers {
            let input = if layer == 0 {
                self.embed_size
            } else {
                self.rnn_hidden_size
            };
            rnn += lstm(input, self.rnn_hidden_size);
        }
        let fusion_in = self.img_feature_size + 2 * self.rnn_hidden_size;
        let fusion = fusion_in * self.rnn_hidden_size + self.rnn_hidden_size;
        let decoder = embed + lstm(self.embed_size, self.rnn_hidden_size);
        embed + 2 * rnn + fusion + decoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults_match_reference_run() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.num_epochs, 20);
        assert_eq!(cfg.batch_size, 16);
        assert!((cfg.lr - 1e-3).abs() < 1e-12);
        assert!((cfg.lr_decay_rate - 0.9997592083).abs() < 1e-12);
        assert!((cfg.min_lr - 5e-5).abs() < 1e-12);
        assert_eq!(cfg.save_step, 2);
        assert_eq!(cfg.weight_init, WeightInit::Xavier);
        assert_eq!(cfg.img_feature_size, 4096);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = TrainConfig::tiny_cpu();
        assert!(cfg.validate().is_ok());

        cfg.batch_size = 0;
        cfg.dropout = 1.5;
        cfg.lr = 0.0;
        let errors = cfg.validate().unwrap_err();
        // min_lr is now above the zero lr
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("min_lr")));
        assert!(errors.iter().any(|e| e.contains("batch_size")));
        assert!(errors.iter().any(|e| e.contains("dropout")));
        assert!(errors.iter().any(|e| e.contains("learning rate")));
    }

    #[test]
    fn test_iter_per_epoch_rounds_up() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.batch_size = 16;
        cfg.num_data_points.insert(Split::Train, 33);
        assert_eq!(cfg.iter_per_epoch(), 3);

        cfg.num_data_points.insert(Split::Train, 32);
        assert_eq!(cfg.iter_per_epoch(), 2);
    }

    #[test]
    fn test_stamp_only_default_save_path() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();

        let mut cfg = TrainConfig::default();
        cfg.stamp_save_path(now);
        assert_eq!(cfg.save_path, "checkpoints/05-Mar-2024-07:08:09");

        let mut custom = TrainConfig {
            save_path: "runs/lf".to_string(),
            ..TrainConfig::default()
        };
        custom.stamp_save_path(now);
        assert_eq!(custom.save_path, "runs/lf");
    }

    #[test]
    fn test_adopt_model_args_keeps_run_options() {
        let mut saved = TrainConfig::tiny_cpu();
        saved.rnn_hidden_size = 99;
        saved.img_norm = false;
        saved.batch_size = 2;

        let mut cli = TrainConfig::default();
        cli.batch_size = 8;
        cli.adopt_model_args(&saved);

        assert_eq!(cli.rnn_hidden_size, 99);
        assert!(!cli.img_norm);
        assert_eq!(cli.batch_size, 8);
    }

    #[test]
    fn test_absorb_dataset_sizes() {
        let ds = crate::data::dataset::tests::toy_dataset();
        let mut cfg = TrainConfig::default();
        cfg.absorb_dataset(&ds);
        assert_eq!(cfg.vocab_size, 12);
        assert_eq!(cfg.max_ques_count, 2);
        assert_eq!(cfg.num_options, 3);
        assert_eq!(cfg.img_feature_size, 2);
        assert_eq!(cfg.num_points(Split::Train), 2);
    }

    #[test]
    fn test_config_json_roundtrip_with_splits() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.num_data_points.insert(Split::Train, 10);
        cfg.num_data_points.insert(Split::Val, 4);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"train\":10"));
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
