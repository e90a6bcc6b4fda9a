//! Training checkpoint save/load.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::{checkpoint_error, IoResultExt, TrainResult};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TrainConfig,
    /// Last completed epoch
    pub epoch: usize,
    pub global_step: usize,
    /// Learning rate to resume with
    pub lr: f64,
    pub running_loss: Option<f64>,
}

/// Directory for the checkpoint written after `epoch`.
pub fn epoch_dir(save_path: impl AsRef<Path>, epoch: usize) -> PathBuf {
    save_path.as_ref().join(format!("model_epoch_{}", epoch))
}

/// Directory for the checkpoint written when training finishes.
pub fn final_dir(save_path: impl AsRef<Path>) -> PathBuf {
    save_path.as_ref().join("model_final")
}

/// Save training checkpoint to directory.
///
/// Creates:
///   - `<dir>/model.safetensors` (model weights)
///   - `<dir>/meta.json` (config, epoch, learning rate)
pub fn save_checkpoint(varmap: &VarMap, meta: &CheckpointMeta, dir: &Path) -> TrainResult<()> {
    std::fs::create_dir_all(dir).with_path(dir)?;

    let weights_path = dir.join(WEIGHTS_FILE);
    varmap
        .save(&weights_path)
        .map_err(|e| checkpoint_error(e.to_string(), &weights_path))?;

    let meta_path = dir.join(META_FILE);
    let json = serde_json::to_string_pretty(meta)?;
    std::fs::write(&meta_path, json).with_path(&meta_path)?;

    Ok(())
}

/// Read checkpoint metadata without touching the weights.
pub fn load_meta(dir: &Path) -> TrainResult<CheckpointMeta> {
    let meta_path = dir.join(META_FILE);
    let meta_json = std::fs::read_to_string(&meta_path).with_path(&meta_path)?;
    serde_json::from_str(&meta_json)
        .map_err(|e| checkpoint_error(format!("invalid metadata: {}", e), &meta_path))
}

/// Overwrite the variables of `varmap` with saved weights.
///
/// Only variables that already exist are filled, so the model must be built
/// on this var map first. A variable missing from the file is an error.
pub fn load_weights(varmap: &mut VarMap, dir: &Path) -> TrainResult<()> {
    let weights_path = dir.join(WEIGHTS_FILE);
    if !weights_path.exists() {
        return Err(checkpoint_error("weights file not found", &weights_path));
    }
    if varmap.all_vars().is_empty() {
        return Err(checkpoint_error(
            "no model variables to load into",
            &weights_path,
        ));
    }
    varmap
        .load(&weights_path)
        .map_err(|e| checkpoint_error(e.to_string(), &weights_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VisDialModel;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn tiny_config() -> TrainConfig {
        TrainConfig {
            img_feature_size: 6,
            embed_size: 4,
            rnn_hidden_size: 5,
            num_layers: 1,
            vocab_size: 12,
            ..TrainConfig::tiny_cpu()
        }
    }

    fn build(cfg: &TrainConfig) -> (VarMap, VisDialModel) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VisDialModel::new(cfg, vb).unwrap();
        (varmap, model)
    }

    fn meta(cfg: &TrainConfig) -> CheckpointMeta {
        CheckpointMeta {
            config: cfg.clone(),
            epoch: 4,
            global_step: 40,
            lr: 7.5e-4,
            running_loss: Some(1.25),
        }
    }

    #[test]
    fn test_checkpoint_dirs() {
        assert_eq!(
            epoch_dir("runs/a", 6),
            PathBuf::from("runs/a/model_epoch_6")
        );
        assert_eq!(final_dir("runs/a"), PathBuf::from("runs/a/model_final"));
    }

    #[test]
    fn test_checkpoint_save_load_roundtrip() {
        let cfg = tiny_config();
        let (varmap, _model) = build(&cfg);

        let dir = tempfile::tempdir().unwrap();
        let ckpt = epoch_dir(dir.path(), 4);
        save_checkpoint(&varmap, &meta(&cfg), &ckpt).unwrap();
        assert!(ckpt.join(WEIGHTS_FILE).exists());
        assert!(ckpt.join(META_FILE).exists());

        let (mut restored, _model) = build(&cfg);
        load_weights(&mut restored, &ckpt).unwrap();

        let saved = varmap.data().lock().unwrap();
        let loaded = restored.data().lock().unwrap();
        assert_eq!(saved.len(), loaded.len());
        for (name, var) in saved.iter() {
            let other = loaded.get(name).unwrap();
            let diff = (var.as_tensor() - other.as_tensor())
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0, "{} differs", name);
        }
    }

    #[test]
    fn test_checkpoint_metadata_preserved() {
        let cfg = tiny_config();
        let (varmap, _model) = build(&cfg);

        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&varmap, &meta(&cfg), dir.path()).unwrap();

        let loaded = load_meta(dir.path()).unwrap();
        assert_eq!(loaded.epoch, 4);
        assert_eq!(loaded.global_step, 40);
        assert!((loaded.lr - 7.5e-4).abs() < 1e-12);
        assert_eq!(loaded.running_loss, Some(1.25));
        assert_eq!(loaded.config, cfg);
    }

    #[test]
    fn test_load_into_empty_varmap_fails() {
        let cfg = tiny_config();
        let (varmap, _model) = build(&cfg);
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&varmap, &meta(&cfg), dir.path()).unwrap();

        let mut empty = VarMap::new();
        let err = load_weights(&mut empty, dir.path()).unwrap_err();
        assert!(err.path().is_some());
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let cfg = tiny_config();
        let (varmap, _model) = build(&cfg);
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&varmap, &meta(&cfg), dir.path()).unwrap();

        let wider = TrainConfig {
            rnn_hidden_size: 7,
            ..cfg
        };
        let (mut other, _model) = build(&wider);
        assert!(load_weights(&mut other, dir.path()).is_err());
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_meta(dir.path()).is_err());
        let mut varmap = VarMap::new();
        assert!(load_weights(&mut varmap, dir.path()).is_err());
    }
}
