//! Ranking evaluation of a trained model on a labeled split.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{load_meta, load_weights, CheckpointMeta};
use crate::data::{DataLoader, Dataset};
use crate::error::{config_error, data_error, TrainResult};
use crate::metrics::{ranks_from_scores, RankMetrics};
use crate::model::VisDialModel;

/// Rebuild a model from a checkpoint directory for inference.
pub fn load_model(dir: &Path, device: &Device) -> TrainResult<(VisDialModel, CheckpointMeta)> {
    let meta = load_meta(dir)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = VisDialModel::new(&meta.config, vb)?;
    load_weights(&mut varmap, dir)?;
    Ok((model, meta))
}

/// Rank the ground-truth answer among all options for every round of
/// `dataset`, with dropout disabled.
pub fn evaluate(
    model: &VisDialModel,
    dataset: &dyn Dataset,
    batch_size: usize,
    device: &Device,
    show_progress: bool,
) -> TrainResult<RankMetrics> {
    let loader = DataLoader::new(dataset, batch_size, false, 0, device);
    let pb = if show_progress {
        ProgressBar::new(loader.n_batches() as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| config_error(e.to_string()))?
            .progress_chars("=>-"),
    );

    let mut ranks = Vec::with_capacity(dataset.len() * dataset.shape().num_rounds);
    for batch in loader {
        let batch = batch?;
        let gt = batch
            .ans_ind
            .as_ref()
            .ok_or_else(|| data_error("evaluation split has no answer indices"))?;
        let scores = model.forward(&batch, false)?;
        ranks.extend(ranks_from_scores(&scores, gt)?);
        pb.inc(1);
    }
    pb.finish_with_message(format!("{} rounds", ranks.len()));

    Ok(RankMetrics::from_ranks(&ranks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Split, TrainConfig};
    use crate::data::{SyntheticSpec, VisDialDataset};

    #[test]
    fn test_untrained_model_ranks_every_round() {
        let device = Device::Cpu;
        let mut cfg = TrainConfig::tiny_cpu();
        let ds = VisDialDataset::synthetic(&SyntheticSpec::from_config(&cfg, 5), &[Split::Val], true)
            .unwrap();
        cfg.absorb_dataset(&ds);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VisDialModel::new(&cfg, vb).unwrap();

        let val = ds.split(Split::Val).unwrap();
        let m = evaluate(&model, val, 2, &device, false).unwrap();
        assert_eq!(m.count, 5 * cfg.max_ques_count);
        assert!(m.mean_rank >= 1.0 && m.mean_rank <= cfg.num_options as f64);
        assert!(m.r1 <= m.r5 && m.r5 <= m.r10);
    }

    #[test]
    fn test_unlabeled_split_is_rejected() {
        let device = Device::Cpu;
        let mut cfg = TrainConfig::tiny_cpu();
        let ds = VisDialDataset::synthetic(&SyntheticSpec::from_config(&cfg, 2), &[Split::Test], true)
            .unwrap();
        cfg.absorb_dataset(&ds);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VisDialModel::new(&cfg, vb).unwrap();

        let test = ds.split(Split::Test).unwrap();
        assert!(evaluate(&model, test, 2, &device, false).is_err());
    }
}
