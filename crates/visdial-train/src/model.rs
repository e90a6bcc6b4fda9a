//! Encoder-decoder pair trained end to end.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::TrainConfig;
use crate::data::Batch;
use crate::decoder::DiscriminativeDecoder;
use crate::encoder::LateFusionEncoder;

/// Late-fusion encoder feeding a discriminative decoder.
///
/// Variables live under `encoder.*` and `decoder.*` so checkpoints keep the
/// two halves apart.
pub struct VisDialModel {
    pub encoder: LateFusionEncoder,
    pub decoder: DiscriminativeDecoder,
}

impl VisDialModel {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = LateFusionEncoder::new(config, vb.pp("encoder"))?;
        let decoder = DiscriminativeDecoder::new(config, vb.pp("decoder"))?;
        Ok(Self { encoder, decoder })
    }

    /// Option scores `[B*R, O]` for every round of the batch.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let enc_out = self
            .encoder
            .forward(&batch.img_feat, &batch.ques_fwd, &batch.hist, train)?;
        self.decoder.forward(&enc_out, &batch.opt, train)
    }
}

/// Total number of scalar parameters held by a var map.
pub fn param_count(varmap: &candle_nn::VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}
