//! Late-fusion encoder: image, question and full history fused by one
//! linear layer.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use crate::config::TrainConfig;
use crate::layers::{fusion_linear, StackedLstm, WordEmbedding};

pub struct LateFusionEncoder {
    word_embed: WordEmbedding,
    ques_rnn: StackedLstm,
    hist_rnn: StackedLstm,
    dropout: Dropout,
    fusion: Linear,
    img_feature_size: usize,
    hidden_size: usize,
}

impl LateFusionEncoder {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let word_embed = WordEmbedding::new(
            config.vocab_size,
            config.embed_size,
            vb.pp("word_embed"),
        )?;
        let ques_rnn = StackedLstm::new(
            config.embed_size,
            config.rnn_hidden_size,
            config.num_layers,
            config.dropout,
            vb.pp("ques_rnn"),
        )?;
        let hist_rnn = StackedLstm::new(
            config.embed_size,
            config.rnn_hidden_size,
            config.num_layers,
            config.dropout,
            vb.pp("hist_rnn"),
        )?;
        let fusion_size = config.img_feature_size + 2 * config.rnn_hidden_size;
        let fusion = fusion_linear(
            fusion_size,
            config.rnn_hidden_size,
            config.weight_init,
            vb.pp("fusion"),
        )?;
        Ok(Self {
            word_embed,
            ques_rnn,
            hist_rnn,
            dropout: Dropout::new(config.dropout),
            fusion,
            img_feature_size: config.img_feature_size,
            hidden_size: config.rnn_hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Embed `tokens [B, R, L]` per round and return final states `[B*R, H]`.
    fn encode_rounds(&self, rnn: &StackedLstm, tokens: &Tensor, train: bool) -> Result<Tensor> {
        let (b, r, len) = tokens.dims3()?;
        let flat = tokens.reshape((b * r, len))?;
        let embedded = self.word_embed.forward(&flat)?;
        rnn.forward_last(&embedded, train)
    }

    /// `img [B, F]`, `ques [B, R, Lq]`, `hist [B, R, Lh]` -> `[B*R, H]`
    pub fn forward(&self, img: &Tensor, ques: &Tensor, hist: &Tensor, train: bool) -> Result<Tensor> {
        let (b, f) = img.dims2()?;
        if f != self.img_feature_size {
            candle_core::bail!(
                "image features have width {}, encoder expects {}",
                f,
                self.img_feature_size
            );
        }
        let (qb, r, _) = ques.dims3()?;
        let (hb, hr, _) = hist.dims3()?;
        if qb != b || hb != b || hr != r {
            candle_core::bail!(
                "batch mismatch: img {:?}, ques {:?}, hist {:?}",
                img.dims(),
                ques.dims(),
                hist.dims()
            );
        }

        // same image for every round of the dialog
        let img = img
            .unsqueeze(1)?
            .broadcast_as((b, r, f))?
            .contiguous()?
            .reshape((b * r, f))?;

        let ques_embed = self.encode_rounds(&self.ques_rnn, ques, train)?;
        let hist_embed = self.encode_rounds(&self.hist_rnn, hist, train)?;

        let fused = Tensor::cat(&[&img, &ques_embed, &hist_embed], 1)?;
        let fused = self.dropout.forward(&fused, train)?;
        self.fusion.forward(&fused)?.tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny() -> TrainConfig {
        TrainConfig {
            img_feature_size: 5,
            embed_size: 4,
            rnn_hidden_size: 6,
            num_layers: 2,
            vocab_size: 10,
            ..TrainConfig::tiny_cpu()
        }
    }

    #[test]
    fn test_output_is_one_row_per_round() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = LateFusionEncoder::new(&tiny(), vb)?;

        let img = Tensor::randn(0.0f32, 1.0, (2, 5), &device)?;
        let ques = Tensor::new(&[[[0u32, 1, 2], [0, 0, 3]], [[4, 5, 6], [0, 7, 8]]], &device)?;
        let hist = Tensor::new(&[[[1u32, 2], [3, 0]], [[4, 0], [5, 6]]], &device)?;
        let out = enc.forward(&img, &ques, &hist, true)?;
        assert_eq!(out.dims(), &[4, 6]);

        // tanh keeps every entry inside (-1, 1)
        let max = out.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max < 1.0);
        Ok(())
    }

    #[test]
    fn test_rounds_of_a_dialog_share_the_image() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = LateFusionEncoder::new(&tiny(), vb)?;

        let img = Tensor::randn(0.0f32, 1.0, (1, 5), &device)?;
        let ques = Tensor::new(&[[[1u32, 2], [1, 2]]], &device)?;
        let hist = Tensor::new(&[[[3u32], [3]]], &device)?;
        let rows = enc.forward(&img, &ques, &hist, false)?.to_vec2::<f32>()?;
        for (a, b) in rows[0].iter().zip(&rows[1]) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_image_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = LateFusionEncoder::new(&tiny(), vb)?;

        let img = Tensor::zeros((1, 3), DType::F32, &device)?;
        let ques = Tensor::new(&[[[1u32]]], &device)?;
        let hist = Tensor::new(&[[[1u32]]], &device)?;
        assert!(enc.forward(&img, &ques, &hist, false).is_err());
        Ok(())
    }
}
