//! Discriminative decoder: scores every answer option against the encoder
//! output by dot product.

use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::TrainConfig;
use crate::layers::{StackedLstm, WordEmbedding};

pub struct DiscriminativeDecoder {
    word_embed: WordEmbedding,
    option_rnn: StackedLstm,
}

impl DiscriminativeDecoder {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let word_embed = WordEmbedding::new(
            config.vocab_size,
            config.embed_size,
            vb.pp("word_embed"),
        )?;
        let option_rnn = StackedLstm::new(
            config.embed_size,
            config.rnn_hidden_size,
            1,
            config.dropout,
            vb.pp("option_rnn"),
        )?;
        Ok(Self {
            word_embed,
            option_rnn,
        })
    }

    /// `enc_out [B*R, H]`, `opt [B, R, O, La]` -> scores `[B*R, O]`
    pub fn forward(&self, enc_out: &Tensor, opt: &Tensor, train: bool) -> Result<Tensor> {
        let (b, r, o, la) = opt.dims4()?;
        let (rows, h) = enc_out.dims2()?;
        if rows != b * r {
            candle_core::bail!(
                "encoder produced {} rows for {} dialogs x {} rounds",
                rows,
                b,
                r
            );
        }

        let options = opt.reshape((b * r * o, la))?;
        let embedded = self.word_embed.forward(&options)?;
        let option_embed = self
            .option_rnn
            .forward_last(&embedded, train)?
            .reshape((b * r, o, h))?;

        let enc = enc_out.unsqueeze(1)?.broadcast_as((b * r, o, h))?;
        (option_embed * enc)?.sum(D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny() -> TrainConfig {
        TrainConfig {
            embed_size: 4,
            rnn_hidden_size: 6,
            vocab_size: 10,
            ..TrainConfig::tiny_cpu()
        }
    }

    #[test]
    fn test_scores_every_option() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = DiscriminativeDecoder::new(&tiny(), vb)?;

        let enc_out = Tensor::randn(0.0f32, 1.0, (2 * 3, 6), &device)?;
        let opt = Tensor::ones((2, 3, 4, 2), DType::U32, &device)?;
        let scores = dec.forward(&enc_out, &opt, true)?;
        assert_eq!(scores.dims(), &[6, 4]);
        Ok(())
    }

    #[test]
    fn test_identical_options_score_equal() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = DiscriminativeDecoder::new(&tiny(), vb)?;

        let enc_out = Tensor::randn(0.0f32, 1.0, (1, 6), &device)?;
        let opt = Tensor::new(&[[[[2u32, 3], [2, 3], [5, 0]]]], &device)?;
        let scores = dec.forward(&enc_out, &opt, false)?.to_vec2::<f32>()?;
        assert!((scores[0][0] - scores[0][1]).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_row_count_mismatch_is_an_error() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = DiscriminativeDecoder::new(&tiny(), vb)?;

        let enc_out = Tensor::zeros((5, 6), DType::F32, &device)?;
        let opt = Tensor::ones((2, 3, 4, 2), DType::U32, &device)?;
        assert!(dec.forward(&enc_out, &opt, false).is_err());
        Ok(())
    }
}
