//! Trainable building blocks shared by the encoder and decoder.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Embedding, Init, Linear, LSTMConfig, VarBuilder, VarMap, LSTM, RNN};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::config::WeightInit;
use crate::data::vocab::PAD_INDEX;

const EMBED_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 1.0,
};

/// Word embedding whose padding index maps to a zero vector.
///
/// Masking the lookup output keeps padded positions at zero and stops any
/// gradient from reaching row 0 of the table.
pub struct WordEmbedding {
    embed: Embedding,
}

impl WordEmbedding {
    pub fn new(vocab_size: usize, embed_size: usize, vb: VarBuilder) -> Result<Self> {
        let weights = vb.get_with_hints((vocab_size, embed_size), "weight", EMBED_INIT)?;
        Ok(Self {
            embed: Embedding::new(weights, embed_size),
        })
    }

    /// `ids [..]` u32 -> `[.., embed_size]`
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let embedded = self.embed.forward(ids)?;
        let mask = ids
            .ne(PAD_INDEX)?
            .to_dtype(embedded.dtype())?
            .unsqueeze(ids.rank())?;
        embedded.broadcast_mul(&mask)
    }
}

/// Multi-layer batch-first LSTM with dropout between layers.
pub struct StackedLstm {
    layers: Vec<LSTM>,
    dropout: Dropout,
    pub hidden_size: usize,
}

impl StackedLstm {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|layer_idx| {
                let in_dim = if layer_idx == 0 {
                    input_size
                } else {
                    hidden_size
                };
                let init = lstm_init(hidden_size);
                let cfg = LSTMConfig {
                    w_ih_init: init,
                    w_hh_init: init,
                    b_ih_init: Some(init),
                    b_hh_init: Some(init),
                    layer_idx,
                    ..Default::default()
                };
                candle_nn::lstm(in_dim, hidden_size, cfg, vb.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
            hidden_size,
        })
    }

    /// Run `xs [batch, seq, input]` and return the top layer's final hidden
    /// state `[batch, hidden]`.
    pub fn forward_last(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut input = xs.clone();
        let mut last = None;
        for (idx, layer) in self.layers.iter().enumerate() {
            let states = layer.seq(&input)?;
            let top = states
                .last()
                .ok_or_else(|| candle_core::Error::Msg("LSTM input has no time steps".into()))?;
            last = Some(top.h().clone());
            if idx + 1 < self.layers.len() {
                let outputs = layer.states_to_tensor(&states)?;
                input = self.dropout.forward(&outputs, train)?;
            }
        }
        last.ok_or_else(|| candle_core::Error::Msg("LSTM has no layers".into()))
    }
}

/// U(-1/sqrt(H), 1/sqrt(H)) for every LSTM weight and bias.
pub fn lstm_init(hidden_size: usize) -> Init {
    let bound = 1.0 / (hidden_size.max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Uniform init bound for the fusion weights.
pub fn fusion_init(weight_init: WeightInit, fan_in: usize, fan_out: usize) -> Init {
    let bound = match weight_init {
        WeightInit::Xavier => (6.0 / (fan_in + fan_out) as f64).sqrt(),
        // Kaiming-uniform with gain sqrt(2)
        WeightInit::Kaiming => (6.0 / fan_in as f64).sqrt(),
    };
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Linear layer with the chosen weight init and a zero bias.
pub fn fusion_linear(
    in_dim: usize,
    out_dim: usize,
    weight_init: WeightInit,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        fusion_init(weight_init, in_dim, out_dim),
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Init a variable built by this module was created with, recovered from its
/// name and shape.
pub fn init_for_var(name: &str, dims: &[usize], weight_init: WeightInit) -> Option<Init> {
    let (scope, leaf) = name.rsplit_once('.').unwrap_or(("", name));
    if ["weight_ih_l", "weight_hh_l", "bias_ih_l", "bias_hh_l"]
        .iter()
        .any(|prefix| leaf.starts_with(prefix))
    {
        return dims.first().map(|&gates| lstm_init(gates / 4));
    }
    let owner = scope.rsplit('.').next().unwrap_or(scope);
    match (owner, leaf, dims) {
        ("word_embed", "weight", _) => Some(EMBED_INIT),
        ("fusion", "weight", &[out_dim, in_dim]) => Some(fusion_init(weight_init, in_dim, out_dim)),
        ("fusion", "bias", _) => Some(Init::Const(0.0)),
        _ => None,
    }
}

fn sample_init(init: Init, n: usize, rng: &mut rand::rngs::StdRng) -> Result<Vec<f32>> {
    let values = match init {
        Init::Const(v) => vec![v as f32; n],
        Init::Uniform { lo, up } if lo < up => {
            (0..n).map(|_| rng.gen_range(lo..up) as f32).collect()
        }
        Init::Uniform { lo, .. } => vec![lo as f32; n],
        Init::Randn { mean, stdev } => {
            let normal = Normal::new(mean, stdev)
                .map_err(|e| candle_core::Error::Msg(format!("bad normal init: {}", e)))?;
            (0..n).map(|_| normal.sample(rng) as f32).collect()
        }
        other => candle_core::bail!("no seeded sampler for {:?}", other),
    };
    Ok(values)
}

/// Redraw every variable from `StdRng::seed_from_u64(seed)`, in name order,
/// with the distribution it was created with.
pub fn reseed_vars(varmap: &VarMap, weight_init: WeightInit, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("var map lock poisoned".into()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        let init = init_for_var(name, &dims, weight_init)
            .ok_or_else(|| candle_core::Error::Msg(format!("no init rule for '{}'", name)))?;
        let values = sample_init(init, var.elem_count(), &mut rng)?;
        let fresh = Tensor::from_vec(values, dims.as_slice(), var.device())?.to_dtype(var.dtype())?;
        var.set(&fresh)?;
    }
    Ok(())
}
