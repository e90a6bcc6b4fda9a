pub mod schedule;

pub use schedule::LrDecay;

use candle_nn::ParamsAdamW;

/// Plain Adam hyper-parameters (AdamW with weight decay disabled).
pub fn adam_params(lr: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
        weight_decay: 0.0,
    }
}
