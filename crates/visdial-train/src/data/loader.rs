//! Batched iteration over dialogs with per-batch length trimming.

use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::dataset::{Dataset, DialogSample, DialogShape};
use super::vocab::PAD_INDEX;

/// Tensors for one batch of `B` dialogs with `R` rounds each.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, F]` f32
    pub img_feat: Tensor,
    /// `[B, R, Lq']` u32, right aligned so every question ends at the last step
    pub ques_fwd: Tensor,
    /// `[B, R, Lh']` u32
    pub hist: Tensor,
    /// `[B, R, O, La']` u32
    pub opt: Tensor,
    /// `[B * R]` u32, absent for unlabeled splits
    pub ans_ind: Option<Tensor>,
    pub batch_size: usize,
    pub num_rounds: usize,
}

/// Longest real sequence in the batch, never below 1 so RNNs get a step.
fn trimmed_len<'a>(lens: impl Iterator<Item = &'a usize>, cap: usize) -> usize {
    lens.copied().max().unwrap_or(0).clamp(1, cap.max(1))
}

/// Copy `rows` padded rows of `width` into rows of `keep` tokens.
/// Right alignment moves the first `len` tokens of a row to its end.
fn pack_rows(
    out: &mut Vec<u32>,
    rows: &[u32],
    lens: &[usize],
    width: usize,
    keep: usize,
    right_align: bool,
) {
    for (row, &len) in rows.chunks(width).zip(lens) {
        let len = len.min(keep);
        if right_align {
            out.extend(std::iter::repeat(PAD_INDEX).take(keep - len));
            out.extend_from_slice(&row[..len]);
        } else {
            let copy = keep.min(width);
            out.extend_from_slice(&row[..copy]);
            out.extend(std::iter::repeat(PAD_INDEX).take(keep - copy));
        }
    }
}

/// Stack samples into a [`Batch`], trimming each token family to the longest
/// real sequence present.
pub fn collate(samples: &[DialogSample], shape: &DialogShape, device: &Device) -> Result<Batch> {
    if samples.is_empty() {
        candle_core::bail!("cannot collate an empty batch");
    }
    if shape.max_ques_len == 0 || shape.max_hist_len == 0 || shape.max_ans_len == 0 {
        candle_core::bail!("zero-width token rows in {:?}", shape);
    }
    let b = samples.len();
    let r = shape.num_rounds;
    let o = shape.num_options;

    let lq = trimmed_len(samples.iter().flat_map(|s| &s.ques_len), shape.max_ques_len);
    let lh = trimmed_len(samples.iter().flat_map(|s| &s.hist_len), shape.max_hist_len);
    let la = trimmed_len(samples.iter().flat_map(|s| &s.opt_len), shape.max_ans_len);

    let mut img = Vec::with_capacity(b * shape.img_feature_size);
    let mut ques = Vec::with_capacity(b * r * lq);
    let mut hist = Vec::with_capacity(b * r * lh);
    let mut opt = Vec::with_capacity(b * r * o * la);
    for s in samples {
        img.extend_from_slice(&s.img_feat);
        pack_rows(&mut ques, &s.ques, &s.ques_len, shape.max_ques_len, lq, true);
        pack_rows(&mut hist, &s.hist, &s.hist_len, shape.max_hist_len, lh, false);
        pack_rows(&mut opt, &s.opt, &s.opt_len, shape.max_ans_len, la, false);
    }

    let ans_ind = samples
        .iter()
        .map(|s| s.ans_ind.as_deref())
        .collect::<Option<Vec<_>>>()
        .map(|rows| Tensor::from_vec(rows.concat(), b * r, device))
        .transpose()?;

    Ok(Batch {
        img_feat: Tensor::from_vec(img, (b, shape.img_feature_size), device)?,
        ques_fwd: Tensor::from_vec(ques, (b, r, lq), device)?,
        hist: Tensor::from_vec(hist, (b, r, lh), device)?,
        opt: Tensor::from_vec(opt, (b, r, o, la), device)?,
        ans_ind,
        batch_size: b,
        num_rounds: r,
    })
}

/// Batched data iterator.
pub struct DataLoader<'a> {
    dataset: &'a dyn Dataset,
    batch_size: usize,
    indices: Vec<usize>,
    pos: usize,
    device: Device,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        dataset: &'a dyn Dataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }
        Self {
            dataset,
            batch_size: batch_size.max(1),
            indices,
            pos: 0,
            device: device.clone(),
        }
    }

    /// Rewind for another pass, optionally reshuffling with a new seed.
    pub fn reset(&mut self, shuffle: bool, seed: u64) {
        self.indices = (0..self.dataset.len()).collect();
        if shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            self.indices.shuffle(&mut rng);
        }
        self.pos = 0;
    }

    pub fn n_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.indices.len() {
            return None;
        }

        let end = (self.pos + self.batch_size).min(self.indices.len());
        let samples: Vec<DialogSample> = self.indices[self.pos..end]
            .iter()
            .map(|&idx| self.dataset.get_item(idx))
            .collect();
        self.pos = end;

        Some(collate(&samples, &self.dataset.shape(), &self.device))
    }
}
