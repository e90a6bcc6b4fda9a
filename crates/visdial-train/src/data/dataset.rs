//! VisDial dialogs: raw split arrays, history processing and per-dialog samples.
//!
//! On-disk layout (safetensors, integer tensors may be i64 or u32):
//!
//! | key                | shape       | notes                         |
//! |--------------------|-------------|-------------------------------|
//! | `ques_{s}`         | `[N, R, Lq]`| left aligned, 0 padded        |
//! | `ques_length_{s}`  | `[N, R]`    |                               |
//! | `ans_{s}`          | `[N, R, La]`|                               |
//! | `ans_length_{s}`   | `[N, R]`    |                               |
//! | `cap_{s}`          | `[N, Lc]`   |                               |
//! | `cap_length_{s}`   | `[N]`       |                               |
//! | `opt_{s}`          | `[N, R, O]` | 1-based rows of `opt_list_{s}`|
//! | `opt_list_{s}`     | `[M, La]`   |                               |
//! | `opt_length_{s}`   | `[M]`       |                               |
//! | `ans_index_{s}`    | `[N, R]`    | 1-based, absent for test      |
//! | `img_pos_{s}`      | `[N]`       | 0-based image row             |
//!
//! Image features live in a second file under `images_{s}` `[I, F]`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::{Split, TrainConfig};
use crate::data::vocab::{Vocabulary, PAD_INDEX};
use crate::error::{data_error, TrainResult};

/// Upper bound on concatenated history length.
pub const MAX_CONCAT_HISTORY: usize = 300;

/// Static sizes shared by every sample of a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogShape {
    pub num_rounds: usize,
    pub max_ques_len: usize,
    pub max_hist_len: usize,
    pub max_ans_len: usize,
    pub num_options: usize,
    pub img_feature_size: usize,
}

/// One dialog: image, all rounds of questions, history and answer options.
///
/// Token arrays are row-major and padded to the split's [`DialogShape`].
#[derive(Debug, Clone)]
pub struct DialogSample {
    pub img_feat: Vec<f32>,
    /// `[R, Lq]`
    pub ques: Vec<u32>,
    pub ques_len: Vec<usize>,
    /// `[R, Lh]`
    pub hist: Vec<u32>,
    pub hist_len: Vec<usize>,
    /// `[R, O, La]`
    pub opt: Vec<u32>,
    pub opt_len: Vec<usize>,
    /// 0-based ground-truth option per round
    pub ans_ind: Option<Vec<u32>>,
}

/// A dataset yields dialog samples of a fixed shape.
pub trait Dataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn shape(&self) -> DialogShape;
    fn get_item(&self, idx: usize) -> DialogSample;
}

/// Arrays of one split exactly as stored on disk.
#[derive(Debug, Clone)]
pub struct RawSplit {
    pub num_dialogs: usize,
    pub num_rounds: usize,
    pub max_ques_len: usize,
    pub max_ans_len: usize,
    pub max_cap_len: usize,
    pub num_options: usize,
    pub img_feature_size: usize,
    pub ques: Vec<u32>,
    pub ques_len: Vec<u32>,
    pub ans: Vec<u32>,
    pub ans_len: Vec<u32>,
    pub cap: Vec<u32>,
    pub cap_len: Vec<u32>,
    pub opt: Vec<u32>,
    pub opt_list: Vec<u32>,
    pub opt_len: Vec<u32>,
    pub ans_index: Option<Vec<u32>>,
    pub img_pos: Vec<u32>,
    pub img_feats: Vec<f32>,
}

fn take<'a>(map: &'a HashMap<String, Tensor>, key: &str) -> TrainResult<&'a Tensor> {
    map.get(key)
        .ok_or_else(|| data_error(format!("missing tensor '{}'", key)))
}

fn ids<const N: usize>(
    map: &HashMap<String, Tensor>,
    key: &str,
) -> TrainResult<(Vec<u32>, [usize; N])> {
    let t = take(map, key)?;
    let dims = <[usize; N]>::try_from(t.dims()).map_err(|_| {
        data_error(format!(
            "'{}': expected rank {}, got shape {:?}",
            key,
            N,
            t.dims()
        ))
    })?;
    let data = t.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    Ok((data, dims))
}

fn load_file(path: &Path) -> TrainResult<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| data_error(format!("{}: {}", path.display(), e)))
}

fn expect_dims(key: &str, got: &[usize], want: &[usize]) -> TrainResult<()> {
    if got != want {
        return Err(data_error(format!(
            "'{}': expected shape {:?}, got {:?}",
            key, want, got
        )));
    }
    Ok(())
}

impl RawSplit {
    /// Read one split from the question and image files.
    pub fn from_safetensors(ques_path: &Path, img_path: &Path, split: Split) -> TrainResult<Self> {
        let tensors = load_file(ques_path)?;
        let images = load_file(img_path)?;
        let s = split.as_str();

        let (ques, [n, r, lq]) = ids::<3>(&tensors, &format!("ques_{s}"))?;
        let (ques_len, d) = ids::<2>(&tensors, &format!("ques_length_{s}"))?;
        expect_dims("ques_length", &d, &[n, r])?;
        let (ans, [an, ar, la]) = ids::<3>(&tensors, &format!("ans_{s}"))?;
        expect_dims("ans", &[an, ar], &[n, r])?;
        let (ans_len, d) = ids::<2>(&tensors, &format!("ans_length_{s}"))?;
        expect_dims("ans_length", &d, &[n, r])?;
        let (cap, [cn, lc]) = ids::<2>(&tensors, &format!("cap_{s}"))?;
        expect_dims("cap", &[cn], &[n])?;
        let (cap_len, d) = ids::<1>(&tensors, &format!("cap_length_{s}"))?;
        expect_dims("cap_length", &d, &[n])?;
        let (opt, [on, or, num_options]) = ids::<3>(&tensors, &format!("opt_{s}"))?;
        expect_dims("opt", &[on, or], &[n, r])?;
        let (opt_list, [m, ola]) = ids::<2>(&tensors, &format!("opt_list_{s}"))?;
        expect_dims("opt_list", &[ola], &[la])?;
        let (opt_len, d) = ids::<1>(&tensors, &format!("opt_length_{s}"))?;
        expect_dims("opt_length", &d, &[m])?;
        let (img_pos, d) = ids::<1>(&tensors, &format!("img_pos_{s}"))?;
        expect_dims("img_pos", &d, &[n])?;

        let ans_key = format!("ans_index_{s}");
        let ans_index = if tensors.contains_key(&ans_key) {
            let (idx, d) = ids::<2>(&tensors, &ans_key)?;
            expect_dims("ans_index", &d, &[n, r])?;
            Some(idx)
        } else if split.has_labels() {
            return Err(data_error(format!("missing tensor '{}'", ans_key)));
        } else {
            None
        };

        let img = take(&images, &format!("images_{s}"))?;
        let (_, img_feature_size) = img.dims2()?;
        let img_feats = img.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

        debug!(
            split = s,
            dialogs = n,
            rounds = r,
            options = num_options,
            option_rows = m,
            "raw split loaded"
        );

        Ok(Self {
            num_dialogs: n,
            num_rounds: r,
            max_ques_len: lq,
            max_ans_len: la,
            max_cap_len: lc,
            num_options,
            img_feature_size,
            ques,
            ques_len,
            ans,
            ans_len,
            cap,
            cap_len,
            opt,
            opt_list,
            opt_len,
            ans_index,
            img_pos,
            img_feats,
        })
    }

    fn num_images(&self) -> usize {
        self.img_feats.len() / self.img_feature_size.max(1)
    }

    fn num_option_rows(&self) -> usize {
        self.opt_len.len()
    }

    /// Check cross-array indices before anything dereferences them.
    pub fn check(&self) -> TrainResult<()> {
        let (n, r) = (self.num_dialogs, self.num_rounds);
        let sized = [
            ("ques", self.ques.len(), n * r * self.max_ques_len),
            ("ques_length", self.ques_len.len(), n * r),
            ("ans", self.ans.len(), n * r * self.max_ans_len),
            ("ans_length", self.ans_len.len(), n * r),
            ("cap", self.cap.len(), n * self.max_cap_len),
            ("cap_length", self.cap_len.len(), n),
            ("opt", self.opt.len(), n * r * self.num_options),
            (
                "opt_list",
                self.opt_list.len(),
                self.num_option_rows() * self.max_ans_len,
            ),
            ("img_pos", self.img_pos.len(), n),
        ];
        for (name, got, want) in sized {
            if got != want {
                return Err(data_error(format!(
                    "'{}' has {} elements, expected {}",
                    name, got, want
                )));
            }
        }

        let rows = self.num_option_rows() as u32;
        if let Some(bad) = self.opt.iter().find(|&&o| o == 0 || o > rows) {
            return Err(data_error(format!(
                "option index {} outside 1..={}",
                bad, rows
            )));
        }
        if let Some(ans_index) = &self.ans_index {
            if ans_index.len() != n * r {
                return Err(data_error("'ans_index' size does not match dialogs"));
            }
            let num_options = self.num_options as u32;
            if let Some(bad) = ans_index.iter().find(|&&a| a == 0 || a > num_options) {
                return Err(data_error(format!(
                    "answer index {} outside 1..={}",
                    bad, num_options
                )));
            }
        }
        let images = self.num_images() as u32;
        if let Some(bad) = self.img_pos.iter().find(|&&p| p >= images) {
            return Err(data_error(format!(
                "image position {} but only {} images",
                bad, images
            )));
        }
        Ok(())
    }
}

/// L2-normalize every row in place; zero rows stay zero.
pub fn l2_normalize_rows(feats: &mut [f32], width: usize) {
    if width == 0 {
        return;
    }
    for row in feats.chunks_mut(width) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
        row.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Build per-round history rows.
///
/// Round 0 sees the caption. With `concat`, round r extends round r-1 with
/// `<END>`, question r-1 and answer r-1, capped at `max_concat` tokens;
/// otherwise round r is just question r-1 followed by answer r-1.
///
/// Returns `(hist [N, R, Lh], hist_len [N, R], Lh)`.
pub(crate) fn process_history(
    raw: &RawSplit,
    end_token: u32,
    concat: bool,
    max_concat: usize,
) -> (Vec<u32>, Vec<u32>, usize) {
    let (n, r) = (raw.num_dialogs, raw.num_rounds);
    let (lq, la, lc) = (raw.max_ques_len, raw.max_ans_len, raw.max_cap_len);
    let qa_window = lq + la;
    let max_hist_len = if concat {
        (r * qa_window).min(max_concat)
    } else {
        qa_window
    };

    let mut hist = vec![PAD_INDEX; n * r * max_hist_len];
    let mut hist_len = vec![0u32; n * r];
    let mut row = Vec::with_capacity(max_hist_len + qa_window + 1);

    for d in 0..n {
        let caption = &raw.cap[d * lc..(d + 1) * lc];
        let mut hlen = (raw.cap_len[d] as usize).min(qa_window).min(max_hist_len);

        for round in 0..r {
            let base = (d * r + round) * max_hist_len;
            if round == 0 {
                let n_copy = lc.min(qa_window).min(max_hist_len);
                hist[base..base + n_copy].copy_from_slice(&caption[..n_copy]);
            } else {
                let prev = d * r + round - 1;
                let qlen = (raw.ques_len[prev] as usize).min(lq);
                let alen = (raw.ans_len[prev] as usize).min(la);
                let question = &raw.ques[prev * lq..prev * lq + qlen];
                let answer = &raw.ans[prev * la..prev * la + alen];

                row.clear();
                if concat {
                    let prev_base = base - max_hist_len;
                    row.extend_from_slice(&hist[prev_base..prev_base + hlen]);
                    row.push(end_token);
                    hlen = (hlen + qlen + alen + 1).min(max_hist_len);
                } else {
                    hlen = qlen + alen;
                }
                row.extend_from_slice(question);
                row.extend_from_slice(answer);
                row.truncate(max_hist_len);
                hist[base..base + row.len()].copy_from_slice(&row);
            }
            hist_len[d * r + round] = hlen as u32;
        }
    }

    (hist, hist_len, max_hist_len)
}

/// One processed split, ready for sampling.
#[derive(Debug, Clone)]
pub struct VisDialSplit {
    split: Split,
    raw: RawSplit,
    hist: Vec<u32>,
    hist_len: Vec<u32>,
    max_hist_len: usize,
}

impl VisDialSplit {
    pub fn new(
        split: Split,
        mut raw: RawSplit,
        end_token: u32,
        img_norm: bool,
        concat_history: bool,
    ) -> TrainResult<Self> {
        raw.check()?;

        if img_norm {
            l2_normalize_rows(&mut raw.img_feats, raw.img_feature_size);
        }
        // 1-based on disk
        raw.opt.iter_mut().for_each(|o| *o -= 1);
        if let Some(ans_index) = raw.ans_index.as_mut() {
            ans_index.iter_mut().for_each(|a| *a -= 1);
        }

        let (hist, hist_len, max_hist_len) =
            process_history(&raw, end_token, concat_history, MAX_CONCAT_HISTORY);

        Ok(Self {
            split,
            raw,
            hist,
            hist_len,
            max_hist_len,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// History row of one round, padded to `max_hist_len`.
    pub fn history(&self, dialog: usize, round: usize) -> (&[u32], usize) {
        let row = dialog * self.raw.num_rounds + round;
        let start = row * self.max_hist_len;
        (
            &self.hist[start..start + self.max_hist_len],
            self.hist_len[row] as usize,
        )
    }
}

impl Dataset for VisDialSplit {
    fn len(&self) -> usize {
        self.raw.num_dialogs
    }

    fn shape(&self) -> DialogShape {
        DialogShape {
            num_rounds: self.raw.num_rounds,
            max_ques_len: self.raw.max_ques_len,
            max_hist_len: self.max_hist_len,
            max_ans_len: self.raw.max_ans_len,
            num_options: self.raw.num_options,
            img_feature_size: self.raw.img_feature_size,
        }
    }

    fn get_item(&self, idx: usize) -> DialogSample {
        let raw = &self.raw;
        let (r, lq, la, o) = (
            raw.num_rounds,
            raw.max_ques_len,
            raw.max_ans_len,
            raw.num_options,
        );
        let f = raw.img_feature_size;
        let lh = self.max_hist_len;

        let img_row = raw.img_pos[idx] as usize;
        let img_feat = raw.img_feats[img_row * f..(img_row + 1) * f].to_vec();

        let rounds = idx * r..(idx + 1) * r;
        let ques = raw.ques[idx * r * lq..(idx + 1) * r * lq].to_vec();
        let ques_len = raw.ques_len[rounds.clone()]
            .iter()
            .map(|&l| (l as usize).min(lq))
            .collect();
        let hist = self.hist[idx * r * lh..(idx + 1) * r * lh].to_vec();
        let hist_len = self.hist_len[rounds.clone()]
            .iter()
            .map(|&l| l as usize)
            .collect();

        let mut opt = Vec::with_capacity(r * o * la);
        let mut opt_len = Vec::with_capacity(r * o);
        for &row in &raw.opt[idx * r * o..(idx + 1) * r * o] {
            let row = row as usize;
            opt.extend_from_slice(&raw.opt_list[row * la..(row + 1) * la]);
            opt_len.push((raw.opt_len[row] as usize).min(la));
        }

        let ans_ind = raw
            .ans_index
            .as_ref()
            .map(|ans_index| ans_index[rounds].to_vec());

        DialogSample {
            img_feat,
            ques,
            ques_len,
            hist,
            hist_len,
            opt,
            opt_len,
            ans_ind,
        }
    }
}

/// Sizes for generated dialogs used in smoke runs and tests.
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub num_dialogs: usize,
    pub num_rounds: usize,
    pub max_ques_len: usize,
    pub max_ans_len: usize,
    pub num_options: usize,
    pub img_feature_size: usize,
    pub num_words: usize,
    pub seed: u64,
}

impl SyntheticSpec {
    /// Match the sizes a config expects; the vocabulary leaves room for
    /// padding and the two special tokens.
    pub fn from_config(config: &TrainConfig, num_dialogs: usize) -> Self {
        Self {
            num_dialogs,
            num_rounds: config.max_ques_count,
            max_ques_len: config.max_ques_len.max(1),
            max_ans_len: config.max_ans_len.max(1),
            num_options: config.num_options,
            img_feature_size: config.img_feature_size,
            num_words: config.vocab_size.saturating_sub(3).max(2),
            seed: config.seed,
        }
    }

    /// Generate one split. The correct option always opens with the first
    /// word of its question, which gives the model something to learn.
    pub fn generate(&self, split: Split) -> RawSplit {
        let split_offset = match split {
            Split::Train => 0,
            Split::Val => 1,
            Split::Test => 2,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed.wrapping_add(split_offset));
        let (n, r, lq, la, o) = (
            self.num_dialogs,
            self.num_rounds,
            self.max_ques_len,
            self.max_ans_len,
            self.num_options,
        );
        let lc = lq + la;
        let words = self.num_words as u32;

        let tokens = |rng: &mut rand::rngs::StdRng, width: usize, len: usize| {
            let mut row = vec![PAD_INDEX; width];
            for slot in row.iter_mut().take(len) {
                *slot = rng.gen_range(1..=words);
            }
            row
        };

        let mut raw = RawSplit {
            num_dialogs: n,
            num_rounds: r,
            max_ques_len: lq,
            max_ans_len: la,
            max_cap_len: lc,
            num_options: o,
            img_feature_size: self.img_feature_size,
            ques: Vec::with_capacity(n * r * lq),
            ques_len: Vec::with_capacity(n * r),
            ans: Vec::with_capacity(n * r * la),
            ans_len: Vec::with_capacity(n * r),
            cap: Vec::with_capacity(n * lc),
            cap_len: Vec::with_capacity(n),
            opt: Vec::with_capacity(n * r * o),
            opt_list: Vec::new(),
            opt_len: Vec::new(),
            ans_index: split.has_labels().then(|| Vec::with_capacity(n * r)),
            img_pos: (0..n as u32).collect(),
            img_feats: (0..n * self.img_feature_size)
                .map(|_| rng.gen_range(-1.0f32..1.0))
                .collect(),
        };

        for _ in 0..n {
            let cap_len = rng.gen_range(1..=lc);
            raw.cap.extend(tokens(&mut rng, lc, cap_len));
            raw.cap_len.push(cap_len as u32);

            for _ in 0..r {
                let qlen = rng.gen_range(1..=lq);
                let question = tokens(&mut rng, lq, qlen);
                let alen = rng.gen_range(1..=la);
                let mut answer = tokens(&mut rng, la, alen);
                answer[0] = question[0];

                let gt = rng.gen_range(0..o);
                for slot in 0..o {
                    let (row, len) = if slot == gt {
                        (answer.clone(), alen)
                    } else {
                        let len = rng.gen_range(1..=la);
                        (tokens(&mut rng, la, len), len)
                    };
                    raw.opt_list.extend(row);
                    raw.opt_len.push(len as u32);
                    raw.opt.push(raw.opt_len.len() as u32);
                }
                if let Some(ans_index) = raw.ans_index.as_mut() {
                    ans_index.push(gt as u32 + 1);
                }

                raw.ques.extend(question);
                raw.ques_len.push(qlen as u32);
                raw.ans.extend(answer);
                raw.ans_len.push(alen as u32);
            }
        }
        raw
    }

    fn vocabulary(&self) -> TrainResult<Vocabulary> {
        Vocabulary::from_word2ind(
            (1..=self.num_words as u32)
                .map(|i| (format!("w{}", i), i))
                .collect(),
        )
    }
}

/// All loaded splits plus the vocabulary.
#[derive(Debug, Clone)]
pub struct VisDialDataset {
    vocab: Vocabulary,
    splits: BTreeMap<Split, VisDialSplit>,
}

impl VisDialDataset {
    /// Load the requested splits from the files named in `config`.
    pub fn load(config: &TrainConfig, splits: &[Split]) -> TrainResult<Self> {
        let vocab = Vocabulary::from_params_json(Path::new(&config.input_json))?;
        let mut raws = Vec::with_capacity(splits.len());
        for &split in splits {
            info!(split = %split, path = %config.input_ques, "Loading dialogs");
            raws.push((
                split,
                RawSplit::from_safetensors(
                    Path::new(&config.input_ques),
                    Path::new(&config.input_img),
                    split,
                )?,
            ));
        }
        Self::from_raw(vocab, raws, config.img_norm, config.concat_history)
    }

    /// Generated dialogs shaped like `spec`.
    pub fn synthetic(spec: &SyntheticSpec, splits: &[Split], concat_history: bool) -> TrainResult<Self> {
        let raws = splits.iter().map(|&s| (s, spec.generate(s))).collect();
        Self::from_raw(spec.vocabulary()?, raws, true, concat_history)
    }

    pub fn from_raw(
        vocab: Vocabulary,
        raws: Vec<(Split, RawSplit)>,
        img_norm: bool,
        concat_history: bool,
    ) -> TrainResult<Self> {
        if raws.is_empty() {
            return Err(data_error("no splits requested"));
        }
        let end_token = vocab.end_token();
        let mut splits = BTreeMap::new();
        for (split, raw) in raws {
            let processed = VisDialSplit::new(split, raw, end_token, img_norm, concat_history)?;
            if let Some(first) = splits.values().next() {
                let (a, b): (DialogShape, DialogShape) = (Dataset::shape(first), processed.shape());
                if a.num_rounds != b.num_rounds
                    || a.num_options != b.num_options
                    || a.img_feature_size != b.img_feature_size
                {
                    return Err(data_error(format!(
                        "split {} shape {:?} does not match {:?}",
                        split, b, a
                    )));
                }
            }
            let rounds = processed.shape().num_rounds;
            if !processed.is_empty() && rounds > 0 {
                let (hist, hlen) = processed.history(0, rounds - 1);
                debug!(split = %split, "last-round history: {}", vocab.decode(&hist[..hlen]));
            }
            splits.insert(split, processed);
        }
        Ok(Self { vocab, splits })
    }

    pub fn split(&self, split: Split) -> TrainResult<&VisDialSplit> {
        self.splits
            .get(&split)
            .ok_or_else(|| data_error(format!("split '{}' was not loaded", split)))
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    fn first_shape(&self) -> DialogShape {
        // from_raw rejects an empty split list
        self.splits
            .values()
            .next()
            .map(Dataset::shape)
            .unwrap_or(DialogShape {
                num_rounds: 0,
                max_ques_len: 0,
                max_hist_len: 0,
                max_ans_len: 0,
                num_options: 0,
                img_feature_size: 0,
            })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.vocab_size()
    }

    /// Rounds per dialog.
    pub fn max_ques_count(&self) -> usize {
        self.first_shape().num_rounds
    }

    pub fn max_ques_len(&self) -> usize {
        self.first_shape().max_ques_len
    }

    pub fn max_ans_len(&self) -> usize {
        self.first_shape().max_ans_len
    }

    pub fn num_options(&self) -> usize {
        self.first_shape().num_options
    }

    pub fn img_feature_size(&self) -> usize {
        self.first_shape().img_feature_size
    }

    pub fn num_data_points(&self) -> BTreeMap<Split, usize> {
        self.splits
            .iter()
            .map(|(&split, data)| (split, data.len()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two dialogs, two rounds, three options; small enough to check by hand.
    pub(crate) fn toy_raw() -> RawSplit {
        RawSplit {
            num_dialogs: 2,
            num_rounds: 2,
            max_ques_len: 3,
            max_ans_len: 2,
            max_cap_len: 4,
            num_options: 3,
            img_feature_size: 2,
            ques: vec![1, 2, 0, 3, 0, 0, 4, 4, 4, 2, 1, 0],
            ques_len: vec![2, 1, 3, 2],
            ans: vec![5, 0, 6, 7, 7, 0, 5, 6],
            ans_len: vec![1, 2, 1, 2],
            cap: vec![8, 9, 0, 0, 9, 9, 9, 9],
            cap_len: vec![2, 4],
            opt: vec![1, 2, 3, 2, 3, 4, 3, 1, 2, 4, 1, 2],
            opt_list: vec![5, 0, 6, 7, 7, 0, 5, 6],
            opt_len: vec![1, 2, 1, 2],
            ans_index: Some(vec![1, 1, 1, 1]),
            img_pos: vec![1, 0],
            img_feats: vec![3.0, 4.0, 0.0, 0.0],
        }
    }

    pub(crate) fn toy_vocab() -> Vocabulary {
        Vocabulary::from_word2ind((1..=9).map(|i| (format!("w{}", i), i)).collect()).unwrap()
    }

    pub(crate) fn toy_dataset() -> VisDialDataset {
        VisDialDataset::from_raw(toy_vocab(), vec![(Split::Train, toy_raw())], true, true).unwrap()
    }

    #[test]
    fn test_concat_history_rows() {
        let raw = toy_raw();
        let (hist, hist_len, lh) = process_history(&raw, 11, true, MAX_CONCAT_HISTORY);
        assert_eq!(lh, 10);
        assert_eq!(hist_len, vec![2, 6, 4, 9]);
        assert_eq!(&hist[0..10], &[8, 9, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&hist[10..20], &[8, 9, 11, 1, 2, 5, 0, 0, 0, 0]);
        assert_eq!(&hist[30..40], &[9, 9, 9, 9, 11, 4, 4, 4, 7, 0]);
    }

    #[test]
    fn test_history_without_concat() {
        let raw = toy_raw();
        let (hist, hist_len, lh) = process_history(&raw, 11, false, MAX_CONCAT_HISTORY);
        assert_eq!(lh, 5);
        assert_eq!(hist_len, vec![2, 3, 4, 4]);
        assert_eq!(&hist[5..10], &[1, 2, 5, 0, 0]);
        assert_eq!(&hist[15..20], &[4, 4, 4, 7, 0]);
    }

    #[test]
    fn test_concat_history_capped() {
        let raw = toy_raw();
        let (hist, hist_len, lh) = process_history(&raw, 11, true, 7);
        assert_eq!(lh, 7);
        // dialog 1, round 1: 4 + 1 + 3 + 1 tokens truncated to 7
        assert_eq!(hist_len[3], 7);
        assert_eq!(&hist[21..28], &[9, 9, 9, 9, 11, 4, 4]);
    }

    #[test]
    fn test_sample_options_and_answers_zero_based() {
        let ds = toy_dataset();
        let train = ds.split(Split::Train).unwrap();
        let sample = train.get_item(0);

        assert_eq!(sample.ans_ind, Some(vec![0, 0]));
        // round 1 options are opt_list rows 1, 2, 3
        assert_eq!(&sample.opt[6..12], &[6, 7, 7, 0, 5, 6]);
        assert_eq!(&sample.opt_len[3..6], &[2, 1, 2]);
        assert_eq!(sample.ques_len, vec![2, 1]);
    }

    #[test]
    fn test_image_features_normalized_per_dialog() {
        let ds = toy_dataset();
        let train = ds.split(Split::Train).unwrap();
        // dialog 1 points at image row 0 = [3, 4]
        let feat = train.get_item(1).img_feat;
        assert!((feat[0] - 0.6).abs() < 1e-6);
        assert!((feat[1] - 0.8).abs() < 1e-6);
        // zero row stays zero
        assert_eq!(train.get_item(0).img_feat, vec![0.0, 0.0]);
    }

    #[test]
    fn test_dataset_dimensions() {
        let ds = toy_dataset();
        assert_eq!(ds.vocab_size(), 12);
        assert_eq!(ds.max_ques_count(), 2);
        assert_eq!(ds.max_ques_len(), 3);
        assert_eq!(ds.max_ans_len(), 2);
        assert_eq!(ds.num_options(), 3);
        assert_eq!(ds.num_data_points()[&Split::Train], 2);
        assert!(ds.split(Split::Val).is_err());
    }

    #[test]
    fn test_bad_option_index_rejected() {
        let mut raw = toy_raw();
        raw.opt[4] = 9;
        let err = VisDialDataset::from_raw(toy_vocab(), vec![(Split::Train, raw)], true, true)
            .unwrap_err();
        assert!(err.to_string().contains("option index 9"));
    }

    #[test]
    fn test_synthetic_split_is_consistent() {
        let spec = SyntheticSpec {
            num_dialogs: 5,
            num_rounds: 3,
            max_ques_len: 4,
            max_ans_len: 3,
            num_options: 4,
            img_feature_size: 6,
            num_words: 20,
            seed: 7,
        };
        let ds = VisDialDataset::synthetic(&spec, &[Split::Train, Split::Test], true).unwrap();
        let train = ds.split(Split::Train).unwrap();
        assert_eq!(train.len(), 5);

        let sample = train.get_item(2);
        let answers = sample.ans_ind.unwrap();
        for (round, &gt) in answers.iter().enumerate() {
            let opt_start = (round * 4 + gt as usize) * 3;
            assert_eq!(sample.opt[opt_start], sample.ques[round * 4]);
        }
        assert!(ds.split(Split::Test).unwrap().get_item(0).ans_ind.is_none());
    }

    #[test]
    fn test_safetensors_roundtrip() {
        let raw = toy_raw();
        let dev = Device::Cpu;
        let i64s = |v: &[u32], shape: &[usize]| {
            Tensor::from_vec(
                v.iter().map(|&x| x as i64).collect::<Vec<_>>(),
                shape,
                &dev,
            )
            .unwrap()
        };
        let mut tensors = HashMap::new();
        tensors.insert("ques_train".to_string(), i64s(&raw.ques, &[2, 2, 3]));
        tensors.insert("ques_length_train".to_string(), i64s(&raw.ques_len, &[2, 2]));
        tensors.insert("ans_train".to_string(), i64s(&raw.ans, &[2, 2, 2]));
        tensors.insert("ans_length_train".to_string(), i64s(&raw.ans_len, &[2, 2]));
        tensors.insert("cap_train".to_string(), i64s(&raw.cap, &[2, 4]));
        tensors.insert("cap_length_train".to_string(), i64s(&raw.cap_len, &[2]));
        tensors.insert("opt_train".to_string(), i64s(&raw.opt, &[2, 2, 3]));
        tensors.insert("opt_list_train".to_string(), i64s(&raw.opt_list, &[4, 2]));
        tensors.insert("opt_length_train".to_string(), i64s(&raw.opt_len, &[4]));
        tensors.insert(
            "ans_index_train".to_string(),
            i64s(raw.ans_index.as_ref().unwrap(), &[2, 2]),
        );
        tensors.insert("img_pos_train".to_string(), i64s(&raw.img_pos, &[2]));
        let mut images = HashMap::new();
        images.insert(
            "images_train".to_string(),
            Tensor::from_vec(raw.img_feats.clone(), (2, 2), &dev).unwrap(),
        );

        let dir = tempfile::tempdir().unwrap();
        let ques_path = dir.path().join("data.safetensors");
        let img_path = dir.path().join("img.safetensors");
        candle_core::safetensors::save(&tensors, &ques_path).unwrap();
        candle_core::safetensors::save(&images, &img_path).unwrap();

        let loaded = RawSplit::from_safetensors(&ques_path, &img_path, Split::Train).unwrap();
        assert_eq!(loaded.ques, raw.ques);
        assert_eq!(loaded.opt, raw.opt);
        assert_eq!(loaded.max_cap_len, 4);
        assert_eq!(loaded.num_options, 3);
        assert_eq!(loaded.ans_index, raw.ans_index);

        // labels are required for train
        tensors.remove("ans_index_train");
        candle_core::safetensors::save(&tensors, &ques_path).unwrap();
        assert!(RawSplit::from_safetensors(&ques_path, &img_path, Split::Train).is_err());
    }
}
