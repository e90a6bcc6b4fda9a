//! Retrieval metrics over ranked answer options.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// 1-based rank of the ground-truth option in each row of `scores`.
///
/// `scores [N, O]` f32, `gt [N]` u32 0-based option index. The rank is one
/// plus the number of options scoring strictly higher, so ties favour the
/// ground truth.
pub fn ranks_from_scores(scores: &Tensor, gt: &Tensor) -> Result<Vec<u32>> {
    let (n, _) = scores.dims2()?;
    if gt.dims1()? != n {
        candle_core::bail!(
            "{} score rows but {} ground-truth indices",
            n,
            gt.dims1()?
        );
    }
    let scores = scores.to_dtype(DType::F32)?;
    let gt_scores = scores.gather(&gt.unsqueeze(1)?.contiguous()?, 1)?;
    let higher = scores
        .broadcast_gt(&gt_scores)?
        .to_dtype(DType::U32)?
        .sum(1)?;
    Ok(higher.to_vec1::<u32>()?.into_iter().map(|h| h + 1).collect())
}

/// Recall@k (percent), mean rank and mean reciprocal rank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankMetrics {
    pub count: usize,
    pub r1: f64,
    pub r5: f64,
    pub r10: f64,
    pub mean_rank: f64,
    pub mrr: f64,
}

impl RankMetrics {
    pub fn from_ranks(ranks: &[u32]) -> Self {
        let count = ranks.len();
        if count == 0 {
            return Self {
                count,
                r1: 0.0,
                r5: 0.0,
                r10: 0.0,
                mean_rank: 0.0,
                mrr: 0.0,
            };
        }
        let n = count as f64;
        let recall = |k: u32| 100.0 * ranks.iter().filter(|&&r| r <= k).count() as f64 / n;
        Self {
            count,
            r1: recall(1),
            r5: recall(5),
            r10: recall(10),
            mean_rank: ranks.iter().map(|&r| r as f64).sum::<f64>() / n,
            mrr: ranks.iter().map(|&r| 1.0 / r as f64).sum::<f64>() / n,
        }
    }
}
