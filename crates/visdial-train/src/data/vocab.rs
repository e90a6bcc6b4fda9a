//! Word/index vocabulary read from the preprocessing params file.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{data_error, IoResultExt, TrainResult};

pub const START_TOKEN: &str = "<START>";
pub const END_TOKEN: &str = "<END>";

/// Index reserved for padding; never assigned to a word.
pub const PAD_INDEX: u32 = 0;

#[derive(Debug, Deserialize)]
struct ParamsFile {
    word2ind: HashMap<String, u32>,
}

/// Vocabulary with `<START>` and `<END>` appended after the dataset words.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    word2ind: HashMap<String, u32>,
    ind2word: HashMap<u32, String>,
}

impl Vocabulary {
    /// Build from a 1-based word index map (0 is padding).
    pub fn from_word2ind(mut word2ind: HashMap<String, u32>) -> TrainResult<Self> {
        if word2ind.values().any(|&idx| idx == PAD_INDEX) {
            return Err(data_error("word2ind must not use index 0 (padding)"));
        }
        let n_words = word2ind.len() as u32;
        word2ind.insert(START_TOKEN.to_string(), n_words + 1);
        word2ind.insert(END_TOKEN.to_string(), n_words + 2);

        let ind2word = word2ind
            .iter()
            .map(|(word, &idx)| (idx, word.clone()))
            .collect();
        Ok(Self { word2ind, ind2word })
    }

    /// Load `word2ind` from the params JSON written by preprocessing.
    pub fn from_params_json(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        let params: ParamsFile = serde_json::from_str(&raw)
            .map_err(|e| data_error(format!("{}: {}", path.display(), e)))?;
        Self::from_word2ind(params.word2ind)
    }

    /// Words plus the two special tokens.
    pub fn len(&self) -> usize {
        self.word2ind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word2ind.is_empty()
    }

    /// Embedding table rows: words + `<START>` + `<END>` + padding.
    pub fn vocab_size(&self) -> usize {
        self.word2ind.len() + 1
    }

    pub fn index(&self, word: &str) -> Option<u32> {
        self.word2ind.get(word).copied()
    }

    pub fn word(&self, idx: u32) -> Option<&str> {
        self.ind2word.get(&idx).map(String::as_str)
    }

    /// Separator between rounds in concatenated history.
    pub fn end_token(&self) -> u32 {
        self.word2ind[END_TOKEN]
    }

    /// Render token ids back to words, stopping at padding.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&idx| idx != PAD_INDEX)
            .map(|&idx| self.word(idx).unwrap_or("<UNK>"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
