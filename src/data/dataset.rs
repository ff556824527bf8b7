use super::encode_truncated;
use crate::tokenizer::Tokenizer;
use burn::data::dataset::{Dataset, InMemDataset};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One corpus line per item, tokenized lazily by the batcher.
pub struct MlmDataset {
    dataset: InMemDataset<String>,
}

impl MlmDataset {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            dataset: InMemDataset::new(lines),
        }
    }

    /// Shuffle the lines with `seed` and hold out `eval_fraction` of them for evaluation.
    ///
    /// At least one line goes to each split whenever there are two lines or more.
    pub fn split(mut lines: Vec<String>, eval_fraction: f64, seed: u64) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(seed);
        lines.shuffle(&mut rng);

        let total = lines.len();
        let mut num_eval = (total as f64 * eval_fraction.clamp(0.0, 1.0)).round() as usize;
        if total >= 2 {
            num_eval = num_eval.clamp(1, total - 1);
        }

        let train = lines.split_off(num_eval);
        (Self::new(train), Self::new(lines))
    }
}

/// Keep the lines holding at least one regular token once truncated to `max_seq_length`.
///
/// Lines made of special tokens only, such as a bare `<mask>`, leave nothing to predict.
/// Lines the tokenizer failed on come back as `<s> <unk> </s>` and are dropped too.
pub fn maskable_lines(
    lines: Vec<String>,
    tokenizer: &dyn Tokenizer,
    max_seq_length: usize,
) -> Vec<String> {
    let special_tokens = tokenizer.special_tokens();
    let total = lines.len();

    let lines = lines
        .into_iter()
        .filter(|line| {
            encode_truncated(tokenizer, line, max_seq_length)
                .iter()
                .any(|token| !special_tokens.contains(token))
        })
        .collect::<Vec<_>>();

    if lines.len() < total {
        tracing::warn!(
            "Dropped {} of {total} lines without any token to predict",
            total - lines.len()
        );
    }

    lines
}

impl Dataset<String> for MlmDataset {
    fn get(&self, index: usize) -> Option<String> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}
