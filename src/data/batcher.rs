use super::masking::{MaskedSequence, MaskingConfig};
use crate::tokenizer::Tokenizer;
use burn::data::dataloader::batcher::Batcher;
use burn::nn::attention::generate_padding_mask;
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

/// Tokenize and cut a text to at most `max_seq_length` tokens, keeping the closing token.
pub fn encode_truncated(tokenizer: &dyn Tokenizer, text: &str, max_seq_length: usize) -> Vec<usize> {
    let mut tokens = tokenizer.encode(text);
    if tokens.len() > max_seq_length && max_seq_length > 0 {
        let last = tokens[tokens.len() - 1];
        tokens.truncate(max_seq_length - 1);
        tokens.push(last);
    }
    tokens
}

#[derive(Clone, new)]
pub struct InferenceBatcher {
    /// Tokenizer for converting input text string to token IDs
    tokenizer: Arc<dyn Tokenizer>,
    /// Maximum sequence length for tokenized text
    max_seq_length: usize,
}

#[derive(Debug, Clone, new)]
pub struct RobertaInferenceBatch<B: Backend> {
    /// Tokenized text as 2D tensor: [batch_size, max_seq_length]
    pub tokens: Tensor<B, 2, Int>,
    /// Padding mask for the tokenized text containing booleans for padding locations
    pub mask_pad: Tensor<B, 2, Bool>,
}

impl<B: Backend> Batcher<B, String, RobertaInferenceBatch<B>> for InferenceBatcher {
    /// Batches a vector of strings into an inference batch
    fn batch(&self, items: Vec<String>, device: &B::Device) -> RobertaInferenceBatch<B> {
        let tokens_list = items
            .iter()
            .map(|item| encode_truncated(self.tokenizer.as_ref(), item, self.max_seq_length))
            .collect();

        let mask = generate_padding_mask(
            self.tokenizer.pad_token(),
            tokens_list,
            Some(self.max_seq_length),
            device,
        );

        RobertaInferenceBatch {
            tokens: mask.tensor,
            mask_pad: mask.mask,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaskedLmBatch<B: Backend> {
    /// Corrupted input tokens: [batch_size, seq_length]
    pub tokens: Tensor<B, 2, Int>,
    /// Padding locations: [batch_size, seq_length]
    pub mask_pad: Tensor<B, 2, Bool>,
    /// Selected positions as flat indices into [batch_size * seq_length]
    pub masked_positions: Tensor<B, 1, Int>,
    /// Original tokens at the selected positions
    pub masked_labels: Tensor<B, 1, Int>,
}

/// Tokenizes corpus lines and applies masked language modeling corruption.
#[derive(Clone)]
pub struct MlmBatcher {
    tokenizer: Arc<dyn Tokenizer>,
    masking: MaskingConfig,
    max_seq_length: usize,
    rng: Arc<Mutex<StdRng>>,
}

impl MlmBatcher {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        mlm_probability: f64,
        max_seq_length: usize,
        seed: u64,
    ) -> Self {
        let masking = MaskingConfig {
            mlm_probability,
            mask_token: tokenizer.mask_token(),
            ignore_label: tokenizer.pad_token(),
            vocab_size: tokenizer.vocab_size(),
            special_tokens: tokenizer.special_tokens(),
        };

        Self {
            tokenizer,
            masking,
            max_seq_length,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn mask_batch(&self, items: &[String]) -> Vec<MaskedSequence> {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut sequences = items
            .iter()
            .map(|item| {
                let tokens = encode_truncated(self.tokenizer.as_ref(), item, self.max_seq_length);
                self.masking.mask(&tokens, &mut *rng)
            })
            .collect::<Vec<_>>();

        // The loss needs at least one prediction per batch.
        let has_prediction = sequences
            .iter()
            .any(|seq| seq.labels.iter().any(|l| *l != self.masking.ignore_label));
        if !has_prediction {
            self.masking.force_mask(&mut sequences);
        }

        sequences
    }
}

impl<B: Backend> Batcher<B, String, MaskedLmBatch<B>> for MlmBatcher {
    fn batch(&self, items: Vec<String>, device: &B::Device) -> MaskedLmBatch<B> {
        let sequences = self.mask_batch(&items);
        let seq_length = sequences.iter().map(|s| s.inputs.len()).max().unwrap_or(0);

        let mut positions = Vec::new();
        let mut targets = Vec::new();
        for (row, sequence) in sequences.iter().enumerate() {
            for (col, label) in sequence.labels.iter().enumerate() {
                if *label != self.masking.ignore_label {
                    positions.push((row * seq_length + col) as i64);
                    targets.push(*label as i64);
                }
            }
        }

        let num_masked = positions.len();
        let masked_positions =
            Tensor::from_data(TensorData::new(positions, [num_masked]), device);
        let masked_labels = Tensor::from_data(TensorData::new(targets, [num_masked]), device);

        let inputs = sequences.into_iter().map(|s| s.inputs).collect();
        let mask = generate_padding_mask(
            self.tokenizer.pad_token(),
            inputs,
            Some(self.max_seq_length),
            device,
        );

        MaskedLmBatch {
            tokens: mask.tensor,
            mask_pad: mask.mask,
            masked_positions,
            masked_labels,
        }
    }
}
