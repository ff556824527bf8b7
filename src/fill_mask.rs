use crate::data::{InferenceBatcher, RobertaInferenceBatch};
use crate::error::{Error, Result};
use crate::model::RobertaMaskedLM;
use crate::tokenizer::Tokenizer;
use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{activation::softmax, backend::Backend, Tensor};
use std::sync::Arc;

/// Sentences used to check what the model learned.
pub const SAMPLE_SENTENCES: [&str; 2] = ["La suno <mask>.", "Jen la komenco de bela <mask>."];

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub score: f32,
    pub token: usize,
    pub token_str: String,
    /// Input text with the mask replaced by the predicted token
    pub sequence: String,
}

#[derive(Debug, Clone)]
pub struct FillMaskResult {
    pub mask_idx: usize,
    pub top_k: Vec<Prediction>,
}

/// Predict the `top_k` most likely tokens for every `<mask>` of every text.
///
/// The outer vector follows `texts`, the inner one the masks of a text from left to right.
pub fn fill_mask<B: Backend>(
    model: &RobertaMaskedLM<B>,
    tokenizer: Arc<dyn Tokenizer>,
    texts: &[String],
    top_k: usize,
    max_seq_length: usize,
    device: &B::Device,
) -> Result<Vec<Vec<FillMaskResult>>> {
    if top_k == 0 {
        return Err(Error::InvalidConfig("top_k must be positive".to_string()));
    }
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let mask_token = tokenizer.mask_token();
    let special_tokens = tokenizer.special_tokens();
    let batcher = InferenceBatcher::new(tokenizer.clone(), max_seq_length);
    let input: RobertaInferenceBatch<B> = batcher.batch(texts.to_vec(), device);
    let [batch_size, seq_len] = input.tokens.dims();

    let tokens = input
        .tokens
        .clone()
        .into_data()
        .iter::<i64>()
        .map(|t| t as usize)
        .collect::<Vec<_>>();
    let output = model.forward(input.tokens, input.mask_pad);
    let [_, _, vocab_size] = output.dims();

    let mut results = Vec::with_capacity(batch_size);
    for (i, text) in texts.iter().enumerate() {
        let row = &tokens[i * seq_len..(i + 1) * seq_len];
        // Find the mask tokens in the input, as a list of indices
        let masks = find_masks(row, mask_token);
        if masks.is_empty() {
            return Err(Error::NoMaskToken(text.clone()));
        }

        let mut text_results = Vec::with_capacity(masks.len());
        for mask in masks {
            let logits = output
                .clone()
                .slice([i..i + 1, mask..mask + 1, 0..vocab_size])
                .reshape([vocab_size]);

            let top_k = top_k_tokens(top_k, logits)
                .into_iter()
                .map(|(token, score)| {
                    let mut filled = row.to_vec();
                    filled[mask] = token;
                    filled.retain(|t| !special_tokens.contains(t));

                    Prediction {
                        score,
                        token,
                        token_str: tokenizer.decode(&[token]),
                        sequence: tokenizer.decode(&filled),
                    }
                })
                .collect();

            text_results.push(FillMaskResult {
                mask_idx: mask,
                top_k,
            });
        }
        results.push(text_results);
    }

    Ok(results)
}

fn find_masks(tokens: &[usize], mask_token: usize) -> Vec<usize> {
    tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| **token == mask_token)
        .map(|(i, _)| i)
        .collect()
}

/// Highest probability tokens first.
fn top_k_tokens<B: Backend>(k: usize, logits: Tensor<B, 1>) -> Vec<(usize, f32)> {
    let [vocab_size] = logits.dims();
    let (probabilities, indices) = softmax(logits, 0).topk_with_indices(k.min(vocab_size), 0);

    let probabilities = probabilities.into_data().iter::<f32>().collect::<Vec<_>>();
    let indices = indices
        .into_data()
        .iter::<i64>()
        .map(|i| i as usize)
        .collect::<Vec<_>>();

    indices.into_iter().zip(probabilities).collect()
}
