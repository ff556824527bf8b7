//! RoBERTa masked language model trained from scratch with Burn.
//!
//! This crate trains a byte-level BPE tokenizer and a small RoBERTa model on an
//! Esperanto corpus, then fills `<mask>` tokens with the trained model.
//!
//! # Example
//!
//! ```ignore
//! use esperberto_burn::{fill_mask, MlmTokenizer, RobertaMaskedLM, SAMPLE_SENTENCES};
//! use burn::backend::NdArray;
//! use std::sync::Arc;
//!
//! type B = NdArray<f32>;
//!
//! let device = Default::default();
//! let (model, config) = RobertaMaskedLM::<B>::load("EsperBERTo", &device)?;
//! let tokenizer = Arc::new(MlmTokenizer::from_dir("EsperBERTo")?);
//! let texts = SAMPLE_SENTENCES.map(String::from);
//! let results = fill_mask(&model, tokenizer, &texts, 5, config.max_seq_len(), &device)?;
//! ```

#[macro_use]
extern crate derive_new;

pub mod corpus;
pub mod data;
mod embedding;
mod error;
mod fill_mask;
mod model;
pub mod tokenizer;
pub mod training;

pub use embedding::*;
pub use error::*;
pub use fill_mask::*;
pub use model::*;
pub use tokenizer::{MlmTokenizer, Tokenizer, TokenizerKind, TokenizerTrainingConfig};
pub use training::{MlmTrainingConfig, TrainingReport};
