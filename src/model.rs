use crate::embedding::{RobertaEmbeddings, RobertaEmbeddingsConfig};
use crate::error::{self, Error};
use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::transformer::{
    TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput,
};
use burn::nn::{Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Int, Tensor};
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model";
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// Exported weights keep full precision, learner checkpoints stay compact.
type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

// Define the RoBERTa model configuration
#[derive(Config, Debug)]
pub struct RobertaConfig {
    /// Size of the vocabulary
    #[config(default = 52_000)]
    pub vocab_size: usize,
    /// Max position embeddings, in RoBERTa equal to max_seq_len + pad_token_id + 1 (514)
    #[config(default = 514)]
    pub max_position_embeddings: usize,
    /// Number of attention heads in the multi-head attention
    #[config(default = 12)]
    pub num_attention_heads: usize,
    /// Number of transformer encoder layers/blocks
    #[config(default = 6)]
    pub num_hidden_layers: usize,
    /// Size of the hidden states (768 for roberta-base)
    #[config(default = 768)]
    pub hidden_size: usize,
    /// Size of the intermediate position wise feedforward layer
    #[config(default = 3072)]
    pub intermediate_size: usize,
    /// Number of segment types, a single one for masked language modeling
    #[config(default = 1)]
    pub type_vocab_size: usize,
    /// Dropout value across layers
    #[config(default = 0.1)]
    pub hidden_dropout_prob: f64,
    #[config(default = 1e-5)]
    pub layer_norm_eps: f64,
    /// Index of the padding token
    #[config(default = 1)]
    pub pad_token_id: usize,
}

impl RobertaConfig {
    /// Check the hyper-parameters can build a model.
    pub fn validate(&self) -> error::Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("intermediate_size", self.intermediate_size),
            ("type_vocab_size", self.type_vocab_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden_size ({}) must be a multiple of num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.pad_token_id >= self.vocab_size {
            return Err(Error::InvalidConfig(format!(
                "pad_token_id ({}) is outside the vocabulary ({})",
                self.pad_token_id, self.vocab_size
            )));
        }
        if self.max_seq_len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_position_embeddings ({}) leaves no room for <s> and </s>",
                self.max_position_embeddings
            )));
        }
        Ok(())
    }

    /// Longest sequence the position embeddings can index.
    pub fn max_seq_len(&self) -> usize {
        self.max_position_embeddings
            .saturating_sub(self.pad_token_id + 1)
    }

    /// Initializes a RoBERTa encoder with default weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> RobertaModel<B> {
        let embeddings = RobertaEmbeddingsConfig {
            vocab_size: self.vocab_size,
            max_position_embeddings: self.max_position_embeddings,
            type_vocab_size: self.type_vocab_size,
            hidden_size: self.hidden_size,
            hidden_dropout_prob: self.hidden_dropout_prob,
            layer_norm_eps: self.layer_norm_eps,
            pad_token_idx: self.pad_token_id,
        }
        .init(device);

        // RoBERTa normalizes after each residual connection.
        let encoder = TransformerEncoderConfig::new(
            self.hidden_size,
            self.intermediate_size,
            self.num_attention_heads,
            self.num_hidden_layers,
        )
        .with_dropout(self.hidden_dropout_prob)
        .with_norm_first(false)
        .init(device);

        RobertaModel {
            embeddings,
            encoder,
        }
    }

    /// Initializes a RoBERTa model with a masked language modeling head
    pub fn init_masked_lm<B: Backend>(&self, device: &B::Device) -> RobertaMaskedLM<B> {
        let roberta = self.init(device);
        let lm_head = RobertaLmHead {
            dense: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            layer_norm: LayerNormConfig::new(self.hidden_size)
                .with_epsilon(self.layer_norm_eps)
                .init(device),
            decoder_bias: Param::from_tensor(Tensor::zeros([self.vocab_size], device)),
            gelu: Gelu::new(),
        };

        RobertaMaskedLM { roberta, lm_head }
    }
}

// Define the RoBERTa model structure
#[derive(Module, Debug)]
pub struct RobertaModel<B: Backend> {
    pub embeddings: RobertaEmbeddings<B>,
    pub encoder: TransformerEncoder<B>,
}

impl<B: Backend> RobertaModel<B> {
    /// Hidden states `[batch_size, seq_len, hidden_size]`.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, mask_pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let embedding = self.embeddings.forward(tokens, mask_pad.clone());
        let encoder_input = TransformerEncoderInput::new(embedding).mask_pad(mask_pad);
        self.encoder.forward(encoder_input)
    }
}

/// Prediction head: dense → gelu → layer norm, then a decoder tied to the word embeddings.
#[derive(Module, Debug)]
pub struct RobertaLmHead<B: Backend> {
    dense: Linear<B>,
    layer_norm: LayerNorm<B>,
    decoder_bias: Param<Tensor<B, 1>>,
    gelu: Gelu,
}

impl<B: Backend> RobertaLmHead<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>, word_embeddings: Tensor<B, 2>) -> Tensor<B, 3> {
        let hidden = self.dense.forward(hidden);
        let hidden = self.gelu.forward(hidden);
        let hidden = self.layer_norm.forward(hidden);

        // [batch, seq, hidden] x [1, hidden, vocab]
        let decoder: Tensor<B, 3> = word_embeddings.transpose().unsqueeze();
        let logits = hidden.matmul(decoder);

        logits + self.decoder_bias.val().unsqueeze()
    }
}

/// RoBERTa for masked language modeling.
#[derive(Module, Debug)]
pub struct RobertaMaskedLM<B: Backend> {
    pub roberta: RobertaModel<B>,
    pub lm_head: RobertaLmHead<B>,
}

impl<B: Backend> RobertaMaskedLM<B> {
    /// Logits over the vocabulary, `[batch_size, seq_len, vocab_size]`.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, mask_pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let hidden = self.roberta.forward(tokens, mask_pad);
        self.lm_head
            .forward(hidden, self.roberta.embeddings.word_embeddings_weight())
    }

    /// Save the full precision weights and the configuration into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>, config: &RobertaConfig) -> error::Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        config.save(dir.join(MODEL_CONFIG_FILE))?;
        self.clone()
            .save_file(dir.join(MODEL_FILE), &ModelRecorder::new())?;
        Ok(dir.to_path_buf())
    }

    /// Load a model saved with [`RobertaMaskedLM::save`].
    pub fn load(dir: impl AsRef<Path>, device: &B::Device) -> error::Result<(Self, RobertaConfig)> {
        let dir = dir.as_ref();
        let config = RobertaConfig::load(dir.join(MODEL_CONFIG_FILE))?;
        config.validate()?;
        let model = config
            .init_masked_lm(device)
            .load_file(dir.join(MODEL_FILE), &ModelRecorder::new(), device)?;
        Ok((model, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{assert_close, scratch_dir, tiny_config, TestBackend};

    #[test]
    fn default_config_matches_esperberto() {
        let config = RobertaConfig::new();

        assert_eq!(config.vocab_size, 52_000);
        assert_eq!(config.max_position_embeddings, 514);
        assert_eq!(config.num_attention_heads, 12);
        assert_eq!(config.num_hidden_layers, 6);
        assert_eq!(config.type_vocab_size, 1);
        assert_eq!(config.max_seq_len(), 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_uneven_heads() {
        let config = tiny_config().with_num_attention_heads(3);

        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_pad_outside_vocab() {
        let config = tiny_config().with_pad_token_id(40);

        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn masked_lm_outputs_vocabulary_logits() {
        let device = Default::default();
        let model = tiny_config().init_masked_lm::<TestBackend>(&device);
        let tokens = Tensor::<TestBackend, 2, Int>::from_data(
            [[0, 5, 6, 7, 2], [0, 8, 2, 1, 1]],
            &device,
        );
        let mask_pad = tokens.clone().equal_elem(1);

        let logits = model.forward(tokens, mask_pad);

        assert_eq!(logits.dims(), [2, 5, 40]);
    }

    #[test]
    fn decoder_is_tied_to_word_embeddings() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init_masked_lm::<TestBackend>(&device);

        // Tied decoder adds only the bias on top of the encoder and head.
        let head_params = config.hidden_size * config.hidden_size
            + config.hidden_size
            + 2 * config.hidden_size
            + config.vocab_size;
        let encoder_params = model.roberta.num_params();

        assert_eq!(model.num_params(), encoder_params + head_params);
    }

    #[test]
    fn save_and_load_restore_weights() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init_masked_lm::<TestBackend>(&device);
        let dir = scratch_dir("model-save");

        model.save(&dir, &config).unwrap();
        let (loaded, loaded_config) = RobertaMaskedLM::<TestBackend>::load(&dir, &device).unwrap();

        assert_eq!(loaded_config.hidden_size, config.hidden_size);
        let tokens = Tensor::<TestBackend, 2, Int>::from_data([[0, 5, 6, 2]], &device);
        let mask_pad = tokens.clone().equal_elem(1);
        let expected = model.forward(tokens.clone(), mask_pad.clone());
        let actual = loaded.forward(tokens, mask_pad);
        assert_close(expected, actual);
    }
}
