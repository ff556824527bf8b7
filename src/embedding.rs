use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Float, Int, Tensor};

#[derive(Config)]
pub struct RobertaEmbeddingsConfig {
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub hidden_size: usize,
    pub hidden_dropout_prob: f64,
    pub layer_norm_eps: f64,
    pub pad_token_idx: usize,
}

#[derive(Module, Debug)]
pub struct RobertaEmbeddings<B: Backend> {
    pub pad_token_idx: usize,
    pub(crate) word_embeddings: Embedding<B>,
    position_embeddings: Embedding<B>,
    token_type_embeddings: Embedding<B>,
    layer_norm: LayerNorm<B>,
    dropout: Dropout,
}

impl RobertaEmbeddingsConfig {
    /// Initializes RobertaEmbeddings with default weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> RobertaEmbeddings<B> {
        let word_embeddings = EmbeddingConfig::new(self.vocab_size, self.hidden_size).init(device);
        let position_embeddings =
            EmbeddingConfig::new(self.max_position_embeddings, self.hidden_size).init(device);
        let token_type_embeddings =
            EmbeddingConfig::new(self.type_vocab_size, self.hidden_size).init(device);
        let layer_norm = LayerNormConfig::new(self.hidden_size)
            .with_epsilon(self.layer_norm_eps)
            .init(device);

        let dropout = DropoutConfig::new(self.hidden_dropout_prob).init();

        RobertaEmbeddings {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            layer_norm,
            dropout,
            pad_token_idx: self.pad_token_idx,
        }
    }
}

impl<B: Backend> RobertaEmbeddings<B> {
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        mask_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3, Float> {
        // tokens and mask_pad: [batch_size, seq_length]
        let [_, seq_length] = tokens.dims();
        let device = tokens.device();

        let token_type_ids = Tensor::<B, 2, Int>::zeros(tokens.shape(), &device);
        let position_ids = self.position_ids(mask_pad, seq_length);

        let embeddings = self.word_embeddings.forward(tokens)
            + self.token_type_embeddings.forward(token_type_ids)
            + self.position_embeddings.forward(position_ids);

        let embeddings = self.layer_norm.forward(embeddings);
        self.dropout.forward(embeddings)
    }

    /// RoBERTa positions start right after the padding index, padding tokens all share the
    /// padding index. Check create_position_ids_from_input_ids() in
    /// https://github.com/huggingface/transformers/blob/main/src/transformers/models/roberta/modeling_roberta.py
    pub fn position_ids(&self, mask_pad: Tensor<B, 2, Bool>, seq_length: usize) -> Tensor<B, 2, Int> {
        let [batch_size, _] = mask_pad.dims();
        let offset = self.pad_token_idx as i64 + 1;

        Tensor::<B, 1, Int>::arange(offset..seq_length as i64 + offset, &mask_pad.device())
            .reshape([1, seq_length])
            .repeat_dim(0, batch_size)
            .mask_fill(mask_pad, self.pad_token_idx as i64)
    }

    /// Word embedding matrix `[vocab_size, hidden_size]`, shared with the LM decoder.
    pub fn word_embeddings_weight(&self) -> Tensor<B, 2> {
        self.word_embeddings.weight.val()
    }
}
