use crate::data::{maskable_lines, MaskedLmBatch, MlmBatcher, MlmDataset};
use crate::error::{self, Error};
use crate::model::{RobertaConfig, RobertaMaskedLM};
use crate::tokenizer::{MlmTokenizer, Tokenizer};
use burn::{
    data::{dataloader::batcher::Batcher, dataloader::DataLoaderBuilder, dataset::Dataset},
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::AdamWConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        checkpoint::KeepLastNCheckpoints,
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep,
    },
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TRAINING_CONFIG_FILE: &str = "training.json";
pub const EVAL_RESULTS_FILE: &str = "eval_results_lm.txt";

impl<B: Backend> RobertaMaskedLM<B> {
    /// Cross-entropy over the masked positions only.
    pub fn forward_mlm(&self, batch: MaskedLmBatch<B>) -> ClassificationOutput<B> {
        let [batch_size, seq_length] = batch.tokens.dims();
        let logits = self.forward(batch.tokens, batch.mask_pad);
        let [_, _, vocab_size] = logits.dims();

        let logits = logits
            .reshape([batch_size * seq_length, vocab_size])
            .select(0, batch.masked_positions);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.masked_labels.clone());

        ClassificationOutput::new(loss, logits, batch.masked_labels)
    }
}

impl<B: AutodiffBackend> TrainStep<MaskedLmBatch<B>, ClassificationOutput<B>> for RobertaMaskedLM<B> {
    fn step(&self, batch: MaskedLmBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_mlm(batch);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<MaskedLmBatch<B>, ClassificationOutput<B>> for RobertaMaskedLM<B> {
    fn step(&self, batch: MaskedLmBatch<B>) -> ClassificationOutput<B> {
        self.forward_mlm(batch)
    }
}

#[derive(Config, Debug)]
pub struct MlmTrainingConfig {
    #[config(default = 1)]
    pub num_epochs: usize,

    #[config(default = 64)]
    pub batch_size: usize,

    /// Sequences are truncated to this many tokens, <s> and </s> included
    #[config(default = 128)]
    pub block_size: usize,

    #[config(default = 5e-5)]
    pub learning_rate: f64,

    #[config(default = 0.0)]
    pub weight_decay: f32,

    #[config(default = 1.0)]
    pub max_grad_norm: f32,

    #[config(default = 0.15)]
    pub mlm_probability: f64,

    /// Share of the corpus lines held out for evaluation
    #[config(default = 0.01)]
    pub eval_fraction: f64,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1)]
    pub num_workers: usize,

    #[config(default = 1)]
    pub grads_accumulation: usize,

    /// Number of epoch checkpoints kept on disk
    #[config(default = 2)]
    pub save_total_limit: usize,
}

impl MlmTrainingConfig {
    pub fn validate(&self, model: &RobertaConfig) -> error::Result<()> {
        if self.batch_size == 0 || self.num_epochs == 0 {
            return Err(Error::InvalidConfig(
                "batch_size and num_epochs must be positive".to_string(),
            ));
        }
        if self.block_size < 2 || self.block_size > model.max_seq_len() {
            return Err(Error::InvalidConfig(format!(
                "block_size ({}) must be within [2, {}]",
                self.block_size,
                model.max_seq_len()
            )));
        }
        if !(0.0..=1.0).contains(&self.mlm_probability) {
            return Err(Error::InvalidConfig(format!(
                "mlm_probability ({}) must be a probability",
                self.mlm_probability
            )));
        }
        Ok(())
    }
}

/// Metrics of the trained model on the held-out lines.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResults {
    /// Mean cross-entropy per masked token
    pub eval_loss: f64,
    pub perplexity: f64,
    pub eval_samples: usize,
    pub eval_masked_tokens: usize,
}

impl EvalResults {
    pub fn new(eval_loss: f64, eval_samples: usize, eval_masked_tokens: usize) -> Self {
        Self {
            eval_loss,
            perplexity: eval_loss.exp(),
            eval_samples,
            eval_masked_tokens,
        }
    }

    /// Results sorted by key.
    pub fn entries(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("eval_loss", self.eval_loss.to_string()),
            ("eval_masked_tokens", self.eval_masked_tokens.to_string()),
            ("eval_samples", self.eval_samples.to_string()),
            ("perplexity", self.perplexity.to_string()),
        ])
    }

    /// Write the `key = value` lines into `eval_results_lm.txt`.
    pub fn write(&self, dir: impl AsRef<Path>) -> error::Result<PathBuf> {
        let path = dir.as_ref().join(EVAL_RESULTS_FILE);
        let content = self
            .entries()
            .iter()
            .map(|(key, value)| format!("{key} = {value}\n"))
            .collect::<String>();
        fs::write(&path, content)?;
        Ok(path)
    }
}

/// Evaluate the masked language modeling loss over a dataset.
pub fn evaluate<B: Backend, D: Dataset<String>>(
    model: &RobertaMaskedLM<B>,
    batcher: &MlmBatcher,
    dataset: &D,
    batch_size: usize,
    device: &B::Device,
) -> EvalResults {
    let mut loss_sum = 0.0;
    let mut masked_tokens = 0;
    let batch_size = batch_size.max(1);

    for start in (0..dataset.len()).step_by(batch_size) {
        let end = usize::min(start + batch_size, dataset.len());
        let items = (start..end)
            .filter_map(|index| dataset.get(index))
            .collect::<Vec<_>>();
        if items.is_empty() {
            continue;
        }

        let batch: MaskedLmBatch<B> = batcher.batch(items, device);
        let [num_masked] = batch.masked_labels.dims();
        if num_masked == 0 {
            continue;
        }
        let output = model.forward_mlm(batch);
        let loss = output.loss.into_scalar().elem::<f64>();

        loss_sum += loss * num_masked as f64;
        masked_tokens += num_masked;
    }

    let eval_loss = if masked_tokens > 0 {
        loss_sum / masked_tokens as f64
    } else {
        f64::NAN
    };

    EvalResults::new(eval_loss, dataset.len(), masked_tokens)
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub model_dir: PathBuf,
    pub num_params: usize,
    pub elapsed: Duration,
    pub eval: EvalResults,
}

fn create_artifact_dir(artifact_dir: &Path) -> error::Result<()> {
    // Remove existing artifacts before to get an accurate learner summary
    if artifact_dir.exists() {
        fs::remove_dir_all(artifact_dir)?;
    }
    fs::create_dir_all(artifact_dir)?;
    Ok(())
}

/// Train a RoBERTa masked language model from scratch on corpus lines.
///
/// The trained model, its configuration, the training configuration, the tokenizer and the
/// evaluation results all end up in `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: impl AsRef<Path>,
    model_config: &RobertaConfig,
    config: &MlmTrainingConfig,
    tokenizer: Arc<MlmTokenizer>,
    lines: Vec<String>,
    device: B::Device,
) -> error::Result<TrainingReport> {
    let artifact_dir = artifact_dir.as_ref();
    model_config.validate()?;
    config.validate(model_config)?;

    if tokenizer.vocab_size() > model_config.vocab_size {
        return Err(Error::InvalidConfig(format!(
            "the tokenizer has {} tokens but the model only {}",
            tokenizer.vocab_size(),
            model_config.vocab_size
        )));
    }
    if tokenizer.pad_token() != model_config.pad_token_id {
        return Err(Error::InvalidConfig(format!(
            "pad_token_id ({}) differs from the tokenizer's ({})",
            model_config.pad_token_id,
            tokenizer.pad_token()
        )));
    }

    let lines = maskable_lines(lines, tokenizer.as_ref(), config.block_size);
    if lines.len() < 2 {
        return Err(Error::InvalidConfig(format!(
            "training needs at least two corpus lines with regular tokens, got {}",
            lines.len()
        )));
    }

    create_artifact_dir(artifact_dir)?;
    config.save(artifact_dir.join(TRAINING_CONFIG_FILE))?;
    tokenizer.save(artifact_dir)?;

    B::seed(config.seed);

    // Dataloaders
    let (train_dataset, eval_dataset) =
        MlmDataset::split(lines, config.eval_fraction, config.seed);
    let eval_dataset = Arc::new(eval_dataset);
    tracing::info!(
        "Train dataset: {} lines, eval dataset: {} lines",
        train_dataset.len(),
        eval_dataset.len()
    );

    let batcher_train = MlmBatcher::new(
        tokenizer.clone(),
        config.mlm_probability,
        config.block_size,
        config.seed,
    );
    let batcher_valid = MlmBatcher::new(
        tokenizer.clone(),
        config.mlm_probability,
        config.block_size,
        config.seed.wrapping_add(1),
    );

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_dataset);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid.clone())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(eval_dataset.clone());

    let model = model_config.init_masked_lm::<B>(&device);
    let num_params = model.num_params();
    tracing::info!("The number of parameters: {num_params}");

    let optimizer = AdamWConfig::new()
        .with_epsilon(1e-8)
        .with_weight_decay(config.weight_decay)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.max_grad_norm)))
        .init();

    // Learner config
    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .with_checkpointing_strategy(KeepLastNCheckpoints::new(config.save_total_limit))
        .with_application_logger(None)
        .devices(vec![device.clone()])
        .grads_accumulation(config.grads_accumulation)
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, optimizer, config.learning_rate);

    // Training
    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_valid);
    let elapsed = now.elapsed();
    tracing::info!(
        "Training completed in {}m{}s",
        elapsed.as_secs() / 60,
        elapsed.as_secs() % 60
    );

    model_trained.save(artifact_dir, model_config)?;

    let model_valid = model_trained.valid();
    let eval = evaluate(
        &model_valid,
        &batcher_valid,
        eval_dataset.as_ref(),
        config.batch_size,
        &device,
    );
    tracing::info!(
        "Eval loss: {:.4}, perplexity: {:.4}",
        eval.eval_loss,
        eval.perplexity
    );
    eval.write(artifact_dir)?;

    Ok(TrainingReport {
        model_dir: artifact_dir.to_path_buf(),
        num_params,
        elapsed,
        eval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{scratch_dir, tiny_config, FixedTokenizer, TestAutodiffBackend, TestBackend};

    fn batcher(mlm_probability: f64) -> MlmBatcher {
        MlmBatcher::new(Arc::new(FixedTokenizer::default()), mlm_probability, 16, 3)
    }

    #[test]
    fn forward_mlm_scores_masked_positions_only() {
        let device = Default::default();
        let model = tiny_config().init_masked_lm::<TestBackend>(&device);
        let batch: MaskedLmBatch<TestBackend> =
            batcher(1.0).batch(vec!["a b c".to_string(), "a".to_string()], &device);

        let output = model.forward_mlm(batch);

        assert_eq!(output.output.dims(), [4, 40]);
        assert_eq!(output.targets.dims(), [4]);
        let loss = output.loss.into_scalar().elem::<f64>();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn train_step_produces_gradients() {
        let device = Default::default();
        let model = tiny_config().init_masked_lm::<TestAutodiffBackend>(&device);
        let batch: MaskedLmBatch<TestAutodiffBackend> =
            batcher(0.5).batch(vec!["a b c d".to_string()], &device);

        let output = TrainStep::step(&model, batch);

        assert!(output.item.loss.into_scalar().elem::<f64>().is_finite());
    }

    #[test]
    fn evaluation_perplexity_is_exp_of_loss() {
        let device = Default::default();
        let model = tiny_config().init_masked_lm::<TestBackend>(&device);
        let dataset = MlmDataset::new(vec![
            "a b c".to_string(),
            "a b".to_string(),
            "a b c d e".to_string(),
        ]);

        let results = evaluate(&model, &batcher(0.5), &dataset, 2, &device);

        assert_eq!(results.eval_samples, 3);
        assert!(results.eval_masked_tokens > 0);
        assert!((results.perplexity - results.eval_loss.exp()).abs() < 1e-9);
    }

    #[test]
    fn evaluation_skips_batches_without_prediction() {
        let device = Default::default();
        let model = tiny_config().init_masked_lm::<TestBackend>(&device);
        let dataset = MlmDataset::new(vec!["a b c".to_string(), "<mask>".to_string()]);

        let results = evaluate(&model, &batcher(0.5), &dataset, 1, &device);

        assert_eq!(results.eval_samples, 2);
        assert!(results.eval_masked_tokens > 0);
        assert!(results.eval_loss.is_finite());
    }

    #[test]
    fn eval_results_file_is_sorted() {
        let dir = scratch_dir("eval-results");
        let results = EvalResults::new(2.0, 10, 25);

        let path = results.write(&dir).unwrap();

        let content = fs::read_to_string(path).unwrap();
        let keys = content
            .lines()
            .map(|line| line.split(" = ").next().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["eval_loss", "eval_masked_tokens", "eval_samples", "perplexity"]
        );
        assert!(content.contains("perplexity = 7.38905609893065"));
    }

    #[test]
    fn block_size_must_fit_position_embeddings() {
        let model = tiny_config();
        let config = MlmTrainingConfig::new().with_block_size(model.max_seq_len() + 1);

        assert!(matches!(config.validate(&model), Err(Error::InvalidConfig(_))));
        assert!(MlmTrainingConfig::new()
            .with_block_size(model.max_seq_len())
            .validate(&model)
            .is_ok());
    }

    #[test]
    fn default_config_matches_esperberto() {
        let config = MlmTrainingConfig::new();

        assert_eq!(config.num_epochs, 1);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.block_size, 128);
        assert_eq!(config.mlm_probability, 0.15);
        assert_eq!(config.save_total_limit, 2);
    }
}
