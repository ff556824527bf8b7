use anyhow::{bail, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::{Args, Parser, Subcommand, ValueEnum};
use esperberto_burn::{
    corpus, fill_mask, tokenizer::train_tokenizer, training, MlmTokenizer, MlmTrainingConfig,
    RobertaConfig, RobertaMaskedLM, TokenizerKind, TokenizerTrainingConfig, SAMPLE_SENTENCES,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(not(feature = "f16"))]
#[allow(dead_code)]
type ElemType = f32;
#[cfg(feature = "f16")]
#[allow(dead_code)]
type ElemType = burn::tensor::f16;

#[derive(Parser, Debug)]
#[command(name = "esperberto", version, about = "Train an Esperanto RoBERTa from scratch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the Esperanto corpus
    Download(DownloadArgs),
    /// Train a BPE tokenizer on the corpus
    TrainTokenizer(TokenizerArgs),
    /// Train the masked language model
    Train(TrainArgs),
    /// Predict the `<mask>` tokens of some sentences
    FillMask(FillMaskArgs),
    /// Download, train the tokenizer, train the model and fill the sample sentences
    Pipeline(PipelineArgs),
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[arg(long, default_value = corpus::CORPUS_URL)]
    url: String,
    /// Defaults to `~/.cache/esperberto-burn`
    #[arg(long)]
    dest: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    ByteBpe,
    Bpe,
}

impl From<KindArg> for TokenizerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::ByteBpe => TokenizerKind::ByteBpe,
            KindArg::Bpe => TokenizerKind::CharBpe,
        }
    }
}

#[derive(Args, Debug)]
struct TokenizerOptions {
    #[arg(long, default_value_t = 52_000)]
    vocab_size: usize,
    #[arg(long, default_value_t = 2)]
    min_frequency: u64,
    #[arg(long, value_enum, default_value_t = KindArg::ByteBpe)]
    kind: KindArg,
}

impl TokenizerOptions {
    fn config(&self) -> TokenizerTrainingConfig {
        TokenizerTrainingConfig::new()
            .with_vocab_size(self.vocab_size)
            .with_min_frequency(self.min_frequency)
            .with_kind(self.kind.into())
    }
}

#[derive(Args, Debug)]
struct TokenizerArgs {
    /// Corpus file or directory of `*.txt` files
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    options: TokenizerOptions,
}

#[derive(Args, Debug)]
struct TrainOptions {
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 5e-5)]
    learning_rate: f64,
    #[arg(long, default_value_t = 128)]
    block_size: usize,
    #[arg(long, default_value_t = 0.15)]
    mlm_probability: f64,
    #[arg(long, default_value_t = 52_000)]
    model_vocab_size: usize,
    #[arg(long, default_value_t = 6)]
    layers: usize,
    #[arg(long, default_value_t = 12)]
    heads: usize,
    #[arg(long, default_value_t = 768)]
    hidden_size: usize,
    /// Defaults to four times the hidden size
    #[arg(long)]
    intermediate_size: Option<usize>,
}

impl TrainOptions {
    fn model_config(&self) -> RobertaConfig {
        RobertaConfig::new()
            .with_vocab_size(self.model_vocab_size)
            .with_num_hidden_layers(self.layers)
            .with_num_attention_heads(self.heads)
            .with_hidden_size(self.hidden_size)
            .with_intermediate_size(self.intermediate_size.unwrap_or(4 * self.hidden_size))
    }

    fn training_config(&self) -> MlmTrainingConfig {
        MlmTrainingConfig::new()
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_seed(self.seed)
            .with_learning_rate(self.learning_rate)
            .with_block_size(self.block_size)
            .with_mlm_probability(self.mlm_probability)
    }
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Corpus file or directory of `*.txt` files
    #[arg(long)]
    data: PathBuf,
    /// Directory holding `tokenizer.json`
    #[arg(long)]
    tokenizer: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    options: TrainOptions,
}

#[derive(Args, Debug)]
struct FillMaskArgs {
    /// Directory written by `train`
    #[arg(long)]
    model: PathBuf,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    /// Sentences with a `<mask>` token, the sample sentences when empty
    texts: Vec<String>,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    #[arg(long, default_value = "data")]
    data: PathBuf,
    #[arg(long, default_value = "EsperBERTo")]
    out: PathBuf,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    #[command(flatten)]
    tokenizer: TokenizerOptions,
    #[command(flatten)]
    train: TrainOptions,
}

#[cfg(feature = "download")]
fn download(url: &str, dest: Option<&Path>) -> Result<PathBuf> {
    let dest = match dest {
        Some(dest) => dest.to_path_buf(),
        None => corpus::cache_dir()?,
    };
    corpus::download_corpus(url, dest).with_context(|| format!("downloading {url}"))
}

#[cfg(not(feature = "download"))]
fn download(url: &str, _dest: Option<&Path>) -> Result<PathBuf> {
    bail!("cannot fetch {url}: rebuild with `--features download`")
}

fn run_train_tokenizer(data: &Path, out: &Path, options: &TokenizerOptions) -> Result<MlmTokenizer> {
    let files = corpus::corpus_files(data)?;
    let tokenizer = train_tokenizer(&files, &options.config(), out)?;
    Ok(tokenizer)
}

fn run_train<B: AutodiffBackend>(
    data: &Path,
    tokenizer: MlmTokenizer,
    out: &Path,
    options: &TrainOptions,
    device: B::Device,
) -> Result<()> {
    let files = corpus::corpus_files(data)?;
    let lines = corpus::read_lines(&files)?;

    let report = training::train::<B>(
        out,
        &options.model_config(),
        &options.training_config(),
        Arc::new(tokenizer),
        lines,
        device,
    )?;

    println!(
        "Trained {} parameters in {:.1?}, eval loss {:.4}, perplexity {:.4}",
        report.num_params, report.elapsed, report.eval.eval_loss, report.eval.perplexity
    );
    Ok(())
}

fn run_fill_mask<B: AutodiffBackend>(
    model_dir: &Path,
    texts: Vec<String>,
    top_k: usize,
    device: B::Device,
) -> Result<()> {
    let (model, config) = RobertaMaskedLM::<B::InnerBackend>::load(model_dir, &device)
        .with_context(|| format!("loading the model from {}", model_dir.display()))?;
    let tokenizer = MlmTokenizer::from_dir(model_dir)?;

    let texts = if texts.is_empty() {
        SAMPLE_SENTENCES.iter().map(|s| s.to_string()).collect()
    } else {
        texts
    };

    let results = fill_mask(
        &model,
        Arc::new(tokenizer),
        &texts,
        top_k,
        config.max_seq_len(),
        &device,
    )?;

    for (text, masks) in texts.iter().zip(results) {
        println!("{text}");
        for mask in masks {
            for prediction in mask.top_k {
                println!(
                    "  {:.4}  {:>6}  {:<16}  {}",
                    prediction.score,
                    prediction.token,
                    format!("{:?}", prediction.token_str),
                    prediction.sequence
                );
            }
        }
    }
    Ok(())
}

fn launch<B: AutodiffBackend>(command: Command, device: B::Device) -> Result<()> {
    match command {
        Command::Download(args) => {
            let path = download(&args.url, args.dest.as_deref())?;
            println!("{}", path.display());
        }
        Command::TrainTokenizer(args) => {
            run_train_tokenizer(&args.data, &args.out, &args.options)?;
        }
        Command::Train(args) => {
            let tokenizer = MlmTokenizer::from_dir(&args.tokenizer)?;
            run_train::<B>(&args.data, tokenizer, &args.out, &args.options, device)?;
        }
        Command::FillMask(args) => {
            run_fill_mask::<B>(&args.model, args.texts, args.top_k, device)?;
        }
        Command::Pipeline(args) => {
            // Downloads are skipped when the corpus is already there.
            if cfg!(feature = "download") || corpus::corpus_files(&args.data).is_err() {
                download(corpus::CORPUS_URL, Some(&args.data))?;
            }
            let tokenizer_dir = args.out.join("tokenizer");
            let model_dir = args.out.join("model");

            let tokenizer = run_train_tokenizer(&args.data, &tokenizer_dir, &args.tokenizer)?;
            run_train::<B>(&args.data, tokenizer, &model_dir, &args.train, device.clone())?;
            run_fill_mask::<B>(&model_dir, Vec::new(), args.top_k, device)?;
        }
    }
    Ok(())
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use crate::{launch, Command, ElemType};
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    pub fn run(command: Command) -> anyhow::Result<()> {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        launch::<Autodiff<LibTorch<ElemType>>>(command, device)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use crate::{launch, Command};
    use burn::backend::{
        wgpu::{Wgpu, WgpuDevice},
        Autodiff,
    };

    pub fn run(command: Command) -> anyhow::Result<()> {
        launch::<Autodiff<Wgpu>>(command, WgpuDevice::default())
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use crate::{launch, Command, ElemType};
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    pub fn run(command: Command) -> anyhow::Result<()> {
        launch::<Autodiff<LibTorch<ElemType>>>(command, LibTorchDevice::Cpu)
    }
}

#[cfg(feature = "ndarray")]
mod ndarray {
    use crate::{launch, Command, ElemType};
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };

    pub fn run(command: Command) -> anyhow::Result<()> {
        launch::<Autodiff<NdArray<ElemType>>>(command, NdArrayDevice::Cpu)
    }
}

#[allow(unreachable_code)]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("esperberto_burn=info".parse()?),
        )
        .init();

    let command = Cli::parse().command;

    // The first enabled backend wins, GPUs first.
    #[cfg(feature = "tch-gpu")]
    return tch_gpu::run(command);
    #[cfg(all(feature = "wgpu", not(feature = "tch-gpu")))]
    return wgpu::run(command);
    #[cfg(all(feature = "tch-cpu", not(any(feature = "tch-gpu", feature = "wgpu"))))]
    return tch_cpu::run(command);
    #[cfg(all(
        feature = "ndarray",
        not(any(feature = "tch-gpu", feature = "wgpu", feature = "tch-cpu"))
    ))]
    return ndarray::run(command);

    let _ = command;
    bail!("no backend enabled, build with one of the `ndarray`, `wgpu`, `tch-cpu` or `tch-gpu` features")
}
