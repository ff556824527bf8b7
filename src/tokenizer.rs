use crate::error::{self, Error};
use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::decoders::bpe::BPEDecoder;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::bpe::{BpeTrainerBuilder, BPE};
use tokenizers::models::{ModelWrapper, TrainerWrapper};
use tokenizers::normalizers::{BertNormalizer, NormalizerWrapper};
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::processors::roberta::RobertaProcessing;
use tokenizers::processors::PostProcessorWrapper;
use tokenizers::{AddedToken, Model, TokenizerBuilder, TokenizerImpl};

pub const BOS_TOKEN: &str = "<s>";
pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";
pub const MASK_TOKEN: &str = "<mask>";

/// Special tokens in id order: the trainer assigns them the first ids of the vocabulary.
pub const SPECIAL_TOKENS: [&str; 5] = [BOS_TOKEN, PAD_TOKEN, EOS_TOKEN, UNK_TOKEN, MASK_TOKEN];

const END_OF_WORD_SUFFIX: &str = "</w>";
const CHAR_BPE_ALPHABET_LIMIT: usize = 1000;

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

type WrappedTokenizer = TokenizerImpl<
    ModelWrapper,
    NormalizerWrapper,
    PreTokenizerWrapper,
    PostProcessorWrapper,
    DecoderWrapper,
>;

pub trait Tokenizer: Send + Sync {
    /// Converts a text string into a sequence of tokens, special tokens included.
    fn encode(&self, value: &str) -> Vec<usize>;

    /// Converts a sequence of tokens back into a text string.
    fn decode(&self, tokens: &[usize]) -> String;

    /// Gets the size of the tokenizer's vocabulary.
    fn vocab_size(&self) -> usize;

    /// Gets the token used for padding sequences to a consistent length.
    fn pad_token(&self) -> usize;

    /// Gets the token hiding the positions the model has to predict.
    fn mask_token(&self) -> usize;

    /// Tokens that are never masked nor sampled as replacements.
    fn special_tokens(&self) -> Vec<usize>;
}

/// Flavour of BPE to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TokenizerKind {
    /// Byte-level BPE (GPT-2 / RoBERTa style), never produces `<unk>`.
    #[default]
    ByteBpe,
    /// Character BPE with BERT normalization and a `</w>` end-of-word suffix.
    CharBpe,
}

#[derive(Config, Debug)]
pub struct TokenizerTrainingConfig {
    /// Size of the final vocabulary, special tokens included
    #[config(default = 52_000)]
    pub vocab_size: usize,
    /// Minimum frequency for a pair to be merged
    #[config(default = 2)]
    pub min_frequency: u64,
    #[config(default = "TokenizerKind::ByteBpe")]
    pub kind: TokenizerKind,
    #[config(default = true)]
    pub show_progress: bool,
}

impl TokenizerTrainingConfig {
    fn validate(&self) -> error::Result<()> {
        if self.vocab_size <= SPECIAL_TOKENS.len() {
            return Err(Error::InvalidConfig(format!(
                "vocab_size must be larger than the {} special tokens, got {}",
                SPECIAL_TOKENS.len(),
                self.vocab_size
            )));
        }
        Ok(())
    }

    fn special_tokens(&self) -> Vec<AddedToken> {
        SPECIAL_TOKENS
            .iter()
            .map(|token| {
                // `<mask>` swallows the space before it, like the word it stands for.
                AddedToken::from(*token, true).lstrip(*token == MASK_TOKEN)
            })
            .collect()
    }

    fn trainer(&self) -> TrainerWrapper {
        let builder = BpeTrainerBuilder::new()
            .show_progress(self.show_progress)
            .vocab_size(self.vocab_size)
            .min_frequency(self.min_frequency)
            .special_tokens(self.special_tokens());

        let trainer = match self.kind {
            TokenizerKind::ByteBpe => builder.initial_alphabet(ByteLevel::alphabet()).build(),
            TokenizerKind::CharBpe => builder
                .limit_alphabet(CHAR_BPE_ALPHABET_LIMIT)
                .end_of_word_suffix(END_OF_WORD_SUFFIX.to_string())
                .build(),
        };

        TrainerWrapper::BpeTrainer(trainer)
    }

    fn untrained_tokenizer(&self) -> error::Result<WrappedTokenizer> {
        // Ids follow SPECIAL_TOKENS, checked again once the vocabulary exists.
        let post_processor = RobertaProcessing::new(
            (EOS_TOKEN.to_string(), special_id(EOS_TOKEN)),
            (BOS_TOKEN.to_string(), special_id(BOS_TOKEN)),
        );

        let builder = TokenizerBuilder::new()
            .with_post_processor(Some(PostProcessorWrapper::Roberta(post_processor)));

        let builder = match self.kind {
            TokenizerKind::ByteBpe => builder
                .with_model(ModelWrapper::BPE(BPE::default()))
                .with_normalizer(None)
                .with_pre_tokenizer(Some(PreTokenizerWrapper::ByteLevel(ByteLevel::new(
                    false, true, true,
                ))))
                .with_decoder(Some(DecoderWrapper::ByteLevel(ByteLevel::default()))),
            TokenizerKind::CharBpe => {
                let model = BPE::builder()
                    .unk_token(UNK_TOKEN.to_string())
                    .end_of_word_suffix(END_OF_WORD_SUFFIX.to_string())
                    .build()?;
                builder
                    .with_model(ModelWrapper::BPE(model))
                    .with_normalizer(Some(NormalizerWrapper::BertNormalizer(
                        BertNormalizer::new(true, true, None, false),
                    )))
                    .with_pre_tokenizer(Some(PreTokenizerWrapper::BertPreTokenizer(
                        BertPreTokenizer,
                    )))
                    .with_decoder(Some(DecoderWrapper::BPE(BPEDecoder::new(
                        END_OF_WORD_SUFFIX.to_string(),
                    ))))
            }
        };

        Ok(builder.build()?)
    }
}

fn special_id(token: &str) -> u32 {
    SPECIAL_TOKENS
        .iter()
        .position(|t| *t == token)
        .map(|id| id as u32)
        .unwrap_or_default()
}

/// Train a BPE tokenizer on the given corpus files and save it into `output_dir`.
///
/// Writes the model files (`vocab.json`, `merges.txt`), the full `tokenizer.json` and the
/// training configuration.
pub fn train_tokenizer(
    files: &[PathBuf],
    config: &TokenizerTrainingConfig,
    output_dir: impl AsRef<Path>,
) -> error::Result<MlmTokenizer> {
    config.validate()?;
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)?;

    tracing::info!(
        "Training {:?} tokenizer on {} file(s) (vocab_size={}, min_frequency={})",
        config.kind,
        files.len(),
        config.vocab_size,
        config.min_frequency
    );

    let mut trainer = config.trainer();
    let mut tokenizer = config.untrained_tokenizer()?;

    let files = files
        .iter()
        .map(|f| f.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    tokenizer.train_from_files(&mut trainer, files)?;

    let model_files = tokenizer.get_model().save(output_dir, None)?;
    for file in &model_files {
        tracing::debug!("Saved {}", file.display());
    }

    let tokenizer_path = output_dir.join(TOKENIZER_FILE);
    tokenizer.save(&tokenizer_path, false)?;
    config.save(output_dir.join(TOKENIZER_CONFIG_FILE))?;

    let tokenizer = MlmTokenizer::from_file(tokenizer_path)?;
    tracing::info!(
        "Tokenizer trained with {} tokens, saved to {}",
        tokenizer.vocab_size(),
        output_dir.display()
    );

    Ok(tokenizer)
}

/// Ids of the special tokens a masked language model relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub bos: usize,
    pub pad: usize,
    pub eos: usize,
    pub unk: usize,
    pub mask: usize,
}

/// A trained tokenizer together with its special token ids.
#[derive(Clone)]
pub struct MlmTokenizer {
    tokenizer: tokenizers::Tokenizer,
    special: SpecialTokenIds,
}

impl MlmTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> error::Result<Self> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenizer(format!("Cannot load {}: {e}", path.display())))?;
        Self::new(tokenizer)
    }

    /// Load the `tokenizer.json` stored in a tokenizer or model directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> error::Result<Self> {
        Self::from_file(dir.as_ref().join(TOKENIZER_FILE))
    }

    pub fn new(tokenizer: tokenizers::Tokenizer) -> error::Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .map(|id| id as usize)
                .ok_or_else(|| Error::MissingSpecialToken(token.to_string()))
        };

        let special = SpecialTokenIds {
            bos: id(BOS_TOKEN)?,
            pad: id(PAD_TOKEN)?,
            eos: id(EOS_TOKEN)?,
            unk: id(UNK_TOKEN)?,
            mask: id(MASK_TOKEN)?,
        };

        // The post-processor hardcodes the <s> and </s> ids.
        if special.bos != special_id(BOS_TOKEN) as usize
            || special.eos != special_id(EOS_TOKEN) as usize
        {
            return Err(Error::Tokenizer(format!(
                "Unexpected special token ids: {special:?}"
            )));
        }

        Ok(Self { tokenizer, special })
    }

    /// Write `tokenizer.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> error::Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(TOKENIZER_FILE);
        self.tokenizer.save(&path, false)?;
        Ok(path)
    }

    pub fn special_ids(&self) -> SpecialTokenIds {
        self.special
    }

    pub fn token_to_id(&self, token: &str) -> Option<usize> {
        self.tokenizer.token_to_id(token).map(|id| id as usize)
    }

    pub fn id_to_token(&self, id: usize) -> Option<String> {
        self.tokenizer.id_to_token(id as u32)
    }

    pub fn try_encode(&self, value: &str) -> error::Result<Vec<usize>> {
        let encoding = self.tokenizer.encode(value, true)?;
        Ok(encoding.get_ids().iter().map(|t| *t as usize).collect())
    }

    pub fn try_decode(&self, tokens: &[usize], skip_special_tokens: bool) -> error::Result<String> {
        let tokens = tokens.iter().map(|t| *t as u32).collect::<Vec<u32>>();
        Ok(self.tokenizer.decode(&tokens, skip_special_tokens)?)
    }
}

impl Tokenizer for MlmTokenizer {
    fn encode(&self, value: &str) -> Vec<usize> {
        self.try_encode(value).unwrap_or_else(|err| {
            tracing::warn!("Could not encode {value:?}: {err}");
            vec![self.special.bos, self.special.unk, self.special.eos]
        })
    }

    fn decode(&self, tokens: &[usize]) -> String {
        self.try_decode(tokens, false).unwrap_or_else(|err| {
            tracing::warn!("Could not decode {tokens:?}: {err}");
            String::new()
        })
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn pad_token(&self) -> usize {
        self.special.pad
    }

    fn mask_token(&self) -> usize {
        self.special.mask
    }

    fn special_tokens(&self) -> Vec<usize> {
        let SpecialTokenIds {
            bos,
            pad,
            eos,
            unk,
            mask,
        } = self.special;
        vec![bos, pad, eos, unk, mask]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{sample_corpus, scratch_dir};

    fn small_config(kind: TokenizerKind) -> TokenizerTrainingConfig {
        TokenizerTrainingConfig::new()
            .with_vocab_size(400)
            .with_kind(kind)
            .with_show_progress(false)
    }

    #[test]
    fn byte_bpe_assigns_special_tokens_first() {
        let corpus = sample_corpus("tok-special");
        let out = scratch_dir("tok-special-out");

        let tokenizer = train_tokenizer(&corpus, &small_config(TokenizerKind::ByteBpe), &out).unwrap();

        for (expected, token) in SPECIAL_TOKENS.iter().enumerate() {
            assert_eq!(tokenizer.token_to_id(token), Some(expected));
        }
        assert_eq!(tokenizer.pad_token(), 1);
        assert_eq!(tokenizer.mask_token(), 4);
        assert!(tokenizer.vocab_size() <= 400);
    }

    #[test]
    fn byte_bpe_writes_model_files() {
        let corpus = sample_corpus("tok-files");
        let out = scratch_dir("tok-files-out");

        train_tokenizer(&corpus, &small_config(TokenizerKind::ByteBpe), &out).unwrap();

        assert!(out.join("vocab.json").is_file());
        assert!(out.join("merges.txt").is_file());
        assert!(out.join(TOKENIZER_FILE).is_file());
        assert!(out.join(TOKENIZER_CONFIG_FILE).is_file());
        assert!(MlmTokenizer::from_dir(&out).is_ok());
    }

    #[test]
    fn byte_bpe_wraps_and_restores_text() {
        let corpus = sample_corpus("tok-roundtrip");
        let out = scratch_dir("tok-roundtrip-out");
        let tokenizer = train_tokenizer(&corpus, &small_config(TokenizerKind::ByteBpe), &out).unwrap();

        let ids = tokenizer.encode("La suno brilas.");

        assert_eq!(ids.first(), Some(&0));
        assert_eq!(ids.last(), Some(&2));
        assert!(!ids.contains(&tokenizer.special_ids().unk));
        assert_eq!(tokenizer.try_decode(&ids, true).unwrap(), "La suno brilas.");
    }

    #[test]
    fn mask_token_is_kept_whole() {
        let corpus = sample_corpus("tok-mask");
        let out = scratch_dir("tok-mask-out");
        let tokenizer = train_tokenizer(&corpus, &small_config(TokenizerKind::ByteBpe), &out).unwrap();

        let ids = tokenizer.encode("La suno <mask>.");

        assert_eq!(ids.iter().filter(|id| **id == tokenizer.mask_token()).count(), 1);
    }

    #[test]
    fn mask_token_absorbs_preceding_space() {
        let corpus = sample_corpus("tok-mask-space");
        let out = scratch_dir("tok-mask-space-out");
        let tokenizer = train_tokenizer(&corpus, &small_config(TokenizerKind::ByteBpe), &out).unwrap();

        let ids = tokenizer.encode("La suno <mask>.");
        let position = ids.iter().position(|id| *id == tokenizer.mask_token()).unwrap();
        let suno = tokenizer.encode("La suno.");

        assert_ne!(tokenizer.id_to_token(ids[position - 1]).as_deref(), Some("Ġ"));
        assert_eq!(ids[..position], suno[..position]);

        // Filling the mask with a word yields a single space.
        let word = tokenizer.encode(" suno");
        let mut filled = ids[..position].to_vec();
        filled.extend(&word[1..word.len() - 1]);
        filled.extend(&ids[position + 1..]);
        assert_eq!(tokenizer.try_decode(&filled, true).unwrap(), "La suno suno.");
    }

    #[test]
    fn char_bpe_trains_with_same_special_tokens() {
        let corpus = sample_corpus("tok-char");
        let out = scratch_dir("tok-char-out");

        let tokenizer = train_tokenizer(&corpus, &small_config(TokenizerKind::CharBpe), &out).unwrap();

        assert_eq!(tokenizer.special_ids().mask, 4);
        let ids = tokenizer.encode("La suno brilas.");
        assert_eq!(ids.first(), Some(&0));
        assert_eq!(ids.last(), Some(&2));
    }

    #[test]
    fn rejects_vocabulary_smaller_than_special_tokens() {
        let corpus = sample_corpus("tok-invalid");
        let out = scratch_dir("tok-invalid-out");
        let config = small_config(TokenizerKind::ByteBpe).with_vocab_size(5);

        assert!(matches!(
            train_tokenizer(&corpus, &config, &out),
            Err(Error::InvalidConfig(_))
        ));
    }
}
