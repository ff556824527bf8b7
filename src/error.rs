use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Record error: {0}")]
    Record(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No corpus file found in {0}")]
    EmptyCorpus(PathBuf),

    #[error("Special token `{0}` is missing from the vocabulary")]
    MissingSpecialToken(String),

    #[error("Input contains no `<mask>` token: {0}")]
    NoMaskToken(String),

    #[error("Download error: {0}")]
    Download(String),
}

impl From<tokenizers::Error> for Error {
    fn from(err: tokenizers::Error) -> Self {
        Error::Tokenizer(err.to_string())
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(err: burn::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Record(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
