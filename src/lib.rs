use std::{io, path::PathBuf};

use thiserror::Error;

pub mod config;
pub mod corpus;
pub mod engine;
pub mod error_metric;
pub mod params;
pub mod persist;
pub mod scorer;
pub mod tuner;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid configuration: {0}")]
    ConfigSyntax(#[from] toml::de::Error),
    #[error("cannot serialize tuning result: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("test positions line {line}: {reason}")]
    Corpus { line: usize, reason: String },
    #[error("test position file contains no positions")]
    EmptyCorpus,
    #[error("array parameter '{name}' has no element at index {index}")]
    ArrayGap { name: String, index: usize },
}
