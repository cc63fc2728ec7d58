use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Couldn't read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Mnemonic not found: set the {0} environment variable")]
    MissingMnemonic(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Price feed error: {0}")]
    PriceFeed(String),

    #[error(transparent)]
    Sdk(#[from] swapmarket_sdk::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}
