use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use swapmarket_sdk::{
    ChainBackend, DustPolicy, ElectrumBackend, EsploraBackend, LifecycleConfig, Network,
    PollConfig, WalletInfo,
};

use crate::error::AppError;

/// Service configuration, read from a JSON file. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: Network,
    pub explorer: ExplorerConfig,
    /// Explorer root for receipt links. Defaults per network.
    pub explorer_web_url: Option<String>,
    /// Wallet API serving `/info`. Ignored when `limits` is set inline.
    pub api_url: Option<String>,
    pub limits: Option<WalletInfo>,
    pub dust_base: u64,
    pub dust_counter: u64,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub max_fee_iterations: u32,
    pub price_feed: PriceFeedConfig,
    pub custody: CustodyConfig,
}

impl Default for Config {
    fn default() -> Self {
        let dust = DustPolicy::default();
        Self {
            network: Network::LiquidTestnet,
            explorer: ExplorerConfig::default(),
            explorer_web_url: None,
            api_url: None,
            limits: None,
            dust_base: dust.base,
            dust_counter: dust.counter,
            poll_interval_secs: 5,
            max_retries: 3,
            max_fee_iterations: 3,
            price_feed: PriceFeedConfig::default(),
            custody: CustodyConfig::default(),
        }
    }
}

/// Chain data source. The URL defaults per network when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExplorerConfig {
    Electrum { url: Option<String> },
    Esplora { url: Option<String> },
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        ExplorerConfig::Electrum { url: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceFeedConfig {
    pub url: String,
    /// Feed symbol. Falls back to the wallet info `Ticker`, then `tBTCUST`.
    pub ticker: Option<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            url: "https://api-pub.bitfinex.com/v2".to_string(),
            ticker: None,
            interval_secs: 10,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Environment variable holding the signer mnemonic.
    pub mnemonic_env: String,
    pub state_file: Option<PathBuf>,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            mnemonic_env: "SWAPMARKET_MNEMONIC".to_string(),
            state_file: None,
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| AppError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("couldn't parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.limits.is_none() && self.api_url.is_none() {
            return Err(AppError::Config(
                "either `limits` or `api_url` must be set".into(),
            ));
        }
        if self.poll_interval_secs == 0 || self.price_feed.interval_secs == 0 {
            return Err(AppError::Config("intervals must be positive".into()));
        }
        if let Some(limits) = &self.limits {
            let dust = self.dust();
            if limits.min_buy_btc < dust.base || limits.min_buy_token < dust.counter {
                return Err(AppError::Config(format!(
                    "minimum trades {} / {} are below the dust thresholds {} / {}",
                    limits.min_buy_btc, limits.min_buy_token, dust.base, dust.counter
                )));
            }
        }
        if self.max_retries == 0 || self.max_fee_iterations == 0 {
            return Err(AppError::Config(
                "max_retries and max_fee_iterations must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn dust(&self) -> DustPolicy {
        DustPolicy {
            base: self.dust_base,
            counter: self.dust_counter,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let mut config = LifecycleConfig::new(self.network);
        if let Some(url) = &self.explorer_web_url {
            config.explorer_web_url = url.trim_end_matches('/').to_string();
        }
        config.dust = self.dust();
        config.max_retries = self.max_retries;
        config.max_fee_iterations = self.max_fee_iterations;
        config
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn chain_backend(&self) -> Arc<dyn ChainBackend> {
        match &self.explorer {
            ExplorerConfig::Electrum { url } => {
                let url = url
                    .as_deref()
                    .unwrap_or(self.network.default_electrum_url());
                log::info!("Using electrum backend at {url}");
                Arc::new(ElectrumBackend::new(url))
            }
            ExplorerConfig::Esplora { url } => {
                let url = url.as_deref().unwrap_or(self.network.esplora_url());
                log::info!("Using esplora backend at {url}");
                Arc::new(EsploraBackend::new(url, self.network.address_params()))
            }
        }
    }
}
