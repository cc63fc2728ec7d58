//! Service-wide trade limits and the two assets a session swaps between.

use std::fmt;

use lwk_wollet::elements::AssetId;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ticker used for the base asset in status messages and custody records.
pub const BASE_TICKER: &str = "BTC";

/// Which of the two ledger assets a value is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// The network policy asset (L-BTC).
    Base,
    /// The issued asset the service trades against (e.g. USDt).
    Counter,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Base => write!(f, "base"),
            AssetKind::Counter => write!(f, "counter"),
        }
    }
}

/// Wire schema returned by the wallet API `/info` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalletInfo {
    pub token: String,
    pub token_id: String,
    pub token_name: String,
    #[serde(rename = "MaxBuyBTC")]
    pub max_buy_btc: u64,
    pub max_buy_token: u64,
    #[serde(rename = "MinBuyBTC")]
    pub min_buy_btc: u64,
    pub min_buy_token: u64,
    #[serde(rename = "FeeRatePPM")]
    pub fee_rate_ppm: u64,
    pub fee_base_sats: u64,
    /// Price feed symbol for the pair, e.g. "tBTCUST".
    #[serde(default)]
    pub ticker: Option<String>,
}

/// Validated limits, immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletLimits {
    pub base_asset: AssetId,
    pub counter_asset: AssetId,
    /// Short ticker of the counter asset, e.g. "USD".
    pub counter_ticker: String,
    /// Long name of the counter asset, e.g. "PEGx USDt".
    pub counter_name: String,
    pub min_trade_base: u64,
    pub max_trade_base: u64,
    pub min_trade_counter: u64,
    pub max_trade_counter: u64,
    pub fee_rate_ppm: u64,
    pub fee_base: u64,
}

impl WalletLimits {
    /// Validate the wire schema against the network's policy asset.
    pub fn from_info(info: WalletInfo, base_asset: AssetId) -> Result<Self> {
        let counter_asset: AssetId = info
            .token_id
            .parse()
            .map_err(|e| Error::InvalidLimits(format!("bad TokenId {}: {e}", info.token_id)))?;

        let limits = Self {
            base_asset,
            counter_asset,
            counter_ticker: info.token,
            counter_name: info.token_name,
            min_trade_base: info.min_buy_btc,
            max_trade_base: info.max_buy_btc,
            min_trade_counter: info.min_buy_token,
            max_trade_counter: info.max_buy_token,
            fee_rate_ppm: info.fee_rate_ppm,
            fee_base: info.fee_base_sats,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_asset == self.counter_asset {
            return Err(Error::InvalidLimits(
                "counter asset must differ from the base asset".into(),
            ));
        }
        if self.min_trade_base > self.max_trade_base {
            return Err(Error::InvalidLimits(format!(
                "base min {} exceeds max {}",
                self.min_trade_base, self.max_trade_base
            )));
        }
        if self.min_trade_counter > self.max_trade_counter {
            return Err(Error::InvalidLimits(format!(
                "counter min {} exceeds max {}",
                self.min_trade_counter, self.max_trade_counter
            )));
        }
        if self.fee_rate_ppm >= 1_000_000 {
            return Err(Error::InvalidLimits(format!(
                "fee rate {} ppm is 100% or more",
                self.fee_rate_ppm
            )));
        }
        Ok(())
    }

    /// Map an unblinded asset id onto one of the two session assets.
    pub fn classify(&self, asset: &AssetId) -> Option<AssetKind> {
        if *asset == self.base_asset {
            Some(AssetKind::Base)
        } else if *asset == self.counter_asset {
            Some(AssetKind::Counter)
        } else {
            None
        }
    }

    pub fn asset_id(&self, kind: AssetKind) -> AssetId {
        match kind {
            AssetKind::Base => self.base_asset,
            AssetKind::Counter => self.counter_asset,
        }
    }

    pub fn ticker(&self, kind: AssetKind) -> &str {
        match kind {
            AssetKind::Base => BASE_TICKER,
            AssetKind::Counter => &self.counter_ticker,
        }
    }

    pub fn min_trade(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Base => self.min_trade_base,
            AssetKind::Counter => self.min_trade_counter,
        }
    }

    /// Each trade minimum must be at least its asset's dust threshold, so a
    /// settled deposit can always leave as its own change output.
    pub fn check_dust(&self, dust: &DustPolicy) -> Result<()> {
        for kind in [AssetKind::Base, AssetKind::Counter] {
            if self.min_trade(kind) < dust.threshold(kind) {
                return Err(Error::InvalidLimits(format!(
                    "{kind} minimum trade {} is below the dust threshold {}",
                    self.min_trade(kind),
                    dust.threshold(kind)
                )));
            }
        }
        Ok(())
    }

    /// Fee rate as a percentage, for display.
    pub fn fee_rate_pct(&self) -> f64 {
        self.fee_rate_ppm as f64 / 10_000.0
    }
}

/// Smallest change output worth creating, per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DustPolicy {
    pub base: u64,
    pub counter: u64,
}

impl DustPolicy {
    pub fn threshold(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Base => self.base,
            AssetKind::Counter => self.counter,
        }
    }
}

impl Default for DustPolicy {
    fn default() -> Self {
        Self {
            base: 495,
            counter: 2_000_000,
        }
    }
}
