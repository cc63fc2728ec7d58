use std::time::Duration;

use swapmarket_sdk::RateCell;

use crate::config::PriceFeedConfig;
use crate::error::AppError;

pub const DEFAULT_TICKER: &str = "tBTCUST";

/// Polls the Bitfinex public ticker and publishes the bid/ask mid price.
#[derive(Clone, Debug)]
pub struct PriceFeed {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl PriceFeed {
    pub fn new(config: &PriceFeedConfig, ticker: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: ticker_url(&config.url, ticker),
            interval: Duration::from_secs(config.interval_secs),
        })
    }

    pub async fn fetch_mid(&self) -> Result<f64, AppError> {
        let ticker: Vec<f64> = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        mid_price(&ticker)
    }

    /// Poll until the task is dropped. Any failed poll clears the rate.
    pub async fn run(self, cell: RateCell) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            match self.fetch_mid().await {
                Ok(mid) => cell.publish(Some(mid)),
                Err(e) => {
                    log::warn!("Price feed {} failed: {e}", self.url);
                    cell.publish(None);
                }
            }
        }
    }
}

fn ticker_url(base: &str, ticker: &str) -> String {
    format!("{}/ticker/{ticker}", base.trim_end_matches('/'))
}

/// Mid price from a `[BID, BID_SIZE, ASK, ASK_SIZE, ...]` ticker row.
pub fn mid_price(ticker: &[f64]) -> Result<f64, AppError> {
    match ticker {
        [bid, _, ask, ..] if *bid > 0.0 && *ask > 0.0 => Ok((bid + ask) / 2.0),
        _ => Err(AppError::PriceFeed(format!("unexpected ticker {ticker:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_of_best_bid_and_ask() {
        let row = [64_990.0, 1.5, 65_010.0, 2.0, 10.0, 0.01, 65_000.0];
        assert_eq!(mid_price(&row).unwrap(), 65_000.0);
    }

    #[test]
    fn rejects_short_or_empty_book() {
        assert!(mid_price(&[]).is_err());
        assert!(mid_price(&[1.0, 1.0]).is_err());
        assert!(mid_price(&[0.0, 1.0, 65_000.0, 1.0]).is_err());
    }

    #[test]
    fn builds_ticker_url() {
        assert_eq!(
            ticker_url("https://api-pub.bitfinex.com/v2/", DEFAULT_TICKER),
            "https://api-pub.bitfinex.com/v2/ticker/tBTCUST"
        );
    }
}
