use std::time::Duration;

use swapmarket_sdk::WalletInfo;

use crate::error::AppError;

const INFO_TIMEOUT: Duration = Duration::from_secs(3);

pub fn info_url(api_url: &str) -> String {
    format!("{}/info", api_url.trim_end_matches('/'))
}

/// Fetch the service's trade limits once, at session start.
pub async fn fetch_wallet_info(api_url: &str) -> Result<WalletInfo, AppError> {
    let client = reqwest::Client::builder().timeout(INFO_TIMEOUT).build()?;
    let url = info_url(api_url);
    let info = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<WalletInfo>()
        .await?;
    log::info!(
        "Wallet limits from {url}: {} ({}), fee {} ppm + {} sats",
        info.token_name,
        info.token,
        info.fee_rate_ppm,
        info.fee_base_sats
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_url_strips_trailing_slash() {
        assert_eq!(info_url("https://wallet.example/"), "https://wallet.example/info");
        assert_eq!(info_url("https://wallet.example"), "https://wallet.example/info");
    }
}
