pub mod config;
pub mod error;
pub mod limits_api;
pub mod price_feed;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use swapmarket_sdk::{
    DepositLifecycle, PollEvent, RateReceiver, SessionView, StatusBoard, SwSignerCustody,
    WalletLimits, spawn_poll_driver,
};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::AppError;
use price_feed::{DEFAULT_TICKER, PriceFeed};

#[derive(Parser, Debug)]
#[clap(version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[clap(
        short,
        long,
        env = "SWAPMARKET_CONFIG",
        default_value = "swapmarket.json",
        value_name = "FILE"
    )]
    pub config: PathBuf,

    /// Confidential address that receives the withdrawal
    #[clap(short, long, env = "SWAPMARKET_WITHDRAWAL_ADDRESS")]
    pub withdrawal_address: Option<String>,
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,rustls=warn,reqwest=warn,lwk_wollet=warn,electrum_client=warn")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ============================================================================
// Session runner
// ============================================================================

pub async fn run(cli: Cli) -> Result<(), AppError> {
    // electrum-client pulls in rustls 0.23, which needs a process-wide provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::from_path(&cli.config)?;
    let network = config.network;
    log::info!("Starting session on {}", network.as_str());

    let info = match (&config.limits, &config.api_url) {
        (Some(info), _) => info.clone(),
        (None, Some(api_url)) => limits_api::fetch_wallet_info(api_url).await?,
        (None, None) => {
            return Err(AppError::Config("no wallet limits source".into()));
        }
    };
    let ticker = config
        .price_feed
        .ticker
        .clone()
        .or_else(|| info.ticker.clone())
        .unwrap_or_else(|| DEFAULT_TICKER.to_string());
    let limits = WalletLimits::from_info(info, network.policy_asset())?;

    let (rate_cell, rate_rx) = swapmarket_sdk::RateCell::new();
    let feed = PriceFeed::new(&config.price_feed, &ticker)?;
    let feed_task = tokio::spawn(feed.run(rate_cell));
    let first_wait = Duration::from_secs(config.price_feed.timeout_secs);
    match wait_for_rate(&mut rate_rx.clone(), first_wait).await {
        Some(rate) => log::info!("Exchange rate {rate} from {ticker}"),
        None => log::warn!(
            "No exchange rate from {ticker} after {first_wait:?}, refunding until it arrives"
        ),
    }

    let mnemonic = std::env::var(&config.custody.mnemonic_env)
        .map_err(|_| AppError::MissingMnemonic(config.custody.mnemonic_env.clone()))?;
    let state_file = config.custody.state_file.clone();
    let chain = config.chain_backend();
    let lifecycle_config = config.lifecycle_config();
    let (board, mut view_rx) = StatusBoard::new();

    let opened = tokio::task::spawn_blocking(move || {
        let custody = SwSignerCustody::new(&mnemonic, network, state_file.as_deref())?;
        DepositLifecycle::open(chain, custody, limits, lifecycle_config, rate_rx, board)
    })
    .await
    .map_err(|e| AppError::Task(format!("session open: {e}")));
    let session = match opened {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            feed_task.abort();
            return Err(e.into());
        }
        Err(e) => {
            feed_task.abort();
            return Err(e);
        }
    };
    println!("Deposit address: {}", session.deposit_address());

    let (handle, mut events, join) = spawn_poll_driver(session, config.poll_config());
    if let Some(address) = cli.withdrawal_address {
        handle.set_withdrawal_address(address);
    }

    let mut shown = Vec::new();
    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                render(&view, &mut shown);
            }
            event = events.recv() => match event {
                Some(PollEvent::Finished(state)) => {
                    log::info!("Session finished: {state:?}");
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping session");
                handle.shutdown();
                break;
            }
        }
    }

    let _ = join.await;
    feed_task.abort();

    let view = view_rx.borrow().clone();
    render(&view, &mut shown);
    match &view.receipt {
        Some(receipt) => {
            println!("Withdrawal: {}", receipt.link);
            Ok(())
        }
        None if view.error => Err(AppError::Task(
            view.last_status().unwrap_or("session failed").to_string(),
        )),
        None => Ok(()),
    }
}

/// Wait up to `wait` for the price feed's first rate.
async fn wait_for_rate(rx: &mut RateReceiver, wait: Duration) -> Option<f64> {
    match tokio::time::timeout(wait, rx.wait_for(Option::is_some)).await {
        Ok(Ok(rate)) => *rate,
        _ => None,
    }
}

/// Print the status lines that `shown` does not have yet.
fn render(view: &SessionView, shown: &mut Vec<String>) {
    // a reset replaces the list, so print it from the top
    let from = if view.status.starts_with(shown) {
        shown.len()
    } else {
        0
    };
    for line in &view.status[from..] {
        println!("{line}");
    }
    shown.clone_from(&view.status);
}
