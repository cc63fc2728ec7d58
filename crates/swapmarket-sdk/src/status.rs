//! What a surrounding UI can observe about the running session.

use lwk_wollet::elements::Txid;
use tokio::sync::watch;

use crate::limits::AssetKind;
use crate::utxo::TradeLimits;

/// Smallest units per whole coin, for both ledger assets.
pub const UNITS_PER_COIN: f64 = 100_000_000.0;

/// Render an amount in whole coins: eight decimals for the base asset, two
/// for the counter asset.
pub fn format_amount(value: u64, kind: AssetKind) -> String {
    let coins = value as f64 / UNITS_PER_COIN;
    match kind {
        AssetKind::Base => format!("{coins:.8}"),
        AssetKind::Counter => format!("{coins:.2}"),
    }
}

/// Link to the settled withdrawal on a block explorer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub txid: Txid,
    /// `{explorer}/tx/{txid}` plus a `#blinded=` fragment when available.
    pub link: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    /// Confidential deposit address shown to the user.
    pub deposit_address: Option<String>,
    /// Status lines of the current attempt, oldest first.
    pub status: Vec<String>,
    pub error: bool,
    pub receipt: Option<Receipt>,
    /// Largest deposits currently accepted; `None` while no rate is known.
    pub trade_limits: Option<TradeLimits>,
    /// Whether the price feed has a rate. `None` until the first poll.
    pub rate_available: Option<bool>,
}

impl SessionView {
    pub fn last_status(&self) -> Option<&str> {
        self.status.last().map(String::as_str)
    }
}

/// Writer side of the session view. Every change is published to watchers.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<SessionView>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new().0
    }
}

impl StatusBoard {
    pub fn new() -> (Self, watch::Receiver<SessionView>) {
        let (tx, rx) = watch::channel(SessionView::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.tx.subscribe()
    }

    pub fn view(&self) -> SessionView {
        self.tx.borrow().clone()
    }

    pub fn set_deposit_address(&self, address: String) {
        self.tx.send_modify(|v| v.deposit_address = Some(address));
    }

    /// Replace all status lines with one and clear the error flag.
    pub fn set(&self, line: impl Into<String>) {
        let line = line.into();
        log::info!("status: {line}");
        self.tx.send_modify(|v| {
            v.status = vec![line];
            v.error = false;
        });
    }

    pub fn append(&self, line: impl Into<String>) {
        let line = line.into();
        log::info!("status: {line}");
        self.tx.send_modify(|v| v.status.push(line));
    }

    pub fn error(&self, line: impl Into<String>) {
        let line = line.into();
        log::warn!("status: {line}");
        self.tx.send_modify(|v| {
            v.status.push(line);
            v.error = true;
        });
    }

    /// Publish only when the quote actually moved.
    pub fn set_trade_limits(&self, limits: Option<TradeLimits>) {
        self.tx.send_if_modified(|v| {
            if v.trade_limits == limits {
                return false;
            }
            v.trade_limits = limits;
            true
        });
    }

    /// Track the price feed. Losing the rate switches to the error view;
    /// regaining it after an outage is announced.
    pub fn set_rate_available(&self, available: bool) {
        self.tx.send_if_modified(|v| {
            let previous = v.rate_available.replace(available);
            match (previous, available) {
                (Some(prev), now) if prev == now => return false,
                (_, false) => {
                    log::warn!("status: exchange rate lost");
                    v.status
                        .push("Exchange rate is not available, deposits will be refunded.".into());
                    v.error = true;
                }
                (Some(false), true) => {
                    log::info!("status: exchange rate restored");
                    v.status.push("Exchange rate restored.".into());
                }
                (_, true) => {}
            }
            true
        });
    }

    pub fn set_receipt(&self, receipt: Receipt) {
        self.tx.send_modify(|v| v.receipt = Some(receipt));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_both_assets() {
        assert_eq!(format_amount(1_000_000, AssetKind::Base), "0.01000000");
        assert_eq!(format_amount(123_456_789_000, AssetKind::Counter), "1234.57");
    }

    #[test]
    fn set_resets_and_error_flags() {
        let (board, rx) = StatusBoard::new();
        board.append("first");
        board.error("boom");
        assert!(rx.borrow().error);
        assert_eq!(rx.borrow().status.len(), 2);

        board.set("fresh attempt");
        let view = rx.borrow().clone();
        assert!(!view.error);
        assert_eq!(view.status, vec!["fresh attempt".to_string()]);
        assert_eq!(view.last_status(), Some("fresh attempt"));
    }

    #[test]
    fn unchanged_trade_limits_are_not_republished() {
        let (board, mut rx) = StatusBoard::new();
        let quote = Some(TradeLimits {
            max_base_deposit: 1_000,
            max_counter_deposit: 2_000,
        });
        board.set_trade_limits(quote);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        board.set_trade_limits(quote);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().trade_limits, quote);
    }

    #[test]
    fn rate_outage_switches_to_error_view() {
        let (board, rx) = StatusBoard::new();
        board.set("Awaiting deposit...");
        board.set_rate_available(true);
        assert_eq!(rx.borrow().last_status(), Some("Awaiting deposit..."));

        board.set_rate_available(false);
        board.set_rate_available(false);
        let view = rx.borrow().clone();
        assert!(view.error);
        assert_eq!(view.rate_available, Some(false));
        assert_eq!(view.status.len(), 2);

        board.set_rate_available(true);
        let view = rx.borrow().clone();
        assert_eq!(view.last_status(), Some("Exchange rate restored."));
        assert_eq!(view.rate_available, Some(true));
    }
}
