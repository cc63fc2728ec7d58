//! Exchange-rate cell shared between a price feed and the settlement core.

use tokio::sync::watch;

/// Read side: the latest counter-per-base rate, `None` when the feed is down.
pub type RateReceiver = watch::Receiver<Option<f64>>;

/// Write side of the rate cell, held by the price feed.
#[derive(Debug)]
pub struct RateCell {
    tx: watch::Sender<Option<f64>>,
}

impl RateCell {
    pub fn new() -> (Self, RateReceiver) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Publish a new reading. Non-finite or non-positive values clear the rate.
    pub fn publish(&self, rate: Option<f64>) {
        let rate = rate.filter(|r| r.is_finite() && *r > 0.0);
        self.tx.send_if_modified(|current| {
            if *current == rate {
                return false;
            }
            match rate {
                Some(r) => log::debug!("rate: {r}"),
                None => log::warn!("rate: feed unavailable"),
            }
            *current = rate;
            true
        });
    }

    pub fn subscribe(&self) -> RateReceiver {
        self.tx.subscribe()
    }
}

/// Fix the rate for one settlement.
pub fn current_rate(rx: &RateReceiver) -> Option<f64> {
    *rx.borrow()
}
