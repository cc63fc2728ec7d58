//! Converts a deposit into the amounts paid back, at a fixed rate less fees,
//! within what the wallet can afford.

use crate::error::{Error, Result};
use crate::limits::{AssetKind, BASE_TICKER, DustPolicy, WalletLimits};
use crate::utxo::Balances;

/// Amounts owed to the depositor, per asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Payout {
    pub base: u64,
    pub counter: u64,
}

impl Payout {
    pub fn only(kind: AssetKind, value: u64) -> Self {
        let mut p = Self::default();
        *p.get_mut(kind) = value;
        p
    }

    pub fn get(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Base => self.base,
            AssetKind::Counter => self.counter,
        }
    }

    pub fn get_mut(&mut self, kind: AssetKind) -> &mut u64 {
        match kind {
            AssetKind::Base => &mut self.base,
            AssetKind::Counter => &mut self.counter,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.base == 0 && self.counter == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub text: String,
    pub is_error: bool,
}

impl StatusLine {
    fn info(text: String) -> Self {
        Self {
            text,
            is_error: false,
        }
    }

    fn error(text: String) -> Self {
        Self {
            text,
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalQuote {
    pub payout: Payout,
    /// Rate after the fee adjustment; `None` for a pure refund.
    pub bumped_rate: Option<u64>,
    pub status: Vec<StatusLine>,
}

pub struct WithdrawalCalculator<'a> {
    limits: &'a WalletLimits,
    dust: DustPolicy,
}

impl<'a> WithdrawalCalculator<'a> {
    pub fn new(limits: &'a WalletLimits, dust: DustPolicy) -> Self {
        Self { limits, dust }
    }

    /// Rate moved against the depositor by the fee rate: up when they buy
    /// base with counter, down when they sell base.
    pub fn bumped_rate(&self, deposit: AssetKind, rate: f64) -> u64 {
        let ppm = self.limits.fee_rate_ppm as f64 / 1_000_000.0;
        let adjusted = match deposit {
            AssetKind::Counter => rate * (1.0 + ppm),
            AssetKind::Base => rate * (1.0 - ppm),
        };
        if adjusted.is_finite() && adjusted > 0.0 {
            adjusted.round() as u64
        } else {
            0
        }
    }

    /// Largest base payout the wallet can fund while keeping room for two
    /// fees and two dust change outputs.
    pub fn reserve_base(&self, balances: &Balances) -> u64 {
        let keep = self
            .limits
            .fee_base
            .saturating_mul(2)
            .saturating_add(self.dust.base.saturating_mul(2));
        self.limits
            .max_trade_base
            .min(balances.base.saturating_sub(keep))
    }

    pub fn reserve_counter(&self, balances: &Balances) -> u64 {
        self.limits.max_trade_counter.min(balances.counter)
    }

    pub fn quote(
        &self,
        deposit: AssetKind,
        value: u64,
        rate: Option<f64>,
        balances: &Balances,
    ) -> Result<WithdrawalQuote> {
        let bumped = rate
            .map(|r| self.bumped_rate(deposit, r))
            .filter(|b| *b > 0);
        let (Some(rate), Some(bumped)) = (rate, bumped) else {
            return Ok(WithdrawalQuote {
                payout: Payout::only(deposit, value),
                bumped_rate: None,
                status: vec![StatusLine::error(
                    "ERROR! Exchange rate is not available, proceeding with refund.".into(),
                )],
            });
        };

        let sign = match deposit {
            AssetKind::Counter => '+',
            AssetKind::Base => '-',
        };
        let mut status = vec![StatusLine::info(format!(
            "Exchange rate fixed at {rate:.2} {sign} {:.2}% = {bumped}",
            self.limits.fee_rate_pct()
        ))];

        let mut payout = match deposit {
            AssetKind::Counter => Payout {
                base: (value / bumped).saturating_sub(self.limits.fee_base),
                counter: 0,
            },
            AssetKind::Base => Payout {
                base: 0,
                counter: value
                    .saturating_sub(self.limits.fee_base)
                    .checked_mul(bumped)
                    .ok_or(Error::Overflow("counter payout"))?,
            },
        };

        let reserve_counter = self.reserve_counter(balances);
        let reserve_base = self.reserve_base(balances);

        if payout.counter > reserve_counter {
            let excess = payout.counter - reserve_counter;
            let refund = (excess / bumped).min(reserve_base.saturating_sub(payout.base));
            payout.base += refund;
            payout.counter = reserve_counter;
            status.push(StatusLine::info(format!(
                "Trade is over {} limit. Processing refund of {BASE_TICKER}...",
                self.limits.counter_name
            )));
        }

        if payout.base > reserve_base {
            let excess = payout.base - reserve_base;
            let refund = excess
                .checked_mul(bumped)
                .ok_or(Error::Overflow("counter refund"))?
                .min(reserve_counter.saturating_sub(payout.counter));
            payout.counter += refund;
            payout.base = reserve_base;
            status.push(StatusLine::info(format!(
                "Trade is over {BASE_TICKER} limit. Processing refund of {}...",
                self.limits.counter_name
            )));
        }

        log::info!(
            "calculator: {value} {deposit} at {bumped} -> base {} counter {}",
            payout.base,
            payout.counter
        );

        Ok(WithdrawalQuote {
            payout,
            bumped_rate: Some(bumped),
            status,
        })
    }
}
