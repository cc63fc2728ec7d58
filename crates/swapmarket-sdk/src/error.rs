use thiserror::Error;

use crate::limits::AssetKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("explorer error: {0}")]
    Explorer(String),

    #[error("electrum error: {0}")]
    Electrum(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("key custody error: {0}")]
    Custody(String),

    /// The custody module rejected a timestamped request. The message is
    /// surfaced verbatim so the operator can correct the clock.
    #[error("{0}")]
    StaleClock(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("invalid wallet limits: {0}")]
    InvalidLimits(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("insufficient {asset} funds: need {required}, have {available}")]
    InsufficientFunds {
        asset: AssetKind,
        required: u64,
        available: u64,
    },

    #[error("nothing to withdraw")]
    NothingToWithdraw,

    #[error("PSET construction error: {0}")]
    Pset(String),

    #[error("blinding error: {0}")]
    Blinding(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("broadcast rejected: {reason}")]
    Broadcast { reason: String, tx_hex: String },

    #[error("fee did not converge: paying {paid}, size requires {required}")]
    FeeNotConverged { paid: u64, required: u64 },

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

impl Error {
    /// Explorer, electrum and custody failures that the next poll tick may
    /// clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Explorer(_) | Error::Electrum(_) | Error::Query(_) | Error::Custody(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
