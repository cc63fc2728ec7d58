pub mod builder;
pub mod calculator;
pub mod chain;
pub mod custody;
pub mod error;
pub mod esplora;
pub mod fee;
pub mod lifecycle;
pub mod limits;
pub mod network;
pub mod pset;
pub mod rate;
pub mod selection;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utxo;
pub mod watcher;

// Core types
pub use builder::{
    BuiltWithdrawal, ChangeKeys, ChangeOutput, ConfidentialTxBuilder, MainOutputReveal,
    OutputPlan, WithdrawalRequest, plan_outputs,
};
pub use calculator::{Payout, StatusLine, WithdrawalCalculator, WithdrawalQuote};
pub use chain::{ChainBackend, ElectrumBackend, HistoryEntry};
pub use custody::{KeyCustody, SwSignerCustody};
pub use error::{Error, Result};
pub use esplora::EsploraBackend;
pub use fee::{FeeConverger, FeeSized, required_fee};
pub use lifecycle::{
    DepositLifecycle, LifecycleConfig, LifecycleState, PollTarget, validate_withdrawal_address,
};
pub use limits::{AssetKind, BASE_TICKER, DustPolicy, WalletInfo, WalletLimits};
pub use network::Network;
pub use rate::{RateCell, RateReceiver, current_rate};
pub use selection::{Selection, UtxoSelector};
pub use status::{Receipt, SessionView, StatusBoard, format_amount};
pub use utxo::{Balances, Deposit, KeyMaterial, TradeLimits, Utxo, UtxoRecord, Wallet};
pub use watcher::{PollCmd, PollConfig, PollEvent, PollHandle, spawn_poll_driver};

// Re-export LWK for app-layer use
pub use lwk_wollet;
