//! Deposit lifecycle: watch the deposit script, value what arrives and settle
//! each confirmed deposit at most once.

use lwk_wollet::elements::{Address, OutPoint, Script, Txid};
use rand::thread_rng;

use crate::builder::{BuiltWithdrawal, ChangeKeys, ConfidentialTxBuilder, WithdrawalRequest};
use crate::calculator::{Payout, WithdrawalCalculator};
use crate::chain::ChainBackend;
use crate::custody::KeyCustody;
use crate::error::{Error, Result};
use crate::fee::FeeConverger;
use crate::limits::{AssetKind, DustPolicy, WalletLimits};
use crate::network::Network;
use crate::rate::{RateReceiver, current_rate};
use crate::selection::UtxoSelector;
use crate::status::{Receipt, SessionView, StatusBoard, format_amount};
use crate::utxo::{Deposit, KeyMaterial, TradeLimits, Utxo, UtxoRecord, Wallet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    AwaitingDeposit,
    MempoolSeen,
    ConfirmedUnprocessed,
    SettlementInFlight,
    Complete,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Complete | LifecycleState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub network: Network,
    /// Explorer root used for receipt links, without a trailing slash.
    pub explorer_web_url: String,
    pub dust: DustPolicy,
    pub max_retries: u32,
    pub max_fee_iterations: u32,
}

impl LifecycleConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            explorer_web_url: network.explorer_web_url().to_string(),
            dust: DustPolicy::default(),
            max_retries: 3,
            max_fee_iterations: 3,
        }
    }
}

/// Something a poll driver can advance one step at a time.
pub trait PollTarget: Send + 'static {
    fn tick(&mut self) -> LifecycleState;
    fn set_withdrawal_address(&mut self, address: String);
}

/// Parse and check a withdrawal address: right network, confidential and
/// distinct from the deposit address.
pub fn validate_withdrawal_address(raw: &str, network: Network, deposit: &Address) -> Result<Address> {
    let address: Address = raw
        .trim()
        .parse()
        .map_err(|e| Error::InvalidAddress(format!("{raw}: {e}")))?;
    if address.params != network.address_params() {
        return Err(Error::InvalidAddress(format!(
            "{raw} is not a {} address",
            network.as_str()
        )));
    }
    if address.blinding_pubkey.is_none() {
        return Err(Error::InvalidAddress(format!("{raw} is not confidential")));
    }
    if address == *deposit {
        return Err(Error::InvalidAddress(
            "withdrawal address equals the deposit address".into(),
        ));
    }
    Ok(address)
}

/// Load the funding output, value and spent flag of a wallet UTXO.
fn hydrate<C, K>(chain: &C, custody: &K, limits: &WalletLimits, utxo: &mut Utxo) -> Result<()>
where
    C: ChainBackend + ?Sized,
    K: KeyCustody + ?Sized,
{
    if utxo.witness.is_none() {
        utxo.witness = Some(chain.fetch_txout(&utxo.outpoint)?);
    }
    if utxo.value.is_none() {
        if let Some(txout) = &utxo.witness {
            let secrets = custody.unblind(utxo.keys.index, txout)?;
            utxo.set_valuation(limits.classify(&secrets.asset), secrets.value);
        }
    }
    if !utxo.spent && chain.is_spent(&utxo.outpoint)? {
        utxo.spent = true;
    }
    Ok(())
}

fn describe_payout(payout: &Payout, limits: &WalletLimits) -> String {
    let mut parts = Vec::new();
    if payout.counter > 0 {
        parts.push(format!(
            "{} {}",
            format_amount(payout.counter, AssetKind::Counter),
            limits.counter_name
        ));
    }
    if payout.base > 0 {
        parts.push(format!(
            "{} {}",
            format_amount(payout.base, AssetKind::Base),
            limits.ticker(AssetKind::Base)
        ));
    }
    parts.join(" + ")
}

pub struct DepositLifecycle<C, K> {
    chain: C,
    custody: K,
    limits: WalletLimits,
    config: LifecycleConfig,
    rate: RateReceiver,
    board: StatusBoard,
    wallet: Wallet,
    deposit_keys: KeyMaterial,
    deposit_address: Address,
    deposit_script: Script,
    withdrawal_address: Option<String>,
    state: LifecycleState,
    last_processed: Option<Txid>,
    retries: u32,
}

impl<C: ChainBackend, K: KeyCustody> DepositLifecycle<C, K> {
    /// Load the wallet from custody, value it and allocate a deposit key.
    pub fn open(
        chain: C,
        mut custody: K,
        limits: WalletLimits,
        config: LifecycleConfig,
        rate: RateReceiver,
        board: StatusBoard,
    ) -> Result<Self> {
        let loaded = limits
            .check_dust(&config.dust)
            .and_then(|()| Self::load_wallet(&chain, &custody, &limits))
            .and_then(|wallet| Ok((wallet, custody.new_keys("deposit")?)));
        let (wallet, deposit_keys) = match loaded {
            Ok(parts) => parts,
            Err(e) => {
                board.error(format!("Failed to start session: {e}"));
                return Err(e);
            }
        };

        let params = config.network.address_params();
        let deposit_address = deposit_keys.address(params);
        let deposit_script = deposit_address.script_pubkey();
        let balances = wallet.balances();
        log::info!(
            "lifecycle: session open, {} utxos, balances base {} counter {}, deposit {}",
            wallet.utxos().len(),
            balances.base,
            balances.counter,
            deposit_address
        );
        board.set_deposit_address(deposit_address.to_string());
        board.set("Awaiting deposit...");

        Ok(Self {
            chain,
            custody,
            limits,
            config,
            rate,
            board,
            wallet,
            deposit_keys,
            deposit_address,
            deposit_script,
            withdrawal_address: None,
            state: LifecycleState::AwaitingDeposit,
            last_processed: None,
            retries: 0,
        })
    }

    fn load_wallet(chain: &C, custody: &K, limits: &WalletLimits) -> Result<Wallet> {
        let mut wallet = Wallet::from_records(custody.wallet_utxos()?)?;
        for utxo in wallet.utxos_mut() {
            hydrate(chain, custody, limits, utxo)?;
        }
        wallet.recompute_balances();
        Ok(wallet)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn custody(&self) -> &K {
        &self.custody
    }

    pub fn limits(&self) -> &WalletLimits {
        &self.limits
    }

    pub fn deposit_address(&self) -> &Address {
        &self.deposit_address
    }

    pub fn last_processed(&self) -> Option<Txid> {
        self.last_processed
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn view(&self) -> SessionView {
        self.board.view()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<SessionView> {
        self.board.subscribe()
    }

    pub fn set_withdrawal_address(&mut self, address: impl Into<String>) {
        self.withdrawal_address = Some(address.into());
    }

    /// Advance one poll step. I/O failures outside settlement leave the state
    /// untouched so the next tick retries.
    pub fn step(&mut self) -> Result<LifecycleState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        self.refresh_trade_limits();
        let history = self.chain.script_history(&self.deposit_script)?;
        let Some(newest) = history.first().cloned() else {
            self.state = LifecycleState::AwaitingDeposit;
            return Ok(self.state);
        };

        if !newest.confirmed {
            if self.state != LifecycleState::MempoolSeen {
                self.board
                    .set("Deposit is in mempool, awaiting confirmation...");
            }
            self.state = LifecycleState::MempoolSeen;
            return Ok(self.state);
        }

        if Some(newest.txid) == self.last_processed {
            self.state = LifecycleState::AwaitingDeposit;
            return Ok(self.state);
        }

        self.state = LifecycleState::ConfirmedUnprocessed;
        let deposit = self.observe_deposit(newest.txid)?;
        let Some(kind) = deposit.asset.filter(|_| deposit.value > 0) else {
            self.board.set("Ineligible token ignored...");
            return Ok(self.finish_without_settlement(deposit.txid));
        };

        let ticker = self.limits.ticker(kind).to_string();
        self.board.set(format!(
            "Received {} {ticker}",
            format_amount(deposit.value, kind)
        ));

        let min = self.limits.min_trade(kind);
        if deposit.value < min {
            self.board.append(format!(
                "Deposit is below the minimum trade of {} {ticker}, ignored.",
                format_amount(min, kind)
            ));
            return Ok(self.finish_without_settlement(deposit.txid));
        }

        let recipient = match self.withdrawal_address.as_deref().map(|raw| {
            validate_withdrawal_address(raw, self.config.network, &self.deposit_address)
        }) {
            Some(Ok(address)) => address,
            Some(Err(e)) => {
                log::warn!("lifecycle: {e}");
                self.board
                    .append("Please provide confidential withdrawal address!");
                return Ok(self.state);
            }
            None => {
                self.board
                    .append("Please provide confidential withdrawal address!");
                return Ok(self.state);
            }
        };

        self.state = LifecycleState::SettlementInFlight;
        match self.settle(&deposit, kind, &recipient) {
            Ok(Some(txid)) => {
                self.last_processed = Some(deposit.txid);
                self.state = LifecycleState::Complete;
                log::info!("lifecycle: deposit {} settled by {txid}", deposit.txid);
            }
            Ok(None) => {
                self.board.append("Nothing to withdraw.");
                return Ok(self.finish_without_settlement(deposit.txid));
            }
            Err(e) => self.record_failure(e),
        }
        Ok(self.state)
    }

    fn refresh_trade_limits(&self) {
        let rate = current_rate(&self.rate);
        self.board.set_rate_available(rate.is_some());
        let quote =
            rate.map(|rate| TradeLimits::quote(&self.wallet.balances(), rate, &self.limits));
        self.board.set_trade_limits(quote);
    }

    fn finish_without_settlement(&mut self, txid: Txid) -> LifecycleState {
        self.last_processed = Some(txid);
        self.state = LifecycleState::AwaitingDeposit;
        self.state
    }

    fn record_failure(&mut self, e: Error) {
        self.retries += 1;
        match &e {
            Error::StaleClock(msg) => self.board.error(msg.clone()),
            Error::Broadcast { reason, tx_hex } => {
                log::error!("lifecycle: broadcast rejected: {reason}; tx {tx_hex}");
                self.board.error(format!("Broadcast failed: {reason}"));
            }
            other => self.board.error(format!("Withdrawal failed: {other}")),
        }

        if self.retries >= self.config.max_retries {
            log::error!("lifecycle: giving up after {} attempts", self.retries);
            self.state = LifecycleState::Failed;
            return;
        }
        self.board.append("Refreshing wallet balances...");
        if let Err(e) = self.resync() {
            log::warn!("lifecycle: resync failed: {e}");
        }
        self.state = LifecycleState::ConfirmedUnprocessed;
    }

    /// Merge the deposit output of `txid` into the wallet (once) and value it.
    fn observe_deposit(&mut self, txid: Txid) -> Result<Deposit> {
        let (vout, txout) = self
            .chain
            .find_output(&txid, &self.deposit_script)?
            .ok_or_else(|| Error::Query(format!("{txid} does not pay the deposit address")))?;
        let outpoint = OutPoint::new(txid, vout);

        if !self.wallet.contains_txid(&txid) {
            let mut utxo = Utxo::new(self.deposit_keys.clone(), outpoint);
            utxo.witness = Some(txout);
            hydrate(&self.chain, &self.custody, &self.limits, &mut utxo)?;
            self.custody.record_utxo(UtxoRecord::from_utxo(&utxo))?;
            self.wallet.merge(utxo);
            log::info!("lifecycle: merged deposit {outpoint}");
        }

        let utxo = self
            .wallet
            .get(&outpoint)
            .ok_or_else(|| Error::Query(format!("deposit {outpoint} missing from wallet")))?;
        Ok(Deposit {
            txid,
            vout,
            asset: utxo.asset,
            value: utxo.value.unwrap_or(0),
            confirmed: true,
        })
    }

    /// Quote, build and broadcast. `Ok(None)` means the quote paid nothing.
    fn settle(&mut self, deposit: &Deposit, kind: AssetKind, recipient: &Address) -> Result<Option<Txid>> {
        let rate = current_rate(&self.rate);
        let calculator = WithdrawalCalculator::new(&self.limits, self.config.dust);
        let quote = calculator.quote(kind, deposit.value, rate, &self.wallet.balances())?;
        for line in &quote.status {
            if line.is_error {
                self.board.error(line.text.clone());
            } else {
                self.board.append(line.text.clone());
            }
        }
        let payout = quote.payout;
        if payout.is_zero() {
            return Ok(None);
        }
        self.board.append(format!(
            "Sending {} to {}",
            describe_payout(&payout, &self.limits),
            recipient.to_unconfidential()
        ));

        let base_change = self.custody.new_keys("BTC change")?;
        let counter_change = if payout.counter > 0 || kind == AssetKind::Counter {
            self.custody
                .new_keys(&format!("{} change", self.limits.counter_ticker))?
        } else {
            base_change.clone()
        };
        let change = ChangeKeys {
            base: base_change,
            counter: counter_change,
        };

        let built = self.build_withdrawal(deposit.outpoint(), recipient, payout, &change)?;
        let txid = self.chain.broadcast(&built.tx)?;
        self.after_broadcast(txid, &built);
        Ok(Some(txid))
    }

    fn build_withdrawal(
        &self,
        deposit: OutPoint,
        recipient: &Address,
        payout: Payout,
        change: &ChangeKeys,
    ) -> Result<BuiltWithdrawal> {
        let builder = ConfidentialTxBuilder::new(
            &self.custody,
            &self.limits,
            self.config.dust,
            self.config.network.address_params(),
        );
        let selector = UtxoSelector::new(self.wallet.utxos()).with_newest_deposit(Some(deposit));
        let mut rng = thread_rng();

        FeeConverger::new(self.config.max_fee_iterations).converge(self.limits.fee_base, |fee| {
            let required_base = payout
                .base
                .checked_add(fee)
                .ok_or(Error::Overflow("base requirement"))?;
            let selection = selector.select(required_base, payout.counter);
            selection.ensure_covers()?;
            builder.build(
                &WithdrawalRequest {
                    selection: &selection,
                    recipient,
                    payout,
                    fee,
                    change,
                },
                &mut rng,
            )
        })
    }

    /// Bookkeeping once the network accepted the withdrawal. Nothing here may
    /// fail the settlement.
    fn after_broadcast(&mut self, txid: Txid, built: &BuiltWithdrawal) {
        self.wallet.mark_spent(&built.spent);

        let mut change = Vec::with_capacity(built.change.len());
        for out in &built.change {
            let mut utxo = Utxo::new(out.keys.clone(), OutPoint::new(txid, out.vout));
            utxo.witness = built.tx.output.get(out.vout as usize).cloned();
            utxo.set_valuation(Some(out.asset), out.value);
            if let Err(e) = self.custody.record_utxo(UtxoRecord::from_utxo(&utxo)) {
                log::warn!("lifecycle: failed to record change {}: {e}", utxo.outpoint);
            }
            change.push(utxo);
        }
        self.wallet.merge_outputs(change);

        let fragment = built
            .reveal
            .as_ref()
            .map(|r| r.fragment())
            .unwrap_or_default();
        let link = format!(
            "{}/tx/{txid}{fragment}",
            self.config.explorer_web_url.trim_end_matches('/')
        );
        self.board.append(format!("Withdrawal sent: {txid}"));
        self.board.set_receipt(Receipt { txid, link });
    }

    /// Reload the wallet from custody after a failed attempt.
    fn resync(&mut self) -> Result<()> {
        let records = self.custody.wallet_utxos()?;
        self.wallet.resync(records)?;
        for utxo in self.wallet.utxos_mut() {
            hydrate(&self.chain, &self.custody, &self.limits, utxo)?;
        }
        self.wallet.recompute_balances();
        Ok(())
    }
}

impl<C, K> PollTarget for DepositLifecycle<C, K>
where
    C: ChainBackend + 'static,
    K: KeyCustody + 'static,
{
    fn tick(&mut self) -> LifecycleState {
        match self.step() {
            Ok(state) => state,
            Err(e) if e.is_transient() => {
                log::warn!("lifecycle: {e}, retrying next tick");
                self.state
            }
            Err(e) => {
                log::error!("lifecycle: {e}");
                self.record_failure(e);
                self.state
            }
        }
    }

    fn set_withdrawal_address(&mut self, address: String) {
        DepositLifecycle::set_withdrawal_address(self, address);
    }
}
