//! Deposit-to-withdrawal flow against an in-memory chain.
//!
//! Uses a software-signer custody and explicit funding outputs; the withdrawal
//! itself is built, blinded and signed for real.

use std::sync::Arc;

use lwk_wollet::elements::secp256k1_zkp::{Secp256k1, SecretKey};
use lwk_wollet::elements::{Address, Script, Transaction};
use swapmarket_sdk::testing::{
    MockChain, TEST_MNEMONIC, base_asset, counter_asset, explicit_txout, funding_tx, test_keys,
    test_limits,
};
use swapmarket_sdk::{
    AssetKind, ChainBackend, DepositLifecycle, KeyCustody, LifecycleConfig, LifecycleState,
    Network, RateCell, StatusBoard, SwSignerCustody, UtxoRecord, required_fee,
};

const RESERVE_BASE: u64 = 1_000_000;
const RESERVE_COUNTER: u64 = 1_000_000_000_000;
const RECIPIENT_KEY: u32 = 7;

type Session = DepositLifecycle<Arc<MockChain>, SwSignerCustody>;

fn params() -> &'static lwk_wollet::elements::AddressParams {
    Network::LiquidTestnet.address_params()
}

/// Custody holding a base and a counter reserve, both confirmed on `chain`.
fn funded_custody(chain: &MockChain) -> SwSignerCustody {
    let mut custody = SwSignerCustody::new(TEST_MNEMONIC, Network::LiquidTestnet, None).unwrap();
    let base_keys = custody.new_keys("reserve").unwrap();
    let counter_keys = custody.new_keys("reserve").unwrap();
    let tx = funding_tx(vec![
        explicit_txout(base_asset(), RESERVE_BASE, &base_keys.script_pubkey(params())),
        explicit_txout(
            counter_asset(),
            RESERVE_COUNTER,
            &counter_keys.script_pubkey(params()),
        ),
    ]);
    let txid = chain.add_transaction(tx, true);
    for (vout, keys) in [(0, base_keys), (1, counter_keys)] {
        custody
            .record_utxo(UtxoRecord {
                index: keys.index,
                txid: txid.to_string(),
                vout,
                pubkey: keys.pubkey.to_string(),
                blinding_pubkey: keys.blinding_pubkey.to_string(),
                value: None,
                token: None,
            })
            .unwrap();
    }
    custody
}

fn recipient() -> Address {
    test_keys(RECIPIENT_KEY).address(params())
}

fn recipient_blinding_key() -> SecretKey {
    SecretKey::from_slice(&[RECIPIENT_KEY as u8 + 50; 32]).unwrap()
}

fn open(chain: &Arc<MockChain>, rate: Option<f64>) -> (Session, RateCell) {
    let custody = funded_custody(chain);
    let (cell, rate_rx) = RateCell::new();
    cell.publish(rate);
    let (board, _view) = StatusBoard::new();
    let session = DepositLifecycle::open(
        chain.clone(),
        custody,
        test_limits(),
        LifecycleConfig::new(Network::LiquidTestnet),
        rate_rx,
        board,
    )
    .unwrap();
    (session, cell)
}

fn deposit(chain: &MockChain, session: &Session, kind: AssetKind, value: u64, confirmed: bool) {
    let asset = session.limits().asset_id(kind);
    let script = session.deposit_address().script_pubkey();
    chain.add_transaction(funding_tx(vec![explicit_txout(asset, value, &script)]), confirmed);
}

fn recipient_receives(tx: &Transaction) -> Vec<(lwk_wollet::elements::AssetId, u64)> {
    let secp = Secp256k1::new();
    let script = recipient().script_pubkey();
    tx.output
        .iter()
        .filter(|o| o.script_pubkey == script)
        .map(|o| {
            let s = o.unblind(&secp, recipient_blinding_key()).unwrap();
            (s.asset, s.value)
        })
        .collect()
}

fn explicit_fee(tx: &Transaction) -> u64 {
    tx.output
        .iter()
        .filter(|o| o.script_pubkey == Script::new())
        .filter_map(|o| o.value.explicit())
        .sum()
}

#[test]
fn session_open_values_wallet_and_allocates_deposit_key() {
    let chain = Arc::new(MockChain::default());
    let (session, _cell) = open(&chain, Some(50_000.0));
    let balances = session.wallet().balances();
    assert_eq!(balances.base, RESERVE_BASE);
    assert_eq!(balances.counter, RESERVE_COUNTER);
    assert_eq!(session.state(), LifecycleState::AwaitingDeposit);
    assert!(session.deposit_address().blinding_pubkey.is_some());
    assert_eq!(
        session.view().deposit_address,
        Some(session.deposit_address().to_string())
    );
}

#[test]
fn idle_tick_publishes_trade_limits() {
    let chain = Arc::new(MockChain::default());
    let (mut session, cell) = open(&chain, Some(50_000.0));
    assert_eq!(session.step().unwrap(), LifecycleState::AwaitingDeposit);
    let limits = session.view().trade_limits.unwrap();
    // counter reserve covers far more than the 0.05 BTC cap
    assert_eq!(limits.max_base_deposit, 5_000_000);
    assert!(limits.max_counter_deposit > 0);

    cell.publish(None);
    session.step().unwrap();
    let view = session.view();
    assert_eq!(view.trade_limits, None);
    assert!(view.error);
    assert_eq!(view.rate_available, Some(false));

    cell.publish(Some(50_000.0));
    session.step().unwrap();
    let view = session.view();
    assert_eq!(view.last_status(), Some("Exchange rate restored."));
    assert!(view.trade_limits.is_some());
}

#[test]
fn base_deposit_is_paid_out_in_counter() {
    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, Some(50_000.0));
    session.set_withdrawal_address(recipient().to_string());

    deposit(&chain, &session, AssetKind::Base, 20_000, false);
    assert_eq!(session.step().unwrap(), LifecycleState::MempoolSeen);
    assert!(chain.broadcasts().is_empty());

    let deposit_txid = chain
        .script_history(&session.deposit_address().script_pubkey())
        .unwrap()[0]
        .txid;
    chain.confirm(&deposit_txid);
    assert_eq!(session.step().unwrap(), LifecycleState::Complete);
    assert_eq!(session.last_processed(), Some(deposit_txid));

    let sent = chain.broadcasts();
    assert_eq!(sent.len(), 1);
    let tx = &sent[0];

    // 49 950 after the 0.1% fee, fee_base of 100 sat kept back
    let expected = (20_000 - 100) * 49_950;
    let received: u64 = recipient_receives(tx)
        .into_iter()
        .map(|(asset, value)| {
            assert_eq!(asset, counter_asset());
            value
        })
        .sum();
    assert_eq!(received, expected);

    assert!(explicit_fee(tx) >= required_fee(tx.discount_vsize()));
    for input in &tx.input {
        assert_eq!(input.witness.script_witness.len(), 2);
    }

    let view = session.view();
    assert!(!view.error);
    let receipt = view.receipt.unwrap();
    assert_eq!(receipt.txid, tx.txid());
    assert!(receipt.link.contains(&format!("/tx/{}#blinded=", tx.txid())));

    // inputs spent, change merged and recorded with custody
    let balances = session.wallet().balances();
    assert_eq!(balances.counter, RESERVE_COUNTER - expected);
    assert!(session
        .wallet()
        .utxos()
        .iter()
        .any(|u| u.outpoint.txid == tx.txid() && !u.spent));
    let records = session.custody().wallet_utxos().unwrap();
    assert!(records.iter().any(|r| r.txid == tx.txid().to_string()));
}

#[test]
fn missing_rate_refunds_the_deposit() {
    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, None);
    session.set_withdrawal_address(recipient().to_string());

    deposit(&chain, &session, AssetKind::Counter, 5_000_000_000, true);
    assert_eq!(session.step().unwrap(), LifecycleState::Complete);

    let sent = chain.broadcasts();
    let received: u64 = recipient_receives(&sent[0])
        .into_iter()
        .filter(|(asset, _)| *asset == counter_asset())
        .map(|(_, v)| v)
        .sum();
    assert_eq!(received, 5_000_000_000);

    let view = session.view();
    assert!(view.error);
    assert!(view
        .status
        .iter()
        .any(|l| l.contains("Exchange rate is not available")));
    assert!(view.receipt.is_some());
}

#[test]
fn settlement_waits_for_a_confidential_address() {
    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, Some(50_000.0));

    deposit(&chain, &session, AssetKind::Base, 20_000, true);
    assert_eq!(
        session.step().unwrap(),
        LifecycleState::ConfirmedUnprocessed
    );
    assert_eq!(
        session.view().last_status(),
        Some("Please provide confidential withdrawal address!")
    );

    session.set_withdrawal_address(recipient().to_unconfidential().to_string());
    assert_eq!(
        session.step().unwrap(),
        LifecycleState::ConfirmedUnprocessed
    );
    assert_eq!(session.retries(), 0);
    assert!(chain.broadcasts().is_empty());

    // two reserves plus the deposit, merged and recorded once across polls
    assert_eq!(session.wallet().utxos().len(), 3);
    assert_eq!(session.custody().wallet_utxos().unwrap().len(), 3);

    session.set_withdrawal_address(recipient().to_string());
    assert_eq!(session.step().unwrap(), LifecycleState::Complete);
}

#[test]
fn converted_counter_deposit_is_not_paid_back() {
    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, Some(100.0));
    session.set_withdrawal_address(recipient().to_string());

    // just above the counter minimum, which equals the counter dust threshold
    deposit(&chain, &session, AssetKind::Counter, 2_500_000, true);
    assert_eq!(session.step().unwrap(), LifecycleState::Complete);

    let sent = chain.broadcasts();
    assert_eq!(sent.len(), 1);
    // bumped rate round(100.1) = 100: 25_000 base less the 100 sat base fee
    let received = recipient_receives(&sent[0]);
    assert_eq!(received, vec![(base_asset(), 24_900)]);

    // the deposit went back to the wallet as counter change
    let balances = session.wallet().balances();
    assert_eq!(balances.counter, RESERVE_COUNTER + 2_500_000);
    assert!(balances.base < RESERVE_BASE - 24_900);
}

#[test]
fn minimum_trade_below_dust_is_rejected_at_open() {
    let chain = Arc::new(MockChain::default());
    let custody = funded_custody(&chain);
    let (_cell, rate_rx) = RateCell::new();
    let (board, view) = StatusBoard::new();
    let mut config = LifecycleConfig::new(Network::LiquidTestnet);
    config.dust.counter = test_limits().min_trade_counter + 1;

    let res = DepositLifecycle::open(
        chain.clone(),
        custody,
        test_limits(),
        config,
        rate_rx,
        board,
    );
    assert!(matches!(res, Err(swapmarket_sdk::Error::InvalidLimits(_))));
    assert!(view.borrow().error);
}

#[test]
fn deposit_below_minimum_is_ignored_once() {
    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, Some(50_000.0));
    session.set_withdrawal_address(recipient().to_string());

    deposit(&chain, &session, AssetKind::Base, 500, true);
    assert_eq!(session.step().unwrap(), LifecycleState::AwaitingDeposit);
    assert!(session.last_processed().is_some());
    assert_eq!(session.step().unwrap(), LifecycleState::AwaitingDeposit);
    assert!(chain.broadcasts().is_empty());
}

#[test]
fn rejected_broadcasts_fail_after_retry_budget() {
    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, Some(50_000.0));
    session.set_withdrawal_address(recipient().to_string());
    chain.reject_broadcast(Some("bad-txns-inputs-missingorspent"));

    deposit(&chain, &session, AssetKind::Base, 20_000, true);
    assert_eq!(
        session.step().unwrap(),
        LifecycleState::ConfirmedUnprocessed
    );
    assert_eq!(session.retries(), 1);
    session.step().unwrap();
    assert_eq!(session.step().unwrap(), LifecycleState::Failed);
    assert_eq!(session.retries(), 3);

    // terminal: no further attempts, nothing marked spent
    assert_eq!(session.step().unwrap(), LifecycleState::Failed);
    assert!(session.wallet().utxos().iter().all(|u| !u.spent));
    let view = session.view();
    assert!(view.error);
    assert!(view.receipt.is_none());
}

/// Custody whose signing endpoint rejects our request timestamps.
struct SkewedClock(SwSignerCustody);

impl KeyCustody for SkewedClock {
    fn wallet_utxos(&self) -> swapmarket_sdk::Result<Vec<UtxoRecord>> {
        self.0.wallet_utxos()
    }

    fn new_keys(&mut self, label: &str) -> swapmarket_sdk::Result<swapmarket_sdk::KeyMaterial> {
        self.0.new_keys(label)
    }

    fn record_utxo(&mut self, record: UtxoRecord) -> swapmarket_sdk::Result<()> {
        self.0.record_utxo(record)
    }

    fn unblind(
        &self,
        index: u32,
        txout: &lwk_wollet::elements::TxOut,
    ) -> swapmarket_sdk::Result<lwk_wollet::elements::TxOutSecrets> {
        self.0.unblind(index, txout)
    }

    fn sign(&self, _index: u32, _sighash: &[u8; 32]) -> swapmarket_sdk::Result<Vec<u8>> {
        Err(swapmarket_sdk::Error::StaleClock(
            "Request expired, please check your system clock".into(),
        ))
    }
}

#[test]
fn stale_clock_is_surfaced_verbatim() {
    let chain = Arc::new(MockChain::default());
    let (cell, rate_rx) = RateCell::new();
    cell.publish(Some(50_000.0));
    let (board, _view) = StatusBoard::new();
    let mut session = DepositLifecycle::open(
        chain.clone(),
        SkewedClock(funded_custody(&chain)),
        test_limits(),
        LifecycleConfig::new(Network::LiquidTestnet),
        rate_rx,
        board,
    )
    .unwrap();
    session.set_withdrawal_address(recipient().to_string());

    let script = session.deposit_address().script_pubkey();
    chain.add_transaction(
        funding_tx(vec![explicit_txout(base_asset(), 20_000, &script)]),
        true,
    );
    assert_eq!(
        session.step().unwrap(),
        LifecycleState::ConfirmedUnprocessed
    );
    assert_eq!(session.retries(), 1);
    let view = session.view();
    assert!(view.error);
    assert!(view
        .status
        .iter()
        .any(|l| l == "Request expired, please check your system clock"));
    assert!(chain.broadcasts().is_empty());
}

#[test]
fn explorer_outage_does_not_consume_retries() {
    use swapmarket_sdk::PollTarget;

    let chain = Arc::new(MockChain::default());
    let (mut session, _cell) = open(&chain, Some(50_000.0));
    session.set_withdrawal_address(recipient().to_string());
    deposit(&chain, &session, AssetKind::Base, 20_000, true);

    chain.set_offline(true);
    assert_eq!(session.tick(), LifecycleState::AwaitingDeposit);
    assert_eq!(session.retries(), 0);

    chain.set_offline(false);
    assert_eq!(session.tick(), LifecycleState::Complete);
}

#[tokio::test]
async fn poll_driver_runs_session_to_completion() {
    use std::time::Duration;
    use swapmarket_sdk::{PollConfig, PollEvent, spawn_poll_driver};

    let chain = Arc::new(MockChain::default());
    let (session, _cell) = open(&chain, Some(50_000.0));
    deposit(&chain, &session, AssetKind::Base, 20_000, true);

    let (handle, mut events, join) = spawn_poll_driver(
        session,
        PollConfig {
            poll_interval: Duration::from_millis(5),
        },
    );
    handle.set_withdrawal_address(recipient().to_string());

    let session = join.await.unwrap();
    assert_eq!(
        session.lock().unwrap().state(),
        LifecycleState::Complete
    );
    assert_eq!(chain.broadcasts().len(), 1);
    let mut finished = None;
    while let Ok(ev) = events.try_recv() {
        if let PollEvent::Finished(state) = ev {
            finished = Some(state);
        }
    }
    assert_eq!(finished, Some(LifecycleState::Complete));
}
