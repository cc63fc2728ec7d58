//! Fixtures and an in-memory chain for tests. Enabled by the `testing` feature.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::secp256k1_zkp::{self, Secp256k1, SecretKey};
use lwk_wollet::elements::{
    AssetId, AssetIssuance, LockTime, OutPoint, Script, Sequence, Transaction, TxIn, TxOut, Txid,
};

use crate::chain::{ChainBackend, HistoryEntry};
use crate::error::{Error, Result};
use crate::limits::{AssetKind, WalletLimits};
use crate::network::Network;
use crate::utxo::{KeyMaterial, Utxo};

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub fn base_asset() -> AssetId {
    Network::LiquidTestnet.policy_asset()
}

pub fn counter_asset() -> AssetId {
    AssetId::from_byte_array([0x22; 32])
}

/// Testnet limits: 1 000 sat .. 0.05 BTC, 0.02 .. 5 000 USD, 0.1% fee.
pub fn test_limits() -> WalletLimits {
    WalletLimits {
        base_asset: base_asset(),
        counter_asset: counter_asset(),
        counter_ticker: "USD".into(),
        counter_name: "Tether USD".into(),
        min_trade_base: 1_000,
        max_trade_base: 5_000_000,
        min_trade_counter: 2_000_000,
        max_trade_counter: 500_000_000_000,
        fee_rate_ppm: 1_000,
        fee_base: 100,
    }
}

pub fn explicit_txout(asset: AssetId, amount: u64, script_pubkey: &Script) -> TxOut {
    TxOut {
        asset: Asset::Explicit(asset),
        value: Value::Explicit(amount),
        nonce: Nonce::Null,
        script_pubkey: script_pubkey.clone(),
        witness: Default::default(),
    }
}

static FUNDING_SEED: AtomicU32 = AtomicU32::new(1);

/// A transaction paying `outputs`, with a unique txid per call.
pub fn funding_tx(outputs: Vec<TxOut>) -> Transaction {
    let seed = FUNDING_SEED.fetch_add(1, Ordering::Relaxed);
    let mut prev = [0u8; 32];
    prev[..4].copy_from_slice(&seed.to_le_bytes());
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array(prev), 0),
            is_pegin: false,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            asset_issuance: AssetIssuance::default(),
            witness: Default::default(),
        }],
        output: outputs,
    }
}

/// Deterministic key material that does not come from custody.
pub fn test_keys(index: u32) -> KeyMaterial {
    let secp = Secp256k1::new();
    let seed = (index % 200) as u8;
    let sk = SecretKey::from_slice(&[seed + 1; 32]).expect("valid key");
    let bk = SecretKey::from_slice(&[seed + 50; 32]).expect("valid key");
    KeyMaterial {
        index,
        pubkey: PublicKey {
            inner: secp256k1_zkp::PublicKey::from_secret_key(&secp, &sk),
            compressed: true,
        },
        blinding_pubkey: secp256k1_zkp::PublicKey::from_secret_key(&secp, &bk),
    }
}

/// A valued UTXO with an explicit funding output at `txbyte`-filled txid.
pub fn valued_utxo(index: u32, txbyte: u8, kind: AssetKind, value: u64) -> Utxo {
    let keys = test_keys(index);
    let limits = test_limits();
    let script = keys.script_pubkey(Network::LiquidTestnet.address_params());
    let mut utxo = Utxo::new(keys, OutPoint::new(Txid::from_byte_array([txbyte; 32]), 0));
    utxo.witness = Some(explicit_txout(limits.asset_id(kind), value, &script));
    utxo.set_valuation(Some(kind), value);
    utxo
}

#[derive(Default)]
struct MockState {
    txs: HashMap<Txid, Transaction>,
    history: HashMap<Script, Vec<HistoryEntry>>,
    spent: HashSet<OutPoint>,
    broadcasts: Vec<Transaction>,
    offline: bool,
    reject: Option<String>,
}

/// In-memory chain. History is kept newest first per script.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_transaction(&self, tx: Transaction, confirmed: bool) -> Txid {
        let mut state = self.lock();
        let txid = tx.txid();
        for out in &tx.output {
            let entries = state.history.entry(out.script_pubkey.clone()).or_default();
            if !entries.iter().any(|e| e.txid == txid) {
                entries.insert(0, HistoryEntry { txid, confirmed });
            }
        }
        for input in &tx.input {
            state.spent.insert(input.previous_output);
        }
        state.txs.insert(txid, tx);
        txid
    }

    pub fn confirm(&self, txid: &Txid) {
        let mut state = self.lock();
        for entries in state.history.values_mut() {
            for e in entries.iter_mut().filter(|e| e.txid == *txid) {
                e.confirmed = true;
            }
        }
    }

    /// Make every call fail with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn reject_broadcast(&self, reason: Option<&str>) {
        self.lock().reject = reason.map(str::to_string);
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.lock().broadcasts.clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.lock().offline {
            return Err(Error::Explorer("mock chain offline".into()));
        }
        Ok(())
    }
}

impl ChainBackend for MockChain {
    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.check_online()?;
        self.lock()
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::Query(format!("unknown transaction {txid}")))
    }

    fn script_history(&self, script_pubkey: &Script) -> Result<Vec<HistoryEntry>> {
        self.check_online()?;
        Ok(self
            .lock()
            .history
            .get(script_pubkey)
            .cloned()
            .unwrap_or_default())
    }

    fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        self.check_online()?;
        Ok(self.lock().spent.contains(outpoint))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        self.check_online()?;
        if let Some(reason) = self.lock().reject.clone() {
            return Err(Error::Broadcast {
                reason,
                tx_hex: lwk_wollet::elements::encode::serialize_hex(tx),
            });
        }
        self.lock().broadcasts.push(tx.clone());
        Ok(self.add_transaction(tx.clone(), false))
    }
}
