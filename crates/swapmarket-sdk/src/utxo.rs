//! Wallet UTXO set: key material, custody wire records, balances and the
//! display quote derived from them.

use std::collections::HashSet;

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::secp256k1_zkp;
use lwk_wollet::elements::{Address, AddressParams, OutPoint, Script, TxOut, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::limits::{AssetKind, WalletLimits};

/// Public half of a custody-held key pair plus its blinding public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Sequence number of the key inside custody.
    pub index: u32,
    pub pubkey: PublicKey,
    pub blinding_pubkey: secp256k1_zkp::PublicKey,
}

impl KeyMaterial {
    /// Confidential P2WPKH address for this key.
    pub fn address(&self, params: &'static AddressParams) -> Address {
        Address::p2wpkh(&self.pubkey, Some(self.blinding_pubkey), params)
    }

    pub fn script_pubkey(&self, params: &'static AddressParams) -> Script {
        self.address(params).script_pubkey()
    }
}

/// Strict wire schema for a wallet UTXO as held by key custody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UtxoRecord {
    #[serde(rename = "N")]
    pub index: u32,
    #[serde(rename = "TxId")]
    pub txid: String,
    #[serde(rename = "Vout")]
    pub vout: u32,
    #[serde(rename = "PubKey")]
    pub pubkey: String,
    #[serde(rename = "PubBlind")]
    pub blinding_pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<AssetKind>,
}

impl UtxoRecord {
    pub fn from_utxo(utxo: &Utxo) -> Self {
        Self {
            index: utxo.keys.index,
            txid: utxo.outpoint.txid.to_string(),
            vout: utxo.outpoint.vout,
            pubkey: utxo.keys.pubkey.to_string(),
            blinding_pubkey: utxo.keys.blinding_pubkey.to_string(),
            value: utxo.value,
            token: utxo.asset,
        }
    }
}

/// An output owned by the service wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct Utxo {
    pub keys: KeyMaterial,
    pub outpoint: OutPoint,
    /// Unblinded amount. `None` until unblinded; 0 for ineligible assets.
    pub value: Option<u64>,
    pub asset: Option<AssetKind>,
    /// The funding `TxOut`, fetched lazily from the chain.
    pub witness: Option<TxOut>,
    pub spent: bool,
}

impl Utxo {
    pub fn new(keys: KeyMaterial, outpoint: OutPoint) -> Self {
        Self {
            keys,
            outpoint,
            value: None,
            asset: None,
            witness: None,
            spent: false,
        }
    }

    /// Record the unblinded amount. Outputs of unrecognized assets are worth 0.
    pub fn set_valuation(&mut self, asset: Option<AssetKind>, value: u64) {
        self.asset = asset;
        self.value = Some(if asset.is_some() { value } else { 0 });
    }

    /// Selectable: valued, positive, recognized and not yet consumed.
    pub fn is_spendable(&self) -> bool {
        !self.spent && self.asset.is_some() && matches!(self.value, Some(v) if v > 0)
    }

    pub fn value_of(&self, kind: AssetKind) -> u64 {
        match (self.asset, self.value) {
            (Some(a), Some(v)) if a == kind && !self.spent => v,
            _ => 0,
        }
    }
}

impl TryFrom<UtxoRecord> for Utxo {
    type Error = Error;

    fn try_from(record: UtxoRecord) -> Result<Self> {
        let txid: Txid = record
            .txid
            .parse()
            .map_err(|e| Error::Schema(format!("utxo {}: bad TxId: {e}", record.index)))?;
        let pubkey: PublicKey = record
            .pubkey
            .parse()
            .map_err(|e| Error::Schema(format!("utxo {}: bad PubKey: {e}", record.index)))?;
        let blinding_pubkey: secp256k1_zkp::PublicKey = record
            .blinding_pubkey
            .parse()
            .map_err(|e| Error::Schema(format!("utxo {}: bad PubBlind: {e}", record.index)))?;
        if record.value.is_some() != record.token.is_some() {
            return Err(Error::Schema(format!(
                "utxo {}: value and token must be set together",
                record.index
            )));
        }

        Ok(Self {
            keys: KeyMaterial {
                index: record.index,
                pubkey,
                blinding_pubkey,
            },
            outpoint: OutPoint::new(txid, record.vout),
            value: record.value,
            asset: record.token,
            witness: None,
            spent: false,
        })
    }
}

/// Confirmed per-asset totals over unspent, positive-valued wallet UTXOs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balances {
    pub base: u64,
    pub counter: u64,
}

impl Balances {
    pub fn get(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Base => self.base,
            AssetKind::Counter => self.counter,
        }
    }
}

/// The session's wallet set. UTXOs are appended once per funding txid and
/// never removed; consumed outputs are only flagged.
#[derive(Debug, Default)]
pub struct Wallet {
    utxos: Vec<Utxo>,
    merged: HashSet<Txid>,
    balances: Balances,
}

impl Wallet {
    pub fn from_records(records: Vec<UtxoRecord>) -> Result<Self> {
        let utxos = records
            .into_iter()
            .map(Utxo::try_from)
            .collect::<Result<Vec<_>>>()?;
        let merged = utxos.iter().map(|u| u.outpoint.txid).collect();
        let mut wallet = Self {
            utxos,
            merged,
            balances: Balances::default(),
        };
        wallet.recompute_balances();
        Ok(wallet)
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn utxos_mut(&mut self) -> &mut [Utxo] {
        &mut self.utxos
    }

    pub fn balances(&self) -> Balances {
        self.balances
    }

    pub fn contains_txid(&self, txid: &Txid) -> bool {
        self.merged.contains(txid)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.iter().find(|u| u.outpoint == *outpoint)
    }

    pub fn get_mut(&mut self, outpoint: &OutPoint) -> Option<&mut Utxo> {
        self.utxos.iter_mut().find(|u| u.outpoint == *outpoint)
    }

    /// Append a freshly confirmed UTXO. Returns `false` when its funding
    /// txid was already merged, in which case the wallet is untouched.
    pub fn merge(&mut self, utxo: Utxo) -> bool {
        self.merge_outputs(vec![utxo])
    }

    /// Append several outputs of one transaction in a single step.
    pub fn merge_outputs(&mut self, utxos: Vec<Utxo>) -> bool {
        let Some(first) = utxos.first() else {
            return false;
        };
        if !self.merged.insert(first.outpoint.txid) {
            return false;
        }
        self.utxos.extend(utxos);
        self.recompute_balances();
        true
    }

    /// Flag the given outpoints as consumed.
    pub fn mark_spent(&mut self, outpoints: &[OutPoint]) {
        for utxo in self.utxos.iter_mut() {
            if outpoints.contains(&utxo.outpoint) {
                utxo.spent = true;
            }
        }
        self.recompute_balances();
    }

    /// Replace the set with a fresh custody listing, keeping the spent flag
    /// and cached valuation of outputs already known.
    pub fn resync(&mut self, records: Vec<UtxoRecord>) -> Result<()> {
        let fresh = Self::from_records(records)?;
        let mut utxos = fresh.utxos;
        for utxo in utxos.iter_mut() {
            if let Some(old) = self.get(&utxo.outpoint) {
                utxo.spent = old.spent;
                if utxo.value.is_none() {
                    utxo.value = old.value;
                    utxo.asset = old.asset;
                }
                utxo.witness = old.witness.clone();
            }
        }
        // Merged deposits that custody has not listed yet stay in the set.
        for old in self.utxos.drain(..) {
            if !utxos.iter().any(|u| u.outpoint == old.outpoint) {
                utxos.push(old);
            }
        }
        self.merged.extend(utxos.iter().map(|u| u.outpoint.txid));
        self.utxos = utxos;
        self.recompute_balances();
        Ok(())
    }

    pub fn recompute_balances(&mut self) {
        let mut balances = Balances::default();
        for utxo in self.utxos.iter().filter(|u| u.is_spendable()) {
            balances.base += utxo.value_of(AssetKind::Base);
            balances.counter += utxo.value_of(AssetKind::Counter);
        }
        self.balances = balances;
    }
}

/// Largest deposit the wallet can currently honour in each asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TradeLimits {
    pub max_base_deposit: u64,
    pub max_counter_deposit: u64,
}

impl TradeLimits {
    /// Quote from balances at `rate` (counter per base), keeping a 1% cushion.
    pub fn quote(balances: &Balances, rate: f64, limits: &WalletLimits) -> Self {
        if !(rate.is_finite() && rate > 0.0) {
            return Self::default();
        }
        let by_counter = ((balances.counter as f64 / rate) * 0.99 / 1_000.0).floor() * 1_000.0;
        let max_base_deposit = limits.max_trade_base.min(by_counter as u64);

        let base_side = (limits.max_trade_base as f64).min(balances.base as f64 * 0.99);
        let max_counter_deposit = limits
            .max_trade_counter
            .min((base_side * rate).floor() as u64);

        Self {
            max_base_deposit,
            max_counter_deposit,
        }
    }
}

/// An incoming transaction observed on the deposit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub txid: Txid,
    pub vout: u32,
    pub asset: Option<AssetKind>,
    pub value: u64,
    pub confirmed: bool,
}

impl Deposit {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}
