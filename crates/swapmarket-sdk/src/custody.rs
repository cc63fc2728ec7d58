//! Key custody: the only component that touches private and blinding keys.

use std::fs;
use std::path::{Path, PathBuf};

use lwk_common::Signer;
use lwk_signer::SwSigner;
use lwk_wollet::bitcoin::bip32::DerivationPath;
use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Value as ConfValue, ValueBlindingFactor,
};
use lwk_wollet::elements::secp256k1_zkp::{self, All, Message, Secp256k1, SecretKey};
use lwk_wollet::elements_miniscript::slip77::MasterBlindingKey;
use lwk_wollet::elements::{Address, Script, TxOut, TxOutSecrets};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::Network;
use crate::utxo::{KeyMaterial, UtxoRecord};

/// Operations the settlement core delegates to whoever holds the keys.
pub trait KeyCustody: Send {
    /// Every UTXO custody knows the wallet owns.
    fn wallet_utxos(&self) -> Result<Vec<UtxoRecord>>;

    /// Allocate the next key pair. `label` describes its use (deposit, change).
    fn new_keys(&mut self, label: &str) -> Result<KeyMaterial>;

    /// Persist that a key now funds an output.
    fn record_utxo(&mut self, record: UtxoRecord) -> Result<()>;

    /// Reveal asset, value and blinding factors of an output owned by key `index`.
    fn unblind(&self, index: u32, txout: &TxOut) -> Result<TxOutSecrets>;

    /// ECDSA-sign a 32-byte digest with key `index`, returning DER bytes.
    fn sign(&self, index: u32, sighash: &[u8; 32]) -> Result<Vec<u8>>;
}

/// Secrets of an explicit output: asset and value in the clear, zero factors.
pub fn explicit_secrets(txout: &TxOut) -> Option<TxOutSecrets> {
    match (txout.asset, txout.value) {
        (Asset::Explicit(asset), ConfValue::Explicit(value)) => Some(TxOutSecrets {
            asset,
            asset_bf: AssetBlindingFactor::zero(),
            value,
            value_bf: ValueBlindingFactor::zero(),
        }),
        _ => None,
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CustodyState {
    next_index: u32,
    #[serde(default)]
    utxos: Vec<UtxoRecord>,
}

/// Software custody backed by an `lwk_signer::SwSigner`.
///
/// Key `N` lives at `m/84'/{coin}'/0'/0/N`; its blinding key is the SLIP-77
/// key of the key's P2WPKH script. Recorded UTXOs and the next free index are
/// kept in an optional JSON state file.
pub struct SwSignerCustody {
    signer: SwSigner,
    network: Network,
    master_blinding_key: MasterBlindingKey,
    state: CustodyState,
    state_file: Option<PathBuf>,
    secp: Secp256k1<All>,
}

impl SwSignerCustody {
    pub fn new(mnemonic: &str, network: Network, state_file: Option<&Path>) -> Result<Self> {
        let signer = SwSigner::new(mnemonic, network.is_mainnet())
            .map_err(|e| Error::Signer(e.to_string()))?;
        let master_blinding_key = signer
            .slip77_master_blinding_key()
            .map_err(|e| Error::Signer(format!("{e:?}")))?;

        let state = match state_file {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| Error::Custody(format!("read {}: {e}", path.display())))?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::Schema(format!("custody state: {e}")))?
            }
            _ => CustodyState::default(),
        };
        log::info!(
            "custody: loaded {} recorded utxos, next key index {}",
            state.utxos.len(),
            state.next_index
        );

        Ok(Self {
            signer,
            network,
            master_blinding_key,
            state,
            state_file: state_file.map(Path::to_path_buf),
            secp: Secp256k1::new(),
        })
    }

    fn secret_key(&self, index: u32) -> Result<SecretKey> {
        let coin = if self.network.is_mainnet() { 1776 } else { 1 };
        let path: DerivationPath = format!("m/84'/{coin}'/0'/0/{index}")
            .parse()
            .map_err(|e| Error::Signer(format!("{e}")))?;
        let derived = self
            .signer
            .derive_xprv(&path)
            .map_err(|e| Error::Signer(format!("{e:?}")))?;
        SecretKey::from_slice(&derived.private_key.secret_bytes())
            .map_err(|e| Error::Signer(e.to_string()))
    }

    fn public_key(&self, index: u32) -> Result<PublicKey> {
        let sk = self.secret_key(index)?;
        Ok(PublicKey {
            inner: secp256k1_zkp::PublicKey::from_secret_key(&self.secp, &sk),
            compressed: true,
        })
    }

    /// P2WPKH script of key `index`, the SLIP-77 derivation input.
    fn script(&self, index: u32) -> Result<Script> {
        let pk = self.public_key(index)?;
        Ok(Address::p2wpkh(&pk, None, self.network.address_params()).script_pubkey())
    }

    fn blinding_secret(&self, index: u32) -> Result<SecretKey> {
        Ok(self
            .master_blinding_key
            .blinding_private_key(&self.script(index)?))
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Custody(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| Error::Custody(e.to_string()))?;
        fs::write(path, json).map_err(|e| Error::Custody(format!("write {}: {e}", path.display())))
    }
}

impl KeyCustody for SwSignerCustody {
    fn wallet_utxos(&self) -> Result<Vec<UtxoRecord>> {
        Ok(self.state.utxos.clone())
    }

    fn new_keys(&mut self, label: &str) -> Result<KeyMaterial> {
        let index = self.state.next_index;
        let pubkey = self.public_key(index)?;
        let blinding_pubkey =
            secp256k1_zkp::PublicKey::from_secret_key(&self.secp, &self.blinding_secret(index)?);
        self.state.next_index = index
            .checked_add(1)
            .ok_or(Error::Overflow("custody key index"))?;
        self.persist()?;
        log::debug!("custody: allocated {label} key {index}");
        Ok(KeyMaterial {
            index,
            pubkey,
            blinding_pubkey,
        })
    }

    fn record_utxo(&mut self, record: UtxoRecord) -> Result<()> {
        let existing = self
            .state
            .utxos
            .iter_mut()
            .find(|r| r.txid == record.txid && r.vout == record.vout);
        match existing {
            Some(slot) => *slot = record,
            None => self.state.utxos.push(record),
        }
        self.persist()
    }

    fn unblind(&self, index: u32, txout: &TxOut) -> Result<TxOutSecrets> {
        if let Some(secrets) = explicit_secrets(txout) {
            return Ok(secrets);
        }
        if txout.script_pubkey != self.script(index)? {
            return Err(Error::Custody(format!("output is not owned by key {index}")));
        }
        txout
            .unblind(&self.secp, self.blinding_secret(index)?)
            .map_err(|e| Error::Blinding(format!("unblind with key {index}: {e}")))
    }

    fn sign(&self, index: u32, sighash: &[u8; 32]) -> Result<Vec<u8>> {
        let sk = self.secret_key(index)?;
        let msg = Message::from_digest(*sighash);
        Ok(self.secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TEST_MNEMONIC;
    use lwk_wollet::elements::AssetId;
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::secp256k1_zkp::ecdsa::Signature;

    fn custody(state: Option<&Path>) -> SwSignerCustody {
        SwSignerCustody::new(TEST_MNEMONIC, Network::LiquidTestnet, state).unwrap()
    }

    #[test]
    fn keys_are_sequential_and_distinct() {
        let mut c = custody(None);
        let a = c.new_keys("deposit").unwrap();
        let b = c.new_keys("change").unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_ne!(a.pubkey, b.pubkey);
        assert_ne!(a.blinding_pubkey, b.blinding_pubkey);
    }

    #[test]
    fn signature_verifies_against_key() {
        let mut c = custody(None);
        let keys = c.new_keys("deposit").unwrap();
        let digest = [7u8; 32];
        let der = c.sign(keys.index, &digest).unwrap();
        let sig = Signature::from_der(&der).unwrap();
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&Message::from_digest(digest), &sig, &keys.pubkey.inner)
            .unwrap();
    }

    #[test]
    fn explicit_output_unblinds_to_zero_factors() {
        let c = custody(None);
        let asset = AssetId::from_byte_array([9; 32]);
        let txout = TxOut {
            asset: Asset::Explicit(asset),
            value: ConfValue::Explicit(1234),
            nonce: lwk_wollet::elements::confidential::Nonce::Null,
            script_pubkey: Script::new(),
            witness: Default::default(),
        };
        let secrets = c.unblind(0, &txout).unwrap();
        assert_eq!(secrets.asset, asset);
        assert_eq!(secrets.value, 1234);
        assert_eq!(secrets.asset_bf, AssetBlindingFactor::zero());
        assert_eq!(secrets.value_bf, ValueBlindingFactor::zero());
    }

    #[test]
    fn state_file_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.json");
        let keys = {
            let mut c = custody(Some(&path));
            let keys = c.new_keys("deposit").unwrap();
            c.record_utxo(UtxoRecord {
                index: keys.index,
                txid: lwk_wollet::elements::Txid::all_zeros().to_string(),
                vout: 1,
                pubkey: keys.pubkey.to_string(),
                blinding_pubkey: keys.blinding_pubkey.to_string(),
                value: None,
                token: None,
            })
            .unwrap();
            keys
        };

        let mut reloaded = custody(Some(&path));
        assert_eq!(reloaded.wallet_utxos().unwrap().len(), 1);
        let next = reloaded.new_keys("change").unwrap();
        assert_eq!(next.index, keys.index + 1);
    }
}
