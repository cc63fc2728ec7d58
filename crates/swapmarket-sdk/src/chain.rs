use std::sync::Arc;

use lwk_wollet::elements::{OutPoint, Script, Transaction, TxOut, Txid};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A single entry of a script's transaction history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub confirmed: bool,
}

/// Backend for interacting with the Liquid blockchain.
pub trait ChainBackend: Send + Sync {
    /// Fetch a transaction by its txid.
    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction>;

    /// Transaction history for a script pubkey, newest first.
    fn script_history(&self, script_pubkey: &Script) -> Result<Vec<HistoryEntry>>;

    /// Whether the given output has been spent.
    fn is_spent(&self, outpoint: &OutPoint) -> Result<bool>;

    /// Broadcast a signed transaction and return its txid.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// Fetch a single output.
    fn fetch_txout(&self, outpoint: &OutPoint) -> Result<TxOut> {
        let tx = self.fetch_transaction(&outpoint.txid)?;
        tx.output
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or_else(|| Error::Query(format!("{outpoint}: vout out of range")))
    }

    /// Locate the first output of `txid` paying `script_pubkey`.
    fn find_output(&self, txid: &Txid, script_pubkey: &Script) -> Result<Option<(u32, TxOut)>> {
        let tx = self.fetch_transaction(txid)?;
        Ok(tx
            .output
            .into_iter()
            .enumerate()
            .find(|(_, out)| out.script_pubkey == *script_pubkey)
            .map(|(vout, out)| (vout as u32, out)))
    }
}

impl<T: ChainBackend + ?Sized> ChainBackend for Arc<T> {
    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        (**self).fetch_transaction(txid)
    }

    fn script_history(&self, script_pubkey: &Script) -> Result<Vec<HistoryEntry>> {
        (**self).script_history(script_pubkey)
    }

    fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        (**self).is_spent(outpoint)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        (**self).broadcast(tx)
    }
}

/// Electrum script hash: SHA256(scriptPubKey) with reversed byte order.
pub fn electrum_script_hash(script_pubkey: &Script) -> String {
    let mut hash = Sha256::digest(script_pubkey.as_bytes()).to_vec();
    hash.reverse();
    hex::encode(&hash)
}

/// Electrum-based chain backend for Liquid.
pub struct ElectrumBackend {
    electrum_url: String,
}

impl ElectrumBackend {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
        }
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    fn raw_client(&self) -> Result<electrum_client::Client> {
        let config = electrum_client::ConfigBuilder::new().timeout(Some(20)).build();
        electrum_client::Client::from_config(&self.electrum_url, config)
            .map_err(|e| Error::Electrum(e.to_string()))
    }

    fn lwk_client(&self) -> Result<lwk_wollet::ElectrumClient> {
        let url: lwk_wollet::ElectrumUrl = self
            .electrum_url
            .parse()
            .map_err(|e| Error::Electrum(format!("{:?}", e)))?;
        lwk_wollet::ElectrumClient::new(&url).map_err(|e| Error::Electrum(e.to_string()))
    }
}

impl ChainBackend for ElectrumBackend {
    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        use lwk_wollet::blocking::BlockchainBackend;

        let client = self.lwk_client()?;
        let txs = client
            .get_transactions(&[*txid])
            .map_err(|e| Error::Electrum(e.to_string()))?;
        txs.into_iter()
            .next()
            .ok_or_else(|| Error::Query(format!("transaction {} not found", txid)))
    }

    fn script_history(&self, script_pubkey: &Script) -> Result<Vec<HistoryEntry>> {
        use electrum_client::ElectrumApi;

        let client = self.raw_client()?;
        let resp = client
            .raw_call(
                "blockchain.scripthash.get_history",
                [electrum_client::Param::String(electrum_script_hash(
                    script_pubkey,
                ))],
            )
            .map_err(|e| Error::Electrum(e.to_string()))?;

        let entries = resp
            .as_array()
            .ok_or_else(|| Error::Electrum("expected array response".into()))?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let tx_hash_hex = entry["tx_hash"]
                .as_str()
                .ok_or_else(|| Error::Electrum("missing tx_hash".into()))?;
            // -1 or 0 means mempool, >0 is the confirming block height
            let height = entry["height"]
                .as_i64()
                .ok_or_else(|| Error::Electrum("missing height".into()))?;

            let txid: Txid = tx_hash_hex
                .parse()
                .map_err(|e| Error::Electrum(format!("bad tx_hash: {e}")))?;

            results.push((height, HistoryEntry {
                txid,
                confirmed: height > 0,
            }));
        }
        // Electrum lists confirmed entries by height ascending, mempool last.
        results.sort_by_key(|(height, _)| if *height > 0 { *height } else { i64::MAX });
        Ok(results.into_iter().rev().map(|(_, e)| e).collect())
    }

    fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let txout = self.fetch_txout(outpoint)?;
        let funding = outpoint.txid;
        for entry in self.script_history(&txout.script_pubkey)? {
            if entry.txid == funding {
                continue;
            }
            let tx = self.fetch_transaction(&entry.txid)?;
            if tx.input.iter().any(|i| i.previous_output == *outpoint) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        use lwk_wollet::blocking::BlockchainBackend;

        let client = self.lwk_client()?;
        client.broadcast(tx).map_err(|e| Error::Broadcast {
            reason: e.to_string(),
            tx_hex: lwk_wollet::elements::encode::serialize_hex(tx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockChain, explicit_txout, funding_tx};
    use lwk_wollet::elements::hashes::Hash;

    #[test]
    fn script_hash_is_reversed_sha256() {
        let script = Script::from(vec![0x00, 0x14]);
        let mut expected = Sha256::digest([0x00u8, 0x14]).to_vec();
        expected.reverse();
        assert_eq!(electrum_script_hash(&script), hex::encode(expected));
    }

    #[test]
    fn default_find_output_matches_script() {
        let chain = MockChain::default();
        let spk = Script::from(vec![0x51]);
        let other = Script::from(vec![0x52]);
        let asset = crate::testing::counter_asset();
        let tx = funding_tx(vec![
            explicit_txout(asset, 10, &other),
            explicit_txout(asset, 20, &spk),
        ]);
        let txid = tx.txid();
        chain.add_transaction(tx, true);

        let (vout, out) = chain.find_output(&txid, &spk).unwrap().unwrap();
        assert_eq!(vout, 1);
        assert_eq!(out.value.explicit(), Some(20));
        assert!(chain.find_output(&txid, &Script::new()).unwrap().is_none());
        assert!(chain.fetch_txout(&OutPoint::new(txid, 5)).is_err());
        assert!(chain.fetch_transaction(&Txid::all_zeros()).is_err());
    }
}
