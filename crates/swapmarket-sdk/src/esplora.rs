//! Esplora REST chain backend.

use std::time::Duration;

use lwk_wollet::elements::encode::{deserialize, serialize_hex};
use lwk_wollet::elements::{Address, AddressParams, OutPoint, Script, Transaction, Txid};
use serde::Deserialize;

use crate::chain::{ChainBackend, HistoryEntry};
use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct AddressTx {
    txid: String,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct Outspend {
    spent: bool,
}

/// Chain backend speaking the Esplora HTTP API. A fresh client with a bounded
/// timeout is built for every call.
pub struct EsploraBackend {
    base_url: String,
    params: &'static AddressParams,
    timeout: Duration,
}

impl EsploraBackend {
    pub fn new(base_url: &str, params: &'static AddressParams) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            params,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Explorer(e.to_string()))
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client()?
            .get(&url)
            .send()
            .map_err(|e| Error::Explorer(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Explorer(format!("GET {url}: {}", resp.status())));
        }
        Ok(resp)
    }
}

impl ChainBackend for EsploraBackend {
    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        let hex_tx = self
            .get(&format!("/tx/{txid}/hex"))?
            .text()
            .map_err(|e| Error::Explorer(e.to_string()))?;
        let bytes = hex::decode(hex_tx.trim())
            .map_err(|e| Error::Explorer(format!("tx {txid}: bad hex: {e}")))?;
        deserialize(&bytes).map_err(|e| Error::Explorer(format!("tx {txid}: {e}")))
    }

    fn script_history(&self, script_pubkey: &Script) -> Result<Vec<HistoryEntry>> {
        let address = Address::from_script(script_pubkey, None, self.params)
            .ok_or_else(|| Error::Query("script has no address form".into()))?;
        // Esplora returns mempool entries first, then confirmed newest first.
        let txs: Vec<AddressTx> = self
            .get(&format!("/address/{address}/txs"))?
            .json()
            .map_err(|e| Error::Explorer(format!("address txs: {e}")))?;
        txs.into_iter()
            .map(|t| {
                let txid = t
                    .txid
                    .parse()
                    .map_err(|e| Error::Explorer(format!("bad txid {}: {e}", t.txid)))?;
                Ok(HistoryEntry {
                    txid,
                    confirmed: t.status.confirmed,
                })
            })
            .collect()
    }

    fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let outspend: Outspend = self
            .get(&format!("/tx/{}/outspend/{}", outpoint.txid, outpoint.vout))?
            .json()
            .map_err(|e| Error::Explorer(format!("outspend: {e}")))?;
        Ok(outspend.spent)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let tx_hex = serialize_hex(tx);
        let url = format!("{}/tx", self.base_url);
        let resp = self
            .client()?
            .post(&url)
            .body(tx_hex.clone())
            .send()
            .map_err(|e| Error::Explorer(format!("POST {url}: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| Error::Explorer(e.to_string()))?
            .trim()
            .to_string();

        if !status.is_success() {
            return Err(Error::Broadcast {
                reason: body,
                tx_hex,
            });
        }
        body.parse::<Txid>().map_err(|_| Error::Broadcast {
            reason: body.clone(),
            tx_hex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwk_wollet::elements::hashes::Hash;

    #[test]
    fn trims_trailing_slash() {
        let backend = EsploraBackend::new(
            "https://blockstream.info/liquidtestnet/api/",
            &AddressParams::LIQUID_TESTNET,
        );
        assert_eq!(
            backend.base_url(),
            "https://blockstream.info/liquidtestnet/api"
        );
    }

    #[test]
    fn parses_address_history() {
        let json = r#"[
            {"txid":"0000000000000000000000000000000000000000000000000000000000000002","status":{"confirmed":false}},
            {"txid":"0000000000000000000000000000000000000000000000000000000000000001","status":{"confirmed":true,"block_height":10}}
        ]"#;
        let txs: Vec<AddressTx> = serde_json::from_str(json).unwrap();
        assert_eq!(txs.len(), 2);
        assert!(!txs[0].status.confirmed);
        assert!(txs[1].status.confirmed);
    }

    #[test]
    fn unreachable_explorer_is_transient() {
        let backend = EsploraBackend::new("http://127.0.0.1:9", &AddressParams::ELEMENTS)
            .with_timeout(Duration::from_millis(200));
        let err = backend
            .is_spent(&OutPoint::new(Txid::all_zeros(), 0))
            .unwrap_err();
        assert!(err.is_transient());
    }
}
