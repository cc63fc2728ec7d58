use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::pset::{Input, Output, PartiallySignedTransaction};
use lwk_wollet::elements::{Address, AssetId, OutPoint, Script, Sequence, TxOut};

use crate::error::{Error, Result};

/// Create a new empty PSET v2.
pub(crate) fn new_pset() -> PartiallySignedTransaction {
    PartiallySignedTransaction::new_v2()
}

/// Add a wallet input spending `txout` at `outpoint`.
pub(crate) fn add_pset_input(pset: &mut PartiallySignedTransaction, outpoint: OutPoint, txout: &TxOut) {
    let input = Input {
        previous_txid: outpoint.txid,
        previous_output_index: outpoint.vout,
        witness_utxo: Some(txout.clone()),
        sequence: Some(Sequence::ENABLE_LOCKTIME_NO_RBF),
        ..Default::default()
    };
    pset.add_input(input);
}

/// Add an output to a confidential address, flagged for blinding by the
/// input at `blinder_index`.
pub(crate) fn add_blinded_output(
    pset: &mut PartiallySignedTransaction,
    asset: AssetId,
    amount: u64,
    address: &Address,
    blinder_index: u32,
) -> Result<()> {
    let blinding_pk = address
        .blinding_pubkey
        .ok_or_else(|| Error::InvalidAddress(format!("{address} is not confidential")))?;
    let output = Output {
        amount: Some(amount),
        asset: Some(asset),
        script_pubkey: address.script_pubkey(),
        blinding_key: Some(PublicKey {
            inner: blinding_pk,
            compressed: true,
        }),
        blinder_index: Some(blinder_index),
        ..Default::default()
    };
    pset.add_output(output);
    Ok(())
}

/// Add the explicit fee output (empty script).
pub(crate) fn add_fee_output(pset: &mut PartiallySignedTransaction, asset: AssetId, amount: u64) {
    let output = Output {
        amount: Some(amount),
        asset: Some(asset),
        script_pubkey: Script::new(),
        ..Default::default()
    };
    pset.add_output(output);
}
