//! Confidential withdrawal construction: output planning, blinding, signing
//! through custody and P2WPKH finalization.

use std::collections::HashMap;

use lwk_wollet::elements::confidential::{AssetBlindingFactor, ValueBlindingFactor};
use lwk_wollet::elements::hashes::Hash as _;
use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::secp256k1_zkp::ecdsa::Signature;
use lwk_wollet::elements::secp256k1_zkp::{All, Message, Secp256k1, SecretKey};
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{
    Address, AddressParams, AssetId, EcdsaSighashType, OutPoint, Transaction, TxOutSecrets,
};
use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};

use crate::calculator::Payout;
use crate::custody::KeyCustody;
use crate::error::{Error, Result};
use crate::fee::FeeSized;
use crate::limits::{AssetKind, DustPolicy, WalletLimits};
use crate::pset::{add_blinded_output, add_fee_output, add_pset_input, new_pset};
use crate::selection::Selection;
use crate::utxo::KeyMaterial;

const SIGHASH_ALL: u8 = 0x01;

/// Hands out blinder indices round-robin over the transaction inputs.
#[derive(Debug, Clone)]
pub struct BlinderCounter {
    next: u32,
    inputs: u32,
}

impl BlinderCounter {
    pub fn new(inputs: usize) -> Self {
        Self {
            next: 0,
            inputs: inputs.max(1) as u32,
        }
    }

    pub fn next_index(&mut self) -> u32 {
        let index = self.next;
        self.next = (self.next + 1) % self.inputs;
        index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRole {
    Recipient,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedOutput {
    pub role: OutputRole,
    pub asset: AssetKind,
    pub value: u64,
}

/// Blinded outputs in final order; the explicit fee output follows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub outputs: Vec<PlannedOutput>,
    pub fee: u64,
}

impl OutputPlan {
    pub fn recipient_total(&self, kind: AssetKind) -> u64 {
        self.sum(OutputRole::Recipient, kind)
    }

    pub fn change_total(&self, kind: AssetKind) -> u64 {
        self.sum(OutputRole::Change, kind)
    }

    fn sum(&self, role: OutputRole, kind: AssetKind) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.role == role && o.asset == kind)
            .map(|o| o.value)
            .sum()
    }
}

/// Lay out recipient legs, change and fee for a selection.
///
/// Change under the dust threshold is added to the recipient leg of the same
/// asset. Without such a leg, base dust goes to the fee and counter dust stays
/// as change. A lone output funded by a lone input is split in two.
pub fn plan_outputs<R: RngCore>(
    selection: &Selection,
    payout: Payout,
    fee: u64,
    dust: &DustPolicy,
    rng: &mut R,
) -> Result<OutputPlan> {
    let base_needed = payout
        .base
        .checked_add(fee)
        .ok_or(Error::Overflow("base requirement"))?;
    let base_change =
        selection
            .total_base
            .checked_sub(base_needed)
            .ok_or(Error::InsufficientFunds {
                asset: AssetKind::Base,
                required: base_needed,
                available: selection.total_base,
            })?;
    let counter_change = selection
        .total_counter
        .checked_sub(payout.counter)
        .ok_or(Error::InsufficientFunds {
            asset: AssetKind::Counter,
            required: payout.counter,
            available: selection.total_counter,
        })?;

    let mut outputs = Vec::with_capacity(4);
    let mut recipient = payout;
    let mut fee = fee;
    for (kind, change) in [
        (AssetKind::Base, base_change),
        (AssetKind::Counter, counter_change),
    ] {
        if change == 0 {
            continue;
        }
        let is_dust = change < dust.threshold(kind);
        if is_dust && payout.get(kind) > 0 {
            log::debug!("builder: folding {change} {kind} dust change into recipient output");
            *recipient.get_mut(kind) += change;
        } else if is_dust && kind == AssetKind::Base {
            log::debug!("builder: adding {change} base dust change to the fee");
            fee += change;
        } else {
            if is_dust {
                log::warn!("builder: keeping {change} {kind} dust change, no recipient {kind} leg");
            }
            outputs.push(PlannedOutput {
                role: OutputRole::Change,
                asset: kind,
                value: change,
            });
        }
    }
    for kind in [AssetKind::Base, AssetKind::Counter] {
        let value = recipient.get(kind);
        if value > 0 {
            outputs.push(PlannedOutput {
                role: OutputRole::Recipient,
                asset: kind,
                value,
            });
        }
    }

    if outputs.is_empty() {
        return Err(Error::NothingToWithdraw);
    }
    if selection.utxos.len() == 1 && outputs.len() == 1 && outputs[0].value >= 2 {
        let sole = outputs[0];
        let half = sole.value / 2;
        outputs[0].value = sole.value - half;
        outputs.push(PlannedOutput { value: half, ..sole });
    }

    outputs.shuffle(rng);
    Ok(OutputPlan { outputs, fee })
}

/// Reveal data for the first output paying the recipient, enough for an
/// explorer to show it unblinded.
#[derive(Debug, Clone, PartialEq)]
pub struct MainOutputReveal {
    pub vout: u32,
    pub value: u64,
    pub asset: AssetId,
    pub asset_bf: AssetBlindingFactor,
    pub value_bf: ValueBlindingFactor,
    /// Ephemeral key used to derive the output's blinding nonce.
    pub nonce: SecretKey,
}

impl MainOutputReveal {
    /// `#blinded=value,asset,vbf,abf` fragment understood by Esplora.
    pub fn fragment(&self) -> String {
        format!(
            "#blinded={},{},{},{}",
            self.value,
            self.asset,
            reversed_hex(self.value_bf.into_inner().as_ref()),
            reversed_hex(self.asset_bf.into_inner().as_ref()),
        )
    }
}

fn reversed_hex(bytes: &[u8]) -> String {
    let mut v = bytes.to_vec();
    v.reverse();
    hex::encode(v)
}

/// A change output of the withdrawal, to be recorded with custody.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeOutput {
    pub vout: u32,
    pub asset: AssetKind,
    pub value: u64,
    pub keys: KeyMaterial,
}

/// Change destinations for the two assets. Both may share one key.
#[derive(Debug, Clone)]
pub struct ChangeKeys {
    pub base: KeyMaterial,
    pub counter: KeyMaterial,
}

impl ChangeKeys {
    pub fn get(&self, kind: AssetKind) -> &KeyMaterial {
        match kind {
            AssetKind::Base => &self.base,
            AssetKind::Counter => &self.counter,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WithdrawalRequest<'a> {
    pub selection: &'a Selection,
    pub recipient: &'a Address,
    pub payout: Payout,
    pub fee: u64,
    pub change: &'a ChangeKeys,
}

/// A signed, finalized withdrawal ready for broadcast.
#[derive(Debug, Clone)]
pub struct BuiltWithdrawal {
    pub tx: Transaction,
    pub fee: u64,
    /// What the recipient actually receives, dust folds included.
    pub delivered: Payout,
    pub reveal: Option<MainOutputReveal>,
    pub change: Vec<ChangeOutput>,
    pub spent: Vec<OutPoint>,
}

impl FeeSized for BuiltWithdrawal {
    fn declared_fee(&self) -> u64 {
        self.fee
    }

    fn discount_vsize(&self) -> usize {
        self.tx.discount_vsize()
    }
}

pub struct ConfidentialTxBuilder<'a, K: KeyCustody + ?Sized> {
    custody: &'a K,
    limits: &'a WalletLimits,
    dust: DustPolicy,
    params: &'static AddressParams,
    secp: Secp256k1<All>,
}

impl<'a, K: KeyCustody + ?Sized> ConfidentialTxBuilder<'a, K> {
    pub fn new(
        custody: &'a K,
        limits: &'a WalletLimits,
        dust: DustPolicy,
        params: &'static AddressParams,
    ) -> Self {
        Self {
            custody,
            limits,
            dust,
            params,
            secp: Secp256k1::new(),
        }
    }

    pub fn build<R: RngCore + CryptoRng>(
        &self,
        req: &WithdrawalRequest<'_>,
        rng: &mut R,
    ) -> Result<BuiltWithdrawal> {
        if req.recipient.blinding_pubkey.is_none() {
            return Err(Error::InvalidAddress(format!(
                "{} is not confidential",
                req.recipient
            )));
        }
        if req.selection.utxos.is_empty() {
            return Err(Error::Pset("no inputs selected".into()));
        }

        let plan = plan_outputs(req.selection, req.payout, req.fee, &self.dust, rng)?;
        let mut pset = new_pset();

        // ── Inputs ──────────────────────────────────────────────────────
        let mut inp_txout_sec: HashMap<usize, TxOutSecrets> = HashMap::new();
        for (idx, utxo) in req.selection.utxos.iter().enumerate() {
            let txout = utxo
                .witness
                .as_ref()
                .ok_or_else(|| Error::Pset(format!("input {idx}: funding output not loaded")))?;
            let secrets = self.custody.unblind(utxo.keys.index, txout)?;
            let expected = utxo
                .asset
                .map(|kind| self.limits.asset_id(kind))
                .ok_or_else(|| Error::Pset(format!("input {idx}: unvalued")))?;
            if secrets.asset != expected || Some(secrets.value) != utxo.value {
                return Err(Error::Blinding(format!(
                    "input {idx}: unblinded {} {} does not match wallet record",
                    secrets.value, secrets.asset
                )));
            }
            add_pset_input(&mut pset, utxo.outpoint, txout);
            inp_txout_sec.insert(idx, secrets);
        }

        // ── Outputs ─────────────────────────────────────────────────────
        let mut blinders = BlinderCounter::new(req.selection.utxos.len());
        for planned in &plan.outputs {
            let address = match planned.role {
                OutputRole::Recipient => req.recipient.clone(),
                OutputRole::Change => req.change.get(planned.asset).address(self.params),
            };
            add_blinded_output(
                &mut pset,
                self.limits.asset_id(planned.asset),
                planned.value,
                &address,
                blinders.next_index(),
            )?;
        }
        add_fee_output(&mut pset, self.limits.base_asset, plan.fee);

        // ── Blind ───────────────────────────────────────────────────────
        let factors = pset
            .blind_last(rng, &self.secp, &inp_txout_sec)
            .map_err(|e| Error::Blinding(format!("{e:?}")))?;

        let reveal = plan
            .outputs
            .iter()
            .enumerate()
            .find(|(_, o)| o.role == OutputRole::Recipient)
            .and_then(|(idx, planned)| {
                factors.get(&idx).map(|(abf, vbf, nonce)| MainOutputReveal {
                    vout: idx as u32,
                    value: planned.value,
                    asset: self.limits.asset_id(planned.asset),
                    asset_bf: *abf,
                    value_bf: *vbf,
                    nonce: *nonce,
                })
            });

        // ── Sign and finalize ───────────────────────────────────────────
        self.sign(&mut pset, req.selection)?;
        finalize(&mut pset, req.selection)?;
        let tx = pset
            .extract_tx()
            .map_err(|e| Error::Finalize(e.to_string()))?;

        let change = plan
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.role == OutputRole::Change)
            .map(|(idx, o)| ChangeOutput {
                vout: idx as u32,
                asset: o.asset,
                value: o.value,
                keys: req.change.get(o.asset).clone(),
            })
            .collect();

        log::info!(
            "builder: built {} with {} inputs, {} outputs, fee {}",
            tx.txid(),
            tx.input.len(),
            tx.output.len(),
            plan.fee
        );

        Ok(BuiltWithdrawal {
            fee: plan.fee,
            delivered: Payout {
                base: plan.recipient_total(AssetKind::Base),
                counter: plan.recipient_total(AssetKind::Counter),
            },
            reveal,
            change,
            spent: req.selection.outpoints(),
            tx,
        })
    }

    /// Have custody sign every input's SIGHASH_ALL digest and attach the
    /// verified signature as a partial signature.
    fn sign(&self, pset: &mut PartiallySignedTransaction, selection: &Selection) -> Result<()> {
        let unsigned = pset
            .extract_tx()
            .map_err(|e| Error::Pset(format!("extract unsigned: {e}")))?;
        let mut cache = SighashCache::new(&unsigned);

        for (idx, utxo) in selection.utxos.iter().enumerate() {
            let txout = utxo
                .witness
                .as_ref()
                .ok_or_else(|| Error::Signer(format!("input {idx}: funding output not loaded")))?;
            let script_code = Address::p2pkh(&utxo.keys.pubkey, None, self.params).script_pubkey();
            let sighash =
                cache.segwitv0_sighash(idx, &script_code, txout.value, EcdsaSighashType::All);
            let digest = sighash.to_byte_array();

            let der = self.custody.sign(utxo.keys.index, &digest)?;
            let sig = Signature::from_der(&der)
                .map_err(|e| Error::Signer(format!("input {idx}: bad DER signature: {e}")))?;
            self.secp
                .verify_ecdsa(&Message::from_digest(digest), &sig, &utxo.keys.pubkey.inner)
                .map_err(|_| Error::Signer(format!("input {idx}: signature does not verify")))?;

            let mut sig_bytes = der;
            sig_bytes.push(SIGHASH_ALL);
            pset.inputs_mut()[idx]
                .partial_sigs
                .insert(utxo.keys.pubkey, sig_bytes);
        }
        Ok(())
    }
}

/// Move each input's partial signature into a `[sig, pubkey]` witness.
fn finalize(pset: &mut PartiallySignedTransaction, selection: &Selection) -> Result<()> {
    for (idx, utxo) in selection.utxos.iter().enumerate() {
        let input = &mut pset.inputs_mut()[idx];
        let sig = input
            .partial_sigs
            .get(&utxo.keys.pubkey)
            .cloned()
            .ok_or_else(|| Error::Finalize(format!("input {idx}: missing signature")))?;
        if sig.last() != Some(&SIGHASH_ALL) || Signature::from_der(&sig[..sig.len() - 1]).is_err() {
            return Err(Error::Finalize(format!("input {idx}: invalid signature")));
        }
        input.final_script_witness = Some(vec![sig, utxo.keys.pubkey.to_bytes()]);
        input.partial_sigs.clear();
    }
    Ok(())
}
