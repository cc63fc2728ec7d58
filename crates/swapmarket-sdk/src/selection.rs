use lwk_wollet::elements::OutPoint;

use crate::error::{Error, Result};
use crate::limits::AssetKind;
use crate::utxo::Utxo;

/// UTXOs chosen to fund a withdrawal, with per-asset totals.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub total_base: u64,
    pub total_counter: u64,
    pub required_base: u64,
    pub required_counter: u64,
}

impl Selection {
    pub fn total(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Base => self.total_base,
            AssetKind::Counter => self.total_counter,
        }
    }

    pub fn required(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Base => self.required_base,
            AssetKind::Counter => self.required_counter,
        }
    }

    /// Fail with the first asset whose total falls short of its requirement.
    pub fn ensure_covers(&self) -> Result<()> {
        for kind in [AssetKind::Counter, AssetKind::Base] {
            if self.total(kind) < self.required(kind) {
                return Err(Error::InsufficientFunds {
                    asset: kind,
                    required: self.required(kind),
                    available: self.total(kind),
                });
            }
        }
        Ok(())
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(|u| u.outpoint).collect()
    }

    fn push(&mut self, utxo: &Utxo) {
        match utxo.asset {
            Some(AssetKind::Base) => self.total_base += utxo.value.unwrap_or(0),
            Some(AssetKind::Counter) => self.total_counter += utxo.value.unwrap_or(0),
            None => return,
        }
        self.utxos.push(utxo.clone());
    }
}

/// Picks inputs from the wallet set, smallest first, stopping as soon as a
/// requirement is met.
pub struct UtxoSelector<'a> {
    utxos: &'a [Utxo],
    newest_deposit: Option<OutPoint>,
}

impl<'a> UtxoSelector<'a> {
    pub fn new(utxos: &'a [Utxo]) -> Self {
        Self {
            utxos,
            newest_deposit: None,
        }
    }

    /// Always spend this deposit first, when it holds value.
    pub fn with_newest_deposit(mut self, outpoint: Option<OutPoint>) -> Self {
        self.newest_deposit = outpoint;
        self
    }

    pub fn select(&self, required_base: u64, required_counter: u64) -> Selection {
        let mut selection = Selection {
            required_base,
            required_counter,
            ..Default::default()
        };

        let deposit = self
            .newest_deposit
            .and_then(|op| self.utxos.iter().find(|u| u.outpoint == op))
            .filter(|u| u.is_spendable());
        if let Some(utxo) = deposit {
            selection.push(utxo);
        }

        let candidates = |kind: AssetKind| -> Vec<&Utxo> {
            let mut v: Vec<&Utxo> = self
                .utxos
                .iter()
                .filter(|u| u.is_spendable() && u.asset == Some(kind))
                .filter(|u| Some(u.outpoint) != deposit.map(|d| d.outpoint))
                .collect();
            v.sort_by_key(|u| u.value.unwrap_or(0));
            v
        };

        if required_counter > 0 {
            for utxo in candidates(AssetKind::Counter) {
                if selection.total_counter >= required_counter {
                    break;
                }
                selection.push(utxo);
            }
        }

        // With a counter leg the fee input should be one large base output.
        let mut base = candidates(AssetKind::Base);
        if required_counter > 0 {
            base.reverse();
        }
        for utxo in base {
            if selection.total_base >= required_base {
                break;
            }
            selection.push(utxo);
        }

        log::debug!(
            "selection: {} inputs, base {}/{}, counter {}/{}",
            selection.utxos.len(),
            selection.total_base,
            required_base,
            selection.total_counter,
            required_counter
        );
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::valued_utxo;

    fn wallet() -> Vec<Utxo> {
        vec![
            valued_utxo(0, 1, AssetKind::Base, 3_000),
            valued_utxo(1, 2, AssetKind::Base, 1_000),
            valued_utxo(2, 3, AssetKind::Base, 2_000),
            valued_utxo(3, 4, AssetKind::Counter, 500),
            valued_utxo(4, 5, AssetKind::Counter, 100),
            valued_utxo(5, 6, AssetKind::Counter, 300),
        ]
    }

    fn values(sel: &Selection) -> Vec<u64> {
        sel.utxos.iter().map(|u| u.value.unwrap()).collect()
    }

    #[test]
    fn base_only_takes_smallest_first() {
        let utxos = wallet();
        let sel = UtxoSelector::new(&utxos).select(2_500, 0);
        assert_eq!(values(&sel), vec![1_000, 2_000]);
        assert_eq!(sel.total_base, 3_000);
        assert_eq!(sel.total_counter, 0);
        sel.ensure_covers().unwrap();
    }

    #[test]
    fn counter_leg_takes_largest_base_for_fee() {
        let utxos = wallet();
        let sel = UtxoSelector::new(&utxos).select(200, 350);
        assert_eq!(values(&sel), vec![100, 300, 3_000]);
        assert_eq!(sel.total_counter, 400);
        assert_eq!(sel.total_base, 3_000);
    }

    #[test]
    fn newest_deposit_is_included_first() {
        let utxos = wallet();
        let deposit = utxos[0].outpoint;
        let sel = UtxoSelector::new(&utxos)
            .with_newest_deposit(Some(deposit))
            .select(100, 0);
        assert_eq!(sel.utxos.len(), 1);
        assert_eq!(sel.utxos[0].outpoint, deposit);
    }

    #[test]
    fn counter_deposit_counts_toward_counter_total() {
        let utxos = wallet();
        let deposit = utxos[3].outpoint;
        let sel = UtxoSelector::new(&utxos)
            .with_newest_deposit(Some(deposit))
            .select(100, 0);
        assert_eq!(sel.total_counter, 500);
        assert_eq!(values(&sel), vec![500, 1_000]);
    }

    #[test]
    fn zero_valued_deposit_is_skipped() {
        let mut utxos = wallet();
        let mut zero = valued_utxo(9, 9, AssetKind::Base, 0);
        zero.set_valuation(None, 77);
        let op = zero.outpoint;
        utxos.push(zero);
        let sel = UtxoSelector::new(&utxos)
            .with_newest_deposit(Some(op))
            .select(500, 0);
        assert!(sel.utxos.iter().all(|u| u.outpoint != op));
    }

    #[test]
    fn spent_utxos_are_never_selected() {
        let mut utxos = wallet();
        for u in utxos.iter_mut() {
            u.spent = true;
        }
        let sel = UtxoSelector::new(&utxos).select(1, 1);
        assert!(sel.utxos.is_empty());
    }

    #[test]
    fn shortfall_reports_asset_and_amounts() {
        let utxos = wallet();
        let sel = UtxoSelector::new(&utxos).select(100, 10_000);
        match sel.ensure_covers() {
            Err(Error::InsufficientFunds {
                asset,
                required,
                available,
            }) => {
                assert_eq!(asset, AssetKind::Counter);
                assert_eq!(required, 10_000);
                assert_eq!(available, 900);
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
    }
}
