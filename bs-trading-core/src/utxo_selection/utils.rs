//! Utility functions for UTXO selection

use bitcoin::Amount;
use std::cmp::Ordering;

use crate::fee_estimation::{estimate_vsize, FeeSpec};
use crate::types::AddressType;
use crate::utxo_selection::types::Utxo;

/// Canonical selection order: value descending, then txid, then vout
///
/// Every selection run starts from this order so identical snapshots always
/// produce identical results.
pub fn selection_order(a: &Utxo, b: &Utxo) -> Ordering {
    b.amount
        .cmp(&a.amount)
        .then_with(|| a.outpoint.txid.cmp(&b.outpoint.txid))
        .then_with(|| a.outpoint.vout.cmp(&b.outpoint.vout))
}

/// Sort UTXOs into [`selection_order`]
pub fn sort_for_selection(utxos: &[Utxo]) -> Vec<Utxo> {
    let mut sorted = utxos.to_vec();
    sorted.sort_by(selection_order);
    sorted
}

/// Calculate the total value of a set of UTXOs as an Amount
pub fn total_amount(utxos: &[Utxo]) -> Amount {
    utxos.iter().map(|utxo| utxo.amount).sum()
}

/// Virtual size of a transaction spending `inputs` into `output_count` outputs
pub fn transaction_vsize<'a, I>(inputs: I, output_count: usize, output_type: AddressType) -> u64
where
    I: IntoIterator<Item = &'a Utxo>,
{
    estimate_vsize(
        inputs.into_iter().map(Utxo::input_vsize),
        output_count,
        output_type.output_vsize(),
    )
}

/// Fee for spending `inputs` into `output_count` outputs of `output_type`
pub fn calculate_fee<'a, I>(inputs: I, output_count: usize, output_type: AddressType, fee: &FeeSpec) -> Amount
where
    I: IntoIterator<Item = &'a Utxo>,
{
    fee.fee_for_vsize(transaction_vsize(inputs, output_count, output_type))
}

/// Value of a UTXO after paying for its own input at the marginal fee rate
///
/// Negative for outputs that cost more to spend than they carry.
pub fn effective_value(utxo: &Utxo, fee: &FeeSpec) -> f64 {
    utxo.amount.to_sat() as f64 - f64::from(fee.marginal_rate()) * utxo.input_vsize() as f64
}

/// Smallest change worth creating an output for
///
/// Below this the extra output costs more than it carries, so the remainder
/// goes to the miner instead.
pub fn change_threshold(fee: &FeeSpec, dust_threshold: u64, change_type: AddressType) -> Amount {
    let output_cost = crate::fee_estimation::fee_for_vsize(fee.marginal_rate(), change_type.output_vsize());
    Amount::from_sat(dust_threshold.max(output_cost.to_sat()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{OutPoint, Txid};
    use std::str::FromStr;

    fn utxo(txid: &str, vout: u32, sats: u64) -> Utxo {
        Utxo::new(
            OutPoint::new(Txid::from_str(&txid.repeat(64)).unwrap(), vout),
            Amount::from_sat(sats),
            6,
        )
    }

    #[test]
    fn test_selection_order_is_total() {
        let utxos = vec![
            utxo("2", 0, 10_000),
            utxo("1", 1, 10_000),
            utxo("1", 0, 10_000),
            utxo("3", 0, 50_000),
        ];
        let sorted = sort_for_selection(&utxos);
        assert_eq!(sorted[0].amount, Amount::from_sat(50_000));
        assert_eq!(sorted[1].outpoint.vout, 0);
        assert_eq!(sorted[1].outpoint.txid, sorted[2].outpoint.txid);
        assert_eq!(sorted[2].outpoint.vout, 1);
        assert_eq!(sorted[3].amount, Amount::from_sat(10_000));
    }

    #[test]
    fn test_change_threshold() {
        // high rate makes the output cost dominate the dust limit
        assert_eq!(
            change_threshold(&FeeSpec::PerVbyte(50.0), 546, AddressType::NativeSegwit),
            Amount::from_sat(1550)
        );
        assert_eq!(
            change_threshold(&FeeSpec::PerVbyte(1.0), 546, AddressType::NativeSegwit),
            Amount::from_sat(546)
        );
        assert_eq!(change_threshold(&FeeSpec::Fixed(2000), 546, AddressType::Legacy), Amount::from_sat(546));
    }

    #[test]
    fn test_effective_value_depends_on_input_type() {
        let segwit = utxo("1", 0, 13_000);
        let legacy = utxo("2", 0, 13_500).with_address_type(AddressType::Legacy);
        let fee = FeeSpec::PerVbyte(100.0);

        assert_eq!(effective_value(&segwit, &fee), 6_200.0);
        assert_eq!(effective_value(&legacy, &fee), -1_300.0);
        assert_eq!(effective_value(&legacy, &FeeSpec::Fixed(5_000)), 13_500.0);
    }

    #[test]
    fn test_calculate_fee() {
        let inputs = vec![utxo("1", 0, 1), utxo("2", 0, 1)];
        // 11 + 2 * 68 + 2 * 31
        assert_eq!(calculate_fee(&inputs, 2, AddressType::NativeSegwit, &FeeSpec::PerVbyte(2.0)), Amount::from_sat(418));
        assert_eq!(total_amount(&inputs), Amount::from_sat(2));
    }
}
