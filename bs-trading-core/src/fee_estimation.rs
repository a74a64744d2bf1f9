//! Fee estimation and fee arithmetic
//!
//! The network fee estimate is an external service reached through the
//! [`FeeEstimator`] trait. Everything else in this module is pure arithmetic
//! over virtual sizes, done in `Decimal` so rates such as 1.1 sat/vB round the
//! same way on every platform.

use bitcoin::Amount;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::providers::Callback;
use crate::types::SATOSHIS_PER_BITCOIN;

/// Fixed per-transaction overhead in vbytes (version, locktime, counts, segwit marker)
pub const TX_OVERHEAD_VSIZE: u64 = 11;

/// Asynchronous fee rate source
pub trait FeeEstimator: Send + Sync {
    /// Estimate the fee rate in sat/vB for confirmation within `target_blocks`
    fn estimate_fee_per_byte(&self, target_blocks: u32, callback: Callback<Result<f32, String>>);
}

/// Estimator that always answers with the same rate
///
/// Useful on regtest and when the node's estimator is unavailable.
#[derive(Debug, Clone, Copy)]
pub struct FixedRateEstimator {
    rate: f32,
}

impl FixedRateEstimator {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }
}

impl FeeEstimator for FixedRateEstimator {
    fn estimate_fee_per_byte(&self, _target_blocks: u32, callback: Callback<Result<f32, String>>) {
        callback(Ok(self.rate));
    }
}

/// How the fee of a transaction is determined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeeSpec {
    /// Rate in sat/vB, fee grows with the transaction size
    PerVbyte(f32),
    /// Flat fee regardless of size
    Fixed(u64),
}

impl FeeSpec {
    /// No fee at all, used for the CC half of a swap
    pub fn zero() -> Self {
        FeeSpec::Fixed(0)
    }

    /// Rate used for marginal costs such as the change output
    ///
    /// A fixed fee has no marginal cost, so this is zero.
    pub fn marginal_rate(&self) -> f32 {
        match self {
            FeeSpec::PerVbyte(rate) => *rate,
            FeeSpec::Fixed(_) => 0.0,
        }
    }

    /// Raise a per-vbyte rate to at least `floor`
    pub fn with_floor(self, floor: f32) -> Self {
        match self {
            FeeSpec::PerVbyte(rate) if rate < floor => FeeSpec::PerVbyte(floor),
            other => other,
        }
    }

    /// Fee for a transaction of the given virtual size
    pub fn fee_for_vsize(&self, vsize: u64) -> Amount {
        match self {
            FeeSpec::PerVbyte(rate) => fee_for_vsize(*rate, vsize),
            FeeSpec::Fixed(sats) => Amount::from_sat(*sats),
        }
    }
}

/// `ceil(rate * vsize)` in satoshis, capped at [`Amount::MAX_MONEY`]
///
/// Negative and NaN rates are treated as zero. Rates too large to multiply
/// exactly, infinity included, saturate at the cap.
pub fn fee_for_vsize(rate: f32, vsize: u64) -> Amount {
    if rate.is_nan() || rate <= 0.0 || vsize == 0 {
        return Amount::ZERO;
    }
    Decimal::from_f32(rate)
        .and_then(|rate| rate.checked_mul(Decimal::from(vsize)))
        .and_then(|fee| fee.ceil().to_u64())
        .map(|sats| Amount::from_sat(sats.min(Amount::MAX_MONEY.to_sat())))
        .unwrap_or(Amount::MAX_MONEY)
}

/// Virtual size of a transaction with the given inputs and outputs
pub fn estimate_vsize<I>(input_vsizes: I, output_count: usize, output_vsize: u64) -> u64
where
    I: IntoIterator<Item = u64>,
{
    let inputs: u64 = input_vsizes.into_iter().sum();
    TX_OVERHEAD_VSIZE + inputs + output_count as u64 * output_vsize
}

/// Check an estimate against the configured bounds
pub fn validate_fee_rate(rate: f32, min_fee_per_byte: f32, max_fee_per_byte: f32) -> Result<f32, String> {
    if !rate.is_finite() || rate < min_fee_per_byte || rate > max_fee_per_byte {
        return Err(format!(
            "invalid fee rate {} sat/vB (allowed {} to {})",
            rate, min_fee_per_byte, max_fee_per_byte
        ));
    }
    Ok(rate)
}

/// Convert a BTC-denominated decimal into satoshis, rounding to the nearest satoshi
pub fn btc_to_sat(btc: Decimal) -> Option<u64> {
    if btc.is_sign_negative() {
        return None;
    }
    (btc * Decimal::from(SATOSHIS_PER_BITCOIN)).round().to_u64()
}
