//! Core types for UTXO selection
//!
//! - [`Utxo`]: a single spendable output as seen by the inventory
//! - [`SelectionRequest`]: what the caller wants covered and how fees are paid
//! - [`SelectionResult`]: the chosen inputs with fee and change breakdown
//!
//! # Example
//!
//! ```
//! use bs_trading_core::utxo_selection::Utxo;
//! use bitcoin::{Amount, OutPoint, Txid};
//! use std::str::FromStr;
//!
//! let utxo = Utxo::new(
//!     OutPoint::new(
//!         Txid::from_str("7967a5185e907a25225574544c31f7b059c1a191d65b53dcc1554d339c4f9efc").unwrap(),
//!         0,
//!     ),
//!     Amount::from_sat(10_000),
//!     6,
//! )
//! .with_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
//!
//! assert!(!utxo.is_zero_conf());
//! ```

use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::fee_estimation::FeeSpec;
use crate::types::{AddressType, Liveness};

/// Unspent transaction output
///
/// Identity is the outpoint; two records with the same outpoint describe the
/// same coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "UtxoRecord", try_from = "UtxoRecord")]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    /// Number of confirmations (0 for unconfirmed)
    pub confirmations: u32,
    /// Height of the confirming block, if any
    pub block_height: Option<u32>,
    /// Address the output pays to
    pub address: Option<String>,
    pub address_type: AddressType,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, amount: Amount, confirmations: u32) -> Self {
        Self {
            outpoint,
            amount,
            confirmations,
            block_height: None,
            address: None,
            address_type: AddressType::default(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }

    pub fn with_block_height(mut self, height: u32) -> Self {
        self.block_height = Some(height);
        self
    }

    pub fn is_zero_conf(&self) -> bool {
        self.confirmations == 0
    }

    pub fn liveness(&self) -> Liveness {
        if self.is_zero_conf() {
            Liveness::ZeroConf
        } else {
            Liveness::Normal
        }
    }

    /// Virtual size this output adds when spent
    pub fn input_vsize(&self) -> u64 {
        self.address_type.input_vsize()
    }
}

/// Wire form of [`Utxo`]; `bitcoin` is built without serde
#[derive(Serialize, Deserialize)]
struct UtxoRecord {
    txid: String,
    vout: u32,
    amount_sat: u64,
    confirmations: u32,
    #[serde(default)]
    block_height: Option<u32>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    address_type: AddressType,
}

impl From<Utxo> for UtxoRecord {
    fn from(utxo: Utxo) -> Self {
        Self {
            txid: utxo.outpoint.txid.to_string(),
            vout: utxo.outpoint.vout,
            amount_sat: utxo.amount.to_sat(),
            confirmations: utxo.confirmations,
            block_height: utxo.block_height,
            address: utxo.address,
            address_type: utxo.address_type,
        }
    }
}

impl TryFrom<UtxoRecord> for Utxo {
    type Error = String;

    fn try_from(record: UtxoRecord) -> Result<Self, Self::Error> {
        let txid = Txid::from_str(&record.txid).map_err(|e| format!("invalid txid: {}", e))?;
        Ok(Self {
            outpoint: OutPoint::new(txid, record.vout),
            amount: Amount::from_sat(record.amount_sat),
            confirmations: record.confirmations,
            block_height: record.block_height,
            address: record.address,
            address_type: record.address_type,
        })
    }
}

/// Parameters of a single selection run
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionRequest {
    /// Value the recipients must receive
    pub target: Amount,
    pub fee: FeeSpec,
    /// Number of recipient outputs, not counting change
    pub recipient_count: usize,
    /// Try to find a subset summing exactly to target plus fee first
    pub exact_match: bool,
    /// Fail instead of returning an undersized set
    pub check_amount: bool,
}

impl SelectionRequest {
    pub fn new(target: Amount, fee: FeeSpec) -> Self {
        Self {
            target,
            fee,
            recipient_count: 1,
            exact_match: false,
            check_amount: true,
        }
    }
}

/// Outcome of a selection run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    /// Chosen inputs in selection order
    pub selected: Vec<Utxo>,
    pub total: Amount,
    pub fee: Amount,
    /// Change value; zero when change was folded into the fee
    pub change: Amount,
    pub has_change: bool,
    /// Inputs sum exactly to target plus fee
    pub exact_match: bool,
    /// Estimated virtual size of the resulting transaction
    pub vsize: u64,
    /// Above the configured size ceiling; caller must confirm
    pub exceeds_size_limit: bool,
    /// False only for undersized results returned with `check_amount` off
    pub sufficient: bool,
}

impl SelectionResult {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.selected.iter().map(|u| u.outpoint).collect()
    }

    pub fn input_count(&self) -> usize {
        self.selected.len()
    }
}
