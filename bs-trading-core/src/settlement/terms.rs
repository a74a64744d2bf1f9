//! Domain rules a settlement container delegates to
//!
//! The container drives the lifecycle; a [`SettlementTerms`] implementation
//! decides what is verified, what is funded and what is signed. Colored-coin
//! and XBT settlements differ only here.

use bitcoin::{Amount, Transaction, Txid};
use rust_decimal::Decimal;
use std::fmt;

use crate::config::SettlementConfig;
use crate::error::{ErrorKind, TradeFailure};
use crate::fee_estimation::btc_to_sat;
use crate::logging::sanitize_for_logging;
use crate::providers::{CounterpartyVerifier, RecipientLookup, RecipientMatch, VerificationContext};
use crate::reservation::ReservationPurpose;
use crate::settlement::params::TradeParams;
use crate::tx_request::{TxRequest, TxRequestError};
use crate::utxo_selection::{SelectionResult, Utxo};

/// Counterparty output paying the settlement address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayIn {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
}

/// How our side of the trade is funded
#[derive(Debug, Clone, PartialEq)]
pub enum Funding {
    /// We spend nothing from our wallet
    None,
    /// Reserve a best set from the wallet
    BestSet {
        target: Amount,
        exact_match: bool,
        zero_fee: bool,
        purpose: ReservationPurpose,
    },
    /// Reserve exactly these inputs
    Fixed { utxos: Vec<Utxo>, target: Amount },
}

/// What happens with our signed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Publish the signed half for the counterparty to merge
    HandOff,
    /// Push to the network ourselves
    Broadcast { announce_pay_in: bool },
}

/// Material available when our transaction is built
#[derive(Debug, Clone, Copy)]
pub struct BuildInputs<'a> {
    pub selection: Option<&'a SelectionResult>,
    pub pay_in: Option<&'a PayIn>,
    pub fee_rate: Option<f32>,
    pub dust_threshold: u64,
}

pub trait SettlementTerms: fmt::Debug + Send + Sync {
    /// Static checks run on activation
    fn validate(&self, trade: &TradeParams) -> Result<(), TradeFailure>;

    /// Amount and destination checks on the counterparty transaction
    fn check_counterparty(
        &self,
        trade: &TradeParams,
        tx: Option<&Transaction>,
        verifier: &dyn CounterpartyVerifier,
        config: &SettlementConfig,
    ) -> Result<Option<PayIn>, TradeFailure>;

    /// Address to verify asynchronously, if any
    fn address_check(&self, trade: &TradeParams) -> Option<(String, VerificationContext)>;

    fn needs_fee_estimate(&self, trade: &TradeParams) -> bool;

    fn funding(&self, trade: &TradeParams) -> Result<Funding, TradeFailure>;

    /// Address the blockchain monitor should watch
    fn watch_address(&self, trade: &TradeParams) -> Option<String>;

    /// The counterparty pay-in must be seen on chain before accepting
    fn requires_pay_in_detection(&self, trade: &TradeParams) -> bool;

    fn build_request(&self, trade: &TradeParams, inputs: &BuildInputs<'_>) -> Result<TxRequest, TradeFailure>;

    fn completion(&self, trade: &TradeParams) -> Completion;
}

pub(crate) fn internal(detail: impl Into<String>) -> TradeFailure {
    TradeFailure::new(ErrorKind::InternalError, detail)
}

pub(crate) fn verification(detail: impl Into<String>) -> TradeFailure {
    TradeFailure::new(ErrorKind::VerificationFailed, detail)
}

impl From<TxRequestError> for TradeFailure {
    fn from(err: TxRequestError) -> Self {
        internal(err.to_string())
    }
}

/// Positive bitcoin amount in satoshis
pub(crate) fn xbt_sats(btc: Decimal, what: &str) -> Result<Amount, TradeFailure> {
    match btc_to_sat(btc) {
        Some(sats) if sats > 0 => Ok(Amount::from_sat(sats)),
        _ => Err(internal(format!("invalid {} amount {}", what, btc))),
    }
}

pub(crate) fn require_address(address: &str, what: &str) -> Result<(), TradeFailure> {
    if address.trim().is_empty() {
        return Err(internal(format!("missing {}", what)));
    }
    Ok(())
}

pub(crate) fn require_counterparty_tx(tx: Option<&Transaction>) -> Result<&Transaction, TradeFailure> {
    tx.ok_or_else(|| verification("counterparty transaction is missing"))
}

/// Locate the output paying `address` and check it with `predicate`
pub(crate) fn find_payment(
    verifier: &dyn CounterpartyVerifier,
    tx: &Transaction,
    address: &str,
    predicate: &dyn Fn(&RecipientMatch) -> bool,
) -> Result<RecipientMatch, TradeFailure> {
    match verifier.find_recipient(tx, address, predicate) {
        RecipientLookup::NotFound => Err(verification(format!(
            "no output pays {}",
            sanitize_for_logging(address)
        ))),
        RecipientLookup::Found { matched, amount_valid: false } => Err(verification(format!(
            "output {} carries an unexpected amount of {} sat",
            matched.vout, matched.value
        ))),
        RecipientLookup::Found { matched, amount_valid: true } => Ok(matched),
    }
}

/// Selection or error for sides that fund with a reservation
pub(crate) fn require_selection<'a>(inputs: &BuildInputs<'a>) -> Result<&'a SelectionResult, TradeFailure> {
    inputs
        .selection
        .ok_or_else(|| internal("no inputs were reserved for this settlement"))
}

pub(crate) fn require_whole_positive(value: Decimal, what: &str) -> Result<(), TradeFailure> {
    if value <= Decimal::ZERO {
        return Err(internal(format!("{} must be positive", what)));
    }
    if !value.fract().is_zero() {
        return Err(internal(format!("{} {} is not a whole number", what, value)));
    }
    Ok(())
}
