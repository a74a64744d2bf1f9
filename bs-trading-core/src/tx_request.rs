//! Unsigned transaction requests handed to the signer
//!
//! A [`TxRequest`] is assembled from a selection result, the recipients of a
//! trade and an optional change output. It is validated before it ever leaves
//! the crate, so the signer never sees a request that spends less than it pays.

use bitcoin::{Amount, OutPoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fee_estimation::estimate_vsize;
use crate::types::{AddressType, WalletId};
use crate::utxo_selection::{SelectionResult, Utxo};

/// Virtual size of a 2-of-2 P2WSH settlement input
pub const SETTLEMENT_INPUT_VSIZE: u64 = 105;

/// Reasons a request is rejected before signing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxRequestError {
    #[error("transaction request has no inputs")]
    NoInputs,

    #[error("transaction request has no recipients")]
    NoRecipients,

    #[error("selection produced change but no change address was given")]
    MissingChangeAddress,

    #[error("inputs of {} sat do not cover outputs of {} sat plus {} sat fee", .inputs.to_sat(), .outputs.to_sat(), .fee.to_sat())]
    Overspend { inputs: Amount, outputs: Amount, fee: Amount },
}

/// Output of a transaction request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub amount: Amount,
}

impl Recipient {
    pub fn new(address: impl Into<String>, amount: Amount) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// Output of a settlement transaction spent by the payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementInput {
    pub outpoint: OutPoint,
    pub amount: Amount,
}

/// Unsigned transaction to be signed by our wallets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxRequest {
    pub wallet_ids: Vec<WalletId>,
    pub inputs: Vec<Utxo>,
    /// Shared settlement output spent alongside `inputs`
    pub settlement_input: Option<SettlementInput>,
    pub recipients: Vec<Recipient>,
    pub change: Option<Recipient>,
    pub fee: Amount,
    /// Opaque blob from `resolve_public_spenders`
    pub resolved_spenders: Option<Vec<u8>>,
    /// Counterparty half the signed inputs are merged with
    pub counterparty_tx: Option<Vec<u8>>,
    /// Ask the signer to attach the previous outputs of the inputs
    pub populate_utxos: bool,
    pub output_type: AddressType,
}

impl TxRequest {
    /// Request spending `selection` to `recipients`
    pub fn from_selection(
        wallet_id: &WalletId,
        selection: &SelectionResult,
        recipients: Vec<Recipient>,
        change_address: Option<&str>,
    ) -> Result<Self, TxRequestError> {
        let change = if selection.has_change {
            let address = change_address.ok_or(TxRequestError::MissingChangeAddress)?;
            Some(Recipient::new(address, selection.change))
        } else {
            None
        };

        let request = Self {
            wallet_ids: vec![wallet_id.clone()],
            inputs: selection.selected.clone(),
            recipients,
            change,
            fee: selection.fee,
            populate_utxos: true,
            ..Default::default()
        };
        request.validate()?;
        Ok(request)
    }

    /// Request spending a settlement output to a single recipient
    pub fn payout(wallet_id: &WalletId, input: SettlementInput, recipient: Recipient, fee: Amount) -> Result<Self, TxRequestError> {
        let request = Self {
            wallet_ids: vec![wallet_id.clone()],
            settlement_input: Some(input),
            recipients: vec![recipient],
            fee,
            ..Default::default()
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_counterparty_tx(mut self, tx: Option<Vec<u8>>) -> Self {
        self.counterparty_tx = tx;
        self
    }

    pub fn input_amount(&self) -> Amount {
        let own: Amount = self.inputs.iter().map(|u| u.amount).sum();
        own + self.settlement_input.map(|i| i.amount).unwrap_or(Amount::ZERO)
    }

    pub fn output_amount(&self) -> Amount {
        let paid: Amount = self.recipients.iter().map(|r| r.amount).sum();
        paid + self.change.as_ref().map(|c| c.amount).unwrap_or(Amount::ZERO)
    }

    pub fn output_count(&self) -> usize {
        self.recipients.len() + usize::from(self.change.is_some())
    }

    pub fn validate(&self) -> Result<(), TxRequestError> {
        if self.inputs.is_empty() && self.settlement_input.is_none() {
            return Err(TxRequestError::NoInputs);
        }
        if self.recipients.is_empty() {
            return Err(TxRequestError::NoRecipients);
        }
        let inputs = self.input_amount();
        let outputs = self.output_amount();
        if outputs.checked_add(self.fee).map_or(true, |needed| inputs < needed) {
            return Err(TxRequestError::Overspend {
                inputs,
                outputs,
                fee: self.fee,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Virtual size of our part of the transaction
    pub fn estimated_vsize(&self) -> u64 {
        let settlement = self.settlement_input.map(|_| SETTLEMENT_INPUT_VSIZE);
        estimate_vsize(
            self.inputs.iter().map(Utxo::input_vsize).chain(settlement),
            self.output_count(),
            self.output_type.output_vsize(),
        )
    }

    /// JSON snapshot of the request for the signing collaborator
    pub fn serialize_state(&self) -> Result<String, serde_json::Error> {
        let state = TxRequestState {
            wallet_ids: self.wallet_ids.clone(),
            inputs: self.inputs.clone(),
            settlement_input: self.settlement_input.map(|i| SettlementInputRecord {
                txid: i.outpoint.txid.to_string(),
                vout: i.outpoint.vout,
                amount_sat: i.amount.to_sat(),
            }),
            recipients: self.recipients.iter().map(RecipientRecord::from).collect(),
            change: self.change.as_ref().map(RecipientRecord::from),
            fee_sat: self.fee.to_sat(),
            vsize: self.estimated_vsize(),
            populate_utxos: self.populate_utxos,
            resolved_spenders: self.resolved_spenders.as_ref().map(hex::encode),
            counterparty_tx: self.counterparty_tx.as_ref().map(hex::encode),
        };
        serde_json::to_string(&state)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecipientRecord {
    address: String,
    amount_sat: u64,
}

impl From<&Recipient> for RecipientRecord {
    fn from(recipient: &Recipient) -> Self {
        Self {
            address: recipient.address.clone(),
            amount_sat: recipient.amount.to_sat(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SettlementInputRecord {
    txid: String,
    vout: u32,
    amount_sat: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxRequestState {
    wallet_ids: Vec<WalletId>,
    inputs: Vec<Utxo>,
    settlement_input: Option<SettlementInputRecord>,
    recipients: Vec<RecipientRecord>,
    change: Option<RecipientRecord>,
    fee_sat: u64,
    vsize: u64,
    populate_utxos: bool,
    resolved_spenders: Option<String>,
    counterparty_tx: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee_estimation::FeeSpec;
    use crate::utxo_selection::{CoinSelector, SelectionRequest};
    use bitcoin::Txid;
    use std::str::FromStr;

    fn utxo(tag: &str, sats: u64) -> Utxo {
        Utxo::new(
            OutPoint::new(Txid::from_str(&tag.repeat(64)).unwrap(), 0),
            Amount::from_sat(sats),
            3,
        )
    }

    #[test]
    fn test_from_selection_with_change() {
        let wallet = WalletId::from("w");
        let utxos = vec![utxo("1", 50_000), utxo("2", 30_000), utxo("3", 20_000)];
        let selection = CoinSelector::default()
            .select(&utxos, &SelectionRequest::new(Amount::from_sat(60_000), FeeSpec::Fixed(2_000)))
            .unwrap();

        assert_eq!(
            TxRequest::from_selection(&wallet, &selection, vec![Recipient::new("dest", Amount::from_sat(60_000))], None),
            Err(TxRequestError::MissingChangeAddress)
        );

        let request = TxRequest::from_selection(
            &wallet,
            &selection,
            vec![Recipient::new("dest", Amount::from_sat(60_000))],
            Some("change"),
        )
        .unwrap();
        assert_eq!(request.output_count(), 2);
        assert_eq!(request.change.as_ref().unwrap().amount, Amount::from_sat(8_000));
        assert_eq!(request.input_amount(), request.output_amount() + request.fee);

        let state: serde_json::Value = serde_json::from_str(&request.serialize_state().unwrap()).unwrap();
        assert_eq!(state["fee_sat"], 2_000);
        assert_eq!(state["inputs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_payout_rejects_overspend() {
        let wallet = WalletId::from("w");
        let input = SettlementInput {
            outpoint: OutPoint::new(Txid::from_str(&"a".repeat(64)).unwrap(), 1),
            amount: Amount::from_sat(10_000),
        };
        let result = TxRequest::payout(&wallet, input, Recipient::new("me", Amount::from_sat(9_900)), Amount::from_sat(200));
        assert!(matches!(result, Err(TxRequestError::Overspend { .. })));

        let request = TxRequest::payout(&wallet, input, Recipient::new("me", Amount::from_sat(9_800)), Amount::from_sat(200)).unwrap();
        // overhead, settlement input, one output
        assert_eq!(request.estimated_vsize(), 11 + 105 + 31);
    }
}
