//! XBT spot settlement rules
//!
//! The paying side funds a pay-in to the shared settlement address and
//! broadcasts it. The receiving side checks the counterparty pay-in, waits for
//! it to show up on chain and then spends the settlement output to itself.

use bitcoin::{Amount, OutPoint, Transaction};
use rust_decimal::Decimal;

use crate::config::SettlementConfig;
use crate::error::{ErrorKind, TradeFailure};
use crate::fee_estimation::{fee_for_vsize, TX_OVERHEAD_VSIZE};
use crate::providers::{CounterpartyVerifier, VerificationContext};
use crate::reservation::ReservationPurpose;
use crate::settlement::params::{TradeParams, XbtTerms};
use crate::settlement::terms::{
    find_payment, internal, require_address, require_counterparty_tx, require_selection, xbt_sats, BuildInputs,
    Completion, Funding, PayIn, SettlementTerms,
};
use crate::tx_request::{Recipient, SettlementInput, TxRequest, SETTLEMENT_INPUT_VSIZE};
use crate::types::{AddressType, Side, XBT_CURRENCY};

impl XbtTerms {
    /// Bitcoin changing hands
    ///
    /// Quantities in another currency are converted at the trade price.
    pub fn xbt_amount(&self, trade: &TradeParams) -> Result<Amount, TradeFailure> {
        let btc = if trade.product == XBT_CURRENCY {
            trade.quantity
        } else {
            trade
                .quantity
                .checked_div(trade.price)
                .ok_or_else(|| internal(format!("invalid price {}", trade.price)))?
        };
        xbt_sats(btc, "settlement")
    }

    /// Whether we fund the pay-in
    pub fn we_pay(&self, trade: &TradeParams) -> bool {
        (trade.side == Side::Buy) != (trade.product == XBT_CURRENCY)
    }

    fn payout_fee(rate: f32) -> Amount {
        let vsize = TX_OVERHEAD_VSIZE + SETTLEMENT_INPUT_VSIZE + AddressType::default().output_vsize();
        fee_for_vsize(rate, vsize)
    }
}

impl SettlementTerms for XbtTerms {
    fn validate(&self, trade: &TradeParams) -> Result<(), TradeFailure> {
        if trade.quantity <= Decimal::ZERO {
            return Err(internal("quantity must be positive"));
        }
        if trade.product != XBT_CURRENCY && trade.price <= Decimal::ZERO {
            return Err(internal(format!("invalid price {}", trade.price)));
        }
        self.xbt_amount(trade)?;
        require_address(&self.settlement_address, "settlement address")?;
        require_address(&self.counterparty_auth_address, "counterparty auth address")?;
        if !self.we_pay(trade) {
            require_address(&trade.own_recv_address, "receiving address")?;
            if trade.counterparty_tx.is_none() {
                return Err(internal("missing counterparty pay-in"));
            }
        }
        Ok(())
    }

    fn check_counterparty(
        &self,
        trade: &TradeParams,
        tx: Option<&Transaction>,
        verifier: &dyn CounterpartyVerifier,
        _config: &SettlementConfig,
    ) -> Result<Option<PayIn>, TradeFailure> {
        if self.we_pay(trade) {
            return Ok(None);
        }

        let tx = require_counterparty_tx(tx)?;
        let expected = self.xbt_amount(trade)?.to_sat();
        let matched = find_payment(verifier, tx, &self.settlement_address, &|m| m.value == expected)?;
        Ok(Some(PayIn {
            txid: tx.txid(),
            vout: matched.vout,
            value: Amount::from_sat(matched.value),
        }))
    }

    fn address_check(&self, _trade: &TradeParams) -> Option<(String, VerificationContext)> {
        Some((self.counterparty_auth_address.clone(), VerificationContext::AuthAddress))
    }

    fn needs_fee_estimate(&self, _trade: &TradeParams) -> bool {
        true
    }

    fn funding(&self, trade: &TradeParams) -> Result<Funding, TradeFailure> {
        if !self.we_pay(trade) {
            return Ok(Funding::None);
        }
        let target = self.xbt_amount(trade)?;
        if self.fixed_inputs.is_empty() {
            Ok(Funding::BestSet {
                target,
                exact_match: false,
                zero_fee: false,
                purpose: ReservationPurpose::XbtSpend,
            })
        } else {
            Ok(Funding::Fixed {
                utxos: self.fixed_inputs.clone(),
                target,
            })
        }
    }

    fn watch_address(&self, _trade: &TradeParams) -> Option<String> {
        Some(self.settlement_address.clone())
    }

    fn requires_pay_in_detection(&self, trade: &TradeParams) -> bool {
        !self.we_pay(trade)
    }

    fn build_request(&self, trade: &TradeParams, inputs: &BuildInputs<'_>) -> Result<TxRequest, TradeFailure> {
        if self.we_pay(trade) {
            let selection = require_selection(inputs)?;
            let recipients = vec![Recipient::new(self.settlement_address.clone(), self.xbt_amount(trade)?)];
            return Ok(TxRequest::from_selection(
                &trade.wallet_id,
                selection,
                recipients,
                trade.change_address.as_deref(),
            )?);
        }

        let pay_in = inputs.pay_in.ok_or_else(|| internal("counterparty pay-in is unknown"))?;
        let rate = inputs.fee_rate.ok_or_else(|| internal("fee rate is unknown"))?;
        let fee = Self::payout_fee(rate);
        let received = pay_in
            .value
            .checked_sub(fee)
            .filter(|amount| amount.to_sat() >= inputs.dust_threshold)
            .ok_or_else(|| {
                TradeFailure::new(
                    ErrorKind::InsufficientFundsForFee,
                    format!("pay-in of {} sat cannot cover a {} sat fee", pay_in.value.to_sat(), fee.to_sat()),
                )
            })?;

        let input = SettlementInput {
            outpoint: OutPoint::new(pay_in.txid, pay_in.vout),
            amount: pay_in.value,
        };
        Ok(TxRequest::payout(
            &trade.wallet_id,
            input,
            Recipient::new(trade.own_recv_address.clone(), received),
            fee,
        )?)
    }

    fn completion(&self, trade: &TradeParams) -> Completion {
        Completion::Broadcast {
            announce_pay_in: self.we_pay(trade),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::params::SettlementKind;
    use crate::types::{SettlementId, WalletId};
    use bitcoin::Txid;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn trade(side: Side, product: &str) -> (TradeParams, XbtTerms) {
        let terms = XbtTerms {
            settlement_address: "settle".to_string(),
            counterparty_auth_address: "auth".to_string(),
            fixed_inputs: Vec::new(),
        };
        let params = TradeParams {
            settlement_id: SettlementId::from("xbt"),
            side,
            product: product.to_string(),
            quantity: dec!(1000),
            price: dec!(20000),
            wallet_id: WalletId::from("w"),
            own_recv_address: "us".to_string(),
            change_address: Some("change".to_string()),
            counterparty_tx: None,
            kind: SettlementKind::Xbt(terms.clone()),
        };
        (params, terms)
    }

    #[test]
    fn test_who_pays() {
        let (params, terms) = trade(Side::Buy, "EUR");
        assert!(terms.we_pay(&params));
        assert_eq!(terms.xbt_amount(&params).unwrap(), Amount::from_sat(5_000_000));

        let (params, terms) = trade(Side::Sell, "XBT");
        assert!(terms.we_pay(&params));
        assert_eq!(terms.xbt_amount(&params).unwrap(), Amount::from_sat(100_000_000_000));

        let (params, terms) = trade(Side::Buy, "XBT");
        assert!(!terms.we_pay(&params));
        assert_eq!(terms.funding(&params).unwrap(), Funding::None);
        // the receiver needs the counterparty pay-in
        assert!(terms.validate(&params).is_err());
    }

    #[test]
    fn test_payout_deducts_fee() {
        let (params, terms) = trade(Side::Sell, "EUR");
        let pay_in = PayIn {
            txid: Txid::from_str(&"c".repeat(64)).unwrap(),
            vout: 1,
            value: Amount::from_sat(5_000_000),
        };
        let inputs = BuildInputs {
            selection: None,
            pay_in: Some(&pay_in),
            fee_rate: Some(2.0),
            dust_threshold: 546,
        };

        let request = terms.build_request(&params, &inputs).unwrap();
        assert_eq!(request.fee, Amount::from_sat(2 * (11 + 105 + 31)));
        assert_eq!(request.recipients[0].amount, Amount::from_sat(5_000_000 - 294));

        let tiny = PayIn {
            value: Amount::from_sat(800),
            ..pay_in
        };
        let failure = terms
            .build_request(
                &params,
                &BuildInputs {
                    pay_in: Some(&tiny),
                    ..inputs
                },
            )
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::InsufficientFundsForFee);
    }
}
