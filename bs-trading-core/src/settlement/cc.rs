//! Colored-coin settlement rules
//!
//! Both parties build one half of a single swap transaction. The seller of
//! the token contributes token inputs spent with an exact match and no fee;
//! the buyer contributes bitcoin and pays the fee. Each side verifies the
//! counterparty half before signing its own and hands the signed half on.

use bitcoin::{Amount, Transaction};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::SettlementConfig;
use crate::error::TradeFailure;
use crate::providers::{CounterpartyVerifier, RecipientMatch, VerificationContext};
use crate::reservation::ReservationPurpose;
use crate::settlement::params::{CcTerms, TradeParams};
use crate::settlement::terms::{
    find_payment, internal, require_address, require_counterparty_tx, require_selection, require_whole_positive,
    xbt_sats, BuildInputs, Completion, Funding, PayIn, SettlementTerms,
};
use crate::tx_request::{Recipient, TxRequest};
use crate::types::Side;

impl CcTerms {
    /// Token amount in satoshis: quantity times lot size
    pub fn token_amount(&self, trade: &TradeParams) -> Result<Amount, TradeFailure> {
        if self.lot_size == 0 {
            return Err(internal("lot size is zero"));
        }
        let sats = trade.quantity * Decimal::from(self.lot_size);
        sats.to_u64()
            .filter(|s| *s > 0)
            .map(Amount::from_sat)
            .ok_or_else(|| internal(format!("invalid token quantity {}", trade.quantity)))
    }

    /// Bitcoin the token buyer pays
    pub fn payment_amount(&self, trade: &TradeParams) -> Result<Amount, TradeFailure> {
        xbt_sats(trade.quantity * trade.price, "payment")
    }

    /// Counterparty pays us bitcoin within tolerance and leaves a fee
    fn payment_matches(expected: Amount, tolerance: u64, m: &RecipientMatch) -> bool {
        m.value.abs_diff(expected.to_sat()) <= tolerance && m.value_input > m.value + m.value_return
    }

    /// Counterparty delivers exactly `quantity` lots and pays no fee from token inputs
    fn delivery_matches(&self, quantity: Decimal, m: &RecipientMatch) -> bool {
        self.lot_size != 0
            && m.value % self.lot_size == 0
            && Decimal::from(m.value / self.lot_size) == quantity
            && m.value_input == m.value + m.value_return
    }
}

impl SettlementTerms for CcTerms {
    fn validate(&self, trade: &TradeParams) -> Result<(), TradeFailure> {
        if self.lot_size == 0 {
            return Err(internal("lot size is zero"));
        }
        require_whole_positive(trade.quantity, "quantity")?;
        if trade.price <= Decimal::ZERO {
            return Err(internal(format!("invalid price {}", trade.price)));
        }
        require_address(&trade.own_recv_address, "receiving address")?;
        require_address(&self.counterparty_recv_address, "counterparty receiving address")?;
        if trade.side == Side::Buy {
            require_address(&self.genesis_address, "genesis address")?;
        }
        if trade.counterparty_tx.is_none() {
            return Err(internal("missing counterparty transaction"));
        }
        Ok(())
    }

    fn check_counterparty(
        &self,
        trade: &TradeParams,
        tx: Option<&Transaction>,
        verifier: &dyn CounterpartyVerifier,
        config: &SettlementConfig,
    ) -> Result<Option<PayIn>, TradeFailure> {
        let tx = require_counterparty_tx(tx)?;
        match trade.side {
            Side::Sell => {
                let expected = self.payment_amount(trade)?;
                let tolerance = config.cc_price_tolerance_sat;
                find_payment(verifier, tx, &trade.own_recv_address, &|m| {
                    Self::payment_matches(expected, tolerance, m)
                })?;
            }
            Side::Buy => {
                let quantity = trade.quantity;
                find_payment(verifier, tx, &trade.own_recv_address, &|m| self.delivery_matches(quantity, m))?;
            }
        }
        Ok(None)
    }

    fn address_check(&self, trade: &TradeParams) -> Option<(String, VerificationContext)> {
        match trade.side {
            Side::Buy => Some((
                self.genesis_address.clone(),
                VerificationContext::Genesis {
                    lot_size: self.lot_size,
                    txid: None,
                },
            )),
            Side::Sell => None,
        }
    }

    fn needs_fee_estimate(&self, trade: &TradeParams) -> bool {
        trade.side == Side::Buy
    }

    fn funding(&self, trade: &TradeParams) -> Result<Funding, TradeFailure> {
        Ok(match trade.side {
            Side::Sell => Funding::BestSet {
                target: self.token_amount(trade)?,
                exact_match: true,
                zero_fee: true,
                purpose: ReservationPurpose::CcSpend,
            },
            Side::Buy => Funding::BestSet {
                target: self.payment_amount(trade)?,
                exact_match: false,
                zero_fee: false,
                purpose: ReservationPurpose::XbtSpend,
            },
        })
    }

    fn watch_address(&self, _trade: &TradeParams) -> Option<String> {
        None
    }

    fn requires_pay_in_detection(&self, _trade: &TradeParams) -> bool {
        false
    }

    fn build_request(&self, trade: &TradeParams, inputs: &BuildInputs<'_>) -> Result<TxRequest, TradeFailure> {
        let selection = require_selection(inputs)?;
        let amount = match trade.side {
            Side::Sell => self.token_amount(trade)?,
            Side::Buy => self.payment_amount(trade)?,
        };
        let recipients = vec![Recipient::new(self.counterparty_recv_address.clone(), amount)];
        let request = TxRequest::from_selection(&trade.wallet_id, selection, recipients, trade.change_address.as_deref())?
            .with_counterparty_tx(trade.counterparty_tx.clone());
        Ok(request)
    }

    fn completion(&self, _trade: &TradeParams) -> Completion {
        Completion::HandOff
    }
}
