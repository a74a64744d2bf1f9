//! Trade parameters of a settlement

use rust_decimal::Decimal;

use crate::settlement::terms::SettlementTerms;
use crate::types::{SettlementId, Side, WalletId};
use crate::utxo_selection::Utxo;

/// Everything a container needs to know about the trade it settles
#[derive(Debug, Clone, PartialEq)]
pub struct TradeParams {
    pub settlement_id: SettlementId,
    /// Our side of the trade
    pub side: Side,
    /// Currency or token the quantity is expressed in
    pub product: String,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Wallet our inputs are drawn from
    pub wallet_id: WalletId,
    /// Where we receive what we bought
    pub own_recv_address: String,
    pub change_address: Option<String>,
    /// Serialized counterparty transaction, when the trade has one
    pub counterparty_tx: Option<Vec<u8>>,
    pub kind: SettlementKind,
}

impl TradeParams {
    /// Domain rules of this kind of settlement
    pub fn terms(&self) -> &dyn SettlementTerms {
        match &self.kind {
            SettlementKind::ColoredCoin(terms) => terms,
            SettlementKind::Xbt(terms) => terms,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SettlementKind::ColoredCoin(_) => "cc",
            SettlementKind::Xbt(_) => "xbt",
        }
    }
}

/// Flavour of settlement
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementKind {
    ColoredCoin(CcTerms),
    Xbt(XbtTerms),
}

/// Colored-coin swap against bitcoin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcTerms {
    /// Satoshis per token unit
    pub lot_size: u64,
    /// Origin address every genuine token descends from
    pub genesis_address: String,
    /// Where our half pays the counterparty
    pub counterparty_recv_address: String,
}

/// Bitcoin leg of a spot trade settled through a shared settlement address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XbtTerms {
    pub settlement_address: String,
    pub counterparty_auth_address: String,
    /// Inputs chosen by the user; spent in full instead of a best set
    pub fixed_inputs: Vec<Utxo>,
}
