//! Core domain types for the trading core
//!
//! Identifiers, trade sides, asset classes and the credential wrapper shared by
//! the reservation and settlement layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Outputs below this value are considered dust
pub const DUST_THRESHOLD: u64 = 546;

/// Standardness weight ceiling for a single transaction
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

/// Virtual size equivalent of [`MAX_STANDARD_TX_WEIGHT`]
pub const MAX_STANDARD_TX_VSIZE: u64 = MAX_STANDARD_TX_WEIGHT / 4;

/// Number of satoshis in one bitcoin
pub const SATOSHIS_PER_BITCOIN: u64 = 100_000_000;

/// Currency code of the settlement asset
pub const XBT_CURRENCY: &str = "XBT";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a wallet (or wallet leaf) owning UTXOs
    WalletId
);

string_id!(
    /// Identifier of a live UTXO reservation
    ReservationId
);

string_id!(
    /// Identifier of a settlement container (settlement or order id)
    SettlementId
);

/// Side of a trade from our point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Asset class of a quoted product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    /// Fiat against fiat, never touches UTXOs
    SpotFx,
    /// Bitcoin against fiat
    SpotXbt,
    /// Colored coins against bitcoin
    PrivateMarket,
}

/// Script type of a wallet leaf
///
/// Multi-leaf wallets must never mix inputs of different types in one
/// transaction, so selection can be restricted to a single type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    NativeSegwit,
    NestedSegwit,
    Legacy,
}

impl AddressType {
    /// Approximate virtual size of an input spending this script type
    pub fn input_vsize(self) -> u64 {
        match self {
            AddressType::NativeSegwit => 68,
            AddressType::NestedSegwit => 91,
            AddressType::Legacy => 148,
        }
    }

    /// Approximate virtual size of an output paying to this script type
    pub fn output_vsize(self) -> u64 {
        match self {
            AddressType::NativeSegwit => 31,
            AddressType::NestedSegwit => 32,
            AddressType::Legacy => 34,
        }
    }
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::NativeSegwit
    }
}

/// Liveness tag of an inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    Normal,
    ZeroConf,
}

/// Wallet password or signing passphrase
///
/// The secret is wiped from memory when dropped and never shown by `Debug`.
#[derive(Clone)]
pub struct Credentials(Zeroizing<String>);

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(*****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_display_and_compare() {
        let a = WalletId::from("wallet-a");
        let b = WalletId::new(String::from("wallet-a"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "wallet-a");
        assert_eq!(a.as_str(), "wallet-a");
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::new("hunter2");
        assert_eq!(format!("{:?}", creds), "Credentials(*****)");
        assert_eq!(creds.expose(), "hunter2");
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
