//! Error handling for the trading core
//!
//! Expected domain failures (insufficient funds, a UTXO already held by another
//! trade, a counterparty transaction that does not verify) are typed results.
//! Each layer has its own `thiserror` enum and [`TradingError`] ties them
//! together for callers that cross layers.
//!
//! Every error maps onto a flat [`ErrorKind`], which is what observers of a
//! settlement see. The kind selects a user-facing template; the detail string
//! carries the raw diagnostic.
//!
//! # Usage
//!
//! ```
//! use bs_trading_core::error::{ErrorKind, TradeFailure};
//!
//! let failure = TradeFailure::new(ErrorKind::VerificationFailed, "recipient not found");
//! assert_eq!(
//!     failure.user_message(),
//!     "Counterparty transaction could not be verified: recipient not found"
//! );
//! ```

use bitcoin::{Amount, OutPoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::settlement::SettlementState;
use crate::types::{ReservationId, SettlementId, WalletId};

/// Flat error taxonomy reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Not enough value even when spending every available UTXO
    InsufficientFunds,
    /// Principal is covered but the fee is not
    InsufficientFundsForFee,
    /// A requested UTXO is held by another reservation
    AlreadyReserved,
    /// Counterparty transaction, amount or address did not verify
    VerificationFailed,
    /// Signer reported an error
    SigningFailed,
    /// User cancelled in the signer
    SigningCancelled,
    /// Network rejected the signed transaction
    BroadcastFailed,
    /// Settlement timer elapsed
    Timeout,
    /// Malformed input or broken invariant
    InternalError,
}

impl ErrorKind {
    /// Template text shown to the user for this kind of failure
    pub fn user_template(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientFunds => "Insufficient funds",
            ErrorKind::InsufficientFundsForFee => "Insufficient funds to pay the network fee",
            ErrorKind::AlreadyReserved => "Funds are already reserved by another trade",
            ErrorKind::VerificationFailed => "Counterparty transaction could not be verified",
            ErrorKind::SigningFailed => "Failed to sign the transaction",
            ErrorKind::SigningCancelled => "Signing was cancelled",
            ErrorKind::BroadcastFailed => "Failed to broadcast the transaction",
            ErrorKind::Timeout => "Settlement timed out",
            ErrorKind::InternalError => "Internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Typed failure payload carried by terminal settlement notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TradeFailure {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Template for the kind with the diagnostic appended
    pub fn user_message(&self) -> String {
        if self.detail.is_empty() {
            self.kind.user_template().to_string()
        } else {
            format!("{}: {}", self.kind.user_template(), self.detail)
        }
    }
}

impl fmt::Display for TradeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Coin selection failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("insufficient funds: available {} sat, required {} sat", .available.to_sat(), .required.to_sat())]
    InsufficientFunds { available: Amount, required: Amount },

    #[error(
        "insufficient funds for fee: available {} sat, required {} sat including {} sat fee",
        .available.to_sat(), .required.to_sat(), .fee.to_sat()
    )]
    InsufficientFundsForFee {
        available: Amount,
        required: Amount,
        fee: Amount,
    },

    #[error("selection target must be positive")]
    ZeroTarget,
}

impl SelectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SelectionError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            SelectionError::InsufficientFundsForFee { .. } => ErrorKind::InsufficientFundsForFee,
            SelectionError::ZeroTarget => ErrorKind::InternalError,
        }
    }
}

/// Reservation table failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("outpoint {outpoint} is already reserved by {holder}")]
    AlreadyReserved {
        outpoint: OutPoint,
        holder: ReservationId,
    },

    #[error("outpoint {outpoint} is not in the inventory of wallet {wallet_id}")]
    NotInInventory {
        outpoint: OutPoint,
        wallet_id: WalletId,
    },

    #[error("reservation id {0} is already in use")]
    DuplicateId(ReservationId),

    #[error("cannot reserve an empty UTXO set")]
    EmptySelection,

    #[error("wallet {0} has never been loaded")]
    UnknownWallet(WalletId),

    #[error("UTXO source failed for wallet {wallet_id}: {message}")]
    Source { wallet_id: WalletId, message: String },

    #[error(transparent)]
    Selection(#[from] SelectionError),
}

impl ReservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReservationError::AlreadyReserved { .. } => ErrorKind::AlreadyReserved,
            ReservationError::Selection(e) => e.kind(),
            _ => ErrorKind::InternalError,
        }
    }
}

/// Settlement command failures
///
/// These are returned to the caller of a command. Failures that happen after a
/// command was accepted are reported as terminal state transitions instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("unknown settlement {0}")]
    UnknownSettlement(SettlementId),

    #[error("settlement {0} already exists")]
    DuplicateSettlement(SettlementId),

    #[error("cannot {operation} settlement {id} in state {state:?}")]
    InvalidState {
        id: SettlementId,
        state: SettlementState,
        operation: &'static str,
    },

    #[error("settlement {0} is not acceptable yet")]
    NotAcceptable(SettlementId),

    #[error("invalid trade parameters: {0}")]
    InvalidParams(String),
}

/// Top-level error type for callers that cross layers
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TradingError {
    /// Error category used for structured logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::Selection(_) => "selection",
            TradingError::Reservation(_) => "reservation",
            TradingError::Settlement(_) => "settlement",
            TradingError::Config(_) => "config",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TradingError::Selection(e) => e.kind(),
            TradingError::Reservation(e) => e.kind(),
            TradingError::Settlement(_) | TradingError::Config(_) => ErrorKind::InternalError,
        }
    }

    /// Message safe to show to a user
    ///
    /// Outpoints and amounts stay out of it; they belong in the logs.
    pub fn user_message(&self) -> String {
        match self {
            TradingError::Settlement(SettlementError::NotAcceptable(_)) => {
                "The trade is not ready to be accepted".to_string()
            }
            TradingError::Settlement(_) => "The trade could not be processed".to_string(),
            TradingError::Config(_) => "Invalid trading configuration".to_string(),
            other => other.kind().user_template().to_string(),
        }
    }
}

impl From<anyhow::Error> for TradingError {
    fn from(err: anyhow::Error) -> Self {
        TradingError::Config(err.to_string())
    }
}
