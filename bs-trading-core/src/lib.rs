//! BlockSettle trading core
//!
//! UTXO reservation, coin selection and trade settlement for the BlockSettle
//! terminal.
//!
//! # Modules
//!
//! - `types`: identifiers, sides, asset and address types, credentials
//! - `error`: layered error types and the flat [`ErrorKind`] taxonomy
//! - `logging`: structured logging over `log` and `env_logger`
//! - `config`: TOML configuration
//! - `events`: event buses for reservation and settlement observers
//! - `clock`: injectable time source for settlement timers
//! - `fee_estimation`: fee estimator seam and fee arithmetic
//! - `providers`: interfaces of wallet, signer, network and verification services
//! - `utxo_selection`: deterministic coin selection
//! - `utxo_inventory`: per-wallet snapshot of spendable outputs
//! - `reservation`: exclusive UTXO reservations and RFQ holds
//! - `dispatcher`: epoch-stamped control queue
//! - `tx_request`: unsigned transaction requests
//! - `settlement`: CC and XBT settlement containers
//! - `session`: the trading session tying it all together
//!
//! # Concurrency
//!
//! All containers live on the thread that owns the [`TradingSession`].
//! Collaborators may answer on any thread; their answers are queued and
//! delivered by [`TradingSession::run_until_idle`]. The reservation table is
//! the only state shared across threads and sits behind a single mutex.

/// Core domain types
pub mod types;

/// Error types
pub mod error;

/// Structured logging
pub mod logging;

/// Configuration management
pub mod config;

/// Event buses
pub mod events;

/// Time source
pub mod clock;

/// Fee estimation and arithmetic
pub mod fee_estimation;

/// Collaborator interfaces
pub mod providers;

/// Coin selection
pub mod utxo_selection;

/// UTXO inventory
pub mod utxo_inventory;

/// UTXO reservations
pub mod reservation;

/// Control queue
pub mod dispatcher;

/// Transaction requests
pub mod tx_request;

/// Settlement containers
pub mod settlement;

/// Trading session
pub mod session;

pub use config::Config;
pub use error::{ErrorKind, ReservationError, SelectionError, SettlementError, TradeFailure, TradingError};
pub use events::{CancelReason, SettlementEvent, UtxoEvent};
pub use reservation::{BestSetRequest, ReservationManager, ReservationPurpose, ReservationToken, RfqRequest};
pub use session::{Collaborators, TradingSession};
pub use settlement::{SettlementManager, SettlementState, TradeParams};
pub use types::{Credentials, ReservationId, SettlementId, Side, WalletId};
pub use utxo_selection::{CoinSelector, SelectionRequest, SelectionResult, Utxo};

pub use bitcoin::{Amount, OutPoint, Transaction, Txid};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging from `config`
///
/// Safe to call more than once; only the first call has an effect.
pub fn init(config: &Config) -> Result<(), String> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = logging::init(&config.logging).map_err(|e| format!("Failed to initialize logging: {}", e));
    });
    result
}
