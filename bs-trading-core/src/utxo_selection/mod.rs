//! UTXO selection module
//!
//! Picks the inputs of a transaction from a snapshot of spendable outputs.
//!
//! # Module Structure
//!
//! - `types.rs` - [`Utxo`], [`SelectionRequest`] and [`SelectionResult`]
//! - `selector.rs` - the deterministic [`CoinSelector`]
//! - `utils.rs` - ordering, size and fee helpers shared with transaction building
//!
//! Selection works on a snapshot and holds no state. Keeping chosen coins away
//! from concurrent trades is the job of the
//! [`ReservationManager`](crate::reservation::ReservationManager), which runs
//! the selector and the reservation under a single lock.
//!
//! # Typical Usage
//!
//! ```
//! use bs_trading_core::fee_estimation::FeeSpec;
//! use bs_trading_core::utxo_selection::{CoinSelector, SelectionRequest, Utxo};
//! use bitcoin::{Amount, OutPoint, Txid};
//! use std::str::FromStr;
//!
//! let utxos = vec![Utxo::new(
//!     OutPoint::new(Txid::from_str(&"1".repeat(64)).unwrap(), 0),
//!     Amount::from_sat(50_000),
//!     6,
//! )];
//!
//! let request = SelectionRequest::new(Amount::from_sat(20_000), FeeSpec::PerVbyte(2.0));
//! let result = CoinSelector::default().select(&utxos, &request).unwrap();
//! assert!(result.has_change);
//! ```

pub mod selector;
pub mod types;
pub mod utils;

pub use selector::CoinSelector;
pub use types::{SelectionRequest, SelectionResult, Utxo};
