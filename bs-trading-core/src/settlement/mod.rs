//! Settlement containers
//!
//! A settlement container follows one trade through
//! `Created → Activated → VerifyingCounterparty → ReadyToAccept → Signing →
//! Completed`, or ends in `Failed` or `Cancelled` from any earlier state.
//!
//! # Module Structure
//!
//! - `state.rs` - [`SettlementState`]
//! - `params.rs` - [`TradeParams`] and the per-kind terms
//! - `terms.rs` - the [`SettlementTerms`] seam between lifecycle and domain rules
//! - `cc.rs` - colored-coin swap rules
//! - `xbt.rs` - XBT spot settlement rules
//! - `container.rs` - the state machine itself
//! - `manager.rs` - owner of all containers and the control queue
//!
//! Containers never block. Every collaborator answers through the control
//! queue, and the manager delivers the answers on its own thread.

pub mod cc;
pub mod container;
pub mod manager;
pub mod params;
pub mod state;
pub mod terms;
pub mod xbt;

pub use container::{SettlementContainer, SettlementServices};
pub use manager::SettlementManager;
pub use params::{CcTerms, SettlementKind, TradeParams, XbtTerms};
pub use state::SettlementState;
pub use terms::{Completion, Funding, PayIn, SettlementTerms};
