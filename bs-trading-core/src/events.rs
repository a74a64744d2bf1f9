//! Event buses for reservation and settlement observers
//!
//! The trading core never calls into the UI. Instead it publishes domain events
//! on a bus and observers hold `Receiver`s obtained from [`EventBus::subscribe`].
//! Subscriptions are keyed by topic name, with `"all"` receiving everything.
//!
//! Events carry no secrets. Outpoints are transported as [`OutPointInfo`] so
//! events serialize without enabling serde support in `bitcoin`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::{ErrorKind, TradeFailure};
use crate::reservation::ReservationPurpose;
use crate::settlement::SettlementState;
use crate::types::{ReservationId, SettlementId, WalletId};

const ALL_TOPIC: &str = "all";

/// An event that can be routed by topic
pub trait BusEvent: Clone + Send + 'static {
    /// Topic name subscribers use to receive this event
    fn topic(&self) -> &'static str;
}

/// Serializable representation of a Bitcoin OutPoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPointInfo {
    /// Transaction ID as a string
    pub txid: String,
    /// Output index
    pub vout: u32,
}

impl From<&bitcoin::OutPoint> for OutPointInfo {
    fn from(outpoint: &bitcoin::OutPoint) -> Self {
        Self {
            txid: outpoint.txid.to_string(),
            vout: outpoint.vout,
        }
    }
}

/// UTXO inventory and reservation events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UtxoEvent {
    /// A set of UTXOs is now held exclusively
    ReservationAcquired {
        reservation_id: ReservationId,
        wallet_id: WalletId,
        purpose: ReservationPurpose,
        utxos: Vec<OutPointInfo>,
        total_sat: u64,
    },
    /// A reservation was released and its UTXOs are selectable again
    ReservationReleased {
        reservation_id: ReservationId,
        wallet_id: WalletId,
        utxos: Vec<OutPointInfo>,
    },
    /// The spendable set of a wallet changed after a refresh
    BalanceChanged {
        wallet_id: WalletId,
        available_sat: u64,
        utxo_count: usize,
    },
    /// A best-set request could not be satisfied
    SelectionFailed {
        wallet_id: WalletId,
        kind: ErrorKind,
        reason: String,
        target_sat: u64,
    },
}

impl BusEvent for UtxoEvent {
    fn topic(&self) -> &'static str {
        match self {
            UtxoEvent::ReservationAcquired { .. } => "reservation_acquired",
            UtxoEvent::ReservationReleased { .. } => "reservation_released",
            UtxoEvent::BalanceChanged { .. } => "balance_changed",
            UtxoEvent::SelectionFailed { .. } => "selection_failed",
        }
    }
}

/// Why a settlement ended up in `Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// Explicit `cancel()` from the orchestration layer
    User,
    /// Timer elapsed before the trade became acceptable
    Timeout,
    /// User declined in the signer
    SigningCancelled,
}

/// Settlement lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementEvent {
    StateChanged {
        settlement_id: SettlementId,
        state: SettlementState,
    },
    /// The trade became acceptable (or stopped being so)
    AcceptableChanged {
        settlement_id: SettlementId,
        acceptable: bool,
    },
    Completed {
        settlement_id: SettlementId,
    },
    Failed {
        settlement_id: SettlementId,
        failure: TradeFailure,
    },
    Cancelled {
        settlement_id: SettlementId,
        reason: CancelReason,
    },
    /// Signed half of a CC swap, ready to hand to the counterparty
    SignedHalfReady {
        settlement_id: SettlementId,
        signed_tx_hex: String,
    },
    /// Own pay-in was pushed to the network
    PayInBroadcast {
        settlement_id: SettlementId,
        txid: String,
    },
    /// Counterparty pay-in seen on the settlement address
    PayInDetected {
        settlement_id: SettlementId,
        confirmations: u32,
    },
    /// Settlement address was spent
    PayOutDetected {
        settlement_id: SettlementId,
        confirmations: u32,
        by_us: bool,
    },
}

impl BusEvent for SettlementEvent {
    fn topic(&self) -> &'static str {
        match self {
            SettlementEvent::StateChanged { .. } => "state_changed",
            SettlementEvent::AcceptableChanged { .. } => "acceptable_changed",
            SettlementEvent::Completed { .. } => "completed",
            SettlementEvent::Failed { .. } => "failed",
            SettlementEvent::Cancelled { .. } => "cancelled",
            SettlementEvent::SignedHalfReady { .. } => "signed_half_ready",
            SettlementEvent::PayInBroadcast { .. } => "pay_in_broadcast",
            SettlementEvent::PayInDetected { .. } => "pay_in_detected",
            SettlementEvent::PayOutDetected { .. } => "pay_out_detected",
        }
    }
}

impl SettlementEvent {
    pub fn settlement_id(&self) -> &SettlementId {
        match self {
            SettlementEvent::StateChanged { settlement_id, .. }
            | SettlementEvent::AcceptableChanged { settlement_id, .. }
            | SettlementEvent::Completed { settlement_id }
            | SettlementEvent::Failed { settlement_id, .. }
            | SettlementEvent::Cancelled { settlement_id, .. }
            | SettlementEvent::SignedHalfReady { settlement_id, .. }
            | SettlementEvent::PayInBroadcast { settlement_id, .. }
            | SettlementEvent::PayInDetected { settlement_id, .. }
            | SettlementEvent::PayOutDetected { settlement_id, .. } => settlement_id,
        }
    }

    /// Whether this is one of the three terminal notifications
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementEvent::Completed { .. }
                | SettlementEvent::Failed { .. }
                | SettlementEvent::Cancelled { .. }
        )
    }
}

/// Topic-based message bus
///
/// Cloning the bus yields another handle onto the same subscriber table.
pub struct EventBus<E: BusEvent> {
    subscribers: Arc<Mutex<HashMap<String, Vec<Sender<E>>>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to all events
    pub fn subscribe_all(&self) -> Receiver<E> {
        self.subscribe(ALL_TOPIC)
    }

    /// Subscribe to one topic, e.g. `"reservation_released"` or `"completed"`
    pub fn subscribe(&self, topic: &str) -> Receiver<E> {
        let (sender, receiver) = channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .entry(topic.to_lowercase())
            .or_insert_with(Vec::new)
            .push(sender);
        receiver
    }

    /// Publish an event to its topic and to `"all"`
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: E) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for topic in [event.topic(), ALL_TOPIC] {
            if let Some(senders) = subscribers.get_mut(topic) {
                senders.retain(|sender| sender.send(event.clone()).is_ok());
            }
        }
    }

    /// Get the number of subscribers
    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.values().map(|v| v.len()).sum()
    }
}

pub type UtxoEventBus = EventBus<UtxoEvent>;
pub type SettlementEventBus = EventBus<SettlementEvent>;
