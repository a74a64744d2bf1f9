//! Control queue of the settlement thread
//!
//! Collaborators answer on threads of their own. Their callbacks never touch a
//! container; they post a [`ControlMessage`] instead, and the owner of the
//! settlement containers drains the queue on its own thread.
//!
//! Every message is stamped with the epoch of the container at the time the
//! request was issued. Cancelling or failing a container advances its epoch,
//! so answers to requests made before that point are recognised as stale and
//! dropped without effect.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::trace;
use std::fmt;

use crate::error::ReservationError;
use crate::providers::{Callback, MonitorEvent, SignError};
use crate::reservation::ReservationToken;
use crate::types::SettlementId;
use crate::utxo_selection::SelectionResult;

/// Generation counter of a settlement container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tracks the current epoch of one container
#[derive(Debug, Default)]
pub struct EpochGuard {
    current: Epoch,
}

impl EpochGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        self.current
    }

    /// Invalidate every outstanding request
    pub fn advance(&mut self) -> Epoch {
        self.current = Epoch(self.current.0 + 1);
        self.current
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current == epoch
    }
}

/// Answer from a collaborator
pub enum ControlPayload {
    FeeEstimated(Result<f32, String>),
    FundsReserved(Result<(ReservationToken, SelectionResult), ReservationError>),
    AddressVerified(Result<bool, String>),
    SpendersResolved(Result<Vec<u8>, SignError>),
    Signed(Result<Vec<u8>, SignError>),
    Broadcast(Result<(), String>),
    Monitor(MonitorEvent),
}

impl ControlPayload {
    pub fn name(&self) -> &'static str {
        match self {
            ControlPayload::FeeEstimated(_) => "fee_estimated",
            ControlPayload::FundsReserved(_) => "funds_reserved",
            ControlPayload::AddressVerified(_) => "address_verified",
            ControlPayload::SpendersResolved(_) => "spenders_resolved",
            ControlPayload::Signed(_) => "signed",
            ControlPayload::Broadcast(_) => "broadcast",
            ControlPayload::Monitor(_) => "monitor",
        }
    }
}

impl fmt::Debug for ControlPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A payload addressed to one container at one epoch
#[derive(Debug)]
pub struct ControlMessage {
    pub settlement_id: SettlementId,
    pub epoch: Epoch,
    pub payload: ControlPayload,
}

/// Receiving end of the control queue
#[derive(Debug)]
pub struct Dispatcher {
    sender: Sender<ControlMessage>,
    receiver: Receiver<ControlMessage>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn poster(&self) -> Poster {
        Poster {
            sender: self.sender.clone(),
        }
    }

    /// Next queued message, if any
    pub fn try_next(&self) -> Option<ControlMessage> {
        match self.receiver.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

/// Sending end of the control queue, cloned into collaborator callbacks
#[derive(Debug, Clone)]
pub struct Poster {
    sender: Sender<ControlMessage>,
}

impl Poster {
    pub fn post(&self, settlement_id: SettlementId, epoch: Epoch, payload: ControlPayload) {
        trace!("Posting {} for {} at {}", payload.name(), settlement_id, epoch);
        // the dispatcher lives as long as the manager; a failed send means it is gone
        let _ = self.sender.send(ControlMessage {
            settlement_id,
            epoch,
            payload,
        });
    }

    /// Callback that posts its argument, wrapped by `wrap`
    pub fn callback<T: Send + 'static>(
        &self,
        settlement_id: SettlementId,
        epoch: Epoch,
        wrap: fn(T) -> ControlPayload,
    ) -> Callback<T> {
        let poster = self.clone();
        Box::new(move |value| poster.post(settlement_id, epoch, wrap(value)))
    }
}
