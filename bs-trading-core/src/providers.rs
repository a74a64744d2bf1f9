//! Interfaces of the external collaborators
//!
//! Wallet UTXO listing, signing, broadcast, counterparty verification and
//! blockchain monitoring live outside this crate. Every long-running call takes
//! a [`Callback`] and may complete on any thread; the settlement layer turns
//! those callbacks into messages on its control queue.

use bitcoin::{Transaction, Txid};

use crate::tx_request::TxRequest;
use crate::types::{Credentials, WalletId};
use crate::utxo_selection::Utxo;

/// One-shot completion handler for an asynchronous call
pub type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Source of the spendable outputs of a wallet
pub trait UtxoSource: Send + Sync {
    fn list_unspent(&self, wallet_id: &WalletId, callback: Callback<Result<Vec<Utxo>, String>>);
}

/// Handle of an outstanding signing request
pub type SignRequestId = u64;

/// Failure reported by the signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    /// The user declined or closed the signing prompt
    Cancelled,
    Failed(String),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::Cancelled => write!(f, "signing cancelled"),
            SignError::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// Signing container
pub trait SigningProvider: Send + Sync {
    /// Resolve public data of the spenders (previous outputs, scripts) of a request
    ///
    /// The returned blob is opaque to this crate and is attached to the
    /// request before signing.
    fn resolve_public_spenders(&self, request: &TxRequest, callback: Callback<Result<Vec<u8>, SignError>>);

    /// Sign the inputs that belong to our wallets
    ///
    /// `request_state` is the JSON snapshot from [`TxRequest::serialize_state`].
    fn sign_partial(
        &self,
        request_state: &str,
        credentials: &Credentials,
        callback: Callback<Result<Vec<u8>, SignError>>,
    ) -> SignRequestId;

    /// Abandon an outstanding request; its callback may still fire
    fn cancel_sign(&self, id: SignRequestId);
}

/// Pushes signed transactions to the network
pub trait Broadcaster: Send + Sync {
    fn push_transaction(&self, signed_tx: &[u8], callback: Callback<Result<(), String>>);
}

/// What an address is being checked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationContext {
    /// The counterparty's CC inputs must descend from this genesis address
    Genesis { lot_size: u64, txid: Option<Txid> },
    /// The counterparty's authentication address must be valid and unrevoked
    AuthAddress,
}

/// Values the amount predicate of [`CounterpartyVerifier::find_recipient`] sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipientMatch {
    pub vout: u32,
    /// Value of the output paying the address
    pub value: u64,
    /// Sum of every other output
    pub value_return: u64,
    /// Sum of all spent inputs
    pub value_input: u64,
}

/// Result of a recipient lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientLookup {
    NotFound,
    Found { matched: RecipientMatch, amount_valid: bool },
}

/// Checks on counterparty-supplied data
pub trait CounterpartyVerifier: Send + Sync {
    fn verify_address(&self, address: &str, context: VerificationContext, callback: Callback<Result<bool, String>>);

    /// Find the output of `tx` paying `address` and evaluate `predicate` on it
    fn find_recipient(
        &self,
        tx: &Transaction,
        address: &str,
        predicate: &dyn Fn(&RecipientMatch) -> bool,
    ) -> RecipientLookup;
}

/// Blockchain notification for a watched settlement address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    PayInDetected { txid: Txid, confirmations: u32 },
    PayOutDetected { confirmations: u32, by_us: bool },
}

/// Handle of an address watch
pub type WatchId = u64;

/// Blockchain watcher
pub trait SettlementMonitor: Send + Sync {
    /// Start watching; the listener may fire many times
    fn watch(&self, address: &str, listener: Box<dyn Fn(MonitorEvent) + Send + Sync>) -> WatchId;

    fn unwatch(&self, id: WatchId);
}
