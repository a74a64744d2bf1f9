//! Shared fixtures and mock collaborators for integration tests

#![allow(dead_code)]

use bitcoin::absolute::LockTime;
use bitcoin::consensus::serialize;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once};

use bs_trading_core::clock::ManualClock;
use bs_trading_core::config::Config;
use bs_trading_core::fee_estimation::FeeEstimator;
use bs_trading_core::logging::{self, LogConfig, LogLevel};
use bs_trading_core::providers::{
    Broadcaster, Callback, CounterpartyVerifier, MonitorEvent, RecipientLookup, RecipientMatch, SettlementMonitor,
    SignError, SignRequestId, SigningProvider, UtxoSource, VerificationContext, WatchId,
};
use bs_trading_core::session::{Collaborators, TradingSession};
use bs_trading_core::tx_request::TxRequest;
use bs_trading_core::types::{Credentials, WalletId};
use bs_trading_core::utxo_selection::Utxo;

static INIT_LOGGER: Once = Once::new();

/// Initialize logging once for the whole test binary
pub fn setup() {
    INIT_LOGGER.call_once(|| {
        let config = LogConfig {
            level: LogLevel::Error,
            log_file: None,
            include_timestamps: false,
            include_source_location: false,
            json_format: false,
        };
        let _ = logging::init(&config);
    });
}

pub fn txid(tag: &str) -> Txid {
    Txid::from_str(&tag.repeat(64 / tag.len())).unwrap()
}

pub fn utxo(tag: &str, vout: u32, sats: u64) -> Utxo {
    Utxo::new(OutPoint::new(txid(tag), vout), Amount::from_sat(sats), 6)
}

/// Transaction paying `value` to `address`, plus a second output of `other`
///
/// Mock addresses are the raw bytes of the output script.
pub fn tx_paying(address: &str, value: u64, other: u64) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid("e"), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value,
                script_pubkey: ScriptBuf::from(address.as_bytes().to_vec()),
            },
            TxOut {
                value: other,
                script_pubkey: ScriptBuf::from(b"elsewhere".to_vec()),
            },
        ],
    }
}

pub fn tx_bytes(tx: &Transaction) -> Vec<u8> {
    serialize(tx)
}

/// UTXO source answering from a table, optionally holding answers back
#[derive(Default)]
pub struct MockUtxoSource {
    utxos: Mutex<HashMap<WalletId, Vec<Utxo>>>,
    deferred: Mutex<bool>,
    held: Mutex<Vec<(WalletId, Callback<Result<Vec<Utxo>, String>>)>>,
}

impl MockUtxoSource {
    pub fn set(&self, wallet_id: &WalletId, utxos: Vec<Utxo>) {
        self.utxos.lock().unwrap().insert(wallet_id.clone(), utxos);
    }

    pub fn defer(&self, deferred: bool) {
        *self.deferred.lock().unwrap() = deferred;
    }

    /// Answer held requests in the order they were made
    pub fn release_held(&self) -> usize {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        let count = held.len();
        for (wallet_id, callback) in held {
            callback(Ok(self.snapshot(&wallet_id)));
        }
        count
    }

    /// Answer only the first held request
    pub fn release_first(&self) {
        let first = {
            let mut held = self.held.lock().unwrap();
            if held.is_empty() {
                None
            } else {
                Some(held.remove(0))
            }
        };
        if let Some((wallet_id, callback)) = first {
            callback(Ok(self.snapshot(&wallet_id)));
        }
    }

    fn snapshot(&self, wallet_id: &WalletId) -> Vec<Utxo> {
        self.utxos.lock().unwrap().get(wallet_id).cloned().unwrap_or_default()
    }
}

impl UtxoSource for MockUtxoSource {
    fn list_unspent(&self, wallet_id: &WalletId, callback: Callback<Result<Vec<Utxo>, String>>) {
        if *self.deferred.lock().unwrap() {
            self.held.lock().unwrap().push((wallet_id.clone(), callback));
        } else {
            callback(Ok(self.snapshot(wallet_id)));
        }
    }
}

/// Fee estimator with a settable answer
pub struct MockFeeEstimator {
    rate: Mutex<Result<f32, String>>,
    hold: Mutex<bool>,
    held: Mutex<Vec<Callback<Result<f32, String>>>>,
}

impl MockFeeEstimator {
    pub fn new(rate: f32) -> Self {
        Self {
            rate: Mutex::new(Ok(rate)),
            hold: Mutex::new(false),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn set_rate(&self, rate: Result<f32, String>) {
        *self.rate.lock().unwrap() = rate;
    }

    pub fn hold(&self, hold: bool) {
        *self.hold.lock().unwrap() = hold;
    }

    pub fn release_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        let rate = self.rate.lock().unwrap().clone();
        for callback in held {
            callback(rate.clone());
        }
    }
}

impl FeeEstimator for MockFeeEstimator {
    fn estimate_fee_per_byte(&self, _target_blocks: u32, callback: Callback<Result<f32, String>>) {
        if *self.hold.lock().unwrap() {
            self.held.lock().unwrap().push(callback);
            return;
        }
        let rate = self.rate.lock().unwrap().clone();
        callback(rate);
    }
}

/// How the mock signer answers `sign_partial`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignBehaviour {
    Sign,
    Cancel,
    Fail(String),
    Hold,
}

pub struct MockSigner {
    behaviour: Mutex<SignBehaviour>,
    signed_tx: Vec<u8>,
    next_id: Mutex<SignRequestId>,
    held: Mutex<Vec<Callback<Result<Vec<u8>, SignError>>>>,
    /// Request snapshots as the signer received them
    pub requests: Mutex<Vec<serde_json::Value>>,
    pub cancelled: Mutex<Vec<SignRequestId>>,
    pub passwords: Mutex<Vec<String>>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self {
            behaviour: Mutex::new(SignBehaviour::Sign),
            signed_tx: tx_bytes(&tx_paying("signed", 1_000, 0)),
            next_id: Mutex::new(1),
            held: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            passwords: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behaviour(&self, behaviour: SignBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn signed_tx(&self) -> &[u8] {
        &self.signed_tx
    }

    /// Complete held requests as if the user had signed
    pub fn release_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for callback in held {
            callback(Ok(self.signed_tx.clone()));
        }
    }
}

impl SigningProvider for MockSigner {
    fn resolve_public_spenders(&self, _request: &TxRequest, callback: Callback<Result<Vec<u8>, SignError>>) {
        callback(Ok(b"resolved".to_vec()));
    }

    fn sign_partial(
        &self,
        request_state: &str,
        credentials: &Credentials,
        callback: Callback<Result<Vec<u8>, SignError>>,
    ) -> SignRequestId {
        let state = serde_json::from_str(request_state).expect("signer received malformed request state");
        self.requests.lock().unwrap().push(state);
        self.passwords.lock().unwrap().push(credentials.expose().to_string());

        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };

        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            SignBehaviour::Sign => callback(Ok(self.signed_tx.clone())),
            SignBehaviour::Cancel => callback(Err(SignError::Cancelled)),
            SignBehaviour::Fail(reason) => callback(Err(SignError::Failed(reason))),
            SignBehaviour::Hold => self.held.lock().unwrap().push(callback),
        }
        id
    }

    fn cancel_sign(&self, id: SignRequestId) {
        self.cancelled.lock().unwrap().push(id);
    }
}

pub struct MockBroadcaster {
    result: Mutex<Result<(), String>>,
    pub pushed: Mutex<Vec<Vec<u8>>>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(Ok(())),
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_result(&self, result: Result<(), String>) {
        *self.result.lock().unwrap() = result;
    }
}

impl Broadcaster for MockBroadcaster {
    fn push_transaction(&self, signed_tx: &[u8], callback: Callback<Result<(), String>>) {
        self.pushed.lock().unwrap().push(signed_tx.to_vec());
        let result = self.result.lock().unwrap().clone();
        callback(result);
    }
}

/// Verifier treating output scripts as address bytes
pub struct MockVerifier {
    address_valid: Mutex<Result<bool, String>>,
    hold: Mutex<bool>,
    held: Mutex<Vec<Callback<Result<bool, String>>>>,
    /// Overrides the input total seen by amount predicates
    input_value: Mutex<Option<u64>>,
    pub verified: Mutex<Vec<(String, VerificationContext)>>,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self {
            address_valid: Mutex::new(Ok(true)),
            hold: Mutex::new(false),
            held: Mutex::new(Vec::new()),
            input_value: Mutex::new(None),
            verified: Mutex::new(Vec::new()),
        }
    }

    pub fn set_address_valid(&self, result: Result<bool, String>) {
        *self.address_valid.lock().unwrap() = result;
    }

    pub fn set_input_value(&self, value: Option<u64>) {
        *self.input_value.lock().unwrap() = value;
    }

    pub fn hold(&self, hold: bool) {
        *self.hold.lock().unwrap() = hold;
    }

    pub fn release_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        let result = self.address_valid.lock().unwrap().clone();
        for callback in held {
            callback(result.clone());
        }
    }
}

impl CounterpartyVerifier for MockVerifier {
    fn verify_address(&self, address: &str, context: VerificationContext, callback: Callback<Result<bool, String>>) {
        self.verified.lock().unwrap().push((address.to_string(), context));
        if *self.hold.lock().unwrap() {
            self.held.lock().unwrap().push(callback);
            return;
        }
        let result = self.address_valid.lock().unwrap().clone();
        callback(result);
    }

    fn find_recipient(
        &self,
        tx: &Transaction,
        address: &str,
        predicate: &dyn Fn(&RecipientMatch) -> bool,
    ) -> RecipientLookup {
        let total: u64 = tx.output.iter().map(|o| o.value).sum();
        let found = tx
            .output
            .iter()
            .enumerate()
            .find(|(_, o)| o.script_pubkey.as_bytes() == address.as_bytes());

        match found {
            None => RecipientLookup::NotFound,
            Some((vout, output)) => {
                let value_input = self.input_value.lock().unwrap().unwrap_or(total + 1_000);
                let matched = RecipientMatch {
                    vout: vout as u32,
                    value: output.value,
                    value_return: total - output.value,
                    value_input,
                };
                RecipientLookup::Found {
                    matched,
                    amount_valid: predicate(&matched),
                }
            }
        }
    }
}

type Listener = Box<dyn Fn(MonitorEvent) + Send + Sync>;

/// Monitor whose events are fired by the test
#[derive(Default)]
pub struct MockMonitor {
    next_id: Mutex<WatchId>,
    watches: Mutex<HashMap<WatchId, (String, Arc<Listener>)>>,
    pub unwatched: Mutex<Vec<WatchId>>,
}

impl MockMonitor {
    pub fn fire(&self, address: &str, event: MonitorEvent) -> usize {
        let listeners: Vec<Arc<Listener>> = self
            .watches
            .lock()
            .unwrap()
            .values()
            .filter(|(watched, _)| watched == address)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &listeners {
            listener(event.clone());
        }
        listeners.len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().unwrap().len()
    }
}

impl SettlementMonitor for MockMonitor {
    fn watch(&self, address: &str, listener: Listener) -> WatchId {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        self.watches
            .lock()
            .unwrap()
            .insert(*next, (address.to_string(), Arc::new(listener)));
        *next
    }

    fn unwatch(&self, id: WatchId) {
        self.watches.lock().unwrap().remove(&id);
        self.unwatched.lock().unwrap().push(id);
    }
}

/// Session wired to mocks, with handles onto each of them
pub struct Harness {
    pub session: TradingSession,
    pub utxo_source: Arc<MockUtxoSource>,
    pub fee_estimator: Arc<MockFeeEstimator>,
    pub signer: Arc<MockSigner>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub verifier: Arc<MockVerifier>,
    pub monitor: Arc<MockMonitor>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        setup();
        let utxo_source = Arc::new(MockUtxoSource::default());
        let fee_estimator = Arc::new(MockFeeEstimator::new(1.0));
        let signer = Arc::new(MockSigner::new());
        let broadcaster = Arc::new(MockBroadcaster::new());
        let verifier = Arc::new(MockVerifier::new());
        let monitor = Arc::new(MockMonitor::default());
        let clock = ManualClock::new();

        let session = TradingSession::new(
            config,
            Collaborators {
                utxo_source: utxo_source.clone(),
                fee_estimator: fee_estimator.clone(),
                signer: signer.clone(),
                broadcaster: broadcaster.clone(),
                verifier: verifier.clone(),
                monitor: monitor.clone(),
                clock: Arc::new(clock.clone()),
            },
        )
        .unwrap();

        Self {
            session,
            utxo_source,
            fee_estimator,
            signer,
            broadcaster,
            verifier,
            monitor,
            clock,
        }
    }

    /// Make `utxos` the snapshot of `wallet_id` and load it
    pub fn fund(&self, wallet_id: &WalletId, utxos: Vec<Utxo>) {
        self.utxo_source.set(wallet_id, utxos);
        self.session.on_balance_changed(wallet_id);
    }
}
