//! Settlement container state machine
//!
//! One container drives one trade from activation to a terminal state. It
//! owns the trade's reservation token, its outstanding signing request and its
//! address watch, and gives all three back when it finishes or is dropped.
//!
//! Asynchronous answers arrive as [`ControlPayload`]s stamped with the epoch
//! the request was issued at. Cancelling or failing advances the epoch, which
//! turns every answer still in flight into a no-op.

use bitcoin::consensus::deserialize;
use bitcoin::{Amount, Transaction};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

use crate::clock::{Clock, Deadline};
use crate::config::SettlementConfig;
use crate::dispatcher::{ControlPayload, Epoch, EpochGuard, Poster};
use crate::error::{ErrorKind, ReservationError, SettlementError, TradeFailure};
use crate::events::{CancelReason, SettlementEvent, SettlementEventBus};
use crate::fee_estimation::{validate_fee_rate, FeeEstimator, FeeSpec};
use crate::logging::{self, LogLevel};
use crate::providers::{
    Broadcaster, Callback, CounterpartyVerifier, MonitorEvent, SettlementMonitor, SignError, SignRequestId, SigningProvider,
    WatchId,
};
use crate::reservation::{BestSetRequest, ReservationManager, ReservationPurpose, ReservationToken};
use crate::settlement::params::TradeParams;
use crate::settlement::state::SettlementState;
use crate::settlement::terms::{BuildInputs, Completion, Funding, PayIn};
use crate::tx_request::TxRequest;
use crate::types::{Credentials, ReservationId, SettlementId};
use crate::utxo_selection::{SelectionRequest, SelectionResult, Utxo};

/// Collaborators shared by every container of a session
pub struct SettlementServices {
    pub reservations: ReservationManager,
    pub fee_estimator: Arc<dyn FeeEstimator>,
    pub signer: Arc<dyn SigningProvider>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub verifier: Arc<dyn CounterpartyVerifier>,
    pub monitor: Arc<dyn SettlementMonitor>,
    pub clock: Arc<dyn Clock>,
    pub events: SettlementEventBus,
    pub config: SettlementConfig,
}

/// State machine of a single trade
pub struct SettlementContainer {
    params: TradeParams,
    services: Arc<SettlementServices>,
    poster: Poster,
    state: SettlementState,
    epoch: EpochGuard,
    deadline: Deadline,

    amount_valid: bool,
    address_valid: bool,
    funds_ready: bool,
    pay_in_seen: bool,
    acceptable: bool,

    fee_rate: Option<f32>,
    pay_in: Option<PayIn>,
    token: ReservationToken,
    selection: Option<SelectionResult>,
    tx_request: Option<TxRequest>,
    signed_txid: Option<String>,
    sign_request: Option<SignRequestId>,
    credentials: Option<Credentials>,
    watch: Option<WatchId>,
}

impl SettlementContainer {
    pub fn new(params: TradeParams, services: Arc<SettlementServices>, poster: Poster) -> Self {
        Self {
            params,
            services,
            poster,
            state: SettlementState::Created,
            epoch: EpochGuard::new(),
            deadline: Deadline::default(),
            amount_valid: false,
            address_valid: false,
            funds_ready: false,
            pay_in_seen: false,
            acceptable: false,
            fee_rate: None,
            pay_in: None,
            token: ReservationToken::empty(),
            selection: None,
            tx_request: None,
            signed_txid: None,
            sign_request: None,
            credentials: None,
            watch: None,
        }
    }

    /// Fund the trade from an existing reservation instead of a new best set
    pub fn with_reservation(mut self, token: ReservationToken) -> Self {
        self.token = token;
        self
    }

    pub fn id(&self) -> &SettlementId {
        &self.params.settlement_id
    }

    pub fn params(&self) -> &TradeParams {
        &self.params
    }

    pub fn state(&self) -> SettlementState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.current()
    }

    pub fn reservation_id(&self) -> Option<&ReservationId> {
        self.token.id()
    }

    pub fn selection(&self) -> Option<&SelectionResult> {
        self.selection.as_ref()
    }

    pub fn tx_request(&self) -> Option<&TxRequest> {
        self.tx_request.as_ref()
    }

    /// Every check passed and the timer has not elapsed
    pub fn is_acceptable(&self) -> bool {
        self.state == SettlementState::ReadyToAccept
            && self.checks_passed()
            && self.deadline.is_live(self.services.clock.as_ref())
    }

    fn checks_passed(&self) -> bool {
        let fee_ready = !self.params.terms().needs_fee_estimate(&self.params) || self.fee_rate.is_some();
        self.amount_valid && self.address_valid && self.funds_ready && self.pay_in_seen && fee_ready
    }

    fn publish(&self, event: SettlementEvent) {
        self.services.events.publish(event);
    }

    fn set_state(&mut self, next: SettlementState) {
        debug_assert!(self.state.can_move_to(next), "{} -> {}", self.state, next);
        debug!("Settlement {}: {} -> {}", self.id(), self.state, next);
        self.state = next;
        self.publish(SettlementEvent::StateChanged {
            settlement_id: self.id().clone(),
            state: next,
        });
    }

    fn set_acceptable(&mut self, acceptable: bool) {
        if self.acceptable != acceptable {
            self.acceptable = acceptable;
            self.publish(SettlementEvent::AcceptableChanged {
                settlement_id: self.id().clone(),
                acceptable,
            });
        }
    }

    /// Start the timer, verification and funding
    pub fn activate(&mut self) -> Result<(), SettlementError> {
        if self.state != SettlementState::Created {
            return Err(self.invalid_state("activate"));
        }

        self.set_state(SettlementState::Activated);
        self.deadline
            .start(self.services.clock.as_ref(), self.services.config.timeout());
        logging::log_settlement(
            LogLevel::Info,
            "settlement_activated",
            Some(json!({
                "id": self.id().as_str(),
                "kind": self.params.kind_name(),
                "side": self.params.side.to_string(),
                "product": self.params.product,
                "quantity": self.params.quantity.to_string(),
                "price": self.params.price.to_string(),
            })),
        );

        if let Err(failure) = self.params.terms().validate(&self.params) {
            self.fail(failure);
            return Ok(());
        }

        let checked = self.parse_counterparty_tx().and_then(|tx| {
            self.params.terms().check_counterparty(
                &self.params,
                tx.as_ref(),
                self.services.verifier.as_ref(),
                &self.services.config,
            )
        });
        match checked {
            Ok(pay_in) => {
                self.amount_valid = true;
                self.pay_in = pay_in;
            }
            Err(failure) => {
                self.fail(failure);
                return Ok(());
            }
        }

        self.set_state(SettlementState::VerifyingCounterparty);
        self.pay_in_seen = !self.params.terms().requires_pay_in_detection(&self.params);
        self.start_watch();
        self.start_address_check();

        if self.params.terms().needs_fee_estimate(&self.params) {
            let callback = self.callback(ControlPayload::FeeEstimated);
            self.services
                .fee_estimator
                .estimate_fee_per_byte(self.services.config.fee_target_blocks, callback);
        } else {
            self.start_funding();
        }

        self.update_acceptable();
        Ok(())
    }

    /// Sign our transaction with `credentials`
    pub fn accept(&mut self, credentials: Credentials) -> Result<(), SettlementError> {
        if self.state != SettlementState::ReadyToAccept {
            return Err(self.invalid_state("accept"));
        }
        if !self.is_acceptable() {
            return Err(SettlementError::NotAcceptable(self.id().clone()));
        }

        self.deadline.stop();
        self.set_acceptable(false);
        self.set_state(SettlementState::Signing);
        self.credentials = Some(credentials);

        let callback = self.callback(ControlPayload::SpendersResolved);
        match self.tx_request.as_ref() {
            Some(request) => {
                logging::log_signing(
                    LogLevel::Info,
                    "resolve_spenders",
                    Some(json!({ "id": self.id().as_str(), "inputs": request.inputs.len() })),
                );
                self.services.signer.resolve_public_spenders(request, callback);
            }
            None => self.fail(TradeFailure::new(ErrorKind::InternalError, "no transaction to sign")),
        }
        Ok(())
    }

    /// Cancel on behalf of the user; false when already terminal
    pub fn cancel(&mut self) -> bool {
        self.cancel_with(CancelReason::User)
    }

    /// Cancel with `Timeout` if the timer elapsed before signing started
    pub fn check_timer(&mut self) -> bool {
        if self.state.is_timed() && self.deadline.has_expired(self.services.clock.as_ref()) {
            info!("Settlement {} timed out in {}", self.id(), self.state);
            return self.cancel_with(CancelReason::Timeout);
        }
        false
    }

    /// Apply an answer from a collaborator
    pub fn handle(&mut self, epoch: Epoch, payload: ControlPayload) {
        if !self.epoch.is_current(epoch) {
            debug!(
                "Settlement {}: dropping stale {} from {} (now {})",
                self.id(),
                payload.name(),
                epoch,
                self.epoch.current()
            );
            return;
        }

        match payload {
            ControlPayload::FeeEstimated(result) => self.on_fee_estimated(result),
            ControlPayload::FundsReserved(result) => self.on_funds_reserved(result),
            ControlPayload::AddressVerified(result) => self.on_address_verified(result),
            ControlPayload::SpendersResolved(result) => self.on_spenders_resolved(result),
            ControlPayload::Signed(result) => self.on_signed(result),
            ControlPayload::Broadcast(result) => self.on_broadcast(result),
            ControlPayload::Monitor(event) => self.on_monitor_event(event),
        }
    }

    fn callback<T: Send + 'static>(&self, wrap: fn(T) -> ControlPayload) -> Callback<T> {
        self.poster.callback(self.id().clone(), self.epoch.current(), wrap)
    }

    fn invalid_state(&self, operation: &'static str) -> SettlementError {
        SettlementError::InvalidState {
            id: self.id().clone(),
            state: self.state,
            operation,
        }
    }

    fn parse_counterparty_tx(&self) -> Result<Option<Transaction>, TradeFailure> {
        match &self.params.counterparty_tx {
            None => Ok(None),
            Some(bytes) => deserialize::<Transaction>(bytes).map(Some).map_err(|e| {
                TradeFailure::new(
                    ErrorKind::VerificationFailed,
                    format!("malformed counterparty transaction: {}", e),
                )
            }),
        }
    }

    fn start_watch(&mut self) {
        let Some(address) = self.params.terms().watch_address(&self.params) else {
            return;
        };
        let poster = self.poster.clone();
        let id = self.id().clone();
        let epoch = self.epoch.current();
        let watch = self.services.monitor.watch(
            &address,
            Box::new(move |event| poster.post(id.clone(), epoch, ControlPayload::Monitor(event))),
        );
        self.watch = Some(watch);
    }

    fn start_address_check(&mut self) {
        match self.params.terms().address_check(&self.params) {
            Some((address, context)) => {
                let callback = self.callback(ControlPayload::AddressVerified);
                self.services.verifier.verify_address(&address, context, callback);
            }
            None => self.address_valid = true,
        }
    }

    fn fee_spec(&self, zero_fee: bool) -> FeeSpec {
        if zero_fee {
            return FeeSpec::zero();
        }
        FeeSpec::PerVbyte(self.fee_rate.unwrap_or(self.services.config.min_fee_per_byte))
    }

    fn start_funding(&mut self) {
        let funding = match self.params.terms().funding(&self.params) {
            Ok(funding) => funding,
            Err(failure) => return self.fail(failure),
        };

        match funding {
            Funding::None => self.funds_ready = true,
            Funding::BestSet {
                target,
                exact_match,
                zero_fee,
                purpose,
            } => {
                let fee = self.fee_spec(zero_fee);
                if self.token.is_active() {
                    self.fund_from_reservation(target, fee, exact_match);
                    return;
                }
                let fee_floor = if zero_fee { 0.0 } else { self.services.config.min_fee_per_byte };
                let request = BestSetRequest::new(self.params.wallet_id.clone(), target, fee)
                    .partial(exact_match)
                    .with_fee_floor(fee_floor);
                let callback = self.callback(ControlPayload::FundsReserved);
                self.services
                    .reservations
                    .reserve_best_utxo_set(request, purpose, None, callback);
            }
            Funding::Fixed { utxos, target } => {
                let fee = self.fee_spec(false);
                let reserved = self.services.reservations.reserve(
                    &utxos,
                    &self.params.wallet_id,
                    None,
                    ReservationPurpose::PartialSpend,
                );
                let outcome = reserved.and_then(|token| {
                    let selection = self.evaluate(&utxos, target, fee, false)?;
                    Ok((token, selection))
                });
                self.on_funds_reserved(outcome);
            }
        }
    }

    /// Spend every input of the adopted reservation
    fn fund_from_reservation(&mut self, target: Amount, fee: FeeSpec, exact_match: bool) {
        let info = self
            .token
            .id()
            .and_then(|id| self.services.reservations.reservation(id));
        let Some(info) = info else {
            return self.fail(TradeFailure::new(
                ErrorKind::InternalError,
                "adopted reservation is no longer held",
            ));
        };
        if info.wallet_id != self.params.wallet_id {
            return self.fail(TradeFailure::new(
                ErrorKind::InternalError,
                format!("reservation {} belongs to another wallet", info.id),
            ));
        }

        match self.evaluate(&info.utxos, target, fee, exact_match) {
            Ok(selection) => self.funds_acquired(selection),
            Err(error) => self.fail(TradeFailure::new(error.kind(), error.to_string())),
        }
    }

    fn evaluate(
        &self,
        utxos: &[Utxo],
        target: Amount,
        fee: FeeSpec,
        exact_match: bool,
    ) -> Result<SelectionResult, ReservationError> {
        let mut request = SelectionRequest::new(target, fee);
        request.exact_match = exact_match;
        Ok(self.services.reservations.selector().evaluate_set(utxos, &request)?)
    }

    fn funds_acquired(&mut self, selection: SelectionResult) {
        if selection.exceeds_size_limit {
            warn!(
                "Settlement {}: transaction of {} vB exceeds the size limit",
                self.id(),
                selection.vsize
            );
        }
        logging::log_settlement(
            LogLevel::Info,
            "funds_reserved",
            Some(json!({
                "id": self.id().as_str(),
                "reservation": self.token.id().map(|r| r.as_str().to_string()),
                "inputs": selection.input_count(),
                "total_sat": selection.total.to_sat(),
                "fee_sat": selection.fee.to_sat(),
                "change_sat": selection.change.to_sat(),
            })),
        );
        self.selection = Some(selection);
        self.funds_ready = true;
        self.update_acceptable();
    }

    fn on_fee_estimated(&mut self, result: Result<f32, String>) {
        if self.state != SettlementState::VerifyingCounterparty {
            return;
        }
        let config = &self.services.config;
        let validated =
            result.and_then(|rate| validate_fee_rate(rate, config.min_fee_per_byte, config.max_fee_per_byte));
        match validated {
            Ok(rate) => {
                logging::log_network(
                    LogLevel::Debug,
                    "fee_estimated",
                    Some(json!({ "id": self.id().as_str(), "rate": rate })),
                );
                self.fee_rate = Some(rate);
                self.start_funding();
                self.update_acceptable();
            }
            Err(message) => self.fail(TradeFailure::new(
                ErrorKind::InternalError,
                format!("invalid fee: {}", message),
            )),
        }
    }

    fn on_funds_reserved(&mut self, result: Result<(ReservationToken, SelectionResult), ReservationError>) {
        if self.state != SettlementState::VerifyingCounterparty {
            // dropping the token returns the coins
            return;
        }
        match result {
            Ok((token, selection)) => {
                self.token = token;
                self.funds_acquired(selection);
            }
            Err(error) => self.fail(TradeFailure::new(error.kind(), error.to_string())),
        }
    }

    fn on_address_verified(&mut self, result: Result<bool, String>) {
        if self.state != SettlementState::VerifyingCounterparty {
            return;
        }
        match result {
            Ok(true) => {
                self.address_valid = true;
                self.update_acceptable();
            }
            Ok(false) => self.fail(TradeFailure::new(
                ErrorKind::VerificationFailed,
                "counterparty address was rejected",
            )),
            Err(message) => self.fail(TradeFailure::new(ErrorKind::VerificationFailed, message)),
        }
    }

    fn update_acceptable(&mut self) {
        if self.state != SettlementState::VerifyingCounterparty || !self.checks_passed() {
            return;
        }
        if !self.deadline.is_live(self.services.clock.as_ref()) {
            return;
        }

        let inputs = BuildInputs {
            selection: self.selection.as_ref(),
            pay_in: self.pay_in.as_ref(),
            fee_rate: self.fee_rate,
            dust_threshold: self.services.reservations.selector().dust_threshold(),
        };
        match self.params.terms().build_request(&self.params, &inputs) {
            Ok(request) => {
                debug!(
                    "Settlement {}: transaction of ~{} vB ready, fee {} sat",
                    self.id(),
                    request.estimated_vsize(),
                    request.fee.to_sat()
                );
                self.tx_request = Some(request);
                self.set_state(SettlementState::ReadyToAccept);
                self.set_acceptable(true);
            }
            Err(failure) => self.fail(failure),
        }
    }

    fn on_spenders_resolved(&mut self, result: Result<Vec<u8>, SignError>) {
        if self.state != SettlementState::Signing {
            return;
        }
        let resolved = match result {
            Ok(resolved) => resolved,
            Err(error) => return self.on_sign_error(error),
        };
        let Some(credentials) = self.credentials.take() else {
            return self.fail(TradeFailure::new(ErrorKind::InternalError, "credentials are gone"));
        };
        let callback = self.callback(ControlPayload::Signed);
        let serialized = match self.tx_request.as_mut() {
            Some(request) => {
                request.resolved_spenders = Some(resolved);
                request.serialize_state()
            }
            None => return self.fail(TradeFailure::new(ErrorKind::InternalError, "no transaction to sign")),
        };
        let request_state = match serialized {
            Ok(request_state) => request_state,
            Err(error) => {
                return self.fail(TradeFailure::new(
                    ErrorKind::InternalError,
                    format!("cannot serialize transaction request: {}", error),
                ))
            }
        };

        let sign_id = self.services.signer.sign_partial(&request_state, &credentials, callback);
        self.sign_request = Some(sign_id);
        logging::log_signing(
            LogLevel::Info,
            "sign_requested",
            Some(json!({ "id": self.params.settlement_id.as_str(), "request": sign_id })),
        );
    }

    fn on_sign_error(&mut self, error: SignError) {
        self.sign_request = None;
        match error {
            SignError::Cancelled => {
                self.cancel_with(CancelReason::SigningCancelled);
            }
            SignError::Failed(message) => self.fail(TradeFailure::new(ErrorKind::SigningFailed, message)),
        }
    }

    fn on_signed(&mut self, result: Result<Vec<u8>, SignError>) {
        if self.state != SettlementState::Signing {
            return;
        }
        let signed = match result {
            Ok(signed) => signed,
            Err(error) => return self.on_sign_error(error),
        };
        self.sign_request = None;
        logging::log_signing(LogLevel::Info, "signed", Some(json!({ "id": self.id().as_str() })));

        match self.params.terms().completion(&self.params) {
            Completion::HandOff => {
                let half = SettlementEvent::SignedHalfReady {
                    settlement_id: self.id().clone(),
                    signed_tx_hex: hex::encode(&signed),
                };
                self.complete(Some(half));
            }
            Completion::Broadcast { .. } => {
                let tx = match deserialize::<Transaction>(&signed) {
                    Ok(tx) => tx,
                    Err(e) => {
                        return self.fail(TradeFailure::new(
                            ErrorKind::SigningFailed,
                            format!("signer returned a malformed transaction: {}", e),
                        ))
                    }
                };
                self.signed_txid = Some(tx.txid().to_string());
                let callback = self.callback(ControlPayload::Broadcast);
                self.services.broadcaster.push_transaction(&signed, callback);
            }
        }
    }

    fn on_broadcast(&mut self, result: Result<(), String>) {
        if self.state != SettlementState::Signing {
            return;
        }
        if let Err(message) = result {
            return self.fail(TradeFailure::new(ErrorKind::BroadcastFailed, message));
        }

        let txid = self.signed_txid.clone().unwrap_or_default();
        logging::log_network(
            LogLevel::Info,
            "transaction_broadcast",
            Some(json!({ "id": self.id().as_str(), "txid": logging::sanitize_for_logging(&txid) })),
        );
        let announce = matches!(
            self.params.terms().completion(&self.params),
            Completion::Broadcast { announce_pay_in: true }
        );
        let extra = announce.then(|| SettlementEvent::PayInBroadcast {
            settlement_id: self.id().clone(),
            txid,
        });
        self.complete(extra);
    }

    fn on_monitor_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::PayInDetected { txid, confirmations } => {
                self.publish(SettlementEvent::PayInDetected {
                    settlement_id: self.id().clone(),
                    confirmations,
                });
                let expected = matches!(self.pay_in, Some(pay_in) if pay_in.txid == txid);
                if expected && !self.pay_in_seen && self.state == SettlementState::VerifyingCounterparty {
                    info!("Settlement {}: counterparty pay-in detected", self.id());
                    self.pay_in_seen = true;
                    self.update_acceptable();
                }
            }
            MonitorEvent::PayOutDetected { confirmations, by_us } => {
                if confirmations >= self.services.config.confirmed_threshold {
                    info!(
                        "Settlement {}: payout confirmed ({} confirmations, by us: {})",
                        self.id(),
                        confirmations,
                        by_us
                    );
                }
                self.publish(SettlementEvent::PayOutDetected {
                    settlement_id: self.id().clone(),
                    confirmations,
                    by_us,
                });
            }
        }
    }

    fn complete(&mut self, extra: Option<SettlementEvent>) {
        let released = self.token.release();
        self.credentials = None;
        self.set_state(SettlementState::Completed);
        logging::log_settlement(
            LogLevel::Info,
            "settlement_completed",
            Some(json!({ "id": self.id().as_str(), "released": released })),
        );
        if let Some(event) = extra {
            self.publish(event);
        }
        self.publish(SettlementEvent::Completed {
            settlement_id: self.id().clone(),
        });
    }

    fn cancel_with(&mut self, reason: CancelReason) -> bool {
        let event = SettlementEvent::Cancelled {
            settlement_id: self.id().clone(),
            reason,
        };
        self.terminate(SettlementState::Cancelled, event)
    }

    fn fail(&mut self, failure: TradeFailure) {
        warn!("Settlement {} failed: {}", self.id(), failure);
        let event = SettlementEvent::Failed {
            settlement_id: self.id().clone(),
            failure,
        };
        self.terminate(SettlementState::Failed, event);
    }

    /// Enter a terminal state and give every resource back, once
    fn terminate(&mut self, state: SettlementState, event: SettlementEvent) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        self.epoch.advance();
        self.deadline.stop();
        let released = self.release_resources();
        self.set_acceptable(false);
        self.set_state(state);
        logging::log_settlement(
            LogLevel::Info,
            "settlement_terminated",
            Some(json!({
                "id": self.id().as_str(),
                "state": state.to_string(),
                "released": released,
            })),
        );
        self.publish(event);
        true
    }

    fn release_resources(&mut self) -> bool {
        let released = self.token.release();
        if let Some(id) = self.sign_request.take() {
            self.services.signer.cancel_sign(id);
        }
        if let Some(watch) = self.watch.take() {
            self.services.monitor.unwatch(watch);
        }
        self.credentials = None;
        released
    }
}

impl Drop for SettlementContainer {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!("Settlement {} dropped in {}", self.id(), self.state);
            self.epoch.advance();
        }
        self.release_resources();
    }
}
