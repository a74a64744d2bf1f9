//! Trading session
//!
//! The session owns the reservation manager and the settlement manager and
//! wires wallet notifications into inventory refreshes. One session exists per
//! logged-in terminal; nothing in this crate is global.

use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::TradingError;
use crate::events::{SettlementEventBus, UtxoEventBus};
use crate::fee_estimation::FeeEstimator;
use crate::providers::{Broadcaster, CounterpartyVerifier, SettlementMonitor, SigningProvider, UtxoSource};
use crate::reservation::{ReservationManager, ReservationToken, RfqRequest};
use crate::settlement::{SettlementManager, SettlementServices, SettlementState, TradeParams};
use crate::types::{Credentials, SettlementId, WalletId};
use crate::utxo_selection::SelectionResult;

/// External services a session talks to
pub struct Collaborators {
    pub utxo_source: Arc<dyn UtxoSource>,
    pub fee_estimator: Arc<dyn FeeEstimator>,
    pub signer: Arc<dyn SigningProvider>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub verifier: Arc<dyn CounterpartyVerifier>,
    pub monitor: Arc<dyn SettlementMonitor>,
    pub clock: Arc<dyn Clock>,
}

pub struct TradingSession {
    config: Config,
    utxo_source: Arc<dyn UtxoSource>,
    reservations: ReservationManager,
    settlements: SettlementManager,
    utxo_events: UtxoEventBus,
}

impl TradingSession {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self, TradingError> {
        config.validate()?;

        let utxo_events = UtxoEventBus::new();
        let reservations = ReservationManager::new(config.selection.clone()).with_event_bus(utxo_events.clone());
        let services = SettlementServices {
            reservations: reservations.clone(),
            fee_estimator: collaborators.fee_estimator,
            signer: collaborators.signer,
            broadcaster: collaborators.broadcaster,
            verifier: collaborators.verifier,
            monitor: collaborators.monitor,
            clock: collaborators.clock,
            events: SettlementEventBus::new(),
            config: config.settlement.clone(),
        };

        Ok(Self {
            config,
            utxo_source: collaborators.utxo_source,
            reservations,
            settlements: SettlementManager::new(services),
            utxo_events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    pub fn settlements(&self) -> &SettlementManager {
        &self.settlements
    }

    pub fn settlements_mut(&mut self) -> &mut SettlementManager {
        &mut self.settlements
    }

    pub fn utxo_events(&self) -> &UtxoEventBus {
        &self.utxo_events
    }

    pub fn settlement_events(&self) -> &SettlementEventBus {
        self.settlements.events()
    }

    /// A wallet's balance moved; its snapshot is stale
    pub fn on_balance_changed(&self, wallet_id: &WalletId) {
        debug!("Balance of {} changed", wallet_id);
        self.reservations.refresh(wallet_id, self.utxo_source.as_ref());
    }

    /// The wallet list was (re)synchronized
    ///
    /// Every listed wallet is refreshed; wallets no longer listed are dropped.
    pub fn on_wallets_synced(&self, wallet_ids: &[WalletId]) {
        let listed: HashSet<&WalletId> = wallet_ids.iter().collect();
        for known in self.reservations.wallet_ids() {
            if !listed.contains(&known) {
                self.reservations.remove_wallet(&known);
            }
        }
        info!("Refreshing {} wallet(s) after sync", wallet_ids.len());
        for wallet_id in wallet_ids {
            self.reservations.refresh(wallet_id, self.utxo_source.as_ref());
        }
    }

    pub fn on_wallet_deleted(&self, wallet_id: &WalletId) {
        info!("Wallet {} deleted", wallet_id);
        self.reservations.remove_wallet(wallet_id);
    }

    /// Hold funds for an outgoing RFQ; `None` when the trade spends no bitcoin
    pub fn reserve_for_rfq(&self, rfq: &RfqRequest) -> Result<Option<(ReservationToken, SelectionResult)>, TradingError> {
        Ok(self.reservations.reserve_for_rfq(rfq)?)
    }

    pub fn create_settlement(&mut self, params: TradeParams) -> Result<SettlementId, TradingError> {
        Ok(self.settlements.create_settlement(params)?)
    }

    pub fn create_settlement_with_reservation(
        &mut self,
        params: TradeParams,
        token: ReservationToken,
    ) -> Result<SettlementId, TradingError> {
        Ok(self.settlements.create_settlement_with_reservation(params, token)?)
    }

    pub fn activate(&mut self, id: &SettlementId) -> Result<(), TradingError> {
        Ok(self.settlements.activate(id)?)
    }

    pub fn accept(&mut self, id: &SettlementId, credentials: Credentials) -> Result<(), TradingError> {
        Ok(self.settlements.accept(id, credentials)?)
    }

    pub fn cancel(&mut self, id: &SettlementId) -> Result<bool, TradingError> {
        Ok(self.settlements.cancel(id)?)
    }

    pub fn state(&self, id: &SettlementId) -> Option<SettlementState> {
        self.settlements.state(id)
    }

    pub fn is_acceptable(&self, id: &SettlementId) -> bool {
        self.settlements.is_acceptable(id)
    }

    /// Drive the control queue and timers until idle
    pub fn run_until_idle(&mut self) -> usize {
        self.settlements.run_until_idle()
    }

    pub fn remove_finished(&mut self) -> Vec<SettlementId> {
        self.settlements.remove_finished()
    }
}
