//! Owner of every in-flight settlement container
//!
//! Commands from the orchestration layer and answers from collaborators meet
//! here. Both are handled on the thread that owns the manager: commands are
//! plain method calls, answers are drained from the control queue by
//! [`SettlementManager::process_pending`].

use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dispatcher::{Dispatcher, Poster};
use crate::error::SettlementError;
use crate::events::SettlementEventBus;
use crate::reservation::ReservationToken;
use crate::settlement::container::{SettlementContainer, SettlementServices};
use crate::settlement::params::TradeParams;
use crate::settlement::state::SettlementState;
use crate::types::{Credentials, SettlementId};

pub struct SettlementManager {
    services: Arc<SettlementServices>,
    dispatcher: Dispatcher,
    containers: BTreeMap<SettlementId, SettlementContainer>,
}

impl SettlementManager {
    pub fn new(services: SettlementServices) -> Self {
        Self {
            services: Arc::new(services),
            dispatcher: Dispatcher::new(),
            containers: BTreeMap::new(),
        }
    }

    pub fn services(&self) -> &SettlementServices {
        &self.services
    }

    pub fn events(&self) -> &SettlementEventBus {
        &self.services.events
    }

    /// Handle for posting answers onto the control queue
    pub fn poster(&self) -> Poster {
        self.dispatcher.poster()
    }

    pub fn create_settlement(&mut self, params: TradeParams) -> Result<SettlementId, SettlementError> {
        self.insert(params, ReservationToken::empty())
    }

    /// Create a settlement funded by a reservation made earlier, e.g. for an RFQ
    pub fn create_settlement_with_reservation(
        &mut self,
        params: TradeParams,
        token: ReservationToken,
    ) -> Result<SettlementId, SettlementError> {
        if let Some(wallet_id) = token.wallet_id() {
            if wallet_id != &params.wallet_id {
                return Err(SettlementError::InvalidParams(format!(
                    "reservation belongs to wallet {}, trade uses {}",
                    wallet_id, params.wallet_id
                )));
            }
        }
        self.insert(params, token)
    }

    fn insert(&mut self, params: TradeParams, token: ReservationToken) -> Result<SettlementId, SettlementError> {
        let id = params.settlement_id.clone();
        if id.as_str().is_empty() {
            return Err(SettlementError::InvalidParams("empty settlement id".to_string()));
        }
        if self.containers.contains_key(&id) {
            return Err(SettlementError::DuplicateSettlement(id));
        }

        info!("Creating {} settlement {}", params.kind_name(), id);
        let container =
            SettlementContainer::new(params, Arc::clone(&self.services), self.dispatcher.poster()).with_reservation(token);
        self.containers.insert(id.clone(), container);
        Ok(id)
    }

    fn container_mut(&mut self, id: &SettlementId) -> Result<&mut SettlementContainer, SettlementError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| SettlementError::UnknownSettlement(id.clone()))
    }

    pub fn activate(&mut self, id: &SettlementId) -> Result<(), SettlementError> {
        self.container_mut(id)?.activate()
    }

    pub fn accept(&mut self, id: &SettlementId, credentials: Credentials) -> Result<(), SettlementError> {
        self.container_mut(id)?.accept(credentials)
    }

    /// Cancel a settlement; returns false if it had already finished
    pub fn cancel(&mut self, id: &SettlementId) -> Result<bool, SettlementError> {
        Ok(self.container_mut(id)?.cancel())
    }

    pub fn state(&self, id: &SettlementId) -> Option<SettlementState> {
        self.containers.get(id).map(SettlementContainer::state)
    }

    pub fn is_acceptable(&self, id: &SettlementId) -> bool {
        self.containers
            .get(id)
            .map(SettlementContainer::is_acceptable)
            .unwrap_or(false)
    }

    pub fn container(&self, id: &SettlementId) -> Option<&SettlementContainer> {
        self.containers.get(id)
    }

    pub fn ids(&self) -> Vec<SettlementId> {
        self.containers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Deliver every queued answer to its container
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Some(message) = self.dispatcher.try_next() {
            processed += 1;
            match self.containers.get_mut(&message.settlement_id) {
                Some(container) => container.handle(message.epoch, message.payload),
                None => debug!(
                    "Dropping {} for unknown settlement {}",
                    message.payload.name(),
                    message.settlement_id
                ),
            }
        }
        processed
    }

    /// Cancel every settlement whose timer elapsed
    pub fn check_timers(&mut self) -> usize {
        self.containers
            .values_mut()
            .map(SettlementContainer::check_timer)
            .filter(|expired| *expired)
            .count()
    }

    /// Process answers and timers until nothing is left to do
    pub fn run_until_idle(&mut self) -> usize {
        let mut processed = 0;
        loop {
            processed += self.process_pending();
            self.check_timers();
            if self.dispatcher.pending() == 0 {
                return processed;
            }
        }
    }

    /// Drop terminal containers and return their ids
    pub fn remove_finished(&mut self) -> Vec<SettlementId> {
        let finished: Vec<SettlementId> = self
            .containers
            .iter()
            .filter(|(_, c)| c.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            self.containers.remove(id);
        }
        finished
    }

    /// Drop a settlement, cancelling it first if it is still running
    pub fn remove(&mut self, id: &SettlementId) -> bool {
        match self.containers.remove(id) {
            Some(mut container) => {
                container.cancel();
                true
            }
            None => false,
        }
    }
}
