//! UTXO reservation manager
//!
//! Hands out exclusive holds on sets of UTXOs so that concurrent trades never
//! pick the same input. The manager is owned by the trading session and shared
//! by cheap clones; every clone refers to the same reservation table.
//!
//! # Guarantees
//!
//! - A UTXO belongs to at most one live reservation, across all wallets.
//! - Selection and reservation of a best set happen under one lock, so a
//!   concurrent refresh or reserve cannot slip in between.
//! - A reservation is released exactly once, either through
//!   [`ReservationToken::release`] or when the token is dropped. Releasing an
//!   empty or already released token is a no-op.
//! - Refreshing a wallet never disturbs reservations; holders are tracked apart
//!   from the inventory snapshot.
//!
//! # Example
//!
//! ```
//! use bs_trading_core::config::SelectionConfig;
//! use bs_trading_core::fee_estimation::FeeSpec;
//! use bs_trading_core::reservation::{BestSetRequest, ReservationManager, ReservationPurpose};
//! use bs_trading_core::types::WalletId;
//! use bs_trading_core::utxo_selection::Utxo;
//! use bitcoin::{Amount, OutPoint, Txid};
//! use std::str::FromStr;
//!
//! let manager = ReservationManager::new(SelectionConfig::default());
//! let wallet = WalletId::from("wallet");
//! manager.load_wallet(&wallet, vec![Utxo::new(
//!     OutPoint::new(Txid::from_str(&"1".repeat(64)).unwrap(), 0),
//!     Amount::from_sat(100_000),
//!     6,
//! )]);
//!
//! let request = BestSetRequest::new(wallet.clone(), Amount::from_sat(40_000), FeeSpec::PerVbyte(1.0));
//! let (mut token, selection) = manager
//!     .reserve_best(&request, ReservationPurpose::XbtSpend, None)
//!     .unwrap();
//! assert_eq!(selection.input_count(), 1);
//! assert!(manager.available(&wallet, &Default::default()).is_empty());
//!
//! token.release();
//! assert_eq!(manager.available(&wallet, &Default::default()).len(), 1);
//! ```

use bitcoin::{Amount, OutPoint};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::SelectionConfig;
use crate::error::ReservationError;
use crate::events::{OutPointInfo, UtxoEvent, UtxoEventBus};
use crate::fee_estimation::{btc_to_sat, FeeSpec};
use crate::logging::{self, LogLevel};
use crate::providers::{Callback, UtxoSource};
use crate::types::{AssetType, ReservationId, Side, WalletId, XBT_CURRENCY};
use crate::utxo_inventory::{InventoryStatus, UtxoFilter, UtxoInventory};
use crate::utxo_selection::{CoinSelector, SelectionRequest, SelectionResult, Utxo};

/// What a reservation's coins are going to be spent on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationPurpose {
    /// Plain bitcoin payment with change
    XbtSpend,
    /// Caller-chosen inputs spent in full
    PartialSpend,
    /// Colored-coin half of a swap
    CcSpend,
}

/// Parameters of a best-set query
#[derive(Debug, Clone, PartialEq)]
pub struct BestSetRequest {
    pub wallet_id: WalletId,
    pub target: Amount,
    /// Look for an exact-sum subset without change first
    pub partial: bool,
    pub fee: FeeSpec,
    /// Minimum fee rate in sat/vB applied on top of `fee`
    pub fee_floor: f32,
    /// Fail rather than return an undersized set
    pub check_amount: bool,
    pub filter: UtxoFilter,
    pub recipient_count: usize,
}

impl BestSetRequest {
    pub fn new(wallet_id: WalletId, target: Amount, fee: FeeSpec) -> Self {
        Self {
            wallet_id,
            target,
            partial: false,
            fee,
            fee_floor: 0.0,
            check_amount: true,
            filter: UtxoFilter::default(),
            recipient_count: 1,
        }
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_fee_floor(mut self, fee_floor: f32) -> Self {
        self.fee_floor = fee_floor;
        self
    }

    pub fn check_amount(mut self, check_amount: bool) -> Self {
        self.check_amount = check_amount;
        self
    }

    pub fn with_filter(mut self, filter: UtxoFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn selection_request(&self) -> SelectionRequest {
        SelectionRequest {
            target: self.target,
            fee: self.fee.with_floor(self.fee_floor),
            recipient_count: self.recipient_count,
            exact_match: self.partial,
            check_amount: self.check_amount,
        }
    }
}

/// An outgoing request for quote that may need funds held while it is open
#[derive(Debug, Clone, PartialEq)]
pub struct RfqRequest {
    pub wallet_id: WalletId,
    pub side: Side,
    pub asset_type: AssetType,
    /// Currency the quantity is expressed in
    pub product: String,
    pub quantity: Decimal,
    /// Best offered price so far
    pub offer: Decimal,
    pub fee: FeeSpec,
}

impl RfqRequest {
    /// Bitcoin we would have to pay, with `headroom_percent` added
    ///
    /// `None` when the trade does not spend bitcoin from our wallet.
    pub fn xbt_to_reserve(&self, headroom_percent: u32) -> Option<Amount> {
        if self.asset_type == AssetType::SpotFx {
            return None;
        }

        let product_is_xbt = self.product == XBT_CURRENCY;
        let pays_xbt = match self.side {
            Side::Sell => product_is_xbt,
            Side::Buy => !product_is_xbt,
        };
        if !pays_xbt {
            return None;
        }

        let mut quantity = self.quantity;
        if self.side == Side::Buy {
            match self.asset_type {
                AssetType::PrivateMarket => quantity *= self.offer,
                AssetType::SpotXbt => quantity = quantity.checked_div(self.offer)?,
                AssetType::SpotFx => {}
            }
        }

        let with_headroom = quantity * Decimal::from(100 + headroom_percent) / Decimal::from(100u32);
        btc_to_sat(with_headroom)
            .filter(|sats| *sats > 0)
            .map(Amount::from_sat)
    }
}

/// Read-only view of a live reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: ReservationId,
    pub wallet_id: WalletId,
    pub purpose: ReservationPurpose,
    pub utxos: Vec<Utxo>,
    pub created_at: DateTime<Utc>,
}

impl ReservationInfo {
    pub fn total(&self) -> Amount {
        self.utxos.iter().map(|u| u.amount).sum()
    }
}

type SelectCallback = Callback<Result<SelectionResult, ReservationError>>;
type ReserveCallback = Callback<Result<(ReservationToken, SelectionResult), ReservationError>>;

/// Request parked until its wallet finishes refreshing
enum PendingRequest {
    Select {
        request: BestSetRequest,
        callback: SelectCallback,
    },
    Reserve {
        request: BestSetRequest,
        purpose: ReservationPurpose,
        id: Option<ReservationId>,
        callback: ReserveCallback,
    },
}

impl PendingRequest {
    fn wallet_id(&self) -> &WalletId {
        match self {
            PendingRequest::Select { request, .. } | PendingRequest::Reserve { request, .. } => &request.wallet_id,
        }
    }

    fn fail(self, error: ReservationError) {
        match self {
            PendingRequest::Select { callback, .. } => callback(Err(error)),
            PendingRequest::Reserve { callback, .. } => callback(Err(error)),
        }
    }
}

struct ReservationTable {
    inventory: UtxoInventory,
    reservations: HashMap<ReservationId, ReservationInfo>,
    /// Which reservation holds each outpoint
    holders: HashMap<OutPoint, ReservationId>,
    pending: Vec<PendingRequest>,
}

impl ReservationTable {
    fn new() -> Self {
        Self {
            inventory: UtxoInventory::new(),
            reservations: HashMap::new(),
            holders: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn available(&self, wallet_id: &WalletId, filter: &UtxoFilter) -> Vec<Utxo> {
        self.inventory
            .spendable(wallet_id, filter, |outpoint| self.holders.contains_key(outpoint))
    }

    fn select(&self, selector: &CoinSelector, request: &BestSetRequest) -> Result<SelectionResult, ReservationError> {
        if self.inventory.status(&request.wallet_id) == InventoryStatus::Unknown {
            return Err(ReservationError::UnknownWallet(request.wallet_id.clone()));
        }
        let candidates = self.available(&request.wallet_id, &request.filter);
        Ok(selector.select(&candidates, &request.selection_request())?)
    }

    fn insert(
        &mut self,
        wallet_id: &WalletId,
        utxos: &[Utxo],
        id: Option<ReservationId>,
        purpose: ReservationPurpose,
    ) -> Result<ReservationInfo, ReservationError> {
        if utxos.is_empty() {
            return Err(ReservationError::EmptySelection);
        }

        let id = match id {
            Some(id) if self.reservations.contains_key(&id) => {
                return Err(ReservationError::DuplicateId(id));
            }
            Some(id) => id,
            None => loop {
                let candidate = generate_reservation_id("reservation");
                if !self.reservations.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let mut seen = HashSet::new();
        let mut members = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            if !seen.insert(utxo.outpoint) {
                continue;
            }
            if let Some(holder) = self.holders.get(&utxo.outpoint) {
                return Err(ReservationError::AlreadyReserved {
                    outpoint: utxo.outpoint,
                    holder: holder.clone(),
                });
            }
            let known = self
                .inventory
                .get(wallet_id, &utxo.outpoint)
                .ok_or_else(|| ReservationError::NotInInventory {
                    outpoint: utxo.outpoint,
                    wallet_id: wallet_id.clone(),
                })?;
            members.push(known.clone());
        }

        for utxo in &members {
            self.holders.insert(utxo.outpoint, id.clone());
        }
        let info = ReservationInfo {
            id: id.clone(),
            wallet_id: wallet_id.clone(),
            purpose,
            utxos: members,
            created_at: Utc::now(),
        };
        self.reservations.insert(id, info.clone());
        Ok(info)
    }

    fn remove(&mut self, id: &ReservationId) -> Option<ReservationInfo> {
        let info = self.reservations.remove(id)?;
        for utxo in &info.utxos {
            if self.holders.get(&utxo.outpoint) == Some(id) {
                self.holders.remove(&utxo.outpoint);
            }
        }
        Some(info)
    }

    fn take_pending(&mut self, wallet_id: &WalletId) -> Vec<PendingRequest> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.wallet_id() == wallet_id);
        self.pending = rest;
        matching
    }
}

fn lock_table(table: &Mutex<ReservationTable>) -> MutexGuard<'_, ReservationTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Random reservation id of the form `<prefix>_<16 hex digits>`
pub fn generate_reservation_id(prefix: &str) -> ReservationId {
    let bytes: [u8; 8] = rand::random();
    ReservationId::new(format!("{}_{}", prefix, hex::encode(bytes)))
}

fn outpoint_infos(utxos: &[Utxo]) -> Vec<OutPointInfo> {
    utxos.iter().map(|u| OutPointInfo::from(&u.outpoint)).collect()
}

/// Shared handle onto the reservation table
#[derive(Clone)]
pub struct ReservationManager {
    table: Arc<Mutex<ReservationTable>>,
    selector: CoinSelector,
    config: SelectionConfig,
    events: Option<UtxoEventBus>,
}

impl fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationManager")
            .field("reservations", &self.reservation_count())
            .finish()
    }
}

impl ReservationManager {
    pub fn new(config: SelectionConfig) -> Self {
        Self {
            table: Arc::new(Mutex::new(ReservationTable::new())),
            selector: CoinSelector::new(&config),
            config,
            events: None,
        }
    }

    /// Publish acquire, release and balance events on `events`
    pub fn with_event_bus(mut self, events: UtxoEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn selector(&self) -> &CoinSelector {
        &self.selector
    }

    fn lock(&self) -> MutexGuard<'_, ReservationTable> {
        lock_table(&self.table)
    }

    fn publish(&self, event: UtxoEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn token_for(&self, info: &ReservationInfo) -> ReservationToken {
        ReservationToken {
            inner: Some(TokenInner {
                id: info.id.clone(),
                wallet_id: info.wallet_id.clone(),
                outpoints: info.utxos.iter().map(|u| u.outpoint).collect(),
                table: Arc::downgrade(&self.table),
                events: self.events.clone(),
            }),
        }
    }

    fn announce_acquired(&self, info: &ReservationInfo) {
        logging::log_reservation(
            LogLevel::Info,
            "reservation_acquired",
            Some(json!({
                "id": info.id.as_str(),
                "wallet": info.wallet_id.as_str(),
                "purpose": format!("{:?}", info.purpose),
                "inputs": info.utxos.len(),
                "total_sat": info.total().to_sat(),
            })),
        );
        self.publish(UtxoEvent::ReservationAcquired {
            reservation_id: info.id.clone(),
            wallet_id: info.wallet_id.clone(),
            purpose: info.purpose,
            utxos: outpoint_infos(&info.utxos),
            total_sat: info.total().to_sat(),
        });
    }

    fn announce_selection_failure(&self, request: &BestSetRequest, error: &ReservationError) {
        logging::log_selection(
            LogLevel::Warn,
            "selection_failed",
            Some(json!({
                "wallet": request.wallet_id.as_str(),
                "target_sat": request.target.to_sat(),
                "error": error.to_string(),
            })),
        );
        self.publish(UtxoEvent::SelectionFailed {
            wallet_id: request.wallet_id.clone(),
            kind: error.kind(),
            reason: error.to_string(),
            target_sat: request.target.to_sat(),
        });
    }

    fn announce_balance(&self, wallet_id: &WalletId) {
        let available = self.available(wallet_id, &UtxoFilter::default().with_zero_conf());
        let available_sat = available.iter().map(|u| u.amount.to_sat()).sum();
        self.publish(UtxoEvent::BalanceChanged {
            wallet_id: wallet_id.clone(),
            available_sat,
            utxo_count: available.len(),
        });
    }

    /// Ask `source` for a fresh snapshot of `wallet_id`
    ///
    /// Best-set requests for the wallet made while the refresh is in flight
    /// are parked and answered from the new snapshot.
    pub fn refresh(&self, wallet_id: &WalletId, source: &dyn UtxoSource) {
        let revision = self.lock().inventory.begin_refresh(wallet_id);
        debug!("Refreshing UTXOs of {} (revision {})", wallet_id, revision);

        let manager = self.clone();
        let wallet = wallet_id.clone();
        source.list_unspent(
            wallet_id,
            Box::new(move |result| {
                manager.apply_refresh(&wallet, revision, result);
            }),
        );
    }

    /// Install the answer to refresh `revision`; stale answers are ignored
    pub fn apply_refresh(&self, wallet_id: &WalletId, revision: u64, result: Result<Vec<Utxo>, String>) -> bool {
        let (pending, failure) = {
            let mut table = self.lock();
            let (applied, failure) = match result {
                Ok(utxos) => (table.inventory.complete_refresh(wallet_id, revision, utxos), None),
                Err(message) => (table.inventory.fail_refresh(wallet_id, revision), Some(message)),
            };
            if !applied {
                debug!("Dropping stale UTXO refresh {} for {}", revision, wallet_id);
                return false;
            }
            (table.take_pending(wallet_id), failure)
        };

        match failure {
            Some(message) => {
                warn!("UTXO refresh of {} failed: {}", wallet_id, message);
                for request in pending {
                    request.fail(ReservationError::Source {
                        wallet_id: wallet_id.clone(),
                        message: message.clone(),
                    });
                }
            }
            None => {
                self.announce_balance(wallet_id);
                for request in pending {
                    self.run_pending(request);
                }
            }
        }
        true
    }

    /// Replace a wallet's snapshot synchronously
    pub fn load_wallet(&self, wallet_id: &WalletId, utxos: Vec<Utxo>) {
        let revision = self.lock().inventory.begin_refresh(wallet_id);
        self.apply_refresh(wallet_id, revision, Ok(utxos));
    }

    /// Forget a wallet's snapshot
    ///
    /// Live reservations of the wallet stay until their tokens are released.
    pub fn remove_wallet(&self, wallet_id: &WalletId) -> bool {
        let (removed, pending) = {
            let mut table = self.lock();
            let removed = table.inventory.remove_wallet(wallet_id);
            (removed, table.take_pending(wallet_id))
        };
        for request in pending {
            request.fail(ReservationError::UnknownWallet(wallet_id.clone()));
        }
        if removed {
            self.announce_balance(wallet_id);
        }
        removed
    }

    pub fn status(&self, wallet_id: &WalletId) -> InventoryStatus {
        self.lock().inventory.status(wallet_id)
    }

    pub fn wallet_ids(&self) -> Vec<WalletId> {
        self.lock().inventory.wallet_ids()
    }

    /// Spendable, unreserved outputs of a wallet
    pub fn available(&self, wallet_id: &WalletId, filter: &UtxoFilter) -> Vec<Utxo> {
        self.lock().available(wallet_id, filter)
    }

    pub fn available_balance(&self, wallet_id: &WalletId, filter: &UtxoFilter) -> Amount {
        self.available(wallet_id, filter).iter().map(|u| u.amount).sum()
    }

    /// Hold `utxos` of `wallet_id` exclusively
    ///
    /// Fails with `AlreadyReserved` if any of them is held by another live
    /// reservation of any wallet.
    pub fn reserve(
        &self,
        utxos: &[Utxo],
        wallet_id: &WalletId,
        id: Option<ReservationId>,
        purpose: ReservationPurpose,
    ) -> Result<ReservationToken, ReservationError> {
        let info = self.lock().insert(wallet_id, utxos, id, purpose)?;
        self.announce_acquired(&info);
        Ok(self.token_for(&info))
    }

    /// Release a reservation; see [`ReservationToken::release`]
    pub fn release(&self, token: &mut ReservationToken) -> bool {
        token.release()
    }

    /// Best set from the current snapshot, without reserving it
    pub fn best_utxo_set(&self, request: &BestSetRequest) -> Result<SelectionResult, ReservationError> {
        let result = self.lock().select(&self.selector, request);
        if let Err(error) = &result {
            self.announce_selection_failure(request, error);
        }
        result
    }

    /// Select and reserve a best set as one atomic step
    pub fn reserve_best(
        &self,
        request: &BestSetRequest,
        purpose: ReservationPurpose,
        id: Option<ReservationId>,
    ) -> Result<(ReservationToken, SelectionResult), ReservationError> {
        let outcome = {
            let mut table = self.lock();
            table.select(&self.selector, request).and_then(|selection| {
                let info = table.insert(&request.wallet_id, &selection.selected, id, purpose)?;
                Ok((info, selection))
            })
        };

        match outcome {
            Ok((info, selection)) => {
                self.announce_acquired(&info);
                Ok((self.token_for(&info), selection))
            }
            Err(error) => {
                self.announce_selection_failure(request, &error);
                Err(error)
            }
        }
    }

    /// Best set, answered once the wallet's snapshot is up to date
    pub fn get_best_utxo_set(&self, request: BestSetRequest, callback: SelectCallback) {
        {
            let mut table = self.lock();
            if table.inventory.status(&request.wallet_id) == InventoryStatus::Loading {
                debug!("Parking best-set request for {} until refresh completes", request.wallet_id);
                table.pending.push(PendingRequest::Select { request, callback });
                return;
            }
        }
        callback(self.best_utxo_set(&request));
    }

    /// Select and reserve a best set, once the wallet's snapshot is up to date
    pub fn reserve_best_utxo_set(
        &self,
        request: BestSetRequest,
        purpose: ReservationPurpose,
        id: Option<ReservationId>,
        callback: ReserveCallback,
    ) {
        {
            let mut table = self.lock();
            if table.inventory.status(&request.wallet_id) == InventoryStatus::Loading {
                debug!("Parking reservation request for {} until refresh completes", request.wallet_id);
                table.pending.push(PendingRequest::Reserve {
                    request,
                    purpose,
                    id,
                    callback,
                });
                return;
            }
        }
        callback(self.reserve_best(&request, purpose, id));
    }

    fn run_pending(&self, request: PendingRequest) {
        match request {
            PendingRequest::Select { request, callback } => callback(self.best_utxo_set(&request)),
            PendingRequest::Reserve {
                request,
                purpose,
                id,
                callback,
            } => callback(self.reserve_best(&request, purpose, id)),
        }
    }

    /// Hold funds for an outgoing RFQ
    ///
    /// Returns `Ok(None)` when the trade does not spend bitcoin from
    /// `rfq.wallet_id`.
    pub fn reserve_for_rfq(
        &self,
        rfq: &RfqRequest,
    ) -> Result<Option<(ReservationToken, SelectionResult)>, ReservationError> {
        let Some(target) = rfq.xbt_to_reserve(self.config.rfq_headroom_percent) else {
            debug!("RFQ for {} {} needs no reservation", rfq.side, rfq.product);
            return Ok(None);
        };

        let request = BestSetRequest::new(rfq.wallet_id.clone(), target, rfq.fee);
        let id = generate_reservation_id("rfq_reserve");
        self.reserve_best(&request, ReservationPurpose::XbtSpend, Some(id))
            .map(Some)
    }

    /// Id of the reservation holding `outpoint`, if any
    pub fn holder_of(&self, outpoint: &OutPoint) -> Option<ReservationId> {
        self.lock().holders.get(outpoint).cloned()
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.holder_of(outpoint).is_some()
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<ReservationInfo> {
        self.lock().reservations.get(id).cloned()
    }

    pub fn reservations_of(&self, wallet_id: &WalletId) -> Vec<ReservationInfo> {
        let mut list: Vec<ReservationInfo> = self
            .lock()
            .reservations
            .values()
            .filter(|r| &r.wallet_id == wallet_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn reservation_count(&self) -> usize {
        self.lock().reservations.len()
    }
}

struct TokenInner {
    id: ReservationId,
    wallet_id: WalletId,
    outpoints: Vec<OutPoint>,
    table: Weak<Mutex<ReservationTable>>,
    events: Option<UtxoEventBus>,
}

/// Exclusive hold on a set of UTXOs
///
/// Move-only. Dropping the token releases the reservation. A default token
/// holds nothing.
#[derive(Default)]
pub struct ReservationToken {
    inner: Option<TokenInner>,
}

impl ReservationToken {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    pub fn id(&self) -> Option<&ReservationId> {
        self.inner.as_ref().map(|i| &i.id)
    }

    pub fn wallet_id(&self) -> Option<&WalletId> {
        self.inner.as_ref().map(|i| &i.wallet_id)
    }

    pub fn outpoints(&self) -> &[OutPoint] {
        self.inner.as_ref().map(|i| i.outpoints.as_slice()).unwrap_or(&[])
    }

    /// Move the reservation out, leaving an empty token behind
    pub fn take(&mut self) -> ReservationToken {
        std::mem::take(self)
    }

    /// Return the UTXOs to the pool
    ///
    /// Returns true only if this call released a live reservation.
    pub fn release(&mut self) -> bool {
        let Some(inner) = self.inner.take() else {
            return false;
        };
        let Some(table) = inner.table.upgrade() else {
            debug!("Reservation {} outlived its manager", inner.id);
            return false;
        };

        let released = lock_table(&table).remove(&inner.id);
        let Some(info) = released else {
            return false;
        };

        logging::log_reservation(
            LogLevel::Info,
            "reservation_released",
            Some(json!({
                "id": info.id.as_str(),
                "wallet": info.wallet_id.as_str(),
                "inputs": info.utxos.len(),
            })),
        );
        if let Some(events) = &inner.events {
            events.publish(UtxoEvent::ReservationReleased {
                reservation_id: info.id.clone(),
                wallet_id: info.wallet_id.clone(),
                utxos: outpoint_infos(&info.utxos),
            });
        }
        true
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("ReservationToken")
                .field("id", &inner.id)
                .field("wallet_id", &inner.wallet_id)
                .field("inputs", &inner.outpoints.len())
                .finish(),
            None => f.write_str("ReservationToken(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn utxo(tag: &str, sats: u64) -> Utxo {
        Utxo::new(
            OutPoint::new(Txid::from_str(&tag.repeat(64)).unwrap(), 0),
            Amount::from_sat(sats),
            6,
        )
    }

    fn rfq(side: Side, asset_type: AssetType, product: &str) -> RfqRequest {
        RfqRequest {
            wallet_id: WalletId::from("w"),
            side,
            asset_type,
            product: product.to_string(),
            quantity: dec!(2),
            offer: dec!(0.5),
            fee: FeeSpec::PerVbyte(1.0),
        }
    }

    #[test]
    fn test_rfq_amount_conversion() {
        // buying 2 CC at 0.5 XBT each
        assert_eq!(
            rfq(Side::Buy, AssetType::PrivateMarket, "BLK").xbt_to_reserve(10),
            Some(Amount::from_sat(110_000_000))
        );
        // buying 2 EUR at 0.5 EUR/XBT
        assert_eq!(
            rfq(Side::Buy, AssetType::SpotXbt, "EUR").xbt_to_reserve(0),
            Some(Amount::from_sat(400_000_000))
        );
        // selling 2 XBT
        assert_eq!(
            rfq(Side::Sell, AssetType::SpotXbt, "XBT").xbt_to_reserve(0),
            Some(Amount::from_sat(200_000_000))
        );
        assert_eq!(rfq(Side::Buy, AssetType::SpotXbt, "XBT").xbt_to_reserve(10), None);
        assert_eq!(rfq(Side::Sell, AssetType::PrivateMarket, "BLK").xbt_to_reserve(10), None);
        assert_eq!(rfq(Side::Buy, AssetType::SpotFx, "EUR").xbt_to_reserve(10), None);
    }

    #[test]
    fn test_token_drop_releases() {
        let manager = ReservationManager::new(SelectionConfig::default());
        let wallet = WalletId::from("w");
        let coin = utxo("1", 10_000);
        manager.load_wallet(&wallet, vec![coin.clone()]);

        {
            let token = manager
                .reserve(&[coin.clone()], &wallet, None, ReservationPurpose::PartialSpend)
                .unwrap();
            assert!(token.id().unwrap().as_str().starts_with("reservation_"));
            assert!(manager.is_reserved(&coin.outpoint));
        }

        assert!(!manager.is_reserved(&coin.outpoint));
        assert_eq!(manager.reservation_count(), 0);
    }

    #[test]
    fn test_unknown_wallet() {
        let manager = ReservationManager::new(SelectionConfig::default());
        let request = BestSetRequest::new(WalletId::from("nope"), Amount::from_sat(1), FeeSpec::zero());
        assert_eq!(
            manager.best_utxo_set(&request),
            Err(ReservationError::UnknownWallet(WalletId::from("nope")))
        );
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_reservation_id("rfq_reserve");
        let b = generate_reservation_id("rfq_reserve");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), "rfq_reserve_".len() + 16);
    }
}
