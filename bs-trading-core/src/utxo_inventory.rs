//! Per-wallet cache of spendable outputs
//!
//! The inventory only knows what exists. Whether an output is currently held
//! by a trade is tracked by the reservation table, so replacing a wallet's
//! snapshot can never un-reserve anything.

use bitcoin::{Amount, OutPoint};
use std::collections::{BTreeMap, HashMap};

use crate::types::{AddressType, Liveness, WalletId};
use crate::utxo_selection::Utxo;

/// Load state of a wallet's snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryStatus {
    /// Never loaded
    Unknown,
    /// A refresh is in flight
    Loading,
    Ready,
    /// Last refresh failed; the previous snapshot, if any, is kept
    Failed,
}

/// Which outputs a caller is willing to spend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UtxoFilter {
    pub include_zero_conf: bool,
    /// Restrict to one leaf type of a multi-leaf wallet
    pub address_type: Option<AddressType>,
}

impl UtxoFilter {
    pub fn confirmed_only() -> Self {
        Self::default()
    }

    pub fn with_zero_conf(mut self) -> Self {
        self.include_zero_conf = true;
        self
    }

    pub fn matches(&self, utxo: &Utxo) -> bool {
        if !self.include_zero_conf && utxo.liveness() == Liveness::ZeroConf {
            return false;
        }
        match self.address_type {
            Some(address_type) => utxo.address_type == address_type,
            None => true,
        }
    }
}

#[derive(Debug)]
struct WalletInventory {
    utxos: BTreeMap<OutPoint, Utxo>,
    status: InventoryStatus,
    /// Bumped by every refresh request; stale answers are dropped
    revision: u64,
}

impl WalletInventory {
    fn new() -> Self {
        Self {
            utxos: BTreeMap::new(),
            status: InventoryStatus::Unknown,
            revision: 0,
        }
    }
}

/// Snapshot of every known wallet's unspent outputs
#[derive(Debug, Default)]
pub struct UtxoInventory {
    wallets: HashMap<WalletId, WalletInventory>,
}

impl UtxoInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, wallet_id: &WalletId) -> InventoryStatus {
        self.wallets
            .get(wallet_id)
            .map(|w| w.status)
            .unwrap_or(InventoryStatus::Unknown)
    }

    /// Mark a refresh as started and return its revision
    pub fn begin_refresh(&mut self, wallet_id: &WalletId) -> u64 {
        let wallet = self
            .wallets
            .entry(wallet_id.clone())
            .or_insert_with(WalletInventory::new);
        wallet.revision += 1;
        wallet.status = InventoryStatus::Loading;
        wallet.revision
    }

    /// Install the snapshot fetched for `revision`
    ///
    /// Returns false and leaves the wallet untouched when a newer refresh has
    /// been started since, or the wallet was removed meanwhile.
    pub fn complete_refresh(&mut self, wallet_id: &WalletId, revision: u64, utxos: Vec<Utxo>) -> bool {
        match self.wallets.get_mut(wallet_id) {
            Some(wallet) if wallet.revision == revision => {
                wallet.utxos = utxos.into_iter().map(|u| (u.outpoint, u)).collect();
                wallet.status = InventoryStatus::Ready;
                true
            }
            _ => false,
        }
    }

    /// Record a failed refresh for `revision`
    pub fn fail_refresh(&mut self, wallet_id: &WalletId, revision: u64) -> bool {
        match self.wallets.get_mut(wallet_id) {
            Some(wallet) if wallet.revision == revision => {
                wallet.status = InventoryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Replace a wallet's snapshot outright
    pub fn replace(&mut self, wallet_id: &WalletId, utxos: Vec<Utxo>) {
        let revision = self.begin_refresh(wallet_id);
        self.complete_refresh(wallet_id, revision, utxos);
    }

    pub fn remove_wallet(&mut self, wallet_id: &WalletId) -> bool {
        self.wallets.remove(wallet_id).is_some()
    }

    pub fn wallet_ids(&self) -> Vec<WalletId> {
        let mut ids: Vec<WalletId> = self.wallets.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, wallet_id: &WalletId, outpoint: &OutPoint) -> Option<&Utxo> {
        self.wallets.get(wallet_id).and_then(|w| w.utxos.get(outpoint))
    }

    /// Outputs of `wallet_id` passing `filter` and not rejected by `is_held`
    pub fn spendable<F>(&self, wallet_id: &WalletId, filter: &UtxoFilter, is_held: F) -> Vec<Utxo>
    where
        F: Fn(&OutPoint) -> bool,
    {
        self.wallets
            .get(wallet_id)
            .map(|wallet| {
                wallet
                    .utxos
                    .values()
                    .filter(|u| filter.matches(u) && !is_held(&u.outpoint))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total value of every output of a wallet, held or not
    pub fn balance(&self, wallet_id: &WalletId) -> Amount {
        self.wallets
            .get(wallet_id)
            .map(|wallet| wallet.utxos.values().map(|u| u.amount).sum())
            .unwrap_or(Amount::ZERO)
    }

    pub fn len(&self, wallet_id: &WalletId) -> usize {
        self.wallets.get(wallet_id).map(|w| w.utxos.len()).unwrap_or(0)
    }
}
