mod common;

use bitcoin::Amount;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use bs_trading_core::config::SelectionConfig;
use bs_trading_core::error::{ReservationError, SelectionError};
use bs_trading_core::events::UtxoEvent;
use bs_trading_core::fee_estimation::FeeSpec;
use bs_trading_core::reservation::{BestSetRequest, ReservationManager, ReservationPurpose, RfqRequest};
use bs_trading_core::types::{AddressType, AssetType, ReservationId, Side, WalletId};
use bs_trading_core::utxo_inventory::{InventoryStatus, UtxoFilter};

use common::{setup, utxo, Harness};

fn funded_manager() -> (ReservationManager, WalletId) {
    setup();
    let manager = ReservationManager::new(SelectionConfig::default());
    let wallet = WalletId::from("main");
    manager.load_wallet(
        &wallet,
        vec![utxo("a", 0, 50_000), utxo("b", 0, 30_000), utxo("c", 0, 20_000)],
    );
    (manager, wallet)
}

fn request(wallet: &WalletId, sats: u64) -> BestSetRequest {
    BestSetRequest::new(wallet.clone(), Amount::from_sat(sats), FeeSpec::Fixed(2_000))
}

#[test]
fn test_reserved_utxos_are_not_selected_again() {
    let (manager, wallet) = funded_manager();

    let (token, selection) = manager
        .reserve_best(&request(&wallet, 60_000), ReservationPurpose::XbtSpend, None)
        .unwrap();
    assert_eq!(selection.total, Amount::from_sat(70_000));
    assert_eq!(token.outpoints().len(), 2);
    for outpoint in token.outpoints() {
        assert_eq!(manager.holder_of(outpoint).as_ref(), token.id());
    }

    let available = manager.available(&wallet, &UtxoFilter::default());
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].amount, Amount::from_sat(30_000));

    let second = manager.reserve_best(&request(&wallet, 60_000), ReservationPurpose::XbtSpend, None);
    assert!(matches!(
        second,
        Err(ReservationError::Selection(SelectionError::InsufficientFunds { .. }))
    ));
}

#[test]
fn test_explicit_reserve_of_held_utxo_fails() {
    let (manager, wallet) = funded_manager();
    let coin = utxo("a", 0, 50_000);

    let token = manager
        .reserve(&[coin.clone()], &wallet, Some(ReservationId::from("first")), ReservationPurpose::PartialSpend)
        .unwrap();
    assert_eq!(token.id(), Some(&ReservationId::from("first")));

    let error = manager
        .reserve(&[coin.clone()], &wallet, None, ReservationPurpose::PartialSpend)
        .unwrap_err();
    assert_eq!(
        error,
        ReservationError::AlreadyReserved {
            outpoint: coin.outpoint,
            holder: ReservationId::from("first"),
        }
    );
    assert_eq!(manager.reservation_count(), 1);
}

#[test]
fn test_exclusivity_spans_wallets() {
    let (manager, wallet) = funded_manager();
    let shared = utxo("a", 0, 50_000);
    let other = WalletId::from("watching-only");
    manager.load_wallet(&other, vec![shared.clone()]);

    let _token = manager
        .reserve(&[shared.clone()], &wallet, None, ReservationPurpose::XbtSpend)
        .unwrap();

    let error = manager
        .reserve(&[shared.clone()], &other, None, ReservationPurpose::XbtSpend)
        .unwrap_err();
    assert!(matches!(error, ReservationError::AlreadyReserved { .. }));
    assert!(manager.available(&other, &UtxoFilter::default()).is_empty());
}

#[test]
fn test_reserve_rejects_bad_input() {
    let (manager, wallet) = funded_manager();

    assert_eq!(
        manager
            .reserve(&[], &wallet, None, ReservationPurpose::XbtSpend)
            .unwrap_err(),
        ReservationError::EmptySelection
    );

    let stranger = utxo("9", 3, 1_000);
    assert_eq!(
        manager
            .reserve(&[stranger.clone()], &wallet, None, ReservationPurpose::XbtSpend)
            .unwrap_err(),
        ReservationError::NotInInventory {
            outpoint: stranger.outpoint,
            wallet_id: wallet.clone(),
        }
    );

    let id = ReservationId::from("dup");
    let _held = manager
        .reserve(&[utxo("a", 0, 50_000)], &wallet, Some(id.clone()), ReservationPurpose::XbtSpend)
        .unwrap();
    assert_eq!(
        manager
            .reserve(&[utxo("b", 0, 30_000)], &wallet, Some(id.clone()), ReservationPurpose::XbtSpend)
            .unwrap_err(),
        ReservationError::DuplicateId(id)
    );
}

#[test]
fn test_duplicate_outpoints_collapse() {
    let (manager, wallet) = funded_manager();
    let coin = utxo("b", 0, 30_000);

    let token = manager
        .reserve(&[coin.clone(), coin.clone()], &wallet, None, ReservationPurpose::PartialSpend)
        .unwrap();

    let info = manager.reservation(token.id().unwrap()).unwrap();
    assert_eq!(info.utxos.len(), 1);
    assert_eq!(info.total(), Amount::from_sat(30_000));
}

#[test]
fn test_release_is_idempotent() {
    let (manager, wallet) = funded_manager();
    let coin = utxo("c", 0, 20_000);

    let mut token = manager
        .reserve(&[coin.clone()], &wallet, None, ReservationPurpose::XbtSpend)
        .unwrap();

    assert!(manager.release(&mut token));
    assert!(!token.is_active());
    assert!(!manager.release(&mut token));
    assert!(!token.release());
    assert!(!manager.is_reserved(&coin.outpoint));
}

#[test]
fn test_released_token_cannot_free_new_holder() {
    let (manager, wallet) = funded_manager();
    let coin = utxo("c", 0, 20_000);

    let mut first = manager
        .reserve(&[coin.clone()], &wallet, None, ReservationPurpose::XbtSpend)
        .unwrap();
    assert!(first.release());

    let second = manager
        .reserve(&[coin.clone()], &wallet, None, ReservationPurpose::XbtSpend)
        .unwrap();

    assert!(!first.release());
    drop(first);
    assert_eq!(manager.holder_of(&coin.outpoint).as_ref(), second.id());
}

#[test]
fn test_moved_token_releases_once() {
    let (manager, wallet) = funded_manager();
    let coin = utxo("a", 0, 50_000);

    let mut original = manager
        .reserve(&[coin.clone()], &wallet, None, ReservationPurpose::XbtSpend)
        .unwrap();
    let moved = original.take();

    assert!(!original.is_active());
    drop(original);
    assert!(manager.is_reserved(&coin.outpoint));

    drop(moved);
    assert!(!manager.is_reserved(&coin.outpoint));
}

#[test]
fn test_refresh_keeps_reservations() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    let kept = utxo("a", 0, 50_000);
    harness.fund(&wallet, vec![kept.clone(), utxo("b", 0, 30_000)]);

    let reservations = harness.session.reservations();
    let token = reservations
        .reserve(&[kept.clone()], &wallet, None, ReservationPurpose::XbtSpend)
        .unwrap();

    harness.fund(&wallet, vec![kept.clone(), utxo("b", 0, 30_000), utxo("c", 0, 20_000)]);
    assert_eq!(reservations.status(&wallet), InventoryStatus::Ready);
    assert_eq!(reservations.holder_of(&kept.outpoint).as_ref(), token.id());
    assert_eq!(
        reservations.available_balance(&wallet, &UtxoFilter::default()),
        Amount::from_sat(50_000)
    );

    // the reserved coin disappears from the snapshot, e.g. spent by our own broadcast
    harness.fund(&wallet, vec![utxo("c", 0, 20_000)]);
    assert!(reservations.is_reserved(&kept.outpoint));
    assert_eq!(reservations.reservations_of(&wallet).len(), 1);
}

#[test]
fn test_request_waits_for_refresh() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    harness.utxo_source.set(&wallet, vec![utxo("a", 0, 50_000)]);
    harness.utxo_source.defer(true);
    harness.session.on_balance_changed(&wallet);

    let reservations = harness.session.reservations();
    assert_eq!(reservations.status(&wallet), InventoryStatus::Loading);

    let answer = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&answer);
    reservations.reserve_best_utxo_set(
        request(&wallet, 10_000),
        ReservationPurpose::XbtSpend,
        None,
        Box::new(move |result| {
            *slot.lock().unwrap() = Some(result);
        }),
    );
    assert!(answer.lock().unwrap().is_none());

    assert_eq!(harness.utxo_source.release_held(), 1);

    let (token, selection) = answer.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(selection.total, Amount::from_sat(50_000));
    assert!(token.is_active());
    assert_eq!(reservations.status(&wallet), InventoryStatus::Ready);
}

#[test]
fn test_stale_refresh_is_dropped() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    harness.utxo_source.set(&wallet, vec![utxo("a", 0, 50_000)]);
    harness.utxo_source.defer(true);

    harness.session.on_balance_changed(&wallet);
    harness.session.on_balance_changed(&wallet);
    let reservations = harness.session.reservations();

    harness.utxo_source.release_first();
    assert_eq!(reservations.status(&wallet), InventoryStatus::Loading);
    assert!(reservations.available(&wallet, &UtxoFilter::default()).is_empty());

    harness.utxo_source.release_first();
    assert_eq!(reservations.status(&wallet), InventoryStatus::Ready);
    assert_eq!(reservations.available(&wallet, &UtxoFilter::default()).len(), 1);
}

#[test]
fn test_unknown_and_removed_wallets() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    let reservations = harness.session.reservations();

    let answer = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&answer);
    reservations.get_best_utxo_set(
        request(&wallet, 1_000),
        Box::new(move |result| {
            *slot.lock().unwrap() = Some(result);
        }),
    );
    assert_eq!(
        answer.lock().unwrap().take().unwrap(),
        Err(ReservationError::UnknownWallet(wallet.clone()))
    );

    harness.utxo_source.set(&wallet, vec![utxo("a", 0, 50_000)]);
    harness.utxo_source.defer(true);
    harness.session.on_balance_changed(&wallet);

    let slot = Arc::clone(&answer);
    reservations.get_best_utxo_set(
        request(&wallet, 1_000),
        Box::new(move |result| {
            *slot.lock().unwrap() = Some(result);
        }),
    );
    harness.session.on_wallet_deleted(&wallet);

    assert_eq!(
        answer.lock().unwrap().take().unwrap(),
        Err(ReservationError::UnknownWallet(wallet.clone()))
    );
    assert_eq!(reservations.status(&wallet), InventoryStatus::Unknown);
}

#[test]
fn test_wallet_sync_drops_unlisted_wallets() {
    let harness = Harness::new();
    let kept = WalletId::from("kept");
    let gone = WalletId::from("gone");
    harness.fund(&kept, vec![utxo("a", 0, 10_000)]);
    harness.fund(&gone, vec![utxo("b", 0, 10_000)]);

    harness.session.on_wallets_synced(&[kept.clone()]);

    assert_eq!(harness.session.reservations().wallet_ids(), vec![kept]);
}

#[test]
fn test_failed_refresh_fails_parked_requests() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    let reservations = harness.session.reservations().clone();
    reservations.load_wallet(&wallet, vec![utxo("a", 0, 50_000)]);

    harness.utxo_source.defer(true);
    harness.session.on_balance_changed(&wallet);

    let answer = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&answer);
    reservations.get_best_utxo_set(
        request(&wallet, 1_000),
        Box::new(move |result| {
            *slot.lock().unwrap() = Some(result);
        }),
    );

    // revision 2 is the deferred refresh; load_wallet used revision 1
    assert!(reservations.apply_refresh(&wallet, 2, Err("node offline".to_string())));

    assert_eq!(
        answer.lock().unwrap().take().unwrap(),
        Err(ReservationError::Source {
            wallet_id: wallet.clone(),
            message: "node offline".to_string(),
        })
    );
    assert_eq!(reservations.status(&wallet), InventoryStatus::Failed);
    // the previous snapshot is still usable
    assert_eq!(reservations.available(&wallet, &UtxoFilter::default()).len(), 1);
}

#[test]
fn test_fee_floor_raises_rate() {
    let (manager, wallet) = funded_manager();
    let low = BestSetRequest::new(wallet.clone(), Amount::from_sat(10_000), FeeSpec::PerVbyte(0.5)).with_fee_floor(2.0);

    let selection = manager.best_utxo_set(&low).unwrap();

    // one input, recipient plus change
    assert_eq!(selection.fee, Amount::from_sat(2 * (11 + 68 + 2 * 31)));
    assert_eq!(manager.reservation_count(), 0);
}

#[test]
fn test_zero_conf_filtered_by_default() {
    setup();
    let manager = ReservationManager::new(SelectionConfig::default());
    let wallet = WalletId::from("main");
    let mut fresh = utxo("d", 0, 90_000);
    fresh.confirmations = 0;
    manager.load_wallet(&wallet, vec![fresh, utxo("e", 0, 10_000)]);

    assert_eq!(
        manager.available_balance(&wallet, &UtxoFilter::default()),
        Amount::from_sat(10_000)
    );
    assert_eq!(
        manager.available_balance(&wallet, &UtxoFilter::default().with_zero_conf()),
        Amount::from_sat(100_000)
    );

    let request = request(&wallet, 50_000).with_filter(UtxoFilter::default().with_zero_conf());
    assert_eq!(manager.best_utxo_set(&request).unwrap().input_count(), 1);
}

#[test]
fn test_leaf_filter_keeps_address_types_apart() {
    setup();
    let manager = ReservationManager::new(SelectionConfig::default());
    let wallet = WalletId::from("multi-leaf");
    manager.load_wallet(
        &wallet,
        vec![
            utxo("a", 0, 60_000),
            utxo("b", 0, 40_000).with_address_type(AddressType::Legacy),
            utxo("c", 0, 30_000).with_address_type(AddressType::Legacy),
        ],
    );
    let legacy_only = UtxoFilter {
        address_type: Some(AddressType::Legacy),
        ..UtxoFilter::default()
    };

    assert_eq!(manager.available_balance(&wallet, &legacy_only), Amount::from_sat(70_000));

    let unrestricted = manager.best_utxo_set(&request(&wallet, 50_000)).unwrap();
    assert_eq!(unrestricted.input_count(), 1);
    assert_eq!(unrestricted.selected[0].address_type, AddressType::NativeSegwit);

    let (token, selection) = manager
        .reserve_best(&request(&wallet, 50_000).with_filter(legacy_only), ReservationPurpose::XbtSpend, None)
        .unwrap();
    assert_eq!(selection.input_count(), 2);
    assert!(selection.selected.iter().all(|u| u.address_type == AddressType::Legacy));
    assert_eq!(manager.available_balance(&wallet, &legacy_only), Amount::ZERO);
    assert_eq!(
        manager.available_balance(&wallet, &UtxoFilter::default()),
        Amount::from_sat(60_000)
    );
    drop(token);

    assert_eq!(
        manager.best_utxo_set(&request(&wallet, 80_000).with_filter(legacy_only)),
        Err(ReservationError::Selection(SelectionError::InsufficientFunds {
            available: Amount::from_sat(70_000),
            required: Amount::from_sat(80_000),
        }))
    );
}

#[test]
fn test_events_follow_reservation_lifecycle() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    let events = harness.session.utxo_events().subscribe_all();
    harness.fund(&wallet, vec![utxo("a", 0, 50_000)]);

    let reservations = harness.session.reservations();
    let token = reservations
        .reserve_best(&request(&wallet, 10_000), ReservationPurpose::XbtSpend, None)
        .unwrap()
        .0;
    let id = token.id().cloned().unwrap();
    drop(token);
    let _ = reservations.reserve_best(&request(&wallet, 90_000), ReservationPurpose::XbtSpend, None);

    let received: Vec<UtxoEvent> = events.try_iter().collect();
    assert_eq!(received.len(), 4);
    assert!(matches!(
        &received[0],
        UtxoEvent::BalanceChanged { available_sat: 50_000, utxo_count: 1, .. }
    ));
    assert!(matches!(
        &received[1],
        UtxoEvent::ReservationAcquired { reservation_id, total_sat: 50_000, .. } if *reservation_id == id
    ));
    assert!(matches!(
        &received[2],
        UtxoEvent::ReservationReleased { reservation_id, .. } if *reservation_id == id
    ));
    assert!(matches!(
        &received[3],
        UtxoEvent::SelectionFailed { target_sat: 90_000, .. }
    ));
}

#[test]
fn test_rfq_reservation() {
    let harness = Harness::new();
    let wallet = WalletId::from("main");
    harness.fund(&wallet, vec![utxo("a", 0, 40_000_000), utxo("b", 0, 30_000_000)]);

    // buying 10000 EUR at 20000 EUR/XBT costs 0.5 XBT, plus 10% headroom
    let rfq = RfqRequest {
        wallet_id: wallet.clone(),
        side: Side::Buy,
        asset_type: AssetType::SpotXbt,
        product: "EUR".to_string(),
        quantity: dec!(10000),
        offer: dec!(20000),
        fee: FeeSpec::PerVbyte(1.0),
    };

    let (token, selection) = harness.session.reserve_for_rfq(&rfq).unwrap().unwrap();
    assert!(token.id().unwrap().as_str().starts_with("rfq_reserve_"));
    assert_eq!(selection.input_count(), 2);
    assert!(selection.total >= Amount::from_sat(55_000_000));

    let selling_tokens = RfqRequest {
        side: Side::Sell,
        asset_type: AssetType::PrivateMarket,
        product: "BLK".to_string(),
        ..rfq
    };
    assert!(harness.session.reserve_for_rfq(&selling_tokens).unwrap().is_none());
}

#[test]
fn test_concurrent_reservations_never_overlap() {
    let (manager, wallet) = funded_manager();
    manager.load_wallet(&wallet, (0..8).map(|vout| utxo("7", vout, 15_000)).collect());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let wallet = wallet.clone();
            thread::spawn(move || {
                let request = BestSetRequest::new(wallet, Amount::from_sat(10_000), FeeSpec::PerVbyte(1.0));
                manager.reserve_best(&request, ReservationPurpose::XbtSpend, None)
            })
        })
        .collect();

    let tokens: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().0)
        .collect();

    let mut seen = HashSet::new();
    for token in &tokens {
        for outpoint in token.outpoints() {
            assert!(seen.insert(*outpoint), "{} reserved twice", outpoint);
        }
    }
    assert_eq!(seen.len(), 8);
    assert!(manager.available(&wallet, &UtxoFilter::default()).is_empty());

    drop(tokens);
    assert_eq!(manager.available(&wallet, &UtxoFilter::default()).len(), 8);
}
