//! Partial buy-back splits an obligation: the original row continues open
//! with the remainder, a new terminal row carries the closed portion, and
//! only the closed portion's shares return to the lot.

use ccl_db::ops::{buy_back_partial, open_obligation, OpError, OpenObligation};
use ccl_db::{check_integrity, fetch_lots, fetch_obligation, fetch_reservations};
use ccl_ledger::{FxRate, Micros, ObligationStatus, ValidationError};
use ccl_testkit::{date, flat_rates, memory_store, seed_lot};

async fn two_contract_position(pool: &sqlx::SqlitePool) -> (i64, i64) {
    let lot = seed_lot(
        pool,
        "PLTR",
        300,
        Micros::from_units(20),
        FxRate::new(4_000_000),
        date(2024, 1, 5),
    )
    .await
    .unwrap();

    let receipt = open_obligation(
        pool,
        &flat_rates(),
        OpenObligation {
            ticker: "PLTR".into(),
            contracts: 2,
            strike: Micros::from_units(30),
            premium: Micros::from_units(300),
            open_date: date(2024, 1, 15),
            expiry_date: date(2024, 2, 16),
        },
    )
    .await
    .unwrap();
    (lot, receipt.obligation_id)
}

#[tokio::test]
async fn closing_one_of_two_contracts_splits_the_row() {
    let pool = memory_store().await.unwrap();
    let rates = flat_rates();
    let (lot, original) = two_contract_position(&pool).await;

    assert_eq!(fetch_lots(&pool, "PLTR").await.unwrap()[0].quantity_open, 100);

    let receipt = buy_back_partial(
        &pool,
        &rates,
        original,
        1,
        Micros::from_units(50),
        date(2024, 2, 1),
    )
    .await
    .unwrap();
    assert_eq!(receipt.continuing_id, Some(original));
    assert_ne!(receipt.closed_id, original);
    // closed premium 150, paid 50, flat 4.00 → 100 USD / 400 PLN
    assert_eq!(receipt.realized.usd, Micros::from_units(100));
    assert_eq!(receipt.realized.pln, Micros::from_units(400));

    // the continuing original: still OPEN, half the contracts and premium,
    // reservations still pointing at it
    let cont = fetch_obligation(&pool, original).await.unwrap().unwrap();
    assert_eq!(cont.status, ObligationStatus::Open);
    assert_eq!(cont.contracts, 1);
    assert_eq!(cont.premium, Micros::from_units(150));
    assert_eq!(cont.split_from, None);

    let closed = fetch_obligation(&pool, receipt.closed_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.status, ObligationStatus::BoughtBack);
    assert_eq!(closed.contracts, 1);
    assert_eq!(closed.premium, Micros::from_units(150));
    assert_eq!(closed.split_from, Some(original));
    assert_eq!(closed.close_premium, Some(Micros::from_units(50)));

    let reservations = fetch_reservations(&pool, original).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].lot_id, lot);
    assert_eq!(reservations[0].shares_reserved, 100);
    assert!(fetch_reservations(&pool, receipt.closed_id)
        .await
        .unwrap()
        .is_empty());

    // 300 total − 100 still reserved
    assert_eq!(fetch_lots(&pool, "PLTR").await.unwrap()[0].quantity_open, 200);
    assert!(check_integrity(&pool).await.unwrap().is_clean());
}

#[tokio::test]
async fn closing_all_contracts_is_rejected_as_a_split() {
    let pool = memory_store().await.unwrap();
    let (_, original) = two_contract_position(&pool).await;

    let err = buy_back_partial(
        &pool,
        &flat_rates(),
        original,
        2,
        Micros::from_units(100),
        date(2024, 2, 1),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        OpError::Validation(ValidationError::ContractsExceedOpen { requested: 2, open: 2 })
    ));

    // untouched
    let ob = fetch_obligation(&pool, original).await.unwrap().unwrap();
    assert_eq!(ob.contracts, 2);
    assert_eq!(ob.status, ObligationStatus::Open);
}
