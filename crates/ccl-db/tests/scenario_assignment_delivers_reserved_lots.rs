//! Assignment: the reserved shares are delivered at the strike.  The sale
//! must hit exactly the reserved lots, and their `quantity_open` must NOT
//! also be incremented by a release — the shares leave ownership, they do
//! not return to "open".

use ccl_db::ops::{assign, delete_sale, open_obligation, OpError, OpenObligation};
use ccl_db::{
    check_integrity, fetch_cash_events, fetch_lots, fetch_obligation, fetch_reservations,
    fetch_sale, fetch_sale_legs,
};
use ccl_ledger::{FxRate, Micros, ObligationStatus};
use ccl_testkit::{date, flat_rates, memory_store, seed_lot};

#[tokio::test]
async fn assignment_sells_the_reserved_shares_without_release() {
    let pool = memory_store().await.unwrap();
    let rates = flat_rates();

    let lot = seed_lot(
        &pool,
        "PLTR",
        100,
        Micros::from_units(20),
        FxRate::new(4_000_000),
        date(2024, 1, 5),
    )
    .await
    .unwrap();

    let opened = open_obligation(
        &pool,
        &rates,
        OpenObligation {
            ticker: "PLTR".into(),
            contracts: 1,
            strike: Micros::from_units(30),
            premium: Micros::from_units(200),
            open_date: date(2024, 1, 15),
            expiry_date: date(2024, 2, 16),
        },
    )
    .await
    .unwrap();

    let receipt = assign(&pool, &rates, opened.obligation_id, Micros::from_units(1))
        .await
        .unwrap();

    // stock leg: 100×30−1 = 2999 proceeds, 2000 basis → 999 USD; flat 4.00
    assert_eq!(receipt.realized_stock.usd, Micros::from_units(999));
    assert_eq!(receipt.realized_stock.pln, Micros::from_units(3996));
    // option leg: the full premium is kept
    assert_eq!(receipt.realized_option.usd, Micros::from_units(200));
    assert_eq!(receipt.realized_option.pln, Micros::from_units(800));

    let sale = fetch_sale(&pool, receipt.sale_id).await.unwrap().unwrap();
    assert_eq!(sale.quantity, 100);
    assert_eq!(sale.price, Micros::from_units(30));
    assert_eq!(sale.sale_date, date(2024, 2, 16));
    assert_eq!(sale.obligation_id, Some(opened.obligation_id));

    let legs = fetch_sale_legs(&pool, receipt.sale_id).await.unwrap();
    assert_eq!(legs.len(), 1);
    assert_eq!(legs[0].lot_id, lot);
    assert_eq!(legs[0].quantity, 100);
    assert_eq!(legs[0].cost_basis, Micros::from_units(2000));

    // the delivered shares are gone, not released
    assert_eq!(fetch_lots(&pool, "PLTR").await.unwrap()[0].quantity_open, 0);
    assert!(fetch_reservations(&pool, opened.obligation_id)
        .await
        .unwrap()
        .is_empty());

    let ob = fetch_obligation(&pool, opened.obligation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ob.status, ObligationStatus::Assigned);
    assert_eq!(ob.close_date, Some(date(2024, 2, 16)));
    assert_eq!(ob.realized_usd, Some(Micros::from_units(200)));

    let kinds: Vec<String> = fetch_cash_events(&pool, "PLTR")
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind.clone())
        .collect();
    assert_eq!(kinds, ["PREMIUM_RECEIVED", "SALE_PROCEEDS"]);

    assert!(check_integrity(&pool).await.unwrap().is_clean());
}

#[tokio::test]
async fn assignment_sales_cannot_be_deleted() {
    let pool = memory_store().await.unwrap();
    let rates = flat_rates();

    seed_lot(
        &pool,
        "PLTR",
        100,
        Micros::from_units(20),
        FxRate::new(4_000_000),
        date(2024, 1, 5),
    )
    .await
    .unwrap();
    let opened = open_obligation(
        &pool,
        &rates,
        OpenObligation {
            ticker: "PLTR".into(),
            contracts: 1,
            strike: Micros::from_units(30),
            premium: Micros::from_units(200),
            open_date: date(2024, 1, 15),
            expiry_date: date(2024, 2, 16),
        },
    )
    .await
    .unwrap();
    let receipt = assign(&pool, &rates, opened.obligation_id, Micros::ZERO)
        .await
        .unwrap();

    let err = delete_sale(&pool, receipt.sale_id).await.unwrap_err();
    match err {
        OpError::AssignmentSale {
            sale_id,
            obligation_id,
        } => {
            assert_eq!(sale_id, receipt.sale_id);
            assert_eq!(obligation_id, opened.obligation_id);
        }
        other => panic!("expected assignment-sale refusal, got {other}"),
    }
    // still there
    assert!(fetch_sale(&pool, receipt.sale_id).await.unwrap().is_some());
}
