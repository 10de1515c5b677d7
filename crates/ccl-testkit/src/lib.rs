//! Shared test fixtures: in-memory stores, deterministic rate tables and
//! seed helpers.  Dev-dependency only; nothing here ships.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::SqlitePool;

use ccl_fx::RateTable;
use ccl_ledger::{FxRate, Micros};

/// Fresh migrated in-memory store.  Single connection, so the database
/// lives exactly as long as the returned pool.
pub async fn memory_store() -> Result<SqlitePool> {
    let pool = ccl_db::connect("sqlite::memory:").await?;
    ccl_db::migrate(&pool).await?;
    Ok(pool)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid fixture date")
}

/// A rate table answering 4.000000 PLN/USD for every day of 2024, the
/// boring baseline most scenarios want.
pub fn flat_rates() -> RateTable {
    let mut table = RateTable::new();
    let mut day = date(2024, 1, 1);
    while day <= date(2024, 12, 31) {
        table.insert(day, FxRate::new(4_000_000));
        day = day.succ_opt().expect("valid successor date");
    }
    table
}

/// Rate table from explicit (date, micros) pairs, for scenarios where the
/// open-date and close-date rates must differ.
pub fn rates_from(pairs: &[(NaiveDate, i64)]) -> RateTable {
    RateTable::from_pairs(pairs.iter().map(|(d, m)| (*d, FxRate::new(*m))))
}

/// Insert a lot row directly, bypassing the operations layer.  For tests
/// that need a precise starting ledger without journal side effects.
pub async fn seed_lot(
    pool: &SqlitePool,
    ticker: &str,
    quantity: i64,
    unit_cost: Micros,
    fx_rate: FxRate,
    purchase_date: NaiveDate,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        insert into lots
            (ticker, quantity_total, quantity_open, unit_cost_micros,
             fx_rate_micros, purchase_date, fee_micros)
        values (?1, ?2, ?2, ?3, ?4, ?5, 0)
        "#,
    )
    .bind(ticker)
    .bind(quantity)
    .bind(unit_cost.raw())
    .bind(fx_rate.raw())
    .bind(purchase_date)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}
