//! ccl-db
//!
//! SQLite persistence for the covered-call lot ledger.
//!
//! Layering: `ccl-ledger` owns every rule (validation, FIFO allocation,
//! lifecycle transitions, split arithmetic); this crate owns rows and
//! transaction boundaries.  Each logical operation in [`ops`] runs as one
//! explicit transaction — reservation rows and lot decrements either all
//! commit or none do.
//!
//! The pool is capped at a single connection: the ledger is single-user
//! and single-process by design, and one connection also makes
//! `sqlite::memory:` databases behave (each extra connection would open
//! its own empty in-memory database).

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use ccl_ledger::{
    FxRate, Lot, LotId, Micros, Obligation, ObligationId, ObligationStatus, Reservation, Sale,
    SaleId, SaleLeg,
};

pub mod integrity;
pub mod ops;

pub use integrity::{check_integrity, IntegrityReport, LotMismatch, ObligationMismatch};
pub use ops::OpError;

pub const ENV_DB_URL: &str = "CCL_DATABASE_URL";

/// Open a pool for `url` (e.g. `sqlite:ledger.db` or `sqlite::memory:`),
/// creating the file if missing.  Foreign keys are enforced.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid sqlite url: {url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open sqlite database: {url}"))?;

    Ok(pool)
}

/// Connect using CCL_DATABASE_URL.
pub async fn connect_from_env() -> Result<SqlitePool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as(
        "select exists (select 1 from sqlite_master where type = 'table' and name = 'lots')",
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_lots_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_lots_table: bool,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn bad_column(index: &str, detail: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source: detail.into(),
    }
}

fn lot_from_row(row: &SqliteRow) -> Result<Lot, sqlx::Error> {
    Ok(Lot {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        quantity_total: row.try_get("quantity_total")?,
        quantity_open: row.try_get("quantity_open")?,
        unit_cost: Micros::new(row.try_get("unit_cost_micros")?),
        fx_rate: FxRate::new(row.try_get("fx_rate_micros")?),
        purchase_date: row.try_get("purchase_date")?,
        fee: Micros::new(row.try_get("fee_micros")?),
    })
}

fn obligation_from_row(row: &SqliteRow) -> Result<Obligation, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = ObligationStatus::parse(&status_str)
        .ok_or_else(|| bad_column("status", format!("unknown obligation status '{status_str}'")))?;

    Ok(Obligation {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        contracts: row.try_get("contracts")?,
        strike: Micros::new(row.try_get("strike_micros")?),
        premium: Micros::new(row.try_get("premium_micros")?),
        open_date: row.try_get("open_date")?,
        expiry_date: row.try_get("expiry_date")?,
        open_fx: FxRate::new(row.try_get("open_fx_micros")?),
        status,
        close_date: row.try_get("close_date")?,
        close_premium: row
            .try_get::<Option<i64>, _>("close_premium_micros")?
            .map(Micros::new),
        close_fx: row
            .try_get::<Option<i64>, _>("close_fx_micros")?
            .map(FxRate::new),
        realized_usd: row
            .try_get::<Option<i64>, _>("realized_usd_micros")?
            .map(Micros::new),
        realized_pln: row
            .try_get::<Option<i64>, _>("realized_pln_micros")?
            .map(Micros::new),
        split_from: row.try_get("split_from")?,
    })
}

fn sale_from_row(row: &SqliteRow) -> Result<Sale, sqlx::Error> {
    Ok(Sale {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        quantity: row.try_get("quantity")?,
        sale_date: row.try_get("sale_date")?,
        price: Micros::new(row.try_get("price_micros")?),
        fee: Micros::new(row.try_get("fee_micros")?),
        fx_rate: FxRate::new(row.try_get("fx_rate_micros")?),
        realized_usd: Micros::new(row.try_get("realized_usd_micros")?),
        realized_pln: Micros::new(row.try_get("realized_pln_micros")?),
        obligation_id: row.try_get("obligation_id")?,
    })
}

// ---------------------------------------------------------------------------
// Read surface
// ---------------------------------------------------------------------------

/// All lots of a ticker in FIFO order (purchase_date, then id).
pub async fn fetch_lots<'e, E>(ex: E, ticker: &str) -> Result<Vec<Lot>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        r#"
        select id, ticker, quantity_total, quantity_open, unit_cost_micros,
               fx_rate_micros, purchase_date, fee_micros
        from lots
        where ticker = ?1
        order by purchase_date, id
        "#,
    )
    .bind(ticker)
    .fetch_all(ex)
    .await?;

    rows.iter().map(lot_from_row).collect()
}

pub async fn fetch_lot<'e, E>(ex: E, lot_id: LotId) -> Result<Option<Lot>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"
        select id, ticker, quantity_total, quantity_open, unit_cost_micros,
               fx_rate_micros, purchase_date, fee_micros
        from lots
        where id = ?1
        "#,
    )
    .bind(lot_id)
    .fetch_optional(ex)
    .await?;

    row.as_ref().map(lot_from_row).transpose()
}

pub async fn fetch_obligation<'e, E>(
    ex: E,
    obligation_id: ObligationId,
) -> Result<Option<Obligation>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("select * from obligations where id = ?1")
        .bind(obligation_id)
        .fetch_optional(ex)
        .await?;

    row.as_ref().map(obligation_from_row).transpose()
}

/// Obligations of a ticker, newest first.
pub async fn fetch_obligations<'e, E>(ex: E, ticker: &str) -> Result<Vec<Obligation>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query("select * from obligations where ticker = ?1 order by id desc")
        .bind(ticker)
        .fetch_all(ex)
        .await?;

    rows.iter().map(obligation_from_row).collect()
}

/// Reservation rows for one obligation, in insertion order.
pub async fn fetch_reservations<'e, E>(
    ex: E,
    obligation_id: ObligationId,
) -> Result<Vec<Reservation>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        r#"
        select obligation_id, lot_id, shares_reserved
        from reservations
        where obligation_id = ?1
        order by id
        "#,
    )
    .bind(obligation_id)
    .fetch_all(ex)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(Reservation {
                obligation_id: row.try_get("obligation_id")?,
                lot_id: row.try_get("lot_id")?,
                shares_reserved: row.try_get("shares_reserved")?,
            })
        })
        .collect()
}

/// Shares of a ticker currently reserved under open obligations.
pub async fn reserved_quantity<'e, E>(ex: E, ticker: &str) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let (sum,): (Option<i64>,) = sqlx::query_as(
        r#"
        select sum(r.shares_reserved)
        from reservations r
        join obligations o on o.id = r.obligation_id
        join lots l on l.id = r.lot_id
        where l.ticker = ?1 and o.status = 'OPEN'
        "#,
    )
    .bind(ticker)
    .fetch_one(ex)
    .await?;

    Ok(sum.unwrap_or(0))
}

/// Unencumbered shares of a ticker owned as of `as_of` (date-aware).
pub async fn available_quantity<'e, E>(
    ex: E,
    ticker: &str,
    as_of: NaiveDate,
) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let (sum,): (Option<i64>,) = sqlx::query_as(
        "select sum(quantity_open) from lots where ticker = ?1 and purchase_date <= ?2",
    )
    .bind(ticker)
    .bind(as_of)
    .fetch_one(ex)
    .await?;

    Ok(sum.unwrap_or(0))
}

pub async fn fetch_sale<'e, E>(ex: E, sale_id: SaleId) -> Result<Option<Sale>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("select * from sales where id = ?1")
        .bind(sale_id)
        .fetch_optional(ex)
        .await?;

    row.as_ref().map(sale_from_row).transpose()
}

pub async fn fetch_sale_legs<'e, E>(ex: E, sale_id: SaleId) -> Result<Vec<SaleLeg>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        r#"
        select sale_id, lot_id, quantity, cost_basis_micros
        from sale_legs
        where sale_id = ?1
        order by id
        "#,
    )
    .bind(sale_id)
    .fetch_all(ex)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(SaleLeg {
                sale_id: row.try_get("sale_id")?,
                lot_id: row.try_get("lot_id")?,
                quantity: row.try_get("quantity")?,
                cost_basis: Micros::new(row.try_get("cost_basis_micros")?),
            })
        })
        .collect()
}

/// One journal row as stored (links included).
#[derive(Clone, Debug)]
pub struct CashEventRow {
    pub id: i64,
    pub event_date: NaiveDate,
    pub kind: String,
    pub ticker: String,
    pub amount_usd: Micros,
    pub amount_pln: Micros,
    pub fx_rate: FxRate,
    pub memo: String,
    pub lot_id: Option<LotId>,
    pub obligation_id: Option<ObligationId>,
    pub sale_id: Option<SaleId>,
}

/// Journal rows for a ticker in date order.
pub async fn fetch_cash_events<'e, E>(ex: E, ticker: &str) -> Result<Vec<CashEventRow>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "select * from cash_events where ticker = ?1 order by event_date, id",
    )
    .bind(ticker)
    .fetch_all(ex)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(CashEventRow {
                id: row.try_get("id")?,
                event_date: row.try_get("event_date")?,
                kind: row.try_get("kind")?,
                ticker: row.try_get("ticker")?,
                amount_usd: Micros::new(row.try_get("amount_usd_micros")?),
                amount_pln: Micros::new(row.try_get("amount_pln_micros")?),
                fx_rate: FxRate::new(row.try_get("fx_rate_micros")?),
                memo: row.try_get("memo")?,
                lot_id: row.try_get("lot_id")?,
                obligation_id: row.try_get("obligation_id")?,
                sale_id: row.try_get("sale_id")?,
            })
        })
        .collect()
}
