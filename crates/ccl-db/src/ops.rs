//! Transactional operations — one explicit transaction per logical action.
//!
//! Every function here follows the same shape: resolve the FX rate first
//! (network, outside the transaction), `begin`, read the rows it needs,
//! run the pure rules from `ccl-ledger`, write the outcome, `commit`.
//! Any early return drops the transaction, which rolls it back, so a
//! shortfall or a rejected transition never leaves partial rows behind.
//!
//! Dates follow the D-1 convention: an event on date D converts at the
//! rate effective on the last trading day strictly before D, which is what
//! `d1()` plus the source's on-or-before lookup produce.

use chrono::NaiveDate;
use sqlx::SqlitePool;
use tracing::info;

use ccl_fx::{d1, RateError, RateSource};
use ccl_ledger::{
    adjust_open, allocate_fifo, buyback_pnl, ensure_open, expiry_pnl, plan_partial_close,
    AllocationError, CashEvent, CashEventKind, CloseAction, ConsistencyError, FxRate,
    InvalidStateTransitionError, Lot, LotId, LotTake, Micros, NewLot, Obligation, ObligationId,
    ObligationStatus, Outcome, PartialCloseError, Pnl, Reservation, SaleId, Shortfall,
    ValidationError, SHARES_PER_CONTRACT,
};

use crate::{fetch_lot, fetch_lots, fetch_obligation, fetch_reservations, fetch_sale,
    fetch_sale_legs};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of one logical operation.  The transaction is rolled back in
/// every case; `Coverage` is the only variant a caller is expected to
/// present as a routine outcome rather than a fault.
#[derive(Debug)]
pub enum OpError {
    /// Malformed input, rejected before any read or write.
    Validation(ValidationError),
    /// Eligible lots cannot cover the requested shares.
    Coverage(Shortfall),
    /// A ledger invariant would break; indicates an upstream defect.
    Consistency(ConsistencyError),
    /// Close action attempted on a non-open obligation.
    Transition(InvalidStateTransitionError),
    /// Invalid allocation request.
    Allocation(AllocationError),
    /// The FX rate for the event date could not be resolved.
    Rate(RateError),
    /// Referenced row does not exist.
    NotFound { entity: &'static str, id: i64 },
    /// Sales created by assignment are part of the obligation's closed
    /// history and cannot be deleted on their own.
    AssignmentSale {
        sale_id: SaleId,
        obligation_id: ObligationId,
    },
    Db(sqlx::Error),
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{e}"),
            Self::Coverage(s) => write!(f, "{s}"),
            Self::Consistency(e) => write!(f, "{e}"),
            Self::Transition(e) => write!(f, "{e}"),
            Self::Allocation(e) => write!(f, "{e}"),
            Self::Rate(e) => write!(f, "{e}"),
            Self::NotFound { entity, id } => write!(f, "{entity} {id} not found"),
            Self::AssignmentSale {
                sale_id,
                obligation_id,
            } => write!(
                f,
                "sale {sale_id} was generated by assignment of obligation {obligation_id} and cannot be deleted"
            ),
            Self::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Db(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for OpError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ConsistencyError> for OpError {
    fn from(e: ConsistencyError) -> Self {
        Self::Consistency(e)
    }
}

impl From<InvalidStateTransitionError> for OpError {
    fn from(e: InvalidStateTransitionError) -> Self {
        Self::Transition(e)
    }
}

impl From<AllocationError> for OpError {
    fn from(e: AllocationError) -> Self {
        Self::Allocation(e)
    }
}

impl From<PartialCloseError> for OpError {
    fn from(e: PartialCloseError) -> Self {
        match e {
            PartialCloseError::Validation(v) => Self::Validation(v),
            PartialCloseError::Consistency(c) => Self::Consistency(c),
        }
    }
}

impl From<RateError> for OpError {
    fn from(e: RateError) -> Self {
        Self::Rate(e)
    }
}

impl From<sqlx::Error> for OpError {
    fn from(e: sqlx::Error) -> Self {
        Self::Db(e)
    }
}

// ---------------------------------------------------------------------------
// Inputs and receipts
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CreateLot {
    pub ticker: String,
    pub quantity: i64,
    /// Per-share purchase price, USD micros.
    pub unit_cost: Micros,
    pub purchase_date: NaiveDate,
    pub fee: Micros,
}

#[derive(Clone, Debug)]
pub struct RecordSale {
    pub ticker: String,
    pub quantity: i64,
    /// Per-share sale price, USD micros.
    pub price: Micros,
    pub fee: Micros,
    pub sale_date: NaiveDate,
}

#[derive(Clone, Debug)]
pub struct OpenObligation {
    pub ticker: String,
    pub contracts: i64,
    pub strike: Micros,
    /// Premium received for the whole position, USD micros.
    pub premium: Micros,
    pub open_date: NaiveDate,
    pub expiry_date: NaiveDate,
}

#[derive(Clone, Debug)]
pub struct SaleReceipt {
    pub sale_id: SaleId,
    /// FIFO breakdown of which lots supplied the shares.
    pub legs: Vec<LotTake>,
    pub realized: Pnl,
}

#[derive(Clone, Debug)]
pub struct ObligationReceipt {
    pub obligation_id: ObligationId,
    pub reservations: Vec<Reservation>,
}

#[derive(Clone, Debug)]
pub struct BuyBackReceipt {
    /// The row that reached `BOUGHT_BACK`.  On a partial close this is the
    /// freshly inserted split row, not the continuing original.
    pub closed_id: ObligationId,
    /// The continuing `OPEN` row, present only on a partial close.
    pub continuing_id: Option<ObligationId>,
    pub realized: Pnl,
}

#[derive(Clone, Debug)]
pub struct AssignmentReceipt {
    pub sale_id: SaleId,
    /// Share-delivery P/L: strike proceeds minus delivered cost basis.
    pub realized_stock: Pnl,
    /// Option P/L: the full premium, kept.
    pub realized_option: Pnl,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EraseReport {
    pub lots: u64,
    pub obligations: u64,
    pub reservations: u64,
    pub sales: u64,
    pub sale_legs: u64,
    pub cash_events: u64,
}

// ---------------------------------------------------------------------------
// Rate resolution
// ---------------------------------------------------------------------------

/// Rate effective for an event on `date` under the D-1 convention.
async fn rate_for_event(rates: &dyn RateSource, date: NaiveDate) -> Result<FxRate, OpError> {
    let quote = rates.rate_for(d1(date)).await?;
    Ok(quote.rate)
}

// ---------------------------------------------------------------------------
// Write helpers (used inside transactions only)
// ---------------------------------------------------------------------------

type Tx<'t> = sqlx::Transaction<'t, sqlx::Sqlite>;

async fn write_lot_open(tx: &mut Tx<'_>, lot: &Lot) -> Result<(), sqlx::Error> {
    sqlx::query("update lots set quantity_open = ?1 where id = ?2")
        .bind(lot.quantity_open)
        .bind(lot.id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Apply a delta to one lot's `quantity_open`, invariant-checked, and
/// persist the result.
async fn apply_lot_delta(tx: &mut Tx<'_>, lot_id: LotId, delta: i64) -> Result<(), OpError> {
    let mut lot = fetch_lot(&mut **tx, lot_id)
        .await?
        .ok_or(OpError::NotFound {
            entity: "lot",
            id: lot_id,
        })?;
    adjust_open(&mut lot, delta)?;
    write_lot_open(tx, &lot).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_cash_event(
    tx: &mut Tx<'_>,
    event: &CashEvent,
    lot_id: Option<LotId>,
    obligation_id: Option<ObligationId>,
    sale_id: Option<SaleId>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into cash_events
            (event_date, kind, ticker, amount_usd_micros, fx_rate_micros,
             amount_pln_micros, memo, lot_id, obligation_id, sale_id)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(event.event_date)
    .bind(event.kind.as_str())
    .bind(&event.ticker)
    .bind(event.amount_usd.raw())
    .bind(event.fx_rate.raw())
    .bind(event.amount_pln.raw())
    .bind(&event.memo)
    .bind(lot_id)
    .bind(obligation_id)
    .bind(sale_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Release every reservation of an obligation back into its lots and
/// delete the rows.  Used by full buy-back and expiry.
async fn release_all_reservations(
    tx: &mut Tx<'_>,
    obligation_id: ObligationId,
) -> Result<(), OpError> {
    let reservations = fetch_reservations(&mut **tx, obligation_id).await?;
    for r in &reservations {
        apply_lot_delta(tx, r.lot_id, r.shares_reserved).await?;
    }
    sqlx::query("delete from reservations where obligation_id = ?1")
        .bind(obligation_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn require_obligation(ob: Option<Obligation>, id: ObligationId) -> Result<Obligation, OpError> {
    ob.ok_or(OpError::NotFound {
        entity: "obligation",
        id,
    })
}

// ---------------------------------------------------------------------------
// Lot operations
// ---------------------------------------------------------------------------

/// Record a share purchase: a new lot plus its journal entry.
pub async fn create_lot(
    pool: &SqlitePool,
    rates: &dyn RateSource,
    input: CreateLot,
) -> Result<LotId, OpError> {
    let fx = rate_for_event(rates, input.purchase_date).await?;
    let lot = NewLot::new(
        input.ticker,
        input.quantity,
        input.unit_cost,
        fx,
        input.purchase_date,
        input.fee,
    )?;

    let mut tx = pool.begin().await?;

    let lot_id = sqlx::query(
        r#"
        insert into lots
            (ticker, quantity_total, quantity_open, unit_cost_micros,
             fx_rate_micros, purchase_date, fee_micros)
        values (?1, ?2, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&lot.ticker)
    .bind(lot.quantity)
    .bind(lot.unit_cost.raw())
    .bind(lot.fx_rate.raw())
    .bind(lot.purchase_date)
    .bind(lot.fee.raw())
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let total = lot
        .unit_cost
        .checked_mul_qty(lot.quantity)
        .unwrap_or(Micros::new(i64::MAX))
        .saturating_add(lot.fee);
    let event = CashEvent::new(
        CashEventKind::LotPurchase,
        lot.purchase_date,
        lot.ticker.clone(),
        -total,
        fx,
        format!("buy {} x {}", lot.quantity, lot.ticker),
    );
    insert_cash_event(&mut tx, &event, Some(lot_id), None, None).await?;

    tx.commit().await?;
    info!(lot_id, ticker = %lot.ticker, quantity = lot.quantity, "lot created");
    Ok(lot_id)
}

/// Dry-run the FIFO allocator against current lots.  Read-only; the
/// returned takes are what `record_sale` or `open_obligation` would use.
pub async fn preview_allocation(
    pool: &SqlitePool,
    ticker: &str,
    quantity: i64,
    as_of: NaiveDate,
) -> Result<Outcome, OpError> {
    let lots = fetch_lots(pool, ticker).await?;
    Ok(allocate_fifo(&lots, quantity, as_of)?)
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

fn validate_sale(input: &RecordSale) -> Result<(), ValidationError> {
    if input.ticker.trim().is_empty() {
        return Err(ValidationError::EmptyTicker);
    }
    if input.quantity <= 0 {
        return Err(ValidationError::NonPositiveQuantity {
            quantity: input.quantity,
        });
    }
    if !input.price.is_positive() {
        return Err(ValidationError::NonPositivePrice { price: input.price });
    }
    if input.fee.is_negative() {
        return Err(ValidationError::NegativeFee { fee: input.fee });
    }
    Ok(())
}

/// Sell shares FIFO.  Reserved shares are untouchable: they are already
/// excluded from `quantity_open`, so the allocator never sees them.
pub async fn record_sale(
    pool: &SqlitePool,
    rates: &dyn RateSource,
    input: RecordSale,
) -> Result<SaleReceipt, OpError> {
    validate_sale(&input)?;
    let sale_fx = rate_for_event(rates, input.sale_date).await?;

    let mut tx = pool.begin().await?;

    let lots = fetch_lots(&mut *tx, &input.ticker).await?;
    let takes = match allocate_fifo(&lots, input.quantity, input.sale_date)? {
        Outcome::Allocated(takes) => takes,
        Outcome::Shortfall(s) => return Err(OpError::Coverage(s)),
    };

    let gross = input
        .price
        .checked_mul_qty(input.quantity)
        .unwrap_or(Micros::new(i64::MAX))
        .saturating_sub(input.fee);

    // Cost basis converts at each lot's own purchase-date rate; proceeds
    // at the sale-date rate.
    let mut basis_usd = Micros::ZERO;
    let mut basis_pln = Micros::ZERO;
    for take in &takes {
        let lot = lots
            .iter()
            .find(|l| l.id == take.lot_id)
            .ok_or(OpError::NotFound {
                entity: "lot",
                id: take.lot_id,
            })?;
        basis_usd = basis_usd.saturating_add(take.cost_basis);
        basis_pln = basis_pln.saturating_add(take.cost_basis.convert(lot.fx_rate));
    }
    let realized = Pnl {
        usd: gross.saturating_sub(basis_usd),
        pln: gross.convert(sale_fx).saturating_sub(basis_pln),
    };

    let sale_id = sqlx::query(
        r#"
        insert into sales
            (ticker, quantity, sale_date, price_micros, fee_micros,
             fx_rate_micros, realized_usd_micros, realized_pln_micros, obligation_id)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, null)
        "#,
    )
    .bind(&input.ticker)
    .bind(input.quantity)
    .bind(input.sale_date)
    .bind(input.price.raw())
    .bind(input.fee.raw())
    .bind(sale_fx.raw())
    .bind(realized.usd.raw())
    .bind(realized.pln.raw())
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for take in &takes {
        sqlx::query(
            "insert into sale_legs (sale_id, lot_id, quantity, cost_basis_micros) values (?1, ?2, ?3, ?4)",
        )
        .bind(sale_id)
        .bind(take.lot_id)
        .bind(take.quantity)
        .bind(take.cost_basis.raw())
        .execute(&mut *tx)
        .await?;
        apply_lot_delta(&mut tx, take.lot_id, -take.quantity).await?;
    }

    let event = CashEvent::new(
        CashEventKind::SaleProceeds,
        input.sale_date,
        input.ticker.clone(),
        gross,
        sale_fx,
        format!("sell {} x {}", input.quantity, input.ticker),
    );
    insert_cash_event(&mut tx, &event, None, None, Some(sale_id)).await?;

    tx.commit().await?;
    info!(sale_id, ticker = %input.ticker, quantity = input.quantity, "sale recorded");
    Ok(SaleReceipt {
        sale_id,
        legs: takes,
        realized,
    })
}

/// Undo a manually recorded sale, restoring the shares to their lots.
/// Refuses assignment-generated sales; those belong to the obligation's
/// history and only exist because the obligation was assigned.
pub async fn delete_sale(pool: &SqlitePool, sale_id: SaleId) -> Result<(), OpError> {
    let mut tx = pool.begin().await?;

    let sale = fetch_sale(&mut *tx, sale_id)
        .await?
        .ok_or(OpError::NotFound {
            entity: "sale",
            id: sale_id,
        })?;
    if let Some(obligation_id) = sale.obligation_id {
        return Err(OpError::AssignmentSale {
            sale_id,
            obligation_id,
        });
    }

    let legs = fetch_sale_legs(&mut *tx, sale_id).await?;
    for leg in &legs {
        apply_lot_delta(&mut tx, leg.lot_id, leg.quantity).await?;
    }

    sqlx::query("delete from cash_events where sale_id = ?1")
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("delete from sale_legs where sale_id = ?1")
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("delete from sales where id = ?1")
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!(sale_id, "sale deleted, shares restored");
    Ok(())
}

// ---------------------------------------------------------------------------
// Obligations
// ---------------------------------------------------------------------------

fn validate_obligation(input: &OpenObligation) -> Result<(), ValidationError> {
    if input.ticker.trim().is_empty() {
        return Err(ValidationError::EmptyTicker);
    }
    if input.contracts <= 0 {
        return Err(ValidationError::NonPositiveContracts {
            contracts: input.contracts,
        });
    }
    if !input.strike.is_positive() {
        return Err(ValidationError::NonPositivePrice {
            price: input.strike,
        });
    }
    if input.premium.is_negative() {
        return Err(ValidationError::NegativePremium {
            premium: input.premium,
        });
    }
    Ok(())
}

/// Sell covered calls: allocate coverage FIFO as of the open date, reserve
/// it, record the obligation and journal the premium.  A shortfall commits
/// nothing.
pub async fn open_obligation(
    pool: &SqlitePool,
    rates: &dyn RateSource,
    input: OpenObligation,
) -> Result<ObligationReceipt, OpError> {
    validate_obligation(&input)?;
    let open_fx = rate_for_event(rates, input.open_date).await?;
    let needed = input.contracts * SHARES_PER_CONTRACT;

    let mut tx = pool.begin().await?;

    let lots = fetch_lots(&mut *tx, &input.ticker).await?;
    let takes = match allocate_fifo(&lots, needed, input.open_date)? {
        Outcome::Allocated(takes) => takes,
        Outcome::Shortfall(s) => return Err(OpError::Coverage(s)),
    };

    let obligation_id = sqlx::query(
        r#"
        insert into obligations
            (ticker, contracts, strike_micros, premium_micros, open_date,
             expiry_date, open_fx_micros, status)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'OPEN')
        "#,
    )
    .bind(&input.ticker)
    .bind(input.contracts)
    .bind(input.strike.raw())
    .bind(input.premium.raw())
    .bind(input.open_date)
    .bind(input.expiry_date)
    .bind(open_fx.raw())
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let mut reservations = Vec::with_capacity(takes.len());
    for take in &takes {
        sqlx::query(
            "insert into reservations (obligation_id, lot_id, shares_reserved) values (?1, ?2, ?3)",
        )
        .bind(obligation_id)
        .bind(take.lot_id)
        .bind(take.quantity)
        .execute(&mut *tx)
        .await?;
        apply_lot_delta(&mut tx, take.lot_id, -take.quantity).await?;
        reservations.push(Reservation {
            obligation_id,
            lot_id: take.lot_id,
            shares_reserved: take.quantity,
        });
    }

    let event = CashEvent::new(
        CashEventKind::PremiumReceived,
        input.open_date,
        input.ticker.clone(),
        input.premium,
        open_fx,
        format!("open {}x {} call", input.contracts, input.ticker),
    );
    insert_cash_event(&mut tx, &event, None, Some(obligation_id), None).await?;

    tx.commit().await?;
    info!(
        obligation_id,
        ticker = %input.ticker,
        contracts = input.contracts,
        "obligation opened"
    );
    Ok(ObligationReceipt {
        obligation_id,
        reservations,
    })
}

async fn mark_closed(
    tx: &mut Tx<'_>,
    obligation_id: ObligationId,
    status: ObligationStatus,
    close_date: NaiveDate,
    close_premium: Option<Micros>,
    close_fx: Option<FxRate>,
    realized: Pnl,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        update obligations
        set status = ?1, close_date = ?2, close_premium_micros = ?3,
            close_fx_micros = ?4, realized_usd_micros = ?5, realized_pln_micros = ?6
        where id = ?7
        "#,
    )
    .bind(status.as_str())
    .bind(close_date)
    .bind(close_premium.map(Micros::raw))
    .bind(close_fx.map(FxRate::raw))
    .bind(realized.usd.raw())
    .bind(realized.pln.raw())
    .bind(obligation_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Buy back the whole obligation: reservations released, shares free
/// again, premium delta realized with each leg at its own date's rate.
pub async fn buy_back(
    pool: &SqlitePool,
    rates: &dyn RateSource,
    obligation_id: ObligationId,
    paid: Micros,
    close_date: NaiveDate,
) -> Result<BuyBackReceipt, OpError> {
    if paid.is_negative() {
        return Err(OpError::Validation(ValidationError::NegativePremium {
            premium: paid,
        }));
    }
    let close_fx = rate_for_event(rates, close_date).await?;

    let mut tx = pool.begin().await?;

    let ob = require_obligation(fetch_obligation(&mut *tx, obligation_id).await?, obligation_id)?;
    ensure_open(&ob, CloseAction::BuyBack)?;

    let realized = buyback_pnl(ob.premium, ob.open_fx, paid, close_fx);
    release_all_reservations(&mut tx, obligation_id).await?;
    mark_closed(
        &mut tx,
        obligation_id,
        ObligationStatus::BoughtBack,
        close_date,
        Some(paid),
        Some(close_fx),
        realized,
    )
    .await?;

    let event = CashEvent::new(
        CashEventKind::PremiumPaid,
        close_date,
        ob.ticker.clone(),
        -paid,
        close_fx,
        format!("buy back {}x {} call", ob.contracts, ob.ticker),
    );
    insert_cash_event(&mut tx, &event, None, Some(obligation_id), None).await?;

    tx.commit().await?;
    info!(obligation_id, "obligation bought back");
    Ok(BuyBackReceipt {
        closed_id: obligation_id,
        continuing_id: None,
        realized,
    })
}

/// Buy back part of the position.  The original row continues `OPEN` with
/// the remaining contracts and premium remainder (its reservations shrink
/// in place, so their obligation link never changes); a new terminal row
/// carries the closed portion, tagged with `split_from`.
pub async fn buy_back_partial(
    pool: &SqlitePool,
    rates: &dyn RateSource,
    obligation_id: ObligationId,
    contracts_to_close: i64,
    paid: Micros,
    close_date: NaiveDate,
) -> Result<BuyBackReceipt, OpError> {
    if paid.is_negative() {
        return Err(OpError::Validation(ValidationError::NegativePremium {
            premium: paid,
        }));
    }
    let close_fx = rate_for_event(rates, close_date).await?;

    let mut tx = pool.begin().await?;

    let ob = require_obligation(fetch_obligation(&mut *tx, obligation_id).await?, obligation_id)?;
    ensure_open(&ob, CloseAction::BuyBack)?;
    let reservations = fetch_reservations(&mut *tx, obligation_id).await?;
    let plan = plan_partial_close(&ob, &reservations, contracts_to_close)?;

    let realized = buyback_pnl(plan.closed_premium, ob.open_fx, paid, close_fx);

    let closed_id = sqlx::query(
        r#"
        insert into obligations
            (ticker, contracts, strike_micros, premium_micros, open_date,
             expiry_date, open_fx_micros, status, close_date,
             close_premium_micros, close_fx_micros, realized_usd_micros,
             realized_pln_micros, split_from)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'BOUGHT_BACK', ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&ob.ticker)
    .bind(plan.closed_contracts)
    .bind(ob.strike.raw())
    .bind(plan.closed_premium.raw())
    .bind(ob.open_date)
    .bind(ob.expiry_date)
    .bind(ob.open_fx.raw())
    .bind(close_date)
    .bind(paid.raw())
    .bind(close_fx.raw())
    .bind(realized.usd.raw())
    .bind(realized.pln.raw())
    .bind(obligation_id)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for split in &plan.splits {
        if split.released > 0 {
            apply_lot_delta(&mut tx, split.lot_id, split.released).await?;
        }
        if split.retained == 0 {
            sqlx::query("delete from reservations where obligation_id = ?1 and lot_id = ?2")
                .bind(obligation_id)
                .bind(split.lot_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "update reservations set shares_reserved = ?1 where obligation_id = ?2 and lot_id = ?3",
            )
            .bind(split.retained)
            .bind(obligation_id)
            .bind(split.lot_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query("update obligations set contracts = ?1, premium_micros = ?2 where id = ?3")
        .bind(plan.continuing_contracts)
        .bind(plan.continuing_premium.raw())
        .bind(obligation_id)
        .execute(&mut *tx)
        .await?;

    let event = CashEvent::new(
        CashEventKind::PremiumPaid,
        close_date,
        ob.ticker.clone(),
        -paid,
        close_fx,
        format!(
            "buy back {} of {}x {} call",
            plan.closed_contracts, ob.contracts, ob.ticker
        ),
    );
    insert_cash_event(&mut tx, &event, None, Some(closed_id), None).await?;

    tx.commit().await?;
    info!(
        obligation_id,
        closed_id,
        contracts = contracts_to_close,
        "obligation partially bought back"
    );
    Ok(BuyBackReceipt {
        closed_id,
        continuing_id: Some(obligation_id),
        realized,
    })
}

/// The obligation expired worthless: full premium kept, shares released.
/// No cash moves (the premium was journaled at open), so no journal row.
pub async fn expire(pool: &SqlitePool, obligation_id: ObligationId) -> Result<Pnl, OpError> {
    let mut tx = pool.begin().await?;

    let ob = require_obligation(fetch_obligation(&mut *tx, obligation_id).await?, obligation_id)?;
    ensure_open(&ob, CloseAction::Expire)?;

    let realized = expiry_pnl(ob.premium, ob.open_fx);
    release_all_reservations(&mut tx, obligation_id).await?;
    mark_closed(
        &mut tx,
        obligation_id,
        ObligationStatus::Expired,
        ob.expiry_date,
        None,
        None,
        realized,
    )
    .await?;

    tx.commit().await?;
    info!(obligation_id, "obligation expired");
    Ok(realized)
}

/// The call was exercised: the reserved shares are delivered at the
/// strike.  Reservation rows convert directly into sale legs, so the
/// lots' `quantity_open` does not move (the shares were already
/// encumbered; now they are gone).  Two P/L figures result: the share
/// delivery and the option premium.
pub async fn assign(
    pool: &SqlitePool,
    rates: &dyn RateSource,
    obligation_id: ObligationId,
    fee: Micros,
) -> Result<AssignmentReceipt, OpError> {
    if fee.is_negative() {
        return Err(OpError::Validation(ValidationError::NegativeFee { fee }));
    }

    // The rate date is known only after the obligation row is read, so the
    // transaction opens after the fetch below.
    let ob = require_obligation(fetch_obligation(pool, obligation_id).await?, obligation_id)?;
    ensure_open(&ob, CloseAction::Assign)?;
    let sale_fx = rate_for_event(rates, ob.expiry_date).await?;

    let mut tx = pool.begin().await?;

    // Re-read inside the transaction; the pre-read only served the rate
    // lookup.
    let ob = require_obligation(fetch_obligation(&mut *tx, obligation_id).await?, obligation_id)?;
    ensure_open(&ob, CloseAction::Assign)?;

    let reservations = fetch_reservations(&mut *tx, obligation_id).await?;
    let covered: i64 = reservations.iter().map(|r| r.shares_reserved).sum();
    if covered != ob.shares_obligated() {
        return Err(OpError::Consistency(
            ConsistencyError::ReservationSumMismatch {
                obligation_id,
                reserved: covered,
                obligated: ob.shares_obligated(),
            },
        ));
    }

    let gross = ob
        .strike
        .checked_mul_qty(covered)
        .unwrap_or(Micros::new(i64::MAX))
        .saturating_sub(fee);

    let mut basis_usd = Micros::ZERO;
    let mut basis_pln = Micros::ZERO;
    let mut legs = Vec::with_capacity(reservations.len());
    for r in &reservations {
        let lot = fetch_lot(&mut *tx, r.lot_id)
            .await?
            .ok_or(OpError::NotFound {
                entity: "lot",
                id: r.lot_id,
            })?;
        let basis = lot.cost_basis_for(r.shares_reserved);
        basis_usd = basis_usd.saturating_add(basis);
        basis_pln = basis_pln.saturating_add(basis.convert(lot.fx_rate));
        legs.push((r.lot_id, r.shares_reserved, basis));
    }
    let realized_stock = Pnl {
        usd: gross.saturating_sub(basis_usd),
        pln: gross.convert(sale_fx).saturating_sub(basis_pln),
    };

    let sale_id = sqlx::query(
        r#"
        insert into sales
            (ticker, quantity, sale_date, price_micros, fee_micros,
             fx_rate_micros, realized_usd_micros, realized_pln_micros, obligation_id)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&ob.ticker)
    .bind(covered)
    .bind(ob.expiry_date)
    .bind(ob.strike.raw())
    .bind(fee.raw())
    .bind(sale_fx.raw())
    .bind(realized_stock.usd.raw())
    .bind(realized_stock.pln.raw())
    .bind(obligation_id)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for (lot_id, quantity, basis) in &legs {
        sqlx::query(
            "insert into sale_legs (sale_id, lot_id, quantity, cost_basis_micros) values (?1, ?2, ?3, ?4)",
        )
        .bind(sale_id)
        .bind(lot_id)
        .bind(quantity)
        .bind(basis.raw())
        .execute(&mut *tx)
        .await?;
    }

    // Reservations become sale legs one-for-one; `quantity_open` already
    // excludes these shares and must not be touched.
    sqlx::query("delete from reservations where obligation_id = ?1")
        .bind(obligation_id)
        .execute(&mut *tx)
        .await?;

    let realized_option = expiry_pnl(ob.premium, ob.open_fx);
    mark_closed(
        &mut tx,
        obligation_id,
        ObligationStatus::Assigned,
        ob.expiry_date,
        None,
        None,
        realized_option,
    )
    .await?;

    let event = CashEvent::new(
        CashEventKind::SaleProceeds,
        ob.expiry_date,
        ob.ticker.clone(),
        gross,
        sale_fx,
        format!("assignment {}x {} @ strike", ob.contracts, ob.ticker),
    );
    insert_cash_event(&mut tx, &event, None, Some(obligation_id), Some(sale_id)).await?;

    tx.commit().await?;
    info!(obligation_id, sale_id, "obligation assigned");
    Ok(AssignmentReceipt {
        sale_id,
        realized_stock,
        realized_option,
    })
}

// ---------------------------------------------------------------------------
// Ticker erasure
// ---------------------------------------------------------------------------

/// Remove every trace of a ticker: journal, legs, sales, reservations,
/// obligations, lots — in dependency order, one transaction.
pub async fn erase_ticker(pool: &SqlitePool, ticker: &str) -> Result<EraseReport, OpError> {
    let mut tx = pool.begin().await?;
    let mut report = EraseReport::default();

    report.cash_events = sqlx::query("delete from cash_events where ticker = ?1")
        .bind(ticker)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    report.sale_legs = sqlx::query(
        "delete from sale_legs where sale_id in (select id from sales where ticker = ?1)",
    )
    .bind(ticker)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    report.sales = sqlx::query("delete from sales where ticker = ?1")
        .bind(ticker)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    report.reservations = sqlx::query(
        "delete from reservations where obligation_id in (select id from obligations where ticker = ?1)",
    )
    .bind(ticker)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    report.obligations = sqlx::query("delete from obligations where ticker = ?1")
        .bind(ticker)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    report.lots = sqlx::query("delete from lots where ticker = ?1")
        .bind(ticker)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    info!(ticker, lots = report.lots, "ticker erased");
    Ok(report)
}
