//! Consistency audit — recomputes the cached quantities from first
//! principles and reports every row that disagrees.
//!
//! Read-only.  Two derivations are checked:
//! - per lot: `quantity_open == quantity_total − Σ(sale legs) − Σ(reservations)`
//!   (reservations of open obligations only);
//! - per open obligation: `Σ(reservations) == contracts × 100`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use ccl_ledger::{LotId, ObligationId};

/// A lot whose cached `quantity_open` disagrees with the derivation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotMismatch {
    pub lot_id: LotId,
    pub ticker: String,
    pub quantity_open: i64,
    pub derived_open: i64,
}

/// An open obligation whose reservations do not cover it exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObligationMismatch {
    pub obligation_id: ObligationId,
    pub ticker: String,
    pub reserved: i64,
    pub obligated: i64,
}

#[derive(Clone, Debug, Default)]
pub struct IntegrityReport {
    pub lots_checked: u64,
    pub obligations_checked: u64,
    pub lot_mismatches: Vec<LotMismatch>,
    pub obligation_mismatches: Vec<ObligationMismatch>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.lot_mismatches.is_empty() && self.obligation_mismatches.is_empty()
    }
}

/// Audit the whole store.  Never mutates; a dirty report means some past
/// write bypassed the transactional operations.
pub async fn check_integrity(pool: &SqlitePool) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();

    let lot_rows = sqlx::query(
        r#"
        select l.id, l.ticker, l.quantity_total, l.quantity_open,
               coalesce((select sum(sl.quantity) from sale_legs sl where sl.lot_id = l.id), 0)
                   as sold,
               coalesce((select sum(r.shares_reserved)
                         from reservations r
                         join obligations o on o.id = r.obligation_id
                         where r.lot_id = l.id and o.status = 'OPEN'), 0)
                   as reserved
        from lots l
        order by l.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in &lot_rows {
        report.lots_checked += 1;
        let quantity_total: i64 = row.try_get("quantity_total")?;
        let quantity_open: i64 = row.try_get("quantity_open")?;
        let sold: i64 = row.try_get("sold")?;
        let reserved: i64 = row.try_get("reserved")?;
        let derived_open = quantity_total - sold - reserved;
        if derived_open != quantity_open {
            report.lot_mismatches.push(LotMismatch {
                lot_id: row.try_get("id")?,
                ticker: row.try_get("ticker")?,
                quantity_open,
                derived_open,
            });
        }
    }

    let ob_rows = sqlx::query(
        r#"
        select o.id, o.ticker, o.contracts * 100 as obligated,
               coalesce((select sum(r.shares_reserved)
                         from reservations r where r.obligation_id = o.id), 0)
                   as reserved
        from obligations o
        where o.status = 'OPEN'
        order by o.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in &ob_rows {
        report.obligations_checked += 1;
        let reserved: i64 = row.try_get("reserved")?;
        let obligated: i64 = row.try_get("obligated")?;
        if reserved != obligated {
            report.obligation_mismatches.push(ObligationMismatch {
                obligation_id: row.try_get("id")?,
                ticker: row.try_get("ticker")?,
                reserved,
                obligated,
            });
        }
    }

    Ok(report)
}
