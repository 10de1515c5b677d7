//! Coverage allocator — FIFO, date-aware share selection.
//!
//! Responsibilities (pure, no IO):
//! - Given a set of lots, a desired share quantity and an as-of date,
//!   deterministically select which lots supply the shares,
//!   oldest-purchase-first.
//! - Refuse with a structured [`Shortfall`] when the eligible lots cannot
//!   cover the request — callers must be able to distinguish "not enough
//!   shares" from a system error, so a shortfall is an `Ok` outcome.
//!
//! The same walk serves both consumers: a stock sale turns the takes into
//! permanent decrements plus a sale record; covered-call coverage turns
//! them into reservation rows.  The allocator itself never mutates a lot.
//!
//! # Algorithm
//!
//! 1. Filter to eligible lots: `purchase_date <= as_of` and
//!    `quantity_open > 0`.  The date gate is a functional requirement —
//!    shares not yet owned on the transaction date must never be taken.
//! 2. Sort ascending by `(purchase_date, lot_id)`.  Equal purchase dates
//!    resolve by ascending id (insertion order), so repeated calls against
//!    unchanged lots always return the same order and split.
//! 3. Walk the list, taking `min(remaining, lot.quantity_open)` from each
//!    lot until the request is filled or the lots run out.
//!
//! Each take carries its cost-basis portion
//! (`qty_taken × lot.total_cost / lot.quantity_total`), preserving the
//! lot's weighted average cost.

use chrono::NaiveDate;

use crate::money::Micros;
use crate::types::{Lot, LotId};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// One slice of an allocation: `quantity` shares taken from `lot_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotTake {
    pub lot_id: LotId,
    pub quantity: i64,
    /// Proportional acquisition cost of the taken shares, USD micros.
    pub cost_basis: Micros,
}

/// Per-lot availability detail attached to a [`Shortfall`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotAvailability {
    pub lot_id: LotId,
    pub purchase_date: NaiveDate,
    pub quantity_open: i64,
}

/// The eligible lots could not cover the request.  This is a domain
/// outcome, not an error: nothing was mutated and the caller is expected
/// to surface the detail (available vs needed, per-lot breakdown).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shortfall {
    pub needed: i64,
    pub available: i64,
    pub as_of: NaiveDate,
    pub lots: Vec<LotAvailability>,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insufficient coverage as of {}: needed {} shares, {} available across {} eligible lot(s)",
            self.as_of,
            self.needed,
            self.available,
            self.lots.len()
        )
    }
}

/// Result of one allocation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Ordered takes summing exactly to the requested quantity.
    Allocated(Vec<LotTake>),
    /// Not enough eligible shares; nothing was selected.
    Shortfall(Shortfall),
}

impl Outcome {
    /// Unwrap the takes, panicking on shortfall.  Test convenience.
    pub fn expect_allocated(self) -> Vec<LotTake> {
        match self {
            Outcome::Allocated(takes) => takes,
            Outcome::Shortfall(s) => panic!("expected allocation, got shortfall: {s}"),
        }
    }
}

/// Invalid allocation request (distinct from a shortfall).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// Requested share quantity must be strictly positive.
    NonPositiveQuantity { quantity: i64 },
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveQuantity { quantity } => {
                write!(f, "allocation quantity must be > 0, got {quantity}")
            }
        }
    }
}

impl std::error::Error for AllocationError {}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Select lots to supply `needed` shares as of `as_of`, FIFO.
///
/// `lots` is the candidate set for one ticker; order does not matter, the
/// algorithm re-sorts.  Lots of other tickers must be filtered out by the
/// caller.
pub fn allocate_fifo(
    lots: &[Lot],
    needed: i64,
    as_of: NaiveDate,
) -> Result<Outcome, AllocationError> {
    if needed <= 0 {
        return Err(AllocationError::NonPositiveQuantity { quantity: needed });
    }

    let mut eligible: Vec<&Lot> = lots
        .iter()
        .filter(|l| l.purchase_date <= as_of && l.quantity_open > 0)
        .collect();
    eligible.sort_by_key(|l| (l.purchase_date, l.id));

    let available: i64 = eligible.iter().map(|l| l.quantity_open).sum();
    if available < needed {
        return Ok(Outcome::Shortfall(Shortfall {
            needed,
            available,
            as_of,
            lots: eligible
                .iter()
                .map(|l| LotAvailability {
                    lot_id: l.id,
                    purchase_date: l.purchase_date,
                    quantity_open: l.quantity_open,
                })
                .collect(),
        }));
    }

    let mut takes = Vec::new();
    let mut remaining = needed;
    for lot in eligible {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(lot.quantity_open);
        takes.push(LotTake {
            lot_id: lot.id,
            quantity: take,
            cost_basis: lot.cost_basis_for(take),
        });
        remaining -= take;
    }
    debug_assert_eq!(remaining, 0);
    debug_assert_eq!(takes.iter().map(|t| t.quantity).sum::<i64>(), needed);

    Ok(Outcome::Allocated(takes))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::FxRate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn lot(id: i64, open: i64, purchased: NaiveDate) -> Lot {
        Lot {
            id,
            ticker: "PLTR".to_string(),
            quantity_total: open,
            quantity_open: open,
            unit_cost: Micros::from_units(20),
            fx_rate: FxRate::new(4_000_000),
            purchase_date: purchased,
            fee: Micros::ZERO,
        }
    }

    // --- Request validation ---

    #[test]
    fn rejects_non_positive_quantity() {
        let lots = vec![lot(1, 100, d(2024, 1, 10))];
        assert_eq!(
            allocate_fifo(&lots, 0, d(2024, 2, 1)).unwrap_err(),
            AllocationError::NonPositiveQuantity { quantity: 0 }
        );
        assert!(allocate_fifo(&lots, -5, d(2024, 2, 1)).is_err());
    }

    // --- FIFO walk ---

    #[test]
    fn single_lot_covers_whole_request() {
        let lots = vec![lot(1, 100, d(2024, 1, 10))];
        let takes = allocate_fifo(&lots, 100, d(2024, 1, 15))
            .unwrap()
            .expect_allocated();
        assert_eq!(takes.len(), 1);
        assert_eq!(takes[0].lot_id, 1);
        assert_eq!(takes[0].quantity, 100);
        assert_eq!(takes[0].cost_basis, Micros::from_units(2000));
    }

    #[test]
    fn spans_lots_oldest_first() {
        // A(50 @ 01-01) + B(100 @ 02-01), request 80 → [(A,50),(B,30)]
        let lots = vec![lot(2, 100, d(2024, 2, 1)), lot(1, 50, d(2024, 1, 1))];
        let takes = allocate_fifo(&lots, 80, d(2024, 2, 15))
            .unwrap()
            .expect_allocated();
        assert_eq!(takes.len(), 2);
        assert_eq!((takes[0].lot_id, takes[0].quantity), (1, 50));
        assert_eq!((takes[1].lot_id, takes[1].quantity), (2, 30));
    }

    #[test]
    fn equal_purchase_dates_tie_break_by_ascending_id() {
        let lots = vec![lot(7, 40, d(2024, 1, 10)), lot(3, 40, d(2024, 1, 10))];
        let takes = allocate_fifo(&lots, 50, d(2024, 1, 10))
            .unwrap()
            .expect_allocated();
        assert_eq!((takes[0].lot_id, takes[0].quantity), (3, 40));
        assert_eq!((takes[1].lot_id, takes[1].quantity), (7, 10));
    }

    #[test]
    fn skips_fully_consumed_lots() {
        let mut a = lot(1, 50, d(2024, 1, 1));
        a.quantity_open = 0;
        let lots = vec![a, lot(2, 100, d(2024, 2, 1))];
        let takes = allocate_fifo(&lots, 60, d(2024, 2, 15))
            .unwrap()
            .expect_allocated();
        assert_eq!(takes.len(), 1);
        assert_eq!(takes[0].lot_id, 2);
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let lots = vec![
            lot(2, 100, d(2024, 2, 1)),
            lot(1, 50, d(2024, 1, 1)),
            lot(3, 25, d(2024, 1, 1)),
        ];
        let first = allocate_fifo(&lots, 120, d(2024, 3, 1)).unwrap();
        for _ in 0..10 {
            assert_eq!(allocate_fifo(&lots, 120, d(2024, 3, 1)).unwrap(), first);
        }
    }

    // --- Date awareness ---

    #[test]
    fn lots_purchased_after_as_of_never_count() {
        // 100 shares bought 03-01, request 50 as of 02-01
        let lots = vec![lot(1, 100, d(2024, 3, 1))];
        match allocate_fifo(&lots, 50, d(2024, 2, 1)).unwrap() {
            Outcome::Shortfall(s) => {
                assert_eq!(s.available, 0);
                assert_eq!(s.needed, 50);
                assert!(s.lots.is_empty());
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
    }

    #[test]
    fn purchase_on_as_of_date_is_eligible() {
        let lots = vec![lot(1, 100, d(2024, 3, 1))];
        let takes = allocate_fifo(&lots, 50, d(2024, 3, 1))
            .unwrap()
            .expect_allocated();
        assert_eq!(takes[0].quantity, 50);
    }

    // --- Shortfall detail ---

    #[test]
    fn shortfall_carries_per_lot_breakdown() {
        let lots = vec![lot(1, 50, d(2024, 1, 1)), lot(2, 30, d(2024, 2, 1))];
        match allocate_fifo(&lots, 100, d(2024, 2, 15)).unwrap() {
            Outcome::Shortfall(s) => {
                assert_eq!(s.available, 80);
                assert_eq!(s.needed, 100);
                assert_eq!(s.lots.len(), 2);
                assert_eq!(s.lots[0].lot_id, 1);
                assert_eq!(s.lots[1].quantity_open, 30);
                assert!(!s.to_string().is_empty());
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
    }

    // --- Cost basis ---

    #[test]
    fn partial_take_prorates_cost_basis_with_fee() {
        let mut l = lot(1, 100, d(2024, 1, 1));
        l.fee = Micros::from_units(2);
        // total cost 2002; 30 shares → 600.60
        let takes = allocate_fifo(&[l], 30, d(2024, 1, 1))
            .unwrap()
            .expect_allocated();
        assert_eq!(takes[0].cost_basis, Micros::new(600_600_000));
    }
}
