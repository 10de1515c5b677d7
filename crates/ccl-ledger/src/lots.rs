//! Lot ledger rules — validation and the `quantity_open` invariant boundary.
//!
//! The lot ledger is the source of truth for "what is owned and what
//! fraction of it is currently unencumbered."  Two rules live here:
//!
//! - A lot is only ever created from validated input (positive quantity,
//!   positive unit cost, valid FX rate, non-negative fee).
//! - Every change to `quantity_open` goes through [`adjust_open`], which
//!   refuses any delta that would leave `[0, quantity_total]`.  A refusal
//!   indicates a programming defect upstream (over-release, double
//!   decrement) and must abort the caller's transaction.
//!
//! Everything here is pure; persistence applies these rules inside its
//! transaction boundary.

use chrono::NaiveDate;

use crate::money::{FxRate, Micros};
use crate::types::Lot;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Malformed input, rejected before any mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// Share quantity must be strictly positive.
    NonPositiveQuantity { quantity: i64 },
    /// Per-share price must be strictly positive.
    NonPositivePrice { price: Micros },
    /// Fee must be non-negative.
    NegativeFee { fee: Micros },
    /// Ticker must be non-empty.
    EmptyTicker,
    /// Contract count must be strictly positive.
    NonPositiveContracts { contracts: i64 },
    /// Premium received/paid must be non-negative.
    NegativePremium { premium: Micros },
    /// FX rate must be strictly positive.
    InvalidFxRate { rate: FxRate },
    /// Contracts to close must be fewer than the contracts still open
    /// (a full close is its own path, not a split).
    ContractsExceedOpen { requested: i64, open: i64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveQuantity { quantity } => {
                write!(f, "quantity must be > 0, got {quantity}")
            }
            Self::NonPositivePrice { price } => {
                write!(f, "price must be > 0, got {price}")
            }
            Self::NegativeFee { fee } => write!(f, "fee must be >= 0, got {fee}"),
            Self::EmptyTicker => write!(f, "ticker must not be empty"),
            Self::NonPositiveContracts { contracts } => {
                write!(f, "contracts must be > 0, got {contracts}")
            }
            Self::NegativePremium { premium } => {
                write!(f, "premium must be >= 0, got {premium}")
            }
            Self::InvalidFxRate { rate } => write!(f, "fx rate must be > 0, got {rate}"),
            Self::ContractsExceedOpen { requested, open } => {
                write!(f, "cannot split-close {requested} of {open} open contract(s)")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// A proposed mutation would break a ledger invariant.  Unlike a
/// [`ValidationError`] this is not bad user input — it means some caller
/// upstream already double-booked shares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyError {
    /// `quantity_open + delta` would fall outside `[0, quantity_total]`.
    OpenQuantityOutOfRange {
        lot_id: i64,
        quantity_open: i64,
        quantity_total: i64,
        delta: i64,
    },
    /// A reservation or sale references more shares than the lot holds.
    OverCommitted { lot_id: i64, requested: i64, available: i64 },
    /// An open obligation's reservation rows do not sum to its covered
    /// shares — the ledger itself is broken.
    ReservationSumMismatch {
        obligation_id: i64,
        reserved: i64,
        obligated: i64,
    },
}

impl std::fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenQuantityOutOfRange {
                lot_id,
                quantity_open,
                quantity_total,
                delta,
            } => write!(
                f,
                "lot {lot_id}: quantity_open {quantity_open} {delta:+} leaves [0, {quantity_total}]"
            ),
            Self::OverCommitted {
                lot_id,
                requested,
                available,
            } => write!(
                f,
                "lot {lot_id}: {requested} shares requested but only {available} available"
            ),
            Self::ReservationSumMismatch {
                obligation_id,
                reserved,
                obligated,
            } => write!(
                f,
                "obligation {obligation_id}: reservations sum to {reserved}, expected {obligated}"
            ),
        }
    }
}

impl std::error::Error for ConsistencyError {}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Validated input for a new lot.  `quantity_open` is initialised to the
/// full batch size; the surrogate id is assigned by the store on insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLot {
    pub ticker: String,
    pub quantity: i64,
    pub unit_cost: Micros,
    pub fx_rate: FxRate,
    pub purchase_date: NaiveDate,
    pub fee: Micros,
}

impl NewLot {
    pub fn new(
        ticker: impl Into<String>,
        quantity: i64,
        unit_cost: Micros,
        fx_rate: FxRate,
        purchase_date: NaiveDate,
        fee: Micros,
    ) -> Result<Self, ValidationError> {
        let ticker = ticker.into();
        if ticker.trim().is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        if quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity { quantity });
        }
        if !unit_cost.is_positive() {
            return Err(ValidationError::NonPositivePrice { price: unit_cost });
        }
        if fee.is_negative() {
            return Err(ValidationError::NegativeFee { fee });
        }
        if !fx_rate.is_valid() {
            return Err(ValidationError::InvalidFxRate { rate: fx_rate });
        }
        Ok(Self {
            ticker,
            quantity,
            unit_cost,
            fx_rate,
            purchase_date,
            fee,
        })
    }
}

// ---------------------------------------------------------------------------
// Invariant boundary
// ---------------------------------------------------------------------------

/// Apply a signed change to a lot's `quantity_open`.
///
/// # Errors
/// [`ConsistencyError::OpenQuantityOutOfRange`] if the result would leave
/// `[0, quantity_total]`.  The lot is **not** mutated on error.
pub fn adjust_open(lot: &mut Lot, delta: i64) -> Result<(), ConsistencyError> {
    let next = lot.quantity_open + delta;
    if next < 0 || next > lot.quantity_total {
        return Err(ConsistencyError::OpenQuantityOutOfRange {
            lot_id: lot.id,
            quantity_open: lot.quantity_open,
            quantity_total: lot.quantity_total,
            delta,
        });
    }
    lot.quantity_open = next;
    Ok(())
}

/// Sum of `quantity_open` across lots purchased on or before `as_of`.
///
/// The date filter is a functional requirement, not an optimization: lots
/// purchased after `as_of` must not count, so no allocation can ever use
/// shares that were not yet owned on the transaction date.
pub fn available_quantity(lots: &[Lot], as_of: NaiveDate) -> i64 {
    lots.iter()
        .filter(|l| l.purchase_date <= as_of)
        .map(|l| l.quantity_open)
        .sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn lot(id: i64, qty: i64, open: i64, purchased: NaiveDate) -> Lot {
        Lot {
            id,
            ticker: "PLTR".to_string(),
            quantity_total: qty,
            quantity_open: open,
            unit_cost: Micros::from_units(25),
            fx_rate: FxRate::new(4_000_000),
            purchase_date: purchased,
            fee: Micros::ZERO,
        }
    }

    // --- NewLot validation ---

    #[test]
    fn rejects_zero_quantity() {
        let err = NewLot::new(
            "PLTR",
            0,
            Micros::from_units(25),
            FxRate::new(4_000_000),
            d(2024, 1, 10),
            Micros::ZERO,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::NonPositiveQuantity { quantity: 0 });
    }

    #[test]
    fn rejects_non_positive_unit_cost() {
        let err = NewLot::new(
            "PLTR",
            100,
            Micros::ZERO,
            FxRate::new(4_000_000),
            d(2024, 1, 10),
            Micros::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NonPositivePrice { .. }));
    }

    #[test]
    fn rejects_blank_ticker() {
        let err = NewLot::new(
            "  ",
            100,
            Micros::from_units(25),
            FxRate::new(4_000_000),
            d(2024, 1, 10),
            Micros::ZERO,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::EmptyTicker);
    }

    #[test]
    fn rejects_negative_fee_and_bad_rate() {
        let err = NewLot::new(
            "PLTR",
            100,
            Micros::from_units(25),
            FxRate::new(4_000_000),
            d(2024, 1, 10),
            Micros::new(-1),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NegativeFee { .. }));

        let err = NewLot::new(
            "PLTR",
            100,
            Micros::from_units(25),
            FxRate::new(0),
            d(2024, 1, 10),
            Micros::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFxRate { .. }));
    }

    #[test]
    fn accepts_well_formed_input() {
        let nl = NewLot::new(
            "PLTR",
            100,
            Micros::from_units(25),
            FxRate::new(4_000_000),
            d(2024, 1, 10),
            Micros::from_units(1),
        )
        .unwrap();
        assert_eq!(nl.quantity, 100);
    }

    // --- adjust_open bounds ---

    #[test]
    fn adjust_within_bounds() {
        let mut l = lot(1, 100, 100, d(2024, 1, 10));
        adjust_open(&mut l, -60).unwrap();
        assert_eq!(l.quantity_open, 40);
        adjust_open(&mut l, 60).unwrap();
        assert_eq!(l.quantity_open, 100);
    }

    #[test]
    fn adjust_below_zero_is_rejected_without_mutation() {
        let mut l = lot(1, 100, 30, d(2024, 1, 10));
        let err = adjust_open(&mut l, -31).unwrap_err();
        assert!(matches!(
            err,
            ConsistencyError::OpenQuantityOutOfRange { delta: -31, .. }
        ));
        assert_eq!(l.quantity_open, 30);
    }

    #[test]
    fn adjust_above_total_is_rejected() {
        // over-release: the ghost-lock defect class
        let mut l = lot(1, 100, 100, d(2024, 1, 10));
        let err = adjust_open(&mut l, 1).unwrap_err();
        assert!(matches!(
            err,
            ConsistencyError::OpenQuantityOutOfRange { .. }
        ));
        assert_eq!(l.quantity_open, 100);
    }

    // --- available_quantity date-awareness ---

    #[test]
    fn available_sums_only_lots_purchased_on_or_before() {
        let lots = vec![
            lot(1, 50, 50, d(2024, 1, 1)),
            lot(2, 100, 70, d(2024, 2, 1)),
            lot(3, 200, 200, d(2024, 3, 1)),
        ];
        assert_eq!(available_quantity(&lots, d(2024, 2, 15)), 120);
        assert_eq!(available_quantity(&lots, d(2024, 2, 1)), 120);
        assert_eq!(available_quantity(&lots, d(2024, 1, 31)), 50);
        assert_eq!(available_quantity(&lots, d(2023, 12, 31)), 0);
    }
}
