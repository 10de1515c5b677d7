//! Obligation lifecycle rules — pure state-machine and split arithmetic.
//!
//! States: `OPEN → {BOUGHT_BACK, EXPIRED, ASSIGNED}`, all terminal, no
//! transition out of a terminal state.  This module owns:
//!
//! - the transition guard ([`ensure_open`]) — every close path calls it
//!   before touching anything, so a terminal obligation is never mutated;
//! - realized P/L arithmetic in USD and PLN (premium converted at the
//!   open-date rate, buy-back cost at the close-date rate);
//! - the partial-close split: contract-count premium proration and the
//!   proportional reduction of the reservation set.
//!
//! Persistence drives these rules inside one transaction per transition;
//! nothing here performs IO.

use crate::lots::{ConsistencyError, ValidationError};
use crate::money::{FxRate, Micros};
use crate::types::{Obligation, ObligationId, ObligationStatus, Reservation, SHARES_PER_CONTRACT};

// ---------------------------------------------------------------------------
// Transition guard
// ---------------------------------------------------------------------------

/// The close action being attempted, for error reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseAction {
    BuyBack,
    Expire,
    Assign,
}

impl CloseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseAction::BuyBack => "buy_back",
            CloseAction::Expire => "expire",
            CloseAction::Assign => "assign",
        }
    }
}

/// Attempted transition on an obligation that is not `OPEN`.  Terminal
/// statuses are irreversible; the caller must perform no mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidStateTransitionError {
    pub obligation_id: ObligationId,
    pub status: ObligationStatus,
    pub action: CloseAction,
}

impl std::fmt::Display for InvalidStateTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot {} obligation {}: status is {}",
            self.action.as_str(),
            self.obligation_id,
            self.status.as_str()
        )
    }
}

impl std::error::Error for InvalidStateTransitionError {}

/// Guard: the obligation must be `OPEN` for any close action.
pub fn ensure_open(
    ob: &Obligation,
    action: CloseAction,
) -> Result<(), InvalidStateTransitionError> {
    if ob.status != ObligationStatus::Open {
        return Err(InvalidStateTransitionError {
            obligation_id: ob.id,
            status: ob.status,
            action,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Realized P/L
// ---------------------------------------------------------------------------

/// Realized P/L in both ledger currencies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pnl {
    pub usd: Micros,
    pub pln: Micros,
}

/// Buy-back P/L: premium received minus premium paid, each leg converted
/// at the rate effective on its own date.
pub fn buyback_pnl(premium: Micros, open_fx: FxRate, paid: Micros, close_fx: FxRate) -> Pnl {
    Pnl {
        usd: premium - paid,
        pln: premium.convert(open_fx) - paid.convert(close_fx),
    }
}

/// Expiry P/L: the full premium is kept, no buy-back cost.
pub fn expiry_pnl(premium: Micros, open_fx: FxRate) -> Pnl {
    Pnl {
        usd: premium,
        pln: premium.convert(open_fx),
    }
}

// ---------------------------------------------------------------------------
// Partial close split
// ---------------------------------------------------------------------------

/// How one reservation row is affected by a partial close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationSplit {
    pub lot_id: i64,
    /// Shares returning to the lot's `quantity_open`.
    pub released: i64,
    /// Shares remaining reserved for the continuing portion.
    pub retained: i64,
}

/// The full plan for splitting an open obligation on a partial buy-back.
///
/// The original row continues `OPEN` with the remaining contracts and the
/// un-prorated premium remainder; a new terminal row carries the closed
/// contracts and their premium share.  `splits` preserves the original
/// reservation row order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitPlan {
    pub closed_contracts: i64,
    /// Premium attributed to the closed portion (`premium × n / contracts`).
    pub closed_premium: Micros,
    pub continuing_contracts: i64,
    pub continuing_premium: Micros,
    pub splits: Vec<ReservationSplit>,
}

/// Compute the split of an open obligation for `contracts_to_close`.
///
/// Reservation reduction is proportional per row (floor of the exact
/// fraction, then the rounding remainder distributed one share at a time
/// in row order), so the released shares sum to exactly
/// `contracts_to_close × 100` and the retained shares to the continuing
/// portion's coverage.  Deterministic for a given row order.
///
/// # Errors
/// - [`ValidationError`] if `contracts_to_close` is not in
///   `1..obligation.contracts` (a full close is not a split).
/// - [`ConsistencyError`] if the reservation rows do not sum to the
///   obligation's covered shares — a ledger defect, the caller must abort.
pub fn plan_partial_close(
    ob: &Obligation,
    reservations: &[Reservation],
    contracts_to_close: i64,
) -> Result<SplitPlan, PartialCloseError> {
    if contracts_to_close <= 0 {
        return Err(PartialCloseError::Validation(
            ValidationError::NonPositiveContracts {
                contracts: contracts_to_close,
            },
        ));
    }
    if contracts_to_close >= ob.contracts {
        return Err(PartialCloseError::Validation(
            ValidationError::ContractsExceedOpen {
                requested: contracts_to_close,
                open: ob.contracts,
            },
        ));
    }

    let covered: i64 = reservations.iter().map(|r| r.shares_reserved).sum();
    if covered != ob.shares_obligated() {
        return Err(PartialCloseError::Consistency(
            ConsistencyError::ReservationSumMismatch {
                obligation_id: ob.id,
                reserved: covered,
                obligated: ob.shares_obligated(),
            },
        ));
    }

    let to_release = contracts_to_close * SHARES_PER_CONTRACT;

    // Proportional floor per row, largest-remainder distribution of the
    // rounding gap in row order.
    let mut released: Vec<i64> = Vec::with_capacity(reservations.len());
    let mut remainders: Vec<(usize, i64)> = Vec::with_capacity(reservations.len());
    let mut floored_total = 0i64;
    for (idx, r) in reservations.iter().enumerate() {
        let exact_num = r.shares_reserved as i128 * to_release as i128;
        let floor = (exact_num / covered as i128) as i64;
        let rem = (exact_num % covered as i128) as i64;
        released.push(floor);
        remainders.push((idx, rem));
        floored_total += floor;
    }
    let mut gap = to_release - floored_total;
    // Largest fractional remainder first; ties by row order.
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (idx, _) in remainders {
        if gap == 0 {
            break;
        }
        if released[idx] < reservations[idx].shares_reserved {
            released[idx] += 1;
            gap -= 1;
        }
    }
    debug_assert_eq!(gap, 0, "remainder distribution must close the gap");

    let splits: Vec<ReservationSplit> = reservations
        .iter()
        .zip(released.iter())
        .map(|(r, rel)| ReservationSplit {
            lot_id: r.lot_id,
            released: *rel,
            retained: r.shares_reserved - rel,
        })
        .collect();

    debug_assert_eq!(splits.iter().map(|s| s.released).sum::<i64>(), to_release);

    let closed_premium = ob.premium.prorate(contracts_to_close, ob.contracts);
    Ok(SplitPlan {
        closed_contracts: contracts_to_close,
        closed_premium,
        continuing_contracts: ob.contracts - contracts_to_close,
        continuing_premium: ob.premium - closed_premium,
        splits,
    })
}

/// Failure of a partial-close plan: either bad input or a broken ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartialCloseError {
    Validation(ValidationError),
    Consistency(ConsistencyError),
}

impl std::fmt::Display for PartialCloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{e}"),
            Self::Consistency(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PartialCloseError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
