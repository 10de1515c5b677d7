//! ccl-ledger
//!
//! Pure core of the covered-call lot ledger:
//! - typed entities (lots, obligations, reservations, sales)
//! - fixed-point money and PLN/USD rate arithmetic
//! - FIFO, date-aware coverage allocation
//! - obligation lifecycle rules (transition guard, P/L, partial-close split)
//! - cashflow journal entry types
//!
//! Everything here is deterministic logic with no IO, no time, no
//! randomness; persistence (ccl-db) drives it inside explicit transactions.
//! The governing invariant, per lot:
//! `quantity_open = quantity_total − Σ(sale legs) − Σ(active reservations)`.

mod journal;
mod money;
mod types;

pub mod allocator;
pub mod lots;
pub mod obligations;

pub use allocator::{
    allocate_fifo, AllocationError, LotAvailability, LotTake, Outcome, Shortfall,
};
pub use journal::{CashEvent, CashEventKind};
pub use lots::{adjust_open, available_quantity, ConsistencyError, NewLot, ValidationError};
pub use money::{FxRate, Micros, MICROS_SCALE};
pub use obligations::{
    buyback_pnl, ensure_open, expiry_pnl, plan_partial_close, CloseAction,
    InvalidStateTransitionError, PartialCloseError, Pnl, ReservationSplit, SplitPlan,
};
pub use types::{
    Lot, LotId, Obligation, ObligationId, ObligationStatus, Reservation, Sale, SaleId, SaleLeg,
    SHARES_PER_CONTRACT,
};
