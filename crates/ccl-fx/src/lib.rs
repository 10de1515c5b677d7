//! ccl-fx
//!
//! Historical PLN/USD exchange rates (pluggable sources).
//!
//! This crate owns the rate-source abstraction the ledger core consumes:
//! "give me the rate effective on the latest trading day on or before a
//! date."  It does **not** write to the DB; callers fetch a quote and store
//! the rate on the row they are creating.
//!
//! Two sources:
//! - [`RateTable`] — an in-memory historical table, the deterministic
//!   backbone for tests and offline use.
//! - [`NbpRateSource`] — the NBP (Polish central bank) table-A HTTP API,
//!   range-fetched and cached.  Retries live here, never in the core.
//!
//! A date with no rate on or before it (within the lookback window) is a
//! hard [`RateError::Unavailable`].  The original system substituted a
//! hardcoded fallback rate on lookup failure; that is exactly the kind of
//! fabricated financial figure this crate refuses to produce.

pub mod nbp;
pub mod table;

use chrono::NaiveDate;

use ccl_ledger::FxRate;

pub use nbp::NbpRateSource;
pub use table::RateTable;

/// Polish tax accounting uses the rate of the trading day preceding the
/// transaction date (the "D-1" convention).  Callers pass `d1(tx_date)` to
/// a [`RateSource`]; non-trading days are then absorbed by the
/// on-or-before lookup.
pub fn d1(date: NaiveDate) -> NaiveDate {
    date.pred_opt().unwrap_or(date)
}

/// A resolved rate: the value and the trading day it was published for
/// (which may be earlier than the requested date).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RateQuote {
    pub rate: FxRate,
    pub effective_date: NaiveDate,
}

/// Rate lookup failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateError {
    /// No published rate on or before the requested date (within the
    /// source's lookback window).  Never silently substituted.
    Unavailable { requested: NaiveDate },
    /// HTTP/connectivity failure after retries.
    Transport { detail: String },
    /// The source answered with a payload we could not interpret.
    Malformed { detail: String },
}

impl std::fmt::Display for RateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { requested } => {
                write!(f, "no exchange rate available on or before {requested}")
            }
            Self::Transport { detail } => write!(f, "rate source transport error: {detail}"),
            Self::Malformed { detail } => write!(f, "rate source payload error: {detail}"),
        }
    }
}

impl std::error::Error for RateError {}

/// Pluggable historical rate source.
#[async_trait::async_trait]
pub trait RateSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Rate effective on the latest trading day ≤ `date`.  Deterministic
    /// for a fixed historical table.
    async fn rate_for(&self, date: NaiveDate) -> Result<RateQuote, RateError>;
}
