//! In-memory historical rate table with on-or-before lookup.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use ccl_ledger::FxRate;

use crate::{RateError, RateQuote, RateSource};

/// Default lookback: NBP publishes no table on weekends and holidays; the
/// longest gap in practice is a long holiday weekend.  Ten calendar days
/// is generous — a miss beyond that means the table genuinely lacks data.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 10;

/// A sorted map of trading day → PLN/USD rate.
///
/// The deterministic backbone of every rate lookup: the NBP source fills
/// one of these as its cache, and tests construct them directly.
#[derive(Clone, Debug, Default)]
pub struct RateTable {
    rates: BTreeMap<NaiveDate, FxRate>,
    lookback_days: i64,
}

impl RateTable {
    pub fn new() -> Self {
        Self {
            rates: BTreeMap::new(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }

    /// Build from `(date, rate)` pairs.  Fixture helper.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, FxRate)>,
    {
        let mut t = Self::new();
        for (d, r) in pairs {
            t.insert(d, r);
        }
        t
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn insert(&mut self, date: NaiveDate, rate: FxRate) {
        self.rates.insert(date, rate);
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Latest entry with `date ≤ requested`, no further back than the
    /// lookback window.
    pub fn rate_on_or_before(&self, requested: NaiveDate) -> Result<RateQuote, RateError> {
        let floor = requested - Duration::days(self.lookback_days);
        self.rates
            .range(floor..=requested)
            .next_back()
            .map(|(&effective_date, &rate)| RateQuote {
                rate,
                effective_date,
            })
            .ok_or(RateError::Unavailable { requested })
    }
}

#[async_trait::async_trait]
impl RateSource for RateTable {
    fn source_name(&self) -> &'static str {
        "table"
    }

    async fn rate_for(&self, date: NaiveDate) -> Result<RateQuote, RateError> {
        self.rate_on_or_before(date)
    }
}
