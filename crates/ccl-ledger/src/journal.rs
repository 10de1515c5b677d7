//! Cashflow journal entry types — a thin side-effect sink.
//!
//! Every lot/obligation/sale event has a monetary consequence; the journal
//! records it in USD and PLN at the rate that applied to the event.  The
//! journal is written inside the same transaction as the event it records
//! and is never read back by the core.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::money::{FxRate, Micros};

/// What kind of cash movement a journal row records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CashEventKind {
    /// Outflow: shares purchased (lot created).
    LotPurchase,
    /// Inflow: shares sold (FIFO sale or assignment delivery).
    SaleProceeds,
    /// Inflow: covered-call premium collected at open.
    PremiumReceived,
    /// Outflow: premium paid to buy an obligation back.
    PremiumPaid,
}

impl CashEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CashEventKind::LotPurchase => "LOT_PURCHASE",
            CashEventKind::SaleProceeds => "SALE_PROCEEDS",
            CashEventKind::PremiumReceived => "PREMIUM_RECEIVED",
            CashEventKind::PremiumPaid => "PREMIUM_PAID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOT_PURCHASE" => Some(CashEventKind::LotPurchase),
            "SALE_PROCEEDS" => Some(CashEventKind::SaleProceeds),
            "PREMIUM_RECEIVED" => Some(CashEventKind::PremiumReceived),
            "PREMIUM_PAID" => Some(CashEventKind::PremiumPaid),
            _ => None,
        }
    }
}

/// One journal row.  `amount_usd` is signed (inflow positive); the PLN
/// amount is derived once, at write time, from the event's own rate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CashEvent {
    pub event_date: NaiveDate,
    pub kind: CashEventKind,
    pub ticker: String,
    pub amount_usd: Micros,
    pub fx_rate: FxRate,
    pub amount_pln: Micros,
    pub memo: String,
}

impl CashEvent {
    pub fn new(
        kind: CashEventKind,
        event_date: NaiveDate,
        ticker: impl Into<String>,
        amount_usd: Micros,
        fx_rate: FxRate,
        memo: impl Into<String>,
    ) -> Self {
        Self {
            event_date,
            kind,
            ticker: ticker.into(),
            amount_usd,
            fx_rate,
            amount_pln: amount_usd.convert(fx_rate),
            memo: memo.into(),
        }
    }
}
