use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::money::{FxRate, Micros};

/// One option contract always covers 100 shares.
pub const SHARES_PER_CONTRACT: i64 = 100;

pub type LotId = i64;
pub type ObligationId = i64;
pub type SaleId = i64;

/// A discrete purchase batch of a ticker — the unit of FIFO ordering and
/// the unit against which reservations and sale legs are posted.
///
/// `quantity_open` is a cached derivation:
/// `quantity_total − Σ(sale legs) − Σ(active reservations)`.
/// `quantity_total` is immutable once the lot is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lot {
    pub id: LotId,
    pub ticker: String,
    pub quantity_total: i64,
    pub quantity_open: i64,
    /// Per-share purchase price, USD micros.
    pub unit_cost: Micros,
    /// PLN/USD rate effective for the purchase (D-1 NBP convention).
    pub fx_rate: FxRate,
    pub purchase_date: NaiveDate,
    /// Absolute brokerage fee for the whole batch, USD micros.
    pub fee: Micros,
}

impl Lot {
    /// Total acquisition cost of the batch: `qty × unit_cost + fee`.
    ///
    /// Saturates on overflow — a lot whose cost exceeds i64 micros
    /// (~9.2 trillion USD) is already garbage input.
    pub fn total_cost(&self) -> Micros {
        self.unit_cost
            .checked_mul_qty(self.quantity_total)
            .unwrap_or(Micros::new(i64::MAX))
            .saturating_add(self.fee)
    }

    /// Cost basis attributable to `qty` shares of this lot, preserving the
    /// lot's weighted average cost (`qty × total_cost / quantity_total`).
    pub fn cost_basis_for(&self, qty: i64) -> Micros {
        debug_assert!(qty >= 0 && qty <= self.quantity_total);
        self.total_cost().prorate(qty, self.quantity_total)
    }
}

/// Covered-call obligation status.  `Open` is the only non-terminal state;
/// every terminal state is irreversible.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObligationStatus {
    Open,
    BoughtBack,
    Expired,
    Assigned,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Open => "OPEN",
            ObligationStatus::BoughtBack => "BOUGHT_BACK",
            ObligationStatus::Expired => "EXPIRED",
            ObligationStatus::Assigned => "ASSIGNED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(ObligationStatus::Open),
            "BOUGHT_BACK" => Some(ObligationStatus::BoughtBack),
            "EXPIRED" => Some(ObligationStatus::Expired),
            "ASSIGNED" => Some(ObligationStatus::Assigned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObligationStatus::Open)
    }
}

/// A covered call: a promise to deliver `contracts × 100` shares by
/// `expiry_date` at `strike`, in exchange for `premium` already received.
///
/// While `status == Open` the obligated shares must be fully covered by
/// reservations against lots of the same ticker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Obligation {
    pub id: ObligationId,
    pub ticker: String,
    pub contracts: i64,
    /// Strike price per share, USD micros.
    pub strike: Micros,
    /// Premium received for the whole position, USD micros.
    pub premium: Micros,
    pub open_date: NaiveDate,
    pub expiry_date: NaiveDate,
    /// PLN/USD rate effective for the open date (D-1).
    pub open_fx: FxRate,
    pub status: ObligationStatus,
    pub close_date: Option<NaiveDate>,
    /// Premium paid to close, USD micros (buy-backs only).
    pub close_premium: Option<Micros>,
    pub close_fx: Option<FxRate>,
    pub realized_usd: Option<Micros>,
    pub realized_pln: Option<Micros>,
    /// Set on rows produced by a partial-close split; points at the row the
    /// split was carved out of.
    pub split_from: Option<ObligationId>,
}

impl Obligation {
    /// Shares this obligation must keep covered while open.
    pub fn shares_obligated(&self) -> i64 {
        self.contracts * SHARES_PER_CONTRACT
    }
}

/// A binding of N shares of a specific lot to a specific obligation.
/// Exists only while the obligation is open; removed (or reduced, on a
/// partial close) the instant the obligation reaches a terminal status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub obligation_id: ObligationId,
    pub lot_id: LotId,
    pub shares_reserved: i64,
}

/// A permanent disposal of shares, FIFO-ordered across lots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sale {
    pub id: SaleId,
    pub ticker: String,
    pub quantity: i64,
    pub sale_date: NaiveDate,
    /// Per-share sale price, USD micros.
    pub price: Micros,
    pub fee: Micros,
    /// PLN/USD rate effective for the sale date (D-1).
    pub fx_rate: FxRate,
    pub realized_usd: Micros,
    pub realized_pln: Micros,
    /// Set when the sale was forced by an assignment.
    pub obligation_id: Option<ObligationId>,
}

/// One row of a sale's per-lot breakdown.  `Σ legs.quantity` over a sale
/// always equals `sale.quantity`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleLeg {
    pub sale_id: SaleId,
    pub lot_id: LotId,
    pub quantity: i64,
    /// Proportional acquisition cost of the shares in this leg, USD micros.
    pub cost_basis: Micros,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn lot(qty: i64, unit_cost_units: i64, fee_units: i64) -> Lot {
        Lot {
            id: 1,
            ticker: "PLTR".to_string(),
            quantity_total: qty,
            quantity_open: qty,
            unit_cost: Micros::from_units(unit_cost_units),
            fx_rate: FxRate::new(4_000_000),
            purchase_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            fee: Micros::from_units(fee_units),
        }
    }

    #[test]
    fn total_cost_includes_fee() {
        let l = lot(100, 25, 2);
        assert_eq!(l.total_cost(), Micros::from_units(2502));
    }

    #[test]
    fn cost_basis_preserves_weighted_average() {
        let l = lot(100, 25, 2);
        // 40 shares → 40/100 of 2502 = 1000.80
        assert_eq!(l.cost_basis_for(40), Micros::new(1_000_800_000));
        // full batch → full cost
        assert_eq!(l.cost_basis_for(100), l.total_cost());
        assert_eq!(l.cost_basis_for(0), Micros::ZERO);
    }

    #[test]
    fn status_roundtrip_and_terminality() {
        for st in [
            ObligationStatus::Open,
            ObligationStatus::BoughtBack,
            ObligationStatus::Expired,
            ObligationStatus::Assigned,
        ] {
            assert_eq!(ObligationStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(ObligationStatus::parse("CLOSED"), None);
        assert!(!ObligationStatus::Open.is_terminal());
        assert!(ObligationStatus::BoughtBack.is_terminal());
        assert!(ObligationStatus::Expired.is_terminal());
        assert!(ObligationStatus::Assigned.is_terminal());
    }

    #[test]
    fn shares_obligated_is_contracts_times_100() {
        let ob = Obligation {
            id: 1,
            ticker: "PLTR".to_string(),
            contracts: 3,
            strike: Micros::from_units(30),
            premium: Micros::from_units(450),
            open_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            expiry_date: NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
            open_fx: FxRate::new(4_000_000),
            status: ObligationStatus::Open,
            close_date: None,
            close_premium: None,
            close_fx: None,
            realized_usd: None,
            realized_pln: None,
            split_from: None,
        };
        assert_eq!(ob.shares_obligated(), 300);
    }
}
