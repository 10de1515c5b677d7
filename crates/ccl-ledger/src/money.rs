//! Fixed-point money and FX-rate types.
//!
//! # Motivation
//!
//! All money amounts in this system use a 1e-6 (micros) fixed-point
//! representation stored as `i64`.  Using raw `i64` for money is error-prone:
//! it allows accidental arithmetic with unrelated integers (share counts,
//! ids, contract counts) without any compile-time signal.  Worse, this ledger
//! carries amounts in two currencies (USD brokerage activity, PLN tax
//! figures) plus exchange rates — three numeric families that must never be
//! mixed silently.
//!
//! `Micros` wraps a monetary amount; `FxRate` wraps a PLN-per-USD rate, also
//! at 1e-6 scale (4.1234 PLN/USD = `FxRate::new(4_123_400)`).  Neither has a
//! `From<i64>` impl, so every construction from a raw integer is deliberate.
//!
//! # Arithmetic
//!
//! - `Add`/`Sub`/`Neg` are closed over `Micros`; they panic on overflow in
//!   debug builds and wrap in release (standard integer semantics).
//! - `saturating_add` / `saturating_sub` clamp at the `i64` bounds.
//! - Products (`checked_mul_qty`, `convert`, `prorate`) widen to `i128` and
//!   round half away from zero, so a conversion or proration never loses a
//!   whole grosz to truncation.
//! - No floats anywhere in accounting paths.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Price/cash scale: micros (1e-6).
pub const MICROS_SCALE: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// Micros newtype
// ---------------------------------------------------------------------------

/// A fixed-point monetary amount at 1e-6 scale (micros).
///
/// 1 USD = `Micros(1_000_000)`; the same scale is used for PLN amounts
/// produced by [`Micros::convert`].  The currency is contextual (field
/// names carry it); the type only guards the *scale* and the boundary
/// between money and plain integers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Micros(i64);

impl Micros {
    /// Zero monetary amount.
    pub const ZERO: Micros = Micros(0);

    /// Construct from a raw `i64` known to be at 1e-6 scale.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Micros(raw)
    }

    /// Whole currency units (e.g. dollars) → micros.  Test/fixture helper.
    #[inline]
    pub const fn from_units(units: i64) -> Self {
        Micros(units * MICROS_SCALE)
    }

    /// Extract the underlying raw `i64` (for DB binds and layer boundaries).
    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Saturating addition.
    #[inline]
    pub fn saturating_add(self, rhs: Micros) -> Micros {
        Micros(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub fn saturating_sub(self, rhs: Micros) -> Micros {
        Micros(self.0.saturating_sub(rhs.0))
    }

    /// `true` if this amount is strictly positive.
    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `true` if this amount is strictly negative.
    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiply a per-unit price by an integer share quantity.
    ///
    /// Returns `None` on `i64` overflow.  Callers must handle `None`
    /// explicitly; overflow in a trade-value calculation is a critical
    /// error, not a routine saturation.
    #[inline]
    pub fn checked_mul_qty(self, qty: i64) -> Option<Micros> {
        self.0.checked_mul(qty).map(Micros)
    }

    /// Convert this amount to the quote currency at `rate`.
    ///
    /// `amount × rate / 1e6`, widened to `i128`, rounded half away from
    /// zero.  For this ledger: USD micros × (PLN/USD) → PLN micros.
    #[inline]
    pub fn convert(self, rate: FxRate) -> Micros {
        Micros(mul_div_round(self.0, rate.0, MICROS_SCALE))
    }

    /// Take the `num/den` fraction of this amount, rounded half away from
    /// zero.  Used for premium proration on partial closes
    /// (`premium × contracts_closed / contracts`) and per-lot cost-basis
    /// portions (`total_cost × qty_taken / qty_total`).
    ///
    /// # Panics
    /// Debug-asserts `den > 0` and `0 <= num <= den`.
    #[inline]
    pub fn prorate(self, num: i64, den: i64) -> Micros {
        debug_assert!(den > 0, "prorate: den must be > 0");
        debug_assert!(num >= 0 && num <= den, "prorate: num must be in [0, den]");
        Micros(mul_div_round(self.0, num, den))
    }
}

/// `a × b / den` in `i128`, rounded half away from zero, clamped to `i64`.
fn mul_div_round(a: i64, b: i64, den: i64) -> i64 {
    debug_assert!(den > 0);
    let prod = (a as i128) * (b as i128);
    let den = den as i128;
    let half = den / 2;
    let rounded = if prod >= 0 {
        (prod + half) / den
    } else {
        (prod - half) / den
    };
    if rounded > i64::MAX as i128 {
        i64::MAX
    } else if rounded < i64::MIN as i128 {
        i64::MIN
    } else {
        rounded as i64
    }
}

// ---------------------------------------------------------------------------
// Arithmetic operators (closed over Micros)
// ---------------------------------------------------------------------------

impl Add for Micros {
    type Output = Micros;
    #[inline]
    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0 + rhs.0)
    }
}

impl Sub for Micros {
    type Output = Micros;
    #[inline]
    fn sub(self, rhs: Micros) -> Micros {
        Micros(self.0 - rhs.0)
    }
}

impl Neg for Micros {
    type Output = Micros;
    #[inline]
    fn neg(self) -> Micros {
        Micros(-self.0)
    }
}

impl AddAssign for Micros {
    #[inline]
    fn add_assign(&mut self, rhs: Micros) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Micros {
    #[inline]
    fn sub_assign(&mut self, rhs: Micros) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Micros {
    fn sum<I: Iterator<Item = Micros>>(iter: I) -> Micros {
        iter.fold(Micros::ZERO, |acc, m| acc.saturating_add(m))
    }
}

impl std::fmt::Display for Micros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.0 / MICROS_SCALE;
        let frac = (self.0 % MICROS_SCALE).abs();
        // When |value| < 1 unit and negative, `units` truncates to 0 and the
        // sign is lost.  Emit "-0" explicitly in that case.
        if self.0 < 0 && units == 0 {
            write!(f, "-{units}.{frac:06}")
        } else {
            write!(f, "{units}.{frac:06}")
        }
    }
}

// ---------------------------------------------------------------------------
// FxRate newtype
// ---------------------------------------------------------------------------

/// A PLN-per-USD exchange rate at 1e-6 scale.
///
/// Distinct from [`Micros`] on purpose: a rate is a dimensionless ratio and
/// must never be added to or subtracted from a money amount.  The only
/// cross-type operation is [`Micros::convert`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FxRate(i64);

impl FxRate {
    /// Construct from a raw `i64` at 1e-6 scale.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        FxRate(raw)
    }

    /// Extract the underlying raw `i64`.
    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// `true` for a usable rate (strictly positive).
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for FxRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.0 / MICROS_SCALE;
        let frac = (self.0 % MICROS_SCALE).abs();
        write!(f, "{units}.{frac:06}")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
