//! NBP (Narodowy Bank Polski) table-A rate source.
//!
//! Fetches the official daily mid rate for USD over a date range and keeps
//! every answer in an interior [`RateTable`] cache, so each trading day is
//! fetched at most once per process.  The API publishes nothing for
//! weekends/holidays and answers 404 for a range with no data — both are
//! normal and resolved by the on-or-before lookup.
//!
//! Rates arrive as JSON numbers.  They are carried through as decimal
//! strings and converted to micros with integer arithmetic — no float
//! multiplication touches a financial rate.

use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use tracing::{debug, warn};

use ccl_ledger::FxRate;

use crate::table::{RateTable, DEFAULT_LOOKBACK_DAYS};
use crate::{RateError, RateQuote, RateSource};

const NBP_BASE_URL: &str = "https://api.nbp.pl";

/// Transport retries: transient failures only; a parsed response is final.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;

#[derive(Debug, Deserialize)]
struct NbpSeries {
    rates: Vec<NbpRate>,
}

#[derive(Debug, Deserialize)]
struct NbpRate {
    #[serde(rename = "effectiveDate")]
    effective_date: NaiveDate,
    /// Kept as a JSON number and stringified for integer parsing.
    mid: serde_json::Number,
}

/// NBP-backed historical rate source with an interior cache.
pub struct NbpRateSource {
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<RateTable>,
}

impl NbpRateSource {
    pub fn new() -> Self {
        Self::new_with_base_url(NBP_BASE_URL.to_string())
    }

    /// Injectable base URL for tests (httpmock) and proxies.
    pub fn new_with_base_url(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            cache: Mutex::new(RateTable::new()),
        }
    }

    fn range_url(&self, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/api/exchangerates/rates/a/usd/{}/{}/",
            self.base_url,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        )
    }

    /// Fetch `[start, end]` and merge the published days into the cache.
    /// A 404 means no trading day in the range — merged as nothing.
    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<(), RateError> {
        let url = self.range_url(start, end);

        let mut last_err = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .http
                .get(&url)
                .query(&[("format", "json")])
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    debug!(%url, "nbp: no rates published in range");
                    return Ok(());
                }
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await.map_err(|e| RateError::Transport {
                        detail: e.to_string(),
                    })?;
                    let series: NbpSeries =
                        serde_json::from_str(&body).map_err(|e| RateError::Malformed {
                            detail: format!("nbp series decode: {e}"),
                        })?;
                    let mut cache = self.cache.lock().expect("rate cache poisoned");
                    for rate in series.rates {
                        let micros = parse_rate_micros(&rate.mid.to_string())?;
                        cache.insert(rate.effective_date, FxRate::new(micros));
                    }
                    debug!(%url, cached = cache.len(), "nbp: range fetched");
                    return Ok(());
                }
                Ok(resp) => {
                    last_err = format!("http status {}", resp.status());
                }
                Err(e) => {
                    last_err = e.to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                warn!(%url, attempt, error = %last_err, "nbp: fetch failed, retrying");
                tokio::time::sleep(StdDuration::from_millis(
                    RETRY_BACKOFF_MS * attempt as u64,
                ))
                .await;
            }
        }

        Err(RateError::Transport { detail: last_err })
    }
}

impl Default for NbpRateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RateSource for NbpRateSource {
    fn source_name(&self) -> &'static str {
        "nbp"
    }

    async fn rate_for(&self, date: NaiveDate) -> Result<RateQuote, RateError> {
        // Cache first; the table applies the lookback window itself.
        if let Ok(quote) = self
            .cache
            .lock()
            .expect("rate cache poisoned")
            .rate_on_or_before(date)
        {
            return Ok(quote);
        }

        let start = date - Duration::days(DEFAULT_LOOKBACK_DAYS);
        self.fetch_range(start, date).await?;

        self.cache
            .lock()
            .expect("rate cache poisoned")
            .rate_on_or_before(date)
    }
}

/// Parse a decimal rate string ("4.1234") into 1e-6 micros with integer
/// arithmetic.  More than six fractional digits is rejected rather than
/// silently truncated (NBP publishes at most four).
fn parse_rate_micros(s: &str) -> Result<i64, RateError> {
    let malformed = |detail: String| RateError::Malformed { detail };

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() || int_part.starts_with('-') {
        return Err(malformed(format!("invalid rate '{s}'")));
    }
    if frac_part.len() > 6 {
        return Err(malformed(format!("rate '{s}' has more than 6 decimals")));
    }

    let units: i64 = int_part
        .parse()
        .map_err(|_| malformed(format!("invalid rate '{s}'")))?;
    let frac: i64 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{frac_part:0<6}");
        padded
            .parse()
            .map_err(|_| malformed(format!("invalid rate '{s}'")))?
    };

    units
        .checked_mul(1_000_000)
        .and_then(|u| u.checked_add(frac))
        .ok_or_else(|| malformed(format!("rate '{s}' out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_nbp_rate() {
        assert_eq!(parse_rate_micros("4.1234").unwrap(), 4_123_400);
        assert_eq!(parse_rate_micros("3.9").unwrap(), 3_900_000);
        assert_eq!(parse_rate_micros("4").unwrap(), 4_000_000);
    }

    #[test]
    fn rejects_garbage_and_excess_precision() {
        assert!(parse_rate_micros("").is_err());
        assert!(parse_rate_micros("-4.1").is_err());
        assert!(parse_rate_micros("4.12345678").is_err());
        assert!(parse_rate_micros("abc").is_err());
    }
}
