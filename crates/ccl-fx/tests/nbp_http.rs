//! NBP source behaviour against a mocked HTTP endpoint: range fetch,
//! weekend fallback, caching, missing data, transport failure.

use chrono::NaiveDate;
use httpmock::prelude::*;
use serde_json::json;

use ccl_fx::{NbpRateSource, RateError, RateSource};
use ccl_ledger::FxRate;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn series_body() -> serde_json::Value {
    json!({
        "table": "A",
        "currency": "dolar amerykański",
        "code": "USD",
        "rates": [
            { "no": "009/A/NBP/2024", "effectiveDate": "2024-01-12", "mid": 4.0123 },
            { "no": "010/A/NBP/2024", "effectiveDate": "2024-01-15", "mid": 4.0241 }
        ]
    })
}

#[tokio::test]
async fn fetches_range_and_returns_effective_rate() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/exchangerates/rates/a/usd/2024-01-05/2024-01-15/")
            .query_param("format", "json");
        then.status(200).json_body(series_body());
    });

    let src = NbpRateSource::new_with_base_url(server.base_url());
    let quote = src.rate_for(d(2024, 1, 15)).await.unwrap();

    mock.assert();
    assert_eq!(quote.rate, FxRate::new(4_024_100));
    assert_eq!(quote.effective_date, d(2024, 1, 15));
}

#[tokio::test]
async fn weekend_request_resolves_to_previous_trading_day() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/api/exchangerates/rates/a/usd/2024-01-04/2024-01-14/");
        then.status(200).json_body(series_body());
    });

    let src = NbpRateSource::new_with_base_url(server.base_url());
    // Sunday 2024-01-14 → Friday 2024-01-12
    let quote = src.rate_for(d(2024, 1, 14)).await.unwrap();
    assert_eq!(quote.effective_date, d(2024, 1, 12));
    assert_eq!(quote.rate, FxRate::new(4_012_300));
}

#[tokio::test]
async fn second_lookup_is_served_from_cache() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/exchangerates/rates/a/usd/2024-01-05/2024-01-15/");
        then.status(200).json_body(series_body());
    });

    let src = NbpRateSource::new_with_base_url(server.base_url());
    let first = src.rate_for(d(2024, 1, 15)).await.unwrap();
    let second = src.rate_for(d(2024, 1, 15)).await.unwrap();

    assert_eq!(first, second);
    mock.assert_hits(1);
}

#[tokio::test]
async fn empty_range_is_unavailable_not_a_fallback() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path_matches(Regex::new("/api/exchangerates/.*").unwrap());
        then.status(404).body("404 NotFound - Not Found - Brak danych");
    });

    let src = NbpRateSource::new_with_base_url(server.base_url());
    let err = src.rate_for(d(2024, 1, 15)).await.unwrap_err();
    assert_eq!(
        err,
        RateError::Unavailable {
            requested: d(2024, 1, 15)
        }
    );
}

#[tokio::test]
async fn server_errors_surface_as_transport_after_retries() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path_matches(Regex::new("/api/exchangerates/.*").unwrap());
        then.status(500).body("boom");
    });

    let src = NbpRateSource::new_with_base_url(server.base_url());
    let err = src.rate_for(d(2024, 1, 15)).await.unwrap_err();
    assert!(matches!(err, RateError::Transport { .. }));
    mock.assert_hits(3);
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path_matches(Regex::new("/api/exchangerates/.*").unwrap());
        then.status(200).body("{\"rates\": \"not-a-list\"}");
    });

    let src = NbpRateSource::new_with_base_url(server.base_url());
    let err = src.rate_for(d(2024, 1, 15)).await.unwrap_err();
    assert!(matches!(err, RateError::Malformed { .. }));
}
