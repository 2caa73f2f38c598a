//! Renewal decision policy.
//!
//! A pure decision over the stored certificate bytes, the request's
//! threshold, and the clock. Absence of a certificate is a legitimate
//! trigger for issuance, never an error; unreadable bytes are surfaced so a
//! corrupt secret is visible instead of being silently reissued over.

use crate::cert::ParsedCertificate;
use crate::error::EngineResult;
use chrono::{DateTime, Utc};
use tracing::info;

/// Decide whether (re)issuance is required.
///
/// `renew_before_days` values of zero or below mean the request did not set
/// a threshold and `default_days` applies.
pub fn should_renew(
    existing: Option<&[u8]>,
    renew_before_days: i64,
    default_days: u32,
) -> EngineResult<bool> {
    should_renew_at(existing, renew_before_days, default_days, Utc::now())
}

/// [`should_renew`] against an explicit clock, so the renewal boundary can
/// be tested without wall-clock slack.
pub fn should_renew_at(
    existing: Option<&[u8]>,
    renew_before_days: i64,
    default_days: u32,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let threshold = if renew_before_days > 0 {
        renew_before_days
    } else {
        i64::from(default_days)
    };

    let bytes = match existing {
        Some(bytes) => bytes,
        None => {
            info!("no certificate data present, issuance required");
            return Ok(true);
        },
    };

    let certificate = ParsedCertificate::parse(bytes)?;

    // Whole days only. A certificate inside its final partial day counts as
    // zero days remaining.
    let days_remaining = (certificate.not_after - now).num_hours() / 24;
    let renew = days_remaining < threshold;

    info!(
        renew_before_days = threshold,
        not_after = %certificate.not_after,
        days_remaining,
        should_renew = renew,
        "evaluated certificate renewal"
    );

    Ok(renew)
}
