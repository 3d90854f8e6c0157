//! Small shared utilities: base64 byte handling, identifier generation, and
//! UTC clock formatting.

mod b64;
mod ids;

pub use b64::Base64Bytes;
pub use ids::{session_id, transaction_id, wallet_id};

use chrono::{SecondsFormat, Utc};

/// Current instant as an ISO-8601 UTC string with millisecond precision,
/// e.g. `2026-08-01T09:30:00.000Z`.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC calendar date as `YYYY-MM-DD`. Used as the prefix match for
/// daily-cap accounting.
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
