use chrono::{DateTime, TimeZone, Utc};

/// A fixed base instant plus `offset_secs`, so a test can submit a sequence
/// of mentions with strictly increasing timestamps without depending on wall
/// clock time (this suite never calls `Utc::now()` directly).
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
}
