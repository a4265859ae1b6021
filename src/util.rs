//! Small shared helpers: hashing and timestamp parsing.

use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the input.
pub fn sha_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parse the timestamp formats AWS responses carry.
///
/// Accepts RFC 3339 (`2022-01-03T06:00:42Z`), the space-separated variant
/// with a numeric offset (`2022-01-03 06:00:42.001000+00:00`), and a bare
/// date (`2022-01-03`, midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    None
}
