//! Running estimate of the offset between a remote server's clock and ours.
//!
//! Each response carrying a `Date` header bounds the offset. The header was
//! produced somewhere between sending the request and receiving the
//! response, and a server may round it to whole seconds in either direction,
//! so
//!
//! ```text
//! date - 1 - received <= server - client <= date - sent
//! ```
//!
//! A server lagging us by `d` seconds therefore settles at `(-(d + 1), -d)`.
//!
//! Both bounds are smoothed (0.9 old, 0.1 new) starting from zero.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::trace;

const KEEP: f64 = 0.9;
const BLEND: f64 = 0.1;

/// Smoothed lower/upper bounds of `server_time - client_time`, in seconds.
#[derive(Debug, Default)]
pub struct ClockSkew {
    bounds: Mutex<(f64, f64)>,
}

impl ClockSkew {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current `(min, max)` estimate. `min <= max` always holds.
    pub fn estimate(&self) -> (f64, f64) {
        *self.bounds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Folds in one observation. Times are epoch seconds on the client clock;
    /// `server_date` is the parsed `Date` header.
    pub fn observe(&self, sent: f64, received: f64, server_date: f64) {
        let (sent, received) = if sent <= received {
            (sent, received)
        } else {
            (received, sent)
        };
        let sample_min = server_date - 1.0 - received;
        let sample_max = server_date - sent;

        let mut bounds = self.bounds.lock().unwrap_or_else(|e| e.into_inner());
        bounds.0 = KEEP * bounds.0 + BLEND * sample_min;
        bounds.1 = KEEP * bounds.1 + BLEND * sample_max;
        trace!(min = bounds.0, max = bounds.1, "clock skew updated");
    }

    /// Folds in a raw `Date` header value. Unparseable headers are ignored.
    pub fn observe_header(&self, sent: SystemTime, received: SystemTime, date: &str) {
        if let Some(server) = parse_http_date(date) {
            self.observe(epoch_secs(sent), epoch_secs(received), server);
        }
    }
}

/// Parses an RFC 1123 HTTP date into epoch seconds.
pub fn parse_http_date(value: &str) -> Option<f64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp() as f64)
}

pub(crate) fn epoch_secs(time: SystemTime) -> f64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(ClockSkew::new().estimate(), (0.0, 0.0));
    }

    #[test]
    fn single_observation_is_smoothed() {
        let skew = ClockSkew::new();
        skew.observe(100.0, 100.0, 110.0);
        let (min, max) = skew.estimate();
        assert!((min - 0.9).abs() < 1e-9);
        assert!((max - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parses_http_dates() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784111777.0)
        );
        assert_eq!(parse_http_date("not a date"), None);
    }
}
