//! Clock skew estimation against simulated servers.

use stratus_storage::ClockSkew;
use stratus_storage::clock_skew::parse_http_date;

/// Feeds `rounds` observations from a server whose clock lags ours by `lag`
/// seconds, with requests taking `latency` seconds.
fn converge(lag: f64, latency: f64, rounds: usize) -> (f64, f64) {
    let skew = ClockSkew::new();
    let mut now = 1_700_000_000.25;
    for _ in 0..rounds {
        let sent = now;
        let received = now + latency;
        // the server stamps somewhere in between, truncated to whole seconds
        let server = (sent + latency / 2.0 - lag).floor();
        skew.observe(sent, received, server);
        now += 7.3;
    }
    skew.estimate()
}

#[test]
fn steady_lag_settles_one_second_below_and_at_the_lag() {
    for lag in [0.0, 3.0, 30.0, 120.0] {
        let skew = ClockSkew::new();
        let mut now = 1_700_000_000.0;
        for _ in 0..300 {
            skew.observe(now, now, now - lag);
            now += 5.0;
        }
        let (min, max) = skew.estimate();
        assert!((min + lag + 1.0).abs() < 1e-3, "lag {lag}: min {min}");
        assert!((max + lag).abs() < 1e-3, "lag {lag}: max {max}");
    }
}

#[test]
fn truncated_dates_stay_near_the_lag() {
    for lag in [0.0, 3.0, 30.0, 120.5] {
        let (min, max) = converge(lag, 0.05, 200);
        assert!(min <= max, "lag {lag}: {min} > {max}");
        assert!(min >= -(lag + 2.0) - 0.05, "lag {lag}: min {min}");
        assert!(min <= -lag - 0.9, "lag {lag}: min {min}");
        assert!(max >= -lag - 1.0, "lag {lag}: max {max}");
        assert!(max <= -lag + 0.03, "lag {lag}: max {max}");
    }
}

#[test]
fn leading_server_gives_positive_bounds() {
    let (min, max) = converge(-45.0, 0.1, 200);
    assert!(min > 42.9 && min < 44.0, "min {min}");
    assert!(max > 44.0 && max < 45.1, "max {max}");
}

#[test]
fn estimate_moves_gradually() {
    let skew = ClockSkew::new();
    skew.observe(1000.0, 1000.0, 1100.0);
    let (min, _) = skew.estimate();
    // one sample only pulls the estimate a tenth of the way
    assert!((min - 9.9).abs() < 1e-9);
}

#[test]
fn swapped_send_and_receive_times_are_tolerated() {
    let skew = ClockSkew::new();
    skew.observe(1002.0, 1000.0, 1000.0);
    let (min, max) = skew.estimate();
    assert!(min <= max);
}

#[test]
fn unparseable_date_headers_are_ignored() {
    let skew = ClockSkew::new();
    let now = std::time::SystemTime::now();
    skew.observe_header(now, now, "yesterday-ish");
    assert_eq!(skew.estimate(), (0.0, 0.0));
    assert!(parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").is_some());
}
