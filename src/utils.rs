use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Europe::Stockholm;

/// Round to a fixed number of decimals (field values are stored rounded).
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Seconds to sleep so the next iteration starts on a clock boundary where
/// `minute % interval_minutes == 0`, plus a per-process offset used to
/// stagger many workers against the store.
///
/// If the boundary is less than 10 s away the next one is used instead, so
/// an iteration that finishes just before its own boundary never fires twice.
pub fn seconds_to_next_boundary(now: DateTime<Utc>, interval_minutes: u32, offset_seconds: u32) -> f64 {
    let interval_minutes = interval_minutes.max(1);
    let minutes_past = now.minute() % interval_minutes;
    let seconds_past =
        minutes_past as f64 * 60.0 + now.second() as f64 + now.nanosecond() as f64 / 1_000_000_000.0;
    let mut sleep_seconds = (interval_minutes as f64 * 60.0) - seconds_past + offset_seconds as f64;

    if sleep_seconds < 10.0 {
        sleep_seconds += interval_minutes as f64 * 60.0;
    }

    sleep_seconds
}

/// The aligned boundary timestamp an iteration should be stamped with:
/// `now` truncated down to the interval boundary, at second precision.
pub fn aligned_boundary(now: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    let interval_minutes = interval_minutes.max(1);
    let minutes_past = now.minute() % interval_minutes;
    let truncated = now.timestamp() - minutes_past as i64 * 60 - now.second() as i64;
    Utc.timestamp_opt(truncated, 0).single().unwrap_or(now)
}

/// Swedish-local calendar date for a UTC instant. The energy pipeline and
/// daily separation both bucket by this.
pub fn stockholm_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Stockholm).date_naive()
}

/// Swedish-local hour of day (0-23).
pub fn stockholm_hour(ts: DateTime<Utc>) -> u32 {
    ts.with_timezone(&Stockholm).hour()
}

/// Great-circle distance between two coordinates in kilometers (haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * R * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn boundary_sleep_from_mid_interval() {
        // Process started 12:07:03, interval 15 min: first boundary is 12:15:00.
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 7, 3).unwrap();
        let sleep = seconds_to_next_boundary(now, 15, 0);
        assert!((sleep - 477.0).abs() < 1.0, "expected ~477s, got {sleep}");
    }

    #[test]
    fn boundary_sleep_skips_imminent_boundary() {
        // 4 s before the boundary: skip forward a full interval.
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 14, 56).unwrap();
        let sleep = seconds_to_next_boundary(now, 15, 0);
        assert!(sleep > 15.0 * 60.0 - 10.0 && sleep <= 15.0 * 60.0 + 4.0, "got {sleep}");
    }

    #[test]
    fn boundary_sleep_applies_offset() {
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 30).unwrap();
        let plain = seconds_to_next_boundary(now, 5, 0);
        let offset = seconds_to_next_boundary(now, 5, 20);
        assert!((offset - plain - 20.0).abs() < 1e-9);
    }

    #[test]
    fn aligned_boundary_truncates() {
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 17, 42).unwrap();
        let b = aligned_boundary(now, 15);
        assert_eq!(b, Utc.with_ymd_and_hms(2026, 1, 12, 12, 15, 0).unwrap());
    }

    #[test]
    fn stockholm_day_rolls_before_utc_midnight() {
        // 23:30 UTC in winter is 00:30 next day in Stockholm (CET).
        let ts = Utc.with_ymd_and_hms(2026, 1, 12, 23, 30, 0).unwrap();
        assert_eq!(stockholm_date(ts), NaiveDate::from_ymd_opt(2026, 1, 13).unwrap());
    }

    #[test]
    fn haversine_linkoping_norrkoping() {
        // Roughly 40 km apart.
        let d = haversine_km(58.41, 15.62, 58.59, 16.19);
        assert!(d > 30.0 && d < 50.0, "got {d}");
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to(21.123456, 4), 21.1235);
        assert_eq!(round_to(21.125, 2), 21.13);
    }
}
