//! Solar geometry for the detector and the effective-temperature model.
//!
//! Elevation from Spencer (1971) declination and equation of time plus the
//! hour angle for the true longitude, which is plenty for threshold checks
//! like "sun above 10 degrees".

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;

/// Solar elevation angle in degrees for a UTC instant and location.
/// Negative when the sun is below the horizon.
pub fn solar_elevation(ts: DateTime<Utc>, latitude: f64, longitude: f64) -> f64 {
    let doy = ts.ordinal() as f64;
    let ut_h = ts.hour() as f64 + ts.minute() as f64 / 60.0 + ts.second() as f64 / 3600.0;

    // Declination (Spencer 1971)
    let b = 2.0 * PI * (doy - 1.0) / 365.0;
    let decl = 0.006918 - 0.399912 * b.cos() + 0.070257 * b.sin() - 0.006758 * (2.0 * b).cos()
        + 0.000907 * (2.0 * b).sin()
        - 0.002697 * (3.0 * b).cos()
        + 0.00148 * (3.0 * b).sin();

    // Equation of time in minutes (Spencer 1971)
    let eot_min = 229.18
        * (0.000075 + 0.001868 * b.cos() - 0.032077 * b.sin()
            - 0.014615 * (2.0 * b).cos()
            - 0.04089 * (2.0 * b).sin());

    // Local solar time from true longitude, hour angle from solar noon
    let lst_h = ut_h + longitude / 15.0 + eot_min / 60.0;
    let omega = (15.0 * (lst_h - 12.0)).to_radians();

    let lat = latitude.to_radians();
    let sin_alpha = lat.sin() * decl.sin() + lat.cos() * decl.cos() * omega.cos();
    sin_alpha.clamp(-1.0, 1.0).asin().to_degrees()
}

/// `sin(elevation)` intensity when the sun is up, else 0.
pub fn solar_intensity(ts: DateTime<Utc>, latitude: f64, longitude: f64) -> f64 {
    let elev = solar_elevation(ts, latitude, longitude);
    if elev > 0.0 { elev.to_radians().sin() } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Linkoping, the reference deployment site.
    const LAT: f64 = 58.41;
    const LON: f64 = 15.62;

    #[test]
    fn summer_noon_is_high() {
        // Solar noon near 11:00 UTC at lon 15.6E, midsummer.
        let t = Utc.with_ymd_and_hms(2026, 6, 21, 11, 0, 0).unwrap();
        let elev = solar_elevation(t, LAT, LON);
        assert!(elev > 50.0 && elev < 60.0, "midsummer noon elevation {elev:.1}");
    }

    #[test]
    fn winter_noon_is_low_but_up() {
        let t = Utc.with_ymd_and_hms(2026, 12, 21, 11, 0, 0).unwrap();
        let elev = solar_elevation(t, LAT, LON);
        assert!(elev > 2.0 && elev < 12.0, "midwinter noon elevation {elev:.1}");
    }

    #[test]
    fn midnight_is_below_horizon() {
        let t = Utc.with_ymd_and_hms(2026, 6, 21, 23, 0, 0).unwrap();
        let elev = solar_elevation(t, LAT, LON);
        assert!(elev < 0.0, "midnight elevation {elev:.1}");
        assert_eq!(solar_intensity(t, LAT, LON), 0.0);
    }

    #[test]
    fn intensity_is_sine_of_elevation() {
        let t = Utc.with_ymd_and_hms(2026, 3, 20, 11, 0, 0).unwrap();
        let elev = solar_elevation(t, LAT, LON);
        let intensity = solar_intensity(t, LAT, LON);
        assert!((intensity - elev.to_radians().sin()).abs() < 1e-12);
    }
}
