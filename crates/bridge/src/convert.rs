//! The autopilot reports and accepts NED (north, east, down) with
//! aircraft-convention attitude; everything else in the process is ENU
//! (east, north, up). All three conversions here are involutions, so the
//! same function serves both directions.

use std::f64::consts::FRAC_PI_2;

use nalgebra::Vector3;

/// (n, e, d) -> (e, n, -d), and back.
pub fn swap_ned_enu(v: Vector3<f64>) -> Vector3<f64> {
    Vector3::new(v.y, v.x, -v.z)
}

/// Heading measured clockwise from north <-> yaw measured
/// counter-clockwise from east.
pub fn swap_yaw(yaw: f64) -> f64 {
    FRAC_PI_2 - yaw
}

/// Aircraft attitude (roll, pitch, yaw over NED) <-> attitude over ENU.
pub fn swap_attitude(roll: f64, pitch: f64, yaw: f64) -> (f64, f64, f64) {
    (roll, -pitch, swap_yaw(yaw))
}

/// Aircraft body rates (front-right-down) <-> body rates
/// (front-left-up).
pub fn swap_body_rates(rates: Vector3<f64>) -> Vector3<f64> {
    Vector3::new(rates.x, -rates.y, -rates.z)
}
