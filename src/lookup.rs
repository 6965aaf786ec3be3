//! Lookup tables with linear interpolation
//!
//! Tables are `(x, y)` pairs sorted by `x`. Inputs outside the table are errors; there is
//! no extrapolation.

use crate::error::LookupError;

/// Measured power draw of the light at each duty cycle.
pub const DUTY_CYCLE_TO_WATTS: [(f64, f64); 6] = [
    (0.0, 0.0),
    (0.2, 3.5),
    (0.4, 5.0),
    (0.6, 7.2),
    (0.8, 8.4),
    (1.0, 10.0),
];

/// Duty cycle needed to emit a given light output.
pub const LUMENS_TO_DUTY_CYCLE: [(f64, f64); 7] = [
    (0.0, 0.00),
    (100.0, 0.11),
    (200.0, 0.17),
    (300.0, 0.30),
    (400.0, 0.50),
    (500.0, 0.70),
    (600.0, 1.00),
];

/// Linearly interpolate the output for `value` from `table`.
///
/// Endpoint inputs return the endpoint output exactly.
pub fn lerp(table: &[(f64, f64)], value: f64) -> Result<f64, LookupError> {
    if table.len() < 2 {
        return Err(LookupError::TooFewEntries(table.len()));
    }
    if value.is_nan() {
        return Err(LookupError::NotANumber);
    }

    // Index of the first entry strictly greater than `value`
    let upper = table.partition_point(|&(x, _)| x <= value);

    if upper == 0 {
        let (min, _) = table[0];
        return Err(LookupError::BelowRange { value, min });
    }

    if upper == table.len() {
        let (max, max_output) = table[table.len() - 1];
        if value == max {
            return Ok(max_output);
        }
        return Err(LookupError::AboveRange { value, max });
    }

    let (x_lo, y_lo) = table[upper - 1];
    if value == x_lo {
        return Ok(y_lo);
    }
    let (x_hi, y_hi) = table[upper];

    Ok(y_lo + (y_hi - y_lo) * (value - x_lo) / (x_hi - x_lo))
}

/// Watts drawn at `duty_cycle` (0.0..=1.0).
pub fn duty_cycle_to_watts(duty_cycle: f64) -> Result<f64, LookupError> {
    lerp(&DUTY_CYCLE_TO_WATTS, duty_cycle)
}

/// Duty cycle (0.0..=1.0) that emits `lumens` (0..=600).
pub fn lumens_to_duty_cycle(lumens: f64) -> Result<f64, LookupError> {
    lerp(&LUMENS_TO_DUTY_CYCLE, lumens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_lerp_midpoint() {
        let table = [(5.0, 72.0), (9.0, 52.0)];
        assert!(close(lerp(&table, 7.0).unwrap(), 62.0));
    }

    #[test]
    fn test_lerp_endpoints_are_exact() {
        let table = [(0.1, 0.3), (0.7, 0.9), (1.3, 2.1)];
        assert_eq!(lerp(&table, 0.1).unwrap(), 0.3);
        assert_eq!(lerp(&table, 0.7).unwrap(), 0.9);
        assert_eq!(lerp(&table, 1.3).unwrap(), 2.1);
    }

    #[test]
    fn test_lerp_out_of_range() {
        let table = [(5.0, 72.0), (9.0, 52.0)];
        assert_eq!(
            lerp(&table, 4.999),
            Err(LookupError::BelowRange { value: 4.999, min: 5.0 })
        );
        assert_eq!(
            lerp(&table, 9.5),
            Err(LookupError::AboveRange { value: 9.5, max: 9.0 })
        );
        assert_eq!(lerp(&table, f64::NAN), Err(LookupError::NotANumber));
    }

    #[test]
    fn test_lerp_needs_two_entries() {
        assert_eq!(lerp(&[], 1.0), Err(LookupError::TooFewEntries(0)));
        assert_eq!(lerp(&[(1.0, 1.0)], 1.0), Err(LookupError::TooFewEntries(1)));
    }

    #[test]
    fn test_duty_cycle_to_watts() {
        assert!(close(duty_cycle_to_watts(0.3).unwrap(), 4.25));
        assert!(close(duty_cycle_to_watts(0.8).unwrap(), 8.4));
        assert_eq!(duty_cycle_to_watts(0.0).unwrap(), 0.0);
        assert_eq!(duty_cycle_to_watts(1.0).unwrap(), 10.0);
        assert!(duty_cycle_to_watts(1.01).is_err());
        assert!(duty_cycle_to_watts(-0.01).is_err());
    }

    #[test]
    fn test_lumens_to_duty_cycle() {
        assert!(close(lumens_to_duty_cycle(350.0).unwrap(), 0.4));
        assert_eq!(lumens_to_duty_cycle(0.0).unwrap(), 0.0);
        assert_eq!(lumens_to_duty_cycle(600.0).unwrap(), 1.0);
        assert!(lumens_to_duty_cycle(600.5).is_err());
    }
}
