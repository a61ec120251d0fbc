//! Stateless built-in functions: scale, clamp, abs, min, max, round, sign

/// Multiply a value by a factor
pub fn scale(value: f64, factor: f64) -> f64 {
    value * factor
}

/// Clamp a value to a range
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if min > max {
        return value;
    }
    value.clamp(min, max)
}

/// Absolute value
pub fn abs(value: f64) -> f64 {
    value.abs()
}

/// Minimum of two values
pub fn min(a: f64, b: f64) -> f64 {
    a.min(b)
}

/// Maximum of two values
pub fn max(a: f64, b: f64) -> f64 {
    a.max(b)
}

/// Round to specified decimal places
pub fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Sign function: returns -1, 0, or 1
pub fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}
