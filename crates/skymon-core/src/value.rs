//! Decoding of device response values.
//!
//! Controllers answer with plain decimals, sexagesimal angles in the
//! `sDD*MM'SS#` form, or times of day as `HH:MM:SS#`. A bare single digit is
//! a device error code rather than data.

/// Decode a response value into a floating-point number.
///
/// Angles decode to decimal degrees, times of day to decimal hours. Returns
/// `None` when the value matches none of the known encodings.
pub fn decode_value(raw: &str) -> Option<f64> {
    let clean = raw.trim().trim_end_matches('#');
    if clean.is_empty() {
        return None;
    }

    if let Ok(v) = clean.parse::<f64>() {
        return Some(v);
    }

    if let Some(v) = decode_sexagesimal(clean) {
        return Some(v);
    }

    decode_time_of_day(clean)
}

/// Decode `sDD*MM'SS` (optionally with a trailing `"`), e.g. `+12*34'56`.
fn decode_sexagesimal(clean: &str) -> Option<f64> {
    let (deg_part, rest) = clean.split_once(['*', '\u{00b0}'])?;
    let (min_part, sec_part) = rest.split_once('\'')?;
    let sec_part = sec_part.trim_end_matches('"');

    let deg: f64 = deg_part.trim().parse().ok()?;
    let min: f64 = min_part.trim().parse().ok()?;
    let sec: f64 = sec_part.trim().parse().ok()?;

    let sign = if deg_part.trim_start().starts_with('-') {
        -1.0
    } else {
        1.0
    };
    Some(deg + sign * (min / 60.0 + sec / 3600.0))
}

/// Decode `HH:MM:SS` into decimal hours.
fn decode_time_of_day(clean: &str) -> Option<f64> {
    let mut parts = clean.splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h + m / 60.0 + s / 3600.0)
}

/// If the value is a bare single decimal digit, return it as a device error
/// code.
pub fn as_error_code(raw: &str) -> Option<i32> {
    let clean = raw.trim();
    let mut chars = clean.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_digit() => Some(c as i32 - '0' as i32),
        _ => None,
    }
}

/// Human-readable meaning of a device error code.
pub fn error_code_meaning(code: i32) -> &'static str {
    match code {
        0 => "no error",
        1 => "unknown command",
        2 => "invalid parameter",
        3 => "device busy",
        4 => "hardware fault",
        5 => "motion limit reached",
        6 => "not homed",
        7 => "emergency stop",
        8 => "power failure",
        9 => "communication fault",
        _ => "unrecognized error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_decimal() {
        assert_eq!(decode_value("306.640#"), Some(306.640));
        assert_eq!(decode_value("306.640"), Some(306.640));
        assert_eq!(decode_value("-12.5#"), Some(-12.5));
    }

    #[test]
    fn test_decode_sexagesimal() {
        let v = decode_value("+12*30'00#").unwrap();
        assert!((v - 12.5).abs() < 1e-9);

        let v = decode_value("-05*15'36#").unwrap();
        assert!((v - (-5.26)).abs() < 1e-9);
    }

    #[test]
    fn test_decode_time_of_day() {
        let v = decode_value("06:30:00#").unwrap();
        assert!((v - 6.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_garbage() {
        assert_eq!(decode_value(""), None);
        assert_eq!(decode_value("OPEN#"), None);
        assert_eq!(decode_value("#"), None);
    }

    #[test]
    fn test_error_code_detection() {
        assert_eq!(as_error_code("3"), Some(3));
        assert_eq!(as_error_code("0"), Some(0));
        // Multi-digit and non-digit values are data, not error codes.
        assert_eq!(as_error_code("306.640"), None);
        assert_eq!(as_error_code("12"), None);
        assert_eq!(as_error_code("E"), None);
        assert_eq!(as_error_code(""), None);
    }

    #[test]
    fn test_error_code_meanings() {
        assert_eq!(error_code_meaning(0), "no error");
        assert_eq!(error_code_meaning(3), "device busy");
        assert_eq!(error_code_meaning(42), "unrecognized error code");
    }
}
