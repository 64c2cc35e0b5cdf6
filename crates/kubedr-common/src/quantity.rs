//! Storage quantity arithmetic
//!
//! Parses Kubernetes resource quantities for storage sizes (`10Gi`, `500M`,
//! `1.5Ti`, `1e9`, `1073741824`) into bytes and formats byte counts back into the
//! most compact exact binary form.

use crate::Error;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parse a storage quantity into bytes
pub fn parse_bytes(quantity: &str) -> Result<u128, Error> {
    let q = quantity.trim();
    if q.is_empty() {
        return Err(Error::validation("quantity", "empty storage quantity"));
    }
    let overflow = || Error::validation("quantity", format!("{:?} is too large", q));

    let (number, scale) = split_suffix(q)
        .ok_or_else(|| Error::validation("quantity", format!("unknown suffix in {:?}", q)))?
        .map_err(|_| overflow())?;

    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(Error::validation(
            "quantity",
            format!("missing number in {:?}", q),
        ));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::validation(
            "quantity",
            format!("invalid number in {:?}", q),
        ));
    }

    // value = digits / 10^len(frac) * numerator / denominator
    let joined = format!("{}{}", whole, frac);
    let significant = joined.trim_start_matches('0');
    let digits: u128 = if significant.is_empty() {
        0
    } else {
        significant.parse().map_err(|_| overflow())?
    };
    let frac_scale = 10u128
        .checked_pow(frac.len() as u32)
        .ok_or_else(overflow)?;
    let numerator = digits.checked_mul(scale.numerator).ok_or_else(overflow)?;
    let denominator = frac_scale
        .checked_mul(scale.denominator)
        .ok_or_else(overflow)?;
    // round up: a fractional byte still needs storage
    Ok(numerator.div_ceil(denominator))
}

/// Exact multiplier applied to a quantity's number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Scale {
    numerator: u128,
    denominator: u128,
}

impl Scale {
    fn times(numerator: u128) -> Self {
        Self {
            numerator,
            denominator: 1,
        }
    }
}

/// `None` for an unknown suffix, `Some(Err)` for an exponent out of range
fn split_suffix(q: &str) -> Option<Result<(&str, Scale), ()>> {
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(n) = q.strip_suffix(suffix) {
            return Some(Ok((n, Scale::times(1024u128.pow(power)))));
        }
    }
    if let Some(split) = split_exponent(q) {
        return Some(split);
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(n) = q.strip_suffix(suffix) {
            return Some(Ok((n, Scale::times(1000u128.pow(power)))));
        }
    }
    if q.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Some(Ok((q, Scale::times(1))));
    }
    None
}

/// Decimal exponent form, `1e9` or `1E-3`
fn split_exponent(q: &str) -> Option<Result<(&str, Scale), ()>> {
    let at = q.find(['e', 'E'])?;
    let (number, exponent) = (&q[..at], &q[at + 1..]);
    let (negative, digits) = match exponent.strip_prefix(['+', '-']) {
        Some(rest) => (exponent.starts_with('-'), rest),
        None => (false, exponent),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let power = match digits.parse::<u32>().ok().and_then(|p| 10u128.checked_pow(p)) {
        Some(power) => power,
        None => return Some(Err(())),
    };
    let scale = if negative {
        Scale {
            numerator: 1,
            denominator: power,
        }
    } else {
        Scale::times(power)
    };
    Some(Ok((number, scale)))
}

/// Format bytes using the largest binary suffix that divides exactly
pub fn format_bytes(bytes: u128) -> String {
    for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1024u128.pow(*power);
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_bytes("1Ki").unwrap(), 1024);
        assert_eq!(parse_bytes("3Gi").unwrap(), 3 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("500M").unwrap(), 500_000_000);
        assert_eq!(parse_bytes("2k").unwrap(), 2000);
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
    }

    #[test]
    fn parses_fractions_rounding_up() {
        assert_eq!(parse_bytes("1.5Gi").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_bytes("0.5Ki").unwrap(), 512);
        assert_eq!(parse_bytes("1.0001k").unwrap(), 1001);
    }

    #[test]
    fn parses_decimal_exponents() {
        assert_eq!(parse_bytes("1e9").unwrap(), 1_000_000_000);
        assert_eq!(parse_bytes("1E3").unwrap(), 1000);
        assert_eq!(parse_bytes("2.5e+2").unwrap(), 250);
        assert_eq!(parse_bytes("5e-1").unwrap(), 1);
        // a bare E is still the exa suffix
        assert_eq!(parse_bytes("2E").unwrap(), 2 * 1000u128.pow(6));
        assert!(parse_bytes("1e").is_err());
        assert!(parse_bytes("e3").is_err());
        assert!(parse_bytes("1e99").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("Gi").is_err());
        assert!(parse_bytes("ten Gi").is_err());
        assert!(parse_bytes("10Gb").is_err());
        assert!(parse_bytes("-1Gi").is_err());
    }

    #[test]
    fn formats_with_largest_exact_suffix() {
        assert_eq!(format_bytes(8 * 1024 * 1024 * 1024), "8Gi");
        assert_eq!(format_bytes(1536 * 1024 * 1024), "1536Mi");
        assert_eq!(format_bytes(1000), "1000");
        assert_eq!(format_bytes(0), "0");
    }
}
