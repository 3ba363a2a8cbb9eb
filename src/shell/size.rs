//! Disk size arguments ("4000000", "512M", "10g", "1,024m") in kilobytes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Problem with size '{input}' - expected a number optionally followed by M, G or T")]
pub struct SizeParseError {
    input: String,
}

impl SizeParseError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Parse a size into KB. A bare number is already KB; `M`, `G` and `T`
/// multiply by 1024, 1024² and 1024³. Commas are thousands separators.
pub fn parse_size_kb(s: &str) -> Result<u64, SizeParseError> {
    let trimmed = s.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1024_u64),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 1024_u64.pow(2)),
        Some('t' | 'T') => (&trimmed[..trimmed.len() - 1], 1024_u64.pow(3)),
        _ => (trimmed, 1_u64),
    };

    // Must start with a digit, commas only between digits
    if !digits.starts_with(|c: char| c.is_ascii_digit()) || !digits.chars().all(|c| c.is_ascii_digit() || c == ',') {
        return Err(SizeParseError::new(s));
    }

    let num: u64 = digits.replace(',', "").parse().map_err(|_| SizeParseError::new(s))?;
    num.checked_mul(multiplier).ok_or_else(|| SizeParseError::new(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_number_is_kb() {
        assert_eq!(parse_size_kb("4000000").unwrap(), 4_000_000);
        assert_eq!(parse_size_kb("1,024").unwrap(), 1024);
    }

    #[test]
    fn test_unit_suffixes() {
        assert_eq!(parse_size_kb("3M").unwrap(), 3 * 1024);
        assert_eq!(parse_size_kb("10g").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size_kb("2T").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_kb("1,000m").unwrap(), 1000 * 1024);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_size_kb("").is_err());
        assert!(parse_size_kb("G").is_err());
        assert!(parse_size_kb("ten").is_err());
        assert!(parse_size_kb("10x").is_err());
        assert!(parse_size_kb("10GB").is_err());
        assert!(parse_size_kb(",10").is_err());
        assert!(parse_size_kb("-5").is_err());
    }

    #[test]
    fn test_overflow() {
        assert_eq!(parse_size_kb("99999999999999999999T"), Err(SizeParseError::new("99999999999999999999T")));
    }
}
