//! Dense identifier helpers: base-36 conversion and ignore ranges.

use std::fmt;
use std::str::FromStr;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a dense identifier as lowercase base-36 text.
pub fn base36_encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(13);
    while value > 0 {
        buf.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    // Only ASCII digits were pushed.
    String::from_utf8(buf).unwrap_or_default()
}

/// Decode base-36 text (either case). Returns `None` on empty or invalid input.
pub fn base36_decode(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// True when `text` is exactly what [`base36_encode`] produces for its value:
/// lowercase, no leading zeros.
pub fn is_canonical(text: &str) -> bool {
    base36_decode(text).map_or(false, |value| base36_encode(value) == text)
}

// =============================================================================
// IGNORE RANGES
// =============================================================================

/// Inclusive range of dense identifiers excluded from gap detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    pub fn contains(&self, id: u64) -> bool {
        self.start <= id && id <= self.end
    }

    /// Parse a comma separated list such as `k1a-k2z,m00-m0f`.
    pub fn parse_list(text: &str) -> Result<Vec<IdRange>, String> {
        text.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for IdRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("id range '{}' must look like start-end", s))?;
        let start = base36_decode(start.trim())
            .ok_or_else(|| format!("invalid range start '{}'", start))?;
        let end = base36_decode(end.trim()).ok_or_else(|| format!("invalid range end '{}'", end))?;
        if start > end {
            return Err(format!("id range '{}' is reversed", s));
        }
        Ok(IdRange { start, end })
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", base36_encode(self.start), base36_encode(self.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36_known_values() {
        assert_eq!(base36_encode(0), "0");
        assert_eq!(base36_encode(35), "z");
        assert_eq!(base36_encode(36), "10");
        assert_eq!(base36_decode("k0000"), Some(20 * 36u64.pow(4)));
        assert_eq!(base36_decode("ABC"), base36_decode("abc"));
    }

    #[test]
    fn test_base36_rejects_garbage() {
        assert_eq!(base36_decode(""), None);
        assert_eq!(base36_decode("t1_abc"), None);
        assert_eq!(base36_decode("-1"), None);
        assert_eq!(base36_decode("+k10"), None);
    }

    #[test]
    fn test_canonical_form() {
        assert!(is_canonical("k10"));
        assert!(is_canonical("0"));
        assert!(!is_canonical("0k10"));
        assert!(!is_canonical("K10"));
        assert!(!is_canonical("+k10"));
        assert!(!is_canonical(""));
    }

    #[test]
    fn test_id_range_list() {
        let ranges = IdRange::parse_list("a-f, 10-1z").unwrap();
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].contains(10));
        assert!(ranges[0].contains(15));
        assert!(!ranges[0].contains(16));
        assert_eq!(ranges[1].to_string(), "10-1z");
        assert!(IdRange::parse_list("f-a").is_err());
        assert!(IdRange::parse_list("abc").is_err());
    }
}
