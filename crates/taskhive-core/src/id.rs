// Issue ID helpers
//
// Issue IDs are `{prefix}-{n}` strings with a per-prefix monotonic counter
// behind them. Suffix parsing must be strict: a stored ID that claims the
// prefix but does not carry a numeric suffix means the database was edited
// out-of-band, which the core treats as fatal.

use crate::error::{CoordinationError, Result};

/// Format an issue ID from a prefix and numeric suffix.
pub fn format_issue_id(prefix: &str, n: i64) -> String {
    format!("{prefix}-{n}")
}

/// Parse the numeric suffix of an ID with the given prefix.
///
/// Returns `None` when the ID does not belong to the prefix at all (a
/// different prefix is not corruption). Returns an error when the prefix
/// matches but the suffix is not a positive integer.
pub fn parse_issue_suffix(prefix: &str, id: &str) -> Result<Option<i64>> {
    let Some(rest) = id.strip_prefix(prefix) else {
        return Ok(None);
    };
    let Some(suffix) = rest.strip_prefix('-') else {
        return Ok(None);
    };
    suffix
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .map(Some)
        .ok_or_else(|| {
            CoordinationError::fatal(
                "parse_issue_suffix",
                format!("corrupted issue id {id:?}: suffix {suffix:?} is not a positive integer"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        assert_eq!(format_issue_id("vc", 42), "vc-42");
        assert_eq!(parse_issue_suffix("vc", "vc-42").unwrap(), Some(42));
    }

    #[test]
    fn foreign_prefix_is_not_corruption() {
        assert_eq!(parse_issue_suffix("vc", "other-1").unwrap(), None);
        assert_eq!(parse_issue_suffix("vc", "vc").unwrap(), None);
    }

    #[test]
    fn non_numeric_suffix_is_fatal() {
        let err = parse_issue_suffix("vc", "vc-abc").unwrap_err();
        assert!(matches!(err, CoordinationError::Fatal { .. }));
        assert!(parse_issue_suffix("vc", "vc-0").is_err());
        assert!(parse_issue_suffix("vc", "vc--3").is_err());
    }

    #[test]
    fn prefix_substring_does_not_confuse() {
        // "vc-10" belongs to prefix "vc", not to prefix "v"
        assert_eq!(parse_issue_suffix("v", "vc-10").unwrap(), None);
    }
}
