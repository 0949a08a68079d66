//! Server version helpers.
//!
//! Versions are compared as a single number, `major*10000 + minor*100 + patch`
//! (e.g. `9.2.4` -> `90204`, `13.2` -> `130200`).

use once_cell::sync::OnceCell;
use regex::Regex;

/// Parse and normalize a server version string.
/// Returns a tuple of (`normalized_string`, `version_number`).
///
/// Accepts the raw `SHOW server_version` output (`"13.2 (Debian 13.2-1)"`),
/// a `version()` banner (`"PostgreSQL 9.2.4 (openGauss 2.0.0 ...)"`) or a
/// plain `"major.minor[.patch]"` string. Unparsable input yields `None`.
#[must_use]
pub fn normalize_version(version_string: &str) -> Option<(String, i64)> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("Invalid regex")
    });

    let caps = re.captures(version_string)?;
    let part = |idx: usize| -> Option<i64> {
        caps.get(idx).map_or(Some(0), |m| m.as_str().parse::<i64>().ok())
    };

    let (major, minor, patch) = (part(1)?, part(2)?, part(3)?);
    // minor and patch each own two decimal digits of the number
    if minor >= 100 || patch >= 100 {
        return None;
    }
    let number = major.checked_mul(10_000)?.checked_add(minor * 100 + patch)?;

    Some((format!("{major}.{minor}.{patch}"), number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version() {
        assert_eq!(
            normalize_version("10.5.8"),
            Some(("10.5.8".to_string(), 100_508))
        );
        assert_eq!(
            normalize_version("11.4"),
            Some(("11.4.0".to_string(), 110_400))
        );
        assert_eq!(
            normalize_version("13.2 (Debian 13.2-1.pgdg100+1)").map(|(_, v)| v),
            Some(130_200)
        );
        assert_eq!(
            normalize_version("PostgreSQL 9.2.4 (openGauss 2.0.0 build 78689da9)").map(|(_, v)| v),
            Some(90_204)
        );
        assert_eq!(normalize_version("16").map(|(_, v)| v), Some(160_000));
        assert_eq!(normalize_version("devel"), None);
        assert_eq!(normalize_version(""), None);
    }

    #[test]
    fn test_normalize_version_out_of_range() {
        // does not fit the number at all
        assert_eq!(normalize_version("99999999999999999.0"), None);
        // does not fit an i64 component
        assert_eq!(normalize_version("99999999999999999999.0"), None);
        assert_eq!(normalize_version("9.99999999999999999999"), None);
        // would collide with the next minor or major
        assert_eq!(normalize_version("9.100"), None);
        assert_eq!(normalize_version("9.6.100"), None);
    }
}
