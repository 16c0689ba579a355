//! Timestamp helpers for SAML `xs:dateTime` values.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Formats an instant as `YYYY-MM-DDThh:mm:ssZ`, truncated to seconds.
#[must_use]
pub fn format_instant(instant: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    instant
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .unwrap_or_default()
}

/// Parses an `xs:dateTime` value with an explicit offset.
///
/// # Errors
/// Returns the parse error for values that are not RFC 3339 timestamps.
pub fn parse_instant(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
}

/// Converts a configuration duration, saturating on overflow.
#[must_use]
pub fn to_duration(duration: std::time::Duration) -> Duration {
    Duration::try_from(duration).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_format_truncates_and_converts_to_utc() {
        let instant = datetime!(2024-03-01 10:20:30.987 +02:00);
        assert_eq!(format_instant(instant), "2024-03-01T08:20:30Z");
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            parse_instant("2024-03-01T08:20:30Z").unwrap(),
            datetime!(2024-03-01 08:20:30 UTC)
        );
        assert_eq!(
            parse_instant(" 2024-03-01T08:20:30.500+01:00 ").unwrap(),
            datetime!(2024-03-01 07:20:30.5 UTC)
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_to_duration() {
        assert_eq!(
            to_duration(std::time::Duration::from_secs(90)),
            Duration::seconds(90)
        );
        assert_eq!(to_duration(std::time::Duration::MAX), Duration::MAX);
    }
}
