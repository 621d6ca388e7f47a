//! `expiresAt` serde format shared with the AWS CLI and SDKs
//!
//! Written as `2024-01-01T00:00:00Z`, with a fractional part only when the
//! instant has one. Read from any RFC 3339 timestamp or the legacy
//! `2024-01-01T00:00:00UTC` form older CLIs produced.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

const LEGACY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SUTC";

pub(crate) fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(value))
}

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

/// Render `value` the way cache files store it
pub(crate) fn format(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a cache-file timestamp
pub(crate) fn parse(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, LEGACY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Same format for optional fields
pub(crate) mod option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.serialize_some(&super::format(at)),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::parse(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_cli_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse("2024-03-01T12:30:00UTC"), Some(expected));
        assert_eq!(parse("2024-03-01T12:30:00.000Z"), Some(expected));
        assert_eq!(parse("2024-03-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse("yesterday"), None);
    }

    #[test]
    fn writes_second_precision_utc() {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(with = "super")]
            at: DateTime<Utc>,
        }
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let json = serde_json::to_string(&Wrapper { at }).unwrap();
        assert_eq!(json, r#"{"at":"2024-03-01T12:30:00Z"}"#);
    }

    #[test]
    fn keeps_subsecond_precision() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap() + chrono::Duration::nanoseconds(620_195_072);
        let written = format(&at);
        assert_eq!(written, "2024-03-01T12:30:00.620195072Z");
        assert_eq!(parse(&written), Some(at));
    }
}
