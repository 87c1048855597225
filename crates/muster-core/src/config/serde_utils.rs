//! Shared serialization/deserialization utilities for configuration

/// Helper module for Duration serialization as seconds
///
/// Serializes `std::time::Duration` as a u64 number of seconds, which is
/// more human-readable in TOML configuration files.
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for Duration serialization as milliseconds
///
/// Used for the shorter intervals (watchdog poll, retry delay) where second
/// granularity is too coarse.
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize a Duration from milliseconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(with = "super::duration_secs")]
        timeout: Duration,
        #[serde(with = "super::duration_millis")]
        poll: Duration,
    }

    #[test]
    fn test_duration_roundtrip() {
        let original = TestConfig {
            timeout: Duration::from_secs(30),
            poll: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, r#"{"timeout":30,"poll":250}"#);

        let parsed: TestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
