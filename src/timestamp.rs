use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};
use std::time::SystemTime;

/// A Unix timestamp in seconds, used for payment authorization windows.
///
/// ERC-3009 `transferWithAuthorization` messages carry a validity window
/// (`validAfter`, `validBefore`) expressed in seconds since the Unix epoch.
///
/// Serialized as a stringified integer to avoid precision loss in JSON:
/// `1699999999` becomes `"1699999999"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    /// Current wall-clock time. A clock set before 1970 reads as zero.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl From<UnixTimestamp> for U256 {
    fn from(value: UnixTimestamp) -> Self {
        U256::from(value.0)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl Sub<u64> for UnixTimestamp {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_sub(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_decimal_string() {
        let ts = UnixTimestamp(1699999999);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"1699999999\"");
    }

    #[test]
    fn deserializes_from_decimal_string() {
        let ts: UnixTimestamp = serde_json::from_str("\"1699999999\"").unwrap();
        assert_eq!(ts, UnixTimestamp(1699999999));
    }

    #[test]
    fn rejects_non_numeric() {
        let result: Result<UnixTimestamp, _> = serde_json::from_str("\"soon\"");
        assert!(result.is_err());
    }

    #[test]
    fn saturating_subtraction() {
        assert_eq!(UnixTimestamp(5) - 10, UnixTimestamp(0));
    }
}
