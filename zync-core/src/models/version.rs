//! CVR versions and client cookies.
//!
//! A version is a pair of a replica `state_version` and a CVR-internal
//! `minor_version`. State versions are opaque, lexicographically
//! comparable strings minted by the replica; minor versions count CVR
//! metadata changes (query set changes and the like) that happen between
//! replica transactions. The client-facing rendition is the cookie
//! `stateVersion[:minorVersion]` with the minor part omitted when zero.
//!
//! Numeric components are rendered as "lexi" strings: base36 digits
//! prefixed with a single base36 length character, which makes versions of
//! different magnitudes compare correctly as plain strings.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Opaque, lexicographically comparable replica transaction version.
pub type StateVersion = String;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum VersionError {
    #[error("invalid cookie `{0}`: {1}")]
    InvalidCookie(String, String),
    #[error("invalid lexi value `{0}`")]
    InvalidLexi(String),
    #[error("version moved backwards: {0} -> {1}")]
    VersionRegression(String, String),
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encodes a u64 with a leading base36 length character so that encoded
/// values sort lexicographically in numeric order.
pub fn encode_lexi(value: u64) -> String {
    let mut digits = Vec::new();
    let mut v = value;
    loop {
        digits.push(BASE36[(v % 36) as usize]);
        v /= 36;
        if v == 0 {
            break;
        }
    }
    digits.push(BASE36[digits.len() - 1]);
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ascii")
}

pub fn decode_lexi(encoded: &str) -> Result<u64, VersionError> {
    let bytes = encoded.as_bytes();
    if bytes.len() < 2 {
        return Err(VersionError::InvalidLexi(encoded.to_string()));
    }
    let digit = |b: u8| -> Result<u64, VersionError> {
        match b {
            b'0'..=b'9' => Ok((b - b'0') as u64),
            b'a'..=b'z' => Ok((b - b'a') as u64 + 10),
            _ => Err(VersionError::InvalidLexi(encoded.to_string())),
        }
    };
    let expected_len = digit(bytes[0])? as usize + 1;
    if bytes.len() - 1 != expected_len {
        return Err(VersionError::InvalidLexi(encoded.to_string()));
    }
    let mut value: u64 = 0;
    for &b in &bytes[1..] {
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit(b).ok()?))
            .ok_or_else(|| VersionError::InvalidLexi(encoded.to_string()))?;
    }
    Ok(value)
}

/// A CVR version. Orders component-wise; a missing minor version on the
/// wire is parsed as zero so `"120"` and `"120:00"`-style cookies compare
/// equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CvrVersion {
    pub state_version: StateVersion,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minor_version: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl CvrVersion {
    pub fn new(state_version: impl Into<StateVersion>) -> Self {
        Self { state_version: state_version.into(), minor_version: 0 }
    }

    /// The version a brand new CVR starts at, before any replica state has
    /// been observed.
    pub fn initial() -> Self {
        Self::new("00")
    }

    /// Renders the client-facing cookie.
    pub fn cookie(&self) -> String {
        if self.minor_version == 0 {
            self.state_version.clone()
        } else {
            format!("{}:{}", self.state_version, encode_lexi(self.minor_version))
        }
    }

    pub fn parse_cookie(cookie: &str) -> Result<Self, VersionError> {
        if cookie.is_empty() {
            return Err(VersionError::InvalidCookie(cookie.to_string(), "empty".to_string()));
        }
        match cookie.split_once(':') {
            None => Ok(Self::new(cookie)),
            Some((state, minor)) => {
                let minor_version = decode_lexi(minor).map_err(|e| {
                    VersionError::InvalidCookie(cookie.to_string(), e.to_string())
                })?;
                Ok(Self { state_version: state.to_string(), minor_version })
            }
        }
    }

    /// Next version for a CVR-internal change within the same replica
    /// transaction.
    pub fn next_minor(&self) -> Self {
        Self { state_version: self.state_version.clone(), minor_version: self.minor_version + 1 }
    }

    /// Next version for a replica transaction. Errors if the replica's
    /// state version does not advance.
    pub fn advance_to(&self, state_version: StateVersion) -> Result<Self, VersionError> {
        if state_version.as_str() <= self.state_version.as_str() {
            return Err(VersionError::VersionRegression(
                self.state_version.clone(),
                state_version,
            ));
        }
        Ok(Self { state_version, minor_version: 0 })
    }
}

impl PartialOrd for CvrVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CvrVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.state_version
            .cmp(&other.state_version)
            .then(self.minor_version.cmp(&other.minor_version))
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cookie())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0, "00")]
    #[case(1, "01")]
    #[case(35, "0z")]
    #[case(36, "110")]
    #[case(36 * 36, "2100")]
    #[case(u64::MAX, "c3w5e11264sgsf")]
    fn test_lexi_round_trip(#[case] value: u64, #[case] encoded: &str) {
        assert_eq!(encode_lexi(value), encoded);
        assert_eq!(decode_lexi(encoded).unwrap(), value);
    }

    #[test]
    fn test_lexi_orders_across_magnitudes() {
        let mut encoded: Vec<String> = [0u64, 1, 35, 36, 100, 1295, 1296, 50000]
            .iter()
            .map(|v| encode_lexi(*v))
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[rstest]
    #[case("121", "121", 0)]
    #[case("120:01", "120", 1)]
    #[case("11z:0g", "11z", 16)]
    fn test_cookie_round_trip(#[case] cookie: &str, #[case] state: &str, #[case] minor: u64) {
        let v = CvrVersion::parse_cookie(cookie).unwrap();
        assert_eq!(v.state_version, state);
        assert_eq!(v.minor_version, minor);
        assert_eq!(v.cookie(), cookie);
    }

    #[test]
    fn test_version_ordering() {
        let base = CvrVersion::parse_cookie("120").unwrap();
        let minor = CvrVersion::parse_cookie("120:01").unwrap();
        let next = CvrVersion::parse_cookie("121").unwrap();
        assert!(base < minor);
        assert!(minor < next);
        assert!(CvrVersion::parse_cookie("11z").unwrap() < base);
    }

    #[test]
    fn test_advance_rejects_regression() {
        let v = CvrVersion::parse_cookie("121:02").unwrap();
        assert_eq!(v.advance_to("123".to_string()).unwrap(), CvrVersion::new("123"));
        assert!(v.advance_to("121".to_string()).is_err());
        assert!(v.advance_to("11z".to_string()).is_err());
    }
}
