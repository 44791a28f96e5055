//! Currency codes.
//!
//! A currency is a short uppercase alphanumeric code ("USD", "CAD", "GOOG",
//! "BRK.A"). Codes partition balance arithmetic: amounts in different
//! currencies are never summed together.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use tally_core::DomainError;

/// Validated currency code.
///
/// Pattern: starts with a letter, ends with a letter or digit, interior may
/// contain `.`, `-`, `_`. At least two characters. Construction is the only
/// validation point (parse, don't validate downstream).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(code: impl Into<String>) -> Result<Self, DomainError> {
        let code = code.into();
        let bytes = code.as_bytes();

        let last = bytes.last().copied().unwrap_or(0);
        let valid = bytes.len() >= 2
            && bytes[0].is_ascii_uppercase()
            && (last.is_ascii_uppercase() || last.is_ascii_digit())
            && bytes[1..bytes.len() - 1].iter().copied().all(|b| {
                b.is_ascii_uppercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_')
            });

        if !valid {
            return Err(DomainError::validation(format!(
                "invalid currency code: {code:?}"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for CurrencyCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CurrencyCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CurrencyCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_codes() {
        for code in ["USD", "CAD", "MSFT", "BRK.A", "X-1", "A_B", "B2"] {
            assert!(CurrencyCode::parse(code).is_ok(), "{code}");
        }
    }

    #[test]
    fn rejects_malformed_codes() {
        for code in ["", "U", "usd", "1SD", "USD.", "-US", "US D", "US$"] {
            assert!(CurrencyCode::parse(code).is_err(), "{code}");
        }
    }
}
