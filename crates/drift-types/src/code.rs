use std::fmt;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One-shot session code: six uppercase hex characters with a dash
/// after the third, e.g. `A3F-0B9`.
///
/// Generated by the sender at session start and required from the
/// receiver exactly once. Input is case-insensitive and the dash is
/// optional; the stored form is always normalised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    /// Draw three bytes from the system RNG and format them.
    ///
    /// Fails rather than degrading to a non-cryptographic source.
    pub fn generate() -> Result<Self, EngineError> {
        let mut raw = [0u8; 3];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|_| EngineError::RngUnavailable)?;
        let hex = format!("{:02X}{:02X}{:02X}", raw[0], raw[1], raw[2]);
        Ok(Self(format!("{}-{}", &hex[..3], &hex[3..])))
    }

    /// Normalise user input: uppercase, dash inserted if missing.
    /// Returns `None` when the input is not a 6-hex-digit code.
    pub fn parse(input: &str) -> Option<Self> {
        let cleaned: String = input
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.len() != 6 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(format!("{}-{}", &cleaned[..3], &cleaned[3..])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a peer-supplied code, tolerating case and a
    /// missing dash.
    pub fn matches(&self, candidate: &str) -> bool {
        Self::parse(candidate).is_some_and(|c| c == *self)
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_is_formatted() {
        let code = SessionCode::generate().expect("rng");
        let s = code.as_str();
        assert_eq!(s.len(), 7);
        assert_eq!(s.as_bytes()[3], b'-');
        assert!(
            s.chars()
                .filter(|c| *c != '-')
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        );
    }

    #[test]
    fn parse_normalises_case_and_dash() {
        let code = SessionCode::parse("ab-c1f2");
        assert!(code.is_none());

        let code = SessionCode::parse("abc1f2").expect("valid");
        assert_eq!(code.as_str(), "ABC-1F2");

        let code = SessionCode::parse("  aBc-1F2 ").expect("valid");
        assert_eq!(code.as_str(), "ABC-1F2");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SessionCode::parse("").is_none());
        assert!(SessionCode::parse("XYZ-123").is_none());
        assert!(SessionCode::parse("ABC-12").is_none());
        assert!(SessionCode::parse("ABC-12345").is_none());
    }

    #[test]
    fn matches_is_lenient_on_input_form() {
        let code = SessionCode::parse("1A2-B3C").expect("valid");
        assert!(code.matches("1a2b3c"));
        assert!(code.matches("1A2-B3C"));
        assert!(!code.matches("1A2-B3D"));
        assert!(!code.matches("nonsense"));
    }
}
