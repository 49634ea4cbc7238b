//! Device command sets and response parsers.
//!
//! Builders return requests for the matching [`crate::comms`] codec; parsers
//! turn responses into [`crate::types::BikeTelemetry`] or identity fields.

pub mod daum_classic;
pub mod daum_premium;
pub mod kettler;

use crate::error::{PedalError, Result};

/// Fail with a parse error unless `data` holds at least `len` bytes
pub(crate) fn require_len(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(PedalError::ParseError(format!(
            "{what} too short: {} bytes, expected {len}",
            data.len()
        )));
    }
    Ok(())
}

/// Printable ASCII text of `data`, trimmed of padding
pub(crate) fn ascii_text(data: &[u8]) -> String {
    data.iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|b| char::from(*b))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_len() {
        assert!(require_len(&[1, 2, 3], 3, "frame").is_ok());
        let err = require_len(&[1], 3, "frame").unwrap_err();
        assert!(err.to_string().contains("frame too short"));
    }

    #[test]
    fn test_ascii_text() {
        assert_eq!(ascii_text(b" 8080\x00\x00"), "8080");
        assert_eq!(ascii_text(b"SN 12\xFF"), "SN 12");
    }
}
