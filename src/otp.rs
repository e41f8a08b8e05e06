//! One-time access codes for delivered artifacts.

use crate::error::{EngineError, Result};
use rand::rngs::OsRng;
use rand::RngCore;

pub const OTP_LENGTH: usize = 6;

/// Generate a numeric code from the OS random source.
///
/// Bytes of 250 and above are rejected so every digit is uniform over 0-9.
pub fn generate_otp() -> Result<String> {
    let mut code = String::with_capacity(OTP_LENGTH);
    let mut buf = [0u8; 16];
    while code.len() < OTP_LENGTH {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| EngineError::Encoding(format!("random source failed: {e}")))?;
        for byte in buf.iter().filter(|b| **b < 250) {
            if code.len() == OTP_LENGTH {
                break;
            }
            code.push(char::from(b'0' + byte % 10));
        }
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otp_is_six_digits() {
        for _ in 0..100 {
            let otp = generate_otp().unwrap();
            assert_eq!(otp.len(), OTP_LENGTH);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_codes_are_independent() {
        let codes: std::collections::HashSet<String> =
            (0..50).map(|_| generate_otp().unwrap()).collect();
        // 50 draws from a million codes; a handful of collisions at most.
        assert!(codes.len() > 45);
    }
}
