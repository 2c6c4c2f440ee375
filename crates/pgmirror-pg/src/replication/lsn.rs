//! Log sequence numbers in the server's `X/Y` text form.

use crate::error::{PgError, PgResult};

/// Parse `X/Y` (two hex halves) into a 64-bit position.
pub fn parse_lsn(lsn: &str) -> PgResult<u64> {
    let invalid = || PgError::InvalidLsn(lsn.to_string());
    let (high, low) = lsn.split_once('/').ok_or_else(invalid)?;
    let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
    let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
    Ok(u64::from(high) << 32 | u64::from(low))
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsn() {
        assert_eq!(parse_lsn("0/1A2B3C").unwrap(), 0x1A2B3C);
        assert_eq!(parse_lsn("2/0").unwrap(), 2 << 32);
        assert_eq!(parse_lsn("ff/ffffffff").unwrap(), 0xFF_FFFF_FFFF);
    }

    #[test]
    fn test_parse_lsn_rejects_malformed() {
        for bad in ["", "16B3748", "0/", "/1", "0/1/2", "g/0", "100000000/0"] {
            assert!(
                matches!(parse_lsn(bad), Err(PgError::InvalidLsn(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_format_lsn() {
        assert_eq!(format_lsn(0), "0/0");
        assert_eq!(format_lsn(0x1A2B3C), "0/1A2B3C");
        assert_eq!(format_lsn((3 << 32) | 0x10), "3/10");
        assert_eq!(parse_lsn(&format_lsn(u64::MAX)).unwrap(), u64::MAX);
    }
}
