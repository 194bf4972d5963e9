//! ULEB128/SLEB128 decoding as used by the linkedit opcode streams and the
//! export trie. Bytes carry 7 bits of payload, the top bit signals
//! continuation; SLEB sign-extends from bit 6 of the final byte.

use crate::diagnostics::LoadError;

/// Decodes a ULEB128 at `*offset`, advancing it past the encoding.
pub fn read_uleb128(bytes: &[u8], offset: &mut usize, site: &'static str) -> Result<u64, LoadError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or(LoadError::malformed(site, "uleb128 ran off end"))?;
        *offset += 1;
        let slice = (byte & 0x7f) as u64;
        if shift >= 64 || (shift == 63 && slice > 1) {
            return Err(LoadError::malformed(site, "uleb128 too big for u64"));
        }
        result |= slice << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Decodes an SLEB128 at `*offset`, advancing it past the encoding.
pub fn read_sleb128(bytes: &[u8], offset: &mut usize, site: &'static str) -> Result<i64, LoadError> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or(LoadError::malformed(site, "sleb128 ran off end"))?;
        *offset += 1;
        if shift >= 64 {
            return Err(LoadError::malformed(site, "sleb128 too big for i64"));
        }
        result |= ((byte & 0x7f) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            // sign extend from bit 6 of the last byte
            if byte & 0x40 != 0 && shift < 64 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(bytes: &[u8]) -> Result<u64, LoadError> {
        let mut off = 0;
        read_uleb128(bytes, &mut off, "test")
    }

    fn sleb(bytes: &[u8]) -> Result<i64, LoadError> {
        let mut off = 0;
        read_sleb128(bytes, &mut off, "test")
    }

    #[test]
    fn uleb_small() {
        assert_eq!(uleb(&[0x00]).unwrap(), 0);
        assert_eq!(uleb(&[0x7f]).unwrap(), 0x7f);
        assert_eq!(uleb(&[0x80, 0x01]).unwrap(), 0x80);
        assert_eq!(uleb(&[0xe5, 0x8e, 0x26]).unwrap(), 624485);
    }

    #[test]
    fn uleb_max() {
        assert_eq!(
            uleb(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn uleb_overflow() {
        assert!(uleb(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02]).is_err());
    }

    #[test]
    fn uleb_truncated() {
        assert!(uleb(&[0x80]).is_err());
        assert!(uleb(&[]).is_err());
    }

    #[test]
    fn sleb_signs() {
        assert_eq!(sleb(&[0x00]).unwrap(), 0);
        assert_eq!(sleb(&[0x3f]).unwrap(), 63);
        assert_eq!(sleb(&[0x40]).unwrap(), -64);
        assert_eq!(sleb(&[0x7f]).unwrap(), -1);
        assert_eq!(sleb(&[0x80, 0x7f]).unwrap(), -128);
    }

    #[test]
    fn offset_advances() {
        let bytes = [0x80, 0x01, 0x05];
        let mut off = 0;
        assert_eq!(read_uleb128(&bytes, &mut off, "test").unwrap(), 0x80);
        assert_eq!(off, 2);
        assert_eq!(read_uleb128(&bytes, &mut off, "test").unwrap(), 5);
        assert_eq!(off, 3);
    }
}
