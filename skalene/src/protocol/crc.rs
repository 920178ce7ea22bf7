//! Checksums used on the wire.
//!
//! - CRC-32 (reflected, polynomial `0xEDB88320`) covers whole firmware images
//!   and matches the zip/gzip CRC bit for bit.
//! - CRC-16/CCITT (polynomial `0x1021`, init `0xFFFF`, MSB-first, no final
//!   XOR) covers text protocol messages.
//!
//! Both lookup tables are computed at compile time.

/// Reflected CRC-32 polynomial.
pub const CRC32_POLY: u32 = 0xEDB88320;

/// CRC-16/CCITT polynomial.
pub const CRC16_CCITT_POLY: u16 = 0x1021;

const CRC32_TABLE: [u32; 256] = crc32_table();
const CRC16_CCITT_TABLE: [u16; 256] = crc16_ccitt_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = i as u32;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 1 == 1 {
                (value >> 1) ^ CRC32_POLY
            } else {
                value >> 1
            };
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

#[allow(clippy::cast_possible_truncation)]
const fn crc16_ccitt_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 0x8000 == 0 {
                value << 1
            } else {
                (value << 1) ^ CRC16_CCITT_POLY
            };
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

/// CRC-32 of `data`, as used by zip and gzip.
pub fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8)
    })
}

/// CRC-16/CCITT of `data` (init `0xFFFF`, no final XOR).
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF_u16, |crc, &byte| {
        CRC16_CCITT_TABLE[usize::from((crc >> 8) ^ u16::from(byte)) & 0xFF] ^ (crc << 8)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_table_entries() {
        assert_eq!(CRC32_TABLE[0], 0);
        assert_eq!(CRC32_TABLE[1], 0x77073096);
        assert_eq!(CRC32_TABLE[255], 0x2D02EF8D);
    }

    #[test]
    fn test_crc16_ccitt_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_ccitt_empty_is_init() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_ccitt_table_entries() {
        assert_eq!(CRC16_CCITT_TABLE[1], 0x1021);
        assert_eq!(CRC16_CCITT_TABLE[8], 0x8108);
        assert_eq!(CRC16_CCITT_TABLE[255], 0x1EF0);
    }

    #[test]
    fn test_crc16_ccitt_depends_on_delimiter() {
        assert_ne!(crc16_ccitt(b"3"), crc16_ccitt(b"3:"));
    }

    #[test]
    fn test_checksums_are_deterministic() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(crc32(&data), crc32(&data));
        assert_eq!(crc16_ccitt(&data), crc16_ccitt(&data));
    }
}
