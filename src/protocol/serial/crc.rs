
// CRC-32, polynomial 0x04C11DB7 (reflected form 0xEDB88320), initial value
// !0, final complement. This is the checksum used for the optional datagram
// trailer; the standard check value for "123456789" is 0xCBF43926.

const POLYNOMIAL: u32 = 0xEDB88320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut reg = index as u32;
        let mut bit = 0;
        while bit < 8 {
            reg = if reg & 1 != 0 {
                (reg >> 1) ^ POLYNOMIAL
            } else {
                reg >> 1
            };
            bit += 1;
        }
        table[index] = reg;
        index += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table();

/// Computes the CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut reg = !0u32;
    for &byte in data.iter() {
        reg = (reg >> 8) ^ TABLE[((reg ^ byte as u32) & 0xFF) as usize];
    }
    !reg
}

#[cfg(test)]
fn compute_slow(data: &[u8]) -> u32 {
    let mut reg = !0u32;
    for &byte in data.iter() {
        reg ^= byte as u32;
        for _ in 0..8 {
            reg = if reg & 1 != 0 {
                (reg >> 1) ^ POLYNOMIAL
            } else {
                reg >> 1
            };
        }
    }
    !reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_matches_bitwise_reference() {
        let data = (0..=255u8).cycle().take(1021).collect::<Vec<_>>();

        for len in [0, 1, 2, 63, 1021] {
            assert_eq!(crc32(&data[..len]), compute_slow(&data[..len]));
        }
    }
}
