//! CRC-32 integrity check value (IEEE 802.3 polynomial, bit-reflected)

const POLY: u32 = 0xEDB8_8320;

/// Fold one byte into a running CRC, bit at a time
fn crc_update(mut crc: u32, byte: u8) -> u32 {
    crc ^= byte as u32;
    for _ in 0..8 {
        crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
    }
    crc
}

pub fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(!0u32, |crc, &b| crc_update(crc, b))
}

/// ICV trailer: the CRC-32, least significant byte first
pub fn compute_icv(data: &[u8]) -> [u8; 4] {
    crc32(data).to_le_bytes()
}
