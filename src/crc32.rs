//! CRC-32 used to check staged data against the bootloader's `ReadCRC`.
//!
//! The bootloader computes the same CRC-32 as zlib (ISO-HDLC: reflected
//! polynomial 0x04C11DB7, initial and final XOR 0xFFFFFFFF).

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a block
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Check a block against a CRC reported by the device
pub fn verify(data: &[u8], expected: u32) -> bool {
    checksum(data) == expected
}
