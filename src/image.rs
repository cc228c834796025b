//! Flash images and their per-sector layout.

use std::collections::BTreeMap;

use crate::error::ImageError;
use crate::geometry::{ChipGeometry, CHECKSUM_OFFSET, VECTOR_WORDS};

/// Value of erased flash, used to pad sectors
pub const FILL_BYTE: u8 = 0xFF;

/// Sparse program image keyed by absolute flash address
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlashImage {
    segments: BTreeMap<u32, Vec<u8>>,
}

impl FlashImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image holding one contiguous block
    pub fn from_bytes(address: u32, data: &[u8]) -> Result<Self, ImageError> {
        let mut i = Self::new();
        i.insert(address, data)?;
        Ok(i)
    }

    /// Add data at an address. Segments may touch but not overlap,
    /// touching segments are merged.
    pub fn insert(&mut self, address: u32, data: &[u8]) -> Result<(), ImageError> {
        if data.is_empty() {
            return Ok(());
        }

        let end = address as u64 + data.len() as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(ImageError::OutOfRange {
                address,
                len: data.len(),
            });
        }

        if let Some((start, seg)) = self.segments.range(..=address).next_back() {
            if *start as u64 + seg.len() as u64 > address as u64 {
                return Err(ImageError::Overlap { address });
            }
        }
        if let Some((start, _)) = self.segments.range(address..).next() {
            if (*start as u64) < end {
                return Err(ImageError::Overlap { address: *start });
            }
        }

        // Join with the segment ending here, if any
        let mut start = address;
        let mut bytes = data.to_vec();
        let prev = self
            .segments
            .range(..address)
            .next_back()
            .filter(|(s, seg)| **s as u64 + seg.len() as u64 == address as u64)
            .map(|(s, _)| *s);
        if let Some(s) = prev {
            if let Some(mut seg) = self.segments.remove(&s) {
                seg.extend_from_slice(&bytes);
                bytes = seg;
                start = s;
            }
        }

        // And with the one starting right after
        if end <= u32::MAX as u64 {
            if let Some(next) = self.segments.remove(&(end as u32)) {
                bytes.extend_from_slice(&next);
            }
        }

        self.segments.insert(start, bytes);

        Ok(())
    }

    /// Contiguous segments in address order
    pub fn segments(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.segments.iter().map(|(a, d)| (*a, d.as_slice()))
    }

    /// Number of data bytes, not counting gaps
    pub fn len(&self) -> usize {
        self.segments.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Split the image into whole, padded sectors
    pub fn plan(&self, geometry: &ChipGeometry) -> Result<SectorPlan, ImageError> {
        let mut sectors: BTreeMap<usize, Vec<u8>> = BTreeMap::new();

        for (address, data) in self.segments() {
            let end = address as u64 + data.len() as u64;
            if address < geometry.flash_base || end > geometry.flash_end() as u64 {
                return Err(ImageError::OutOfRange {
                    address,
                    len: data.len(),
                });
            }

            let mut offset = 0;
            while offset < data.len() {
                let a = address + offset as u32;
                let oor = ImageError::OutOfRange {
                    address: a,
                    len: data.len() - offset,
                };

                let index = geometry.sector_of(a).ok_or_else(|| oor.clone())?;
                let start = geometry.sector_start(index).ok_or_else(|| oor.clone())?;
                let size = geometry.sector_size(index).ok_or(oor)? as usize;

                let within = (a - start) as usize;
                let n = (size - within).min(data.len() - offset);

                let sector = sectors
                    .entry(index)
                    .or_insert_with(|| vec![FILL_BYTE; size]);
                sector[within..within + n].copy_from_slice(&data[offset..offset + n]);

                offset += n;
            }
        }

        // Sector 0 is always written, it carries the vector table checksum
        if let Some(size) = geometry.sector_size(0) {
            sectors
                .entry(0)
                .or_insert_with(|| vec![FILL_BYTE; size as usize]);
        }

        Ok(SectorPlan { sectors })
    }
}

/// Padded contents of every sector an image touches
#[derive(Clone, Debug, PartialEq)]
pub struct SectorPlan {
    sectors: BTreeMap<usize, Vec<u8>>,
}

impl SectorPlan {
    pub fn get(&self, sector: usize) -> Option<&[u8]> {
        self.sectors.get(&sector).map(|s| s.as_slice())
    }

    /// Touched sector indices, ascending
    pub fn indices(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.sectors.keys().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.sectors.iter().map(|(i, s)| (*i, s.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Write the vector table checksum into sector 0, returning the value
    pub fn patch_checksum(&mut self) -> Option<u32> {
        let s0 = self.sectors.get_mut(&0)?;
        Some(patch_checksum(s0))
    }

    /// Copy of sector 0 with a checksum the boot ROM rejects
    pub fn scratch_sector_zero(&self) -> Option<Vec<u8>> {
        let mut s0 = self.sectors.get(&0)?.clone();
        invalidate_checksum(&mut s0);
        Some(s0)
    }
}

fn word(data: &[u8], index: usize) -> u32 {
    let o = index * 4;
    u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
}

fn set_word(data: &mut [u8], index: usize, value: u32) {
    let o = index * 4;
    data[o..o + 4].copy_from_slice(&value.to_le_bytes());
}

/// Sum of the first eight vector table words, zero for a bootable image.
///
/// `data` must hold at least 32 bytes.
pub fn vector_table_sum(data: &[u8]) -> u32 {
    (0..VECTOR_WORDS).fold(0u32, |acc, i| acc.wrapping_add(word(data, i)))
}

/// Checksum word that makes the vector table valid
pub fn vector_table_checksum(data: &[u8]) -> u32 {
    let slot = CHECKSUM_OFFSET / 4;
    let partial = (0..VECTOR_WORDS)
        .filter(|i| *i != slot)
        .fold(0u32, |acc, i| acc.wrapping_add(word(data, i)));

    0u32.wrapping_sub(partial)
}

/// Whether the boot ROM would start this image
pub fn is_bootable(data: &[u8]) -> bool {
    vector_table_sum(data) == 0
}

/// Patch the checksum word in place
pub fn patch_checksum(data: &mut [u8]) -> u32 {
    let checksum = vector_table_checksum(data);
    set_word(data, CHECKSUM_OFFSET / 4, checksum);
    checksum
}

/// Overwrite the checksum word with a value that cannot be valid
pub fn invalidate_checksum(data: &mut [u8]) {
    let invalid = match vector_table_checksum(data) {
        0 => 0xFFFF_FFFF,
        _ => 0,
    };
    set_word(data, CHECKSUM_OFFSET / 4, invalid);
}
