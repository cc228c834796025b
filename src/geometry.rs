//! Chip geometry definitions.
//!
//! A [`Registry`] is built once, from code or from an lpctools style
//! `parts.def` table, and is immutable afterwards.

use core::convert::TryFrom;
use core::ops::RangeInclusive;

use crate::error::GeometryError;
use crate::protocol::{COPY_SIZES, WORD_SIZE};

/// Crystal range accepted when a definition does not give one (kHz)
pub const DEFAULT_CRYSTAL_KHZ: RangeInclusive<u32> = 10_000..=25_000;

/// Offset of the vector table checksum word in sector 0
pub const CHECKSUM_OFFSET: usize = 0x1C;

/// Number of vector table words covered by the checksum
pub const VECTOR_WORDS: usize = 8;

/// Parts table built into the crate
pub const BUILTIN_PARTS: &str = include_str!("../data/lpc_parts.def");

/// Flash and RAM layout of a single part
#[derive(Clone, Debug, PartialEq)]
pub struct ChipGeometry {
    pub name: String,
    pub part_id: u32,
    pub flash_base: u32,
    /// Sector sizes in bytes, in address order
    pub sector_sizes: Vec<u32>,
    pub flash_size: u32,
    pub ram_base: u32,
    pub ram_size: u32,
    /// Start of the RAM staging buffer used for writes
    pub ram_buffer: u32,
    /// Largest block moved by one WriteToRAM / CopyRAMToFlash pair
    pub max_copy_size: u32,
    pub crystal_khz: RangeInclusive<u32>,
}

impl ChipGeometry {
    /// Build a geometry with uniform sectors
    pub fn uniform(
        name: &str,
        part_id: u32,
        sector_size: u32,
        sector_count: usize,
        ram_base: u32,
        ram_size: u32,
        ram_buffer: u32,
        max_copy_size: u32,
    ) -> Result<Self, GeometryError> {
        let flash_size = u32::try_from(sector_count)
            .ok()
            .and_then(|n| sector_size.checked_mul(n))
            .ok_or_else(|| GeometryError::Invalid {
                name: name.to_string(),
                reason: format!("{} sectors of {} bytes overflow", sector_count, sector_size),
            })?;

        let g = Self {
            name: name.to_string(),
            part_id,
            flash_base: 0,
            sector_sizes: vec![sector_size; sector_count],
            flash_size,
            ram_base,
            ram_size,
            ram_buffer,
            max_copy_size,
            crystal_khz: DEFAULT_CRYSTAL_KHZ,
        };

        g.validate()?;

        Ok(g)
    }

    pub fn sector_count(&self) -> usize {
        self.sector_sizes.len()
    }

    pub fn sector_size(&self, sector: usize) -> Option<u32> {
        self.sector_sizes.get(sector).cloned()
    }

    /// Flash address of the start of a sector
    pub fn sector_start(&self, sector: usize) -> Option<u32> {
        if sector >= self.sector_count() {
            return None;
        }
        let offset: u64 = self.sector_sizes[..sector].iter().map(|s| *s as u64).sum();
        u32::try_from(self.flash_base as u64 + offset).ok()
    }

    /// Sector containing a flash address
    pub fn sector_of(&self, address: u32) -> Option<usize> {
        let address = address as u64;
        let mut start = self.flash_base as u64;

        for (i, size) in self.sector_sizes.iter().enumerate() {
            if address >= start && address - start < *size as u64 {
                return Some(i);
            }
            start += *size as u64;
        }

        None
    }

    /// First address past the end of flash, saturating at the top of the
    /// address space for geometries that failed validation
    pub fn flash_end(&self) -> u32 {
        self.flash_base.saturating_add(self.flash_size)
    }

    /// Bytes per CopyRAMToFlash for a sector: the largest size the bootloader
    /// accepts that fits in the staging buffer and divides the sector
    pub fn copy_size(&self, sector: usize) -> Option<u32> {
        let size = self.sector_size(sector)?;

        COPY_SIZES
            .iter()
            .cloned()
            .find(|c| *c <= self.max_copy_size && size % c == 0)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        let invalid = |reason: String| GeometryError::Invalid {
            name: self.name.clone(),
            reason,
        };

        if self.sector_sizes.is_empty() {
            return Err(invalid("no sectors".into()));
        }

        let total: u64 = self.sector_sizes.iter().map(|s| *s as u64).sum();
        if total != self.flash_size as u64 {
            return Err(invalid(format!(
                "sector sizes sum to {} bytes, flash is {} bytes",
                total, self.flash_size
            )));
        }

        if self.flash_base.checked_add(self.flash_size).is_none() {
            return Err(invalid(format!(
                "flash 0x{:08x}+{} overflows the address space",
                self.flash_base, self.flash_size
            )));
        }

        if self.ram_base.checked_add(self.ram_size).is_none() {
            return Err(invalid(format!(
                "RAM 0x{:08x}+{} overflows the address space",
                self.ram_base, self.ram_size
            )));
        }

        if (self.sector_sizes[0] as usize) < CHECKSUM_OFFSET + 4 {
            return Err(invalid("sector 0 cannot hold the vector table".into()));
        }

        if self.ram_buffer % WORD_SIZE != 0 {
            return Err(invalid(format!(
                "staging buffer 0x{:08x} is not word aligned",
                self.ram_buffer
            )));
        }

        let ram_end = self.ram_base as u64 + self.ram_size as u64;
        let buffer_end = self.ram_buffer as u64 + self.max_copy_size as u64;
        if self.ram_buffer < self.ram_base || buffer_end > ram_end {
            return Err(invalid(format!(
                "staging buffer 0x{:08x}+{} lies outside RAM",
                self.ram_buffer, self.max_copy_size
            )));
        }

        for i in 0..self.sector_count() {
            if self.copy_size(i).is_none() {
                return Err(invalid(format!(
                    "no valid copy size for sector {} with a {} byte buffer",
                    i, self.max_copy_size
                )));
            }
        }

        if self.crystal_khz.is_empty() {
            return Err(invalid("empty crystal range".into()));
        }

        Ok(())
    }
}

/// Immutable set of known parts
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Registry {
    parts: Vec<ChipGeometry>,
}

impl Registry {
    /// Build a registry, validating every entry
    pub fn new(parts: Vec<ChipGeometry>) -> Result<Self, GeometryError> {
        for p in &parts {
            p.validate()?;
        }
        Ok(Self { parts })
    }

    pub fn lookup(&self, part_id: u32) -> Result<&ChipGeometry, GeometryError> {
        self.parts
            .iter()
            .find(|p| p.part_id == part_id)
            .ok_or(GeometryError::UnknownPart(part_id))
    }

    pub fn lookup_name(&self, name: &str) -> Result<&ChipGeometry, GeometryError> {
        self.parts
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| GeometryError::UnknownName(name.to_string()))
    }

    pub fn parts(&self) -> &[ChipGeometry] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Registry of the parts table built into the crate
    pub fn builtin() -> Result<Self, GeometryError> {
        Self::parse(BUILTIN_PARTS)
    }

    /// Parse an lpctools `parts.def` table.
    ///
    /// Columns: part id, name, flash start, flash size, sector count, reset
    /// vector offset, RAM start, RAM size, RAM buffer offset, RAM buffer size,
    /// UU encode. Parts using UU encoded transfers are skipped.
    pub fn parse(text: &str) -> Result<Self, GeometryError> {
        let mut parts = Vec::new();

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parse_err = |reason: String| GeometryError::Parse {
                line: n + 1,
                reason,
            };

            let cols: Vec<&str> = line.split(',').map(|c| c.trim()).collect();
            if cols.len() < 11 {
                return Err(parse_err(format!("expected 11 columns, found {}", cols.len())));
            }

            let num = |i: usize| {
                parse_int(cols[i]).ok_or_else(|| parse_err(format!("invalid number '{}'", cols[i])))
            };

            let part_id = num(0)?;
            let name = cols[1];
            let flash_base = num(2)?;
            let flash_size = num(3)?;
            let sector_count = num(4)?;
            let ram_base = num(6)?;
            let ram_size = num(7)?;
            let buffer_offset = num(8)?;
            let buffer_size = num(9)?;
            let uu_encode = num(10)? != 0;

            if uu_encode {
                debug!("Skipping {}: UU encoded transfers are not supported", name);
                continue;
            }

            let sector_sizes = sector_layout(flash_size, sector_count).ok_or_else(|| {
                parse_err(format!(
                    "cannot split {} bytes into {} sectors",
                    flash_size, sector_count
                ))
            })?;

            let ram_buffer = ram_base.checked_add(buffer_offset).ok_or_else(|| {
                parse_err(format!(
                    "buffer offset 0x{:x} overflows RAM start 0x{:08x}",
                    buffer_offset, ram_base
                ))
            })?;

            let g = ChipGeometry {
                name: name.to_string(),
                part_id,
                flash_base,
                sector_sizes,
                flash_size,
                ram_base,
                ram_size,
                ram_buffer,
                max_copy_size: buffer_size,
                crystal_khz: DEFAULT_CRYSTAL_KHZ,
            };
            g.validate()?;

            parts.push(g);
        }

        Ok(Self { parts })
    }
}

/// Sector sizes for a flash of `size` bytes split into `count` sectors.
///
/// Uniform when possible, otherwise the LPC17xx / LPC23xx layout of sixteen
/// 4 KiB sectors followed by 32 KiB sectors.
fn sector_layout(size: u32, count: u32) -> Option<Vec<u32>> {
    if count == 0 {
        return None;
    }

    if size % count == 0 {
        return Some(vec![size / count; count as usize]);
    }

    let small = count.min(16);
    let large = count - small;
    if small as u64 * 4096 + large as u64 * 32768 == size as u64 {
        let mut sizes = vec![4096; small as usize];
        sizes.extend(vec![32768; large as usize]);
        return Some(sizes);
    }

    None
}

fn parse_int(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTS: &str = "
# part id, name, flash start, flash size, sectors, reset vector, ram start, ram size, buffer offset, buffer size, uu
0x00008100, LPC810M021FN8,   0x00000000, 0x1000,  4, 0x0, 0x10000000, 0x0400, 0x300, 0x100, 0
0x00008451, LPC845M301JBD64, 0x00000000, 0x10000, 64, 0x0, 0x10000000, 0x4000, 0x800, 0x400, 0
0x26113F37, LPC1769,         0x00000000, 0x80000, 30, 0x0, 0x10000000, 0x8000, 0x200, 0x1000, 1
";

    #[test]
    fn parses_parts_file() {
        let r = Registry::parse(PARTS).unwrap();
        assert_eq!(r.len(), 2);

        let g = r.lookup(0x8100).unwrap();
        assert_eq!(g.name, "LPC810M021FN8");
        assert_eq!(g.sector_sizes, vec![1024; 4]);
        assert_eq!(g.ram_buffer, 0x1000_0300);
        assert_eq!(g.max_copy_size, 0x100);
        assert_eq!(g.copy_size(0), Some(256));

        let g = r.lookup_name("lpc845m301jbd64").unwrap();
        assert_eq!(g.copy_size(10), Some(1024));
    }

    #[test]
    fn builtin_parts() {
        let r = Registry::builtin().unwrap();
        assert!(!r.is_empty());

        let g = r.lookup(0x8454).unwrap();
        assert_eq!(g.sector_count(), 64);
        assert_eq!(g.flash_end(), 0x10000);

        assert!(r.lookup(0x26113F37).is_err());
    }

    #[test]
    fn registry_validates_entries() {
        let good = ChipGeometry::uniform("a", 1, 1024, 4, 0x1000_0000, 0x1000, 0x1000_0800, 1024)
            .unwrap();
        let mut bad = good.clone();
        bad.part_id = 2;
        bad.flash_size += 1;

        let r = Registry::new(vec![good.clone()]).unwrap();
        assert_eq!(r.lookup(1), Ok(&good));
        assert_eq!(r.lookup(2), Err(GeometryError::UnknownPart(2)));

        assert!(Registry::new(vec![good, bad]).is_err());
    }

    #[test]
    fn registry_is_shareable() {
        fn shared<T: Send + Sync>(_: &T) {}
        shared(&Registry::builtin().unwrap());
    }

    #[test]
    fn uu_encoded_parts_are_unknown() {
        let r = Registry::parse(PARTS).unwrap();
        assert_eq!(
            r.lookup(0x26113F37),
            Err(GeometryError::UnknownPart(0x26113F37))
        );
    }

    #[test]
    fn rejects_short_lines() {
        let e = Registry::parse("0x8100, LPC810, 0x0, 0x1000").unwrap_err();
        assert!(matches!(e, GeometryError::Parse { line: 1, .. }));
    }

    #[test]
    fn non_uniform_layout() {
        let sizes = sector_layout(0x80000, 30).unwrap();
        assert_eq!(sizes.len(), 30);
        assert_eq!(sizes[15], 4096);
        assert_eq!(sizes[16], 32768);
        assert_eq!(sizes.iter().sum::<u32>(), 0x80000);

        assert_eq!(sector_layout(1000, 3), None);
    }

    #[test]
    fn sector_sizes_sum_to_flash_size() {
        let mut g = ChipGeometry::uniform("test", 1, 4096, 2, 0x1000_0000, 0x2000, 0x1000_0000, 4096)
            .unwrap();
        assert_eq!(g.sector_sizes.iter().sum::<u32>(), g.flash_size);

        g.sector_sizes.push(4096);
        assert!(matches!(g.validate(), Err(GeometryError::Invalid { .. })));
    }

    #[test]
    fn non_uniform_addressing() {
        let g = ChipGeometry {
            name: "mixed".into(),
            part_id: 2,
            flash_base: 0,
            sector_sizes: vec![4096, 4096, 32768],
            flash_size: 40960,
            ram_base: 0x1000_0000,
            ram_size: 0x8000,
            ram_buffer: 0x1000_0200,
            max_copy_size: 4096,
            crystal_khz: DEFAULT_CRYSTAL_KHZ,
        };
        g.validate().unwrap();

        assert_eq!(g.sector_start(2), Some(8192));
        assert_eq!(g.sector_of(8191), Some(1));
        assert_eq!(g.sector_of(8192), Some(2));
        assert_eq!(g.sector_of(40960), None);
        assert_eq!(g.sector_start(3), None);
    }

    #[test]
    fn overflowing_lines_are_rejected() {
        let e = Registry::parse(
            "0x1, X, 0x0, 0x1000, 4, 0x0, 0xFFFFFF00, 0x100, 0x200, 0x100, 0",
        )
        .unwrap_err();
        assert!(matches!(e, GeometryError::Parse { line: 1, .. }));

        let e = Registry::parse(
            "0x1, X, 0xFFFFF000, 0x2000, 2, 0x0, 0x10000000, 0x400, 0x0, 0x100, 0",
        )
        .unwrap_err();
        assert!(matches!(e, GeometryError::Invalid { .. }));

        let e = Registry::parse(
            "0x1, X, 0x0, 0x1000, 4, 0x0, 0xFFFFFF00, 0x1000, 0x0, 0x100, 0",
        )
        .unwrap_err();
        assert!(matches!(e, GeometryError::Invalid { .. }));

        assert_eq!(sector_layout(0x8_0000, u32::MAX), None);
    }

    #[test]
    fn uniform_size_overflow() {
        let e = ChipGeometry::uniform("big", 1, 0x1000_0000, 32, 0x1000_0000, 0x400, 0x1000_0000, 0x100);
        assert!(matches!(e, Err(GeometryError::Invalid { .. })));
    }

    #[test]
    fn addressing_near_top_of_memory() {
        let mut g = ChipGeometry::uniform("top", 1, 0x1000, 2, 0x1000_0000, 0x400, 0x1000_0000, 0x100)
            .unwrap();
        g.flash_base = 0xFFFF_F000;

        assert!(g.validate().is_err());
        assert_eq!(g.flash_end(), u32::MAX);
        assert_eq!(g.sector_start(1), None);
        assert_eq!(g.sector_of(0xFFFF_F800), Some(0));
    }

    #[test]
    fn staging_buffer_must_fit_ram() {
        let e = ChipGeometry::uniform("test", 1, 1024, 4, 0x1000_0000, 0x400, 0x1000_0300, 0x400);
        assert!(matches!(e, Err(GeometryError::Invalid { .. })));
    }
}
