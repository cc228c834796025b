//! Whole-chip operations over a synchronized session.
//!
//! Writes follow a fixed order so the part never boots a partial image:
//!
//! 1. sector 0 is programmed with an invalid vector table checksum
//! 2. every other touched sector is programmed, highest index first
//! 3. sector 0 is programmed again with the valid checksum
//!
//! Each sector is prepared, erased, blank checked, then written in copy
//! sized chunks staged through the RAM buffer. Staged chunks are checked by
//! CRC before the copy and compared against flash after it.

use core::fmt::Debug;
use core::ops::RangeInclusive;

use embedded_hal::blocking::delay::DelayMs;

use crate::crc32;
use crate::error::AbortReason;
use crate::geometry::ChipGeometry;
use crate::image::{is_bootable, FlashImage};
use crate::protocol::{GoMode, ReturnCode};
use crate::retry::{bounded, Attempt};
use crate::session::{BlankCheck, BootVersion, Comparison, Session, State, Uid};
use crate::{Error, SerialPort};

/// Identity of a connected part
#[derive(Clone, PartialEq, Debug)]
pub struct ChipInfo {
    pub part_id: u32,
    pub boot_version: BootVersion,
    pub uid: Uid,
}

/// Progress of an image write
#[derive(Clone, PartialEq, Debug)]
pub enum WriteState {
    Planned,
    ScratchChecksumWritten,
    OthersWriting(usize),
    OthersWritten,
    FinalChecksumWritten,
    Aborted {
        sector: Option<usize>,
        reason: AbortReason,
    },
}

#[derive(Clone, PartialEq, Debug)]
pub enum SectorStatus {
    Written { attempts: u32 },
    Failed(AbortReason),
}

/// Outcome of the last write, kept after failures
#[derive(Clone, PartialEq, Debug)]
pub struct WriteReport {
    pub state: WriteState,
    /// Final status per sector, in write order
    pub sectors: Vec<(usize, SectorStatus)>,
    /// Vector table checksum written to sector 0
    pub checksum: Option<u32>,
}

impl WriteReport {
    fn new() -> Self {
        Self {
            state: WriteState::Planned,
            sectors: vec![],
            checksum: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == WriteState::FinalChecksumWritten
    }

    pub fn status(&self, sector: usize) -> Option<&SectorStatus> {
        self.sectors
            .iter()
            .find(|(s, _)| *s == sector)
            .map(|(_, status)| status)
    }
}

/// Observer for image writes.
///
/// Cancellation is only honoured between sectors.
pub trait Monitor {
    fn state_changed(&mut self, _state: &WriteState) {}

    /// A sector is about to be erased and programmed, sector 0 is seen twice
    fn sector_started(&mut self, _sector: usize) {}

    fn sector_finished(&mut self, _sector: usize, _status: &SectorStatus) {}

    fn cancel_requested(&mut self) -> bool {
        false
    }
}

impl Monitor for () {}

/// Read part id, boot code version and serial number
pub fn query_chip<P, D, E>(session: &mut Session<P, D, E>) -> Result<ChipInfo, Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    let part_id = session.read_part_id()?;
    let boot_version = session.read_boot_version()?;
    let uid = session.read_uid()?;

    debug!(
        "Part 0x{:08x} boot {} uid {}",
        part_id, boot_version, uid
    );

    Ok(ChipInfo {
        part_id,
        boot_version,
        uid,
    })
}

pub struct Programmer<'a, P, D, E> {
    session: &'a mut Session<P, D, E>,
    geometry: &'a ChipGeometry,
    staging_crc: bool,
    report: WriteReport,
}

impl<'a, P, D, E> Programmer<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(session: &'a mut Session<P, D, E>, geometry: &'a ChipGeometry) -> Self {
        let crystal = session.crystal_khz();
        if !geometry.crystal_khz.contains(&crystal) {
            warn!(
                "Crystal {} kHz outside {:?} kHz supported by {}",
                crystal, geometry.crystal_khz, geometry.name
            );
        }

        let staging_crc = !session.options().no_crc;

        Self {
            session,
            geometry,
            staging_crc,
            report: WriteReport::new(),
        }
    }

    pub fn session(&mut self) -> &mut Session<P, D, E> {
        &mut *self.session
    }

    pub fn geometry(&self) -> &ChipGeometry {
        self.geometry
    }

    /// Report of the last write
    pub fn report(&self) -> &WriteReport {
        &self.report
    }

    pub fn state(&self) -> &WriteState {
        &self.report.state
    }

    pub fn query_chip(&mut self) -> Result<ChipInfo, Error<E>> {
        query_chip(&mut *self.session)
    }

    pub fn ensure_unlocked(&mut self) -> Result<(), Error<E>> {
        if self.session.state() != State::Unlocked {
            self.session.unlock()?;
        }
        Ok(())
    }

    /// Erase every sector, highest first, blank checking each
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        self.ensure_unlocked()?;

        let count = self.geometry.sector_count();
        info!("Erasing {} sectors", count);

        for sector in (0..count).rev() {
            debug!("Erasing sector {}", sector);

            self.session
                .prepare_sectors(sector, sector)
                .map_err(|e| erase_failure(e, sector))?;
            self.session
                .erase_sectors(sector, sector)
                .map_err(|e| erase_failure(e, sector))?;

            if let BlankCheck::NotBlank { offset, value } =
                self.session.blank_check_sectors(sector, sector)?
            {
                error!(
                    "Sector {} not blank after erase (0x{:08x} at +0x{:x})",
                    sector, value, offset
                );
                return Err(Error::VerifyFailed { sector });
            }
        }

        info!("Erase complete");
        Ok(())
    }

    /// Check whether a range of sectors is erased
    pub fn blank_check(&mut self, sectors: RangeInclusive<usize>) -> Result<bool, Error<E>> {
        let (start, end) = (*sectors.start(), *sectors.end());
        if start > end || end >= self.geometry.sector_count() {
            return Err(Error::InvalidArgument(format!(
                "sectors {}..={} not in 0..{}",
                start,
                end,
                self.geometry.sector_count()
            )));
        }

        match self.session.blank_check_sectors(start, end)? {
            BlankCheck::Blank => Ok(true),
            BlankCheck::NotBlank { offset, value } => {
                debug!(
                    "Sectors {}..={} not blank (0x{:08x} at +0x{:x})",
                    start, end, value, offset
                );
                Ok(false)
            }
        }
    }

    /// Read back the contents of one sector
    pub fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>, Error<E>> {
        let (start, size, chunk) = match (
            self.geometry.sector_start(sector),
            self.geometry.sector_size(sector),
            self.geometry.copy_size(sector),
        ) {
            (Some(start), Some(size), Some(chunk)) => (start, size, chunk),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "no sector {} on {}",
                    sector, self.geometry.name
                )))
            }
        };

        let mut data = Vec::with_capacity(size as usize);
        let mut offset = 0;
        while offset < size {
            let n = chunk.min(size - offset);
            data.extend(self.session.read_memory(start + offset, n)?);
            offset += n;
        }

        Ok(data)
    }

    /// Read flash up to the first sector that is blank to the end of the part
    pub fn read_image(&mut self) -> Result<Vec<u8>, Error<E>> {
        let count = self.geometry.sector_count();
        let last = count - 1;

        let mut used = count;
        for sector in 0..count {
            if self.session.blank_check_sectors(sector, last)?.is_blank() {
                used = sector;
                break;
            }
        }

        info!("Reading {} of {} sectors", used, count);

        let mut data = vec![];
        for sector in 0..used {
            data.extend(self.read_sector(sector)?);
        }

        Ok(data)
    }

    /// Compare flash against an image, including the patched checksum
    pub fn verify_image(&mut self, image: &FlashImage) -> Result<(), Error<E>> {
        let mut plan = image.plan(self.geometry)?;
        plan.patch_checksum();

        for (sector, expected) in plan.iter() {
            let actual = self.read_sector(sector)?;

            if let Some(offset) = expected.iter().zip(&actual).position(|(a, b)| a != b) {
                error!("Sector {} differs at +0x{:x}", sector, offset);
                return Err(Error::VerifyFailed { sector });
            }
        }

        info!("Verified {} sectors", plan.len());
        Ok(())
    }

    /// Start the application
    pub fn go(&mut self, address: u32, mode: GoMode) -> Result<(), Error<E>> {
        self.ensure_unlocked()?;
        self.session.go(address, mode)
    }

    pub fn write_image(&mut self, image: &FlashImage) -> Result<WriteReport, Error<E>> {
        self.write_image_with(image, &mut ())
    }

    /// Program an image, reporting progress to a monitor
    pub fn write_image_with<M: Monitor + ?Sized>(
        &mut self,
        image: &FlashImage,
        monitor: &mut M,
    ) -> Result<WriteReport, Error<E>> {
        self.report = WriteReport::new();

        let mut plan = image.plan(self.geometry)?;
        let checksum = plan.patch_checksum();
        let scratch = plan.scratch_sector_zero();

        let (scratch, checksum) = match (scratch, checksum) {
            (Some(s), Some(c)) => (s, c),
            _ => {
                return Err(Error::InvalidArgument(
                    "image plan has no sector 0".to_string(),
                ))
            }
        };

        info!(
            "Writing {} bytes over {} sectors to {}",
            image.len(),
            plan.len(),
            self.geometry.name
        );
        monitor.state_changed(&self.report.state);

        let mut current = Some(0);
        let r = self.sequence(&plan, &scratch, &mut current, monitor);

        match r {
            Ok(()) => {
                self.report.checksum = Some(checksum);
                info!("Write complete, checksum 0x{:08x}", checksum);
                Ok(self.report.clone())
            }
            Err(e) => {
                let reason = e.abort_reason();
                error!("Write aborted at sector {:?}: {}", current, e);

                if let Some(sector) = current {
                    if reason != AbortReason::Cancelled {
                        self.record(sector, SectorStatus::Failed(reason), monitor);
                    }
                }
                self.advance(
                    WriteState::Aborted {
                        sector: current,
                        reason,
                    },
                    monitor,
                );

                Err(e)
            }
        }
    }

    fn sequence<M: Monitor + ?Sized>(
        &mut self,
        plan: &crate::image::SectorPlan,
        scratch: &[u8],
        current: &mut Option<usize>,
        monitor: &mut M,
    ) -> Result<(), Error<E>> {
        self.ensure_unlocked()?;

        check_cancel(monitor)?;
        debug!("Writing sector 0 with invalid checksum");
        monitor.sector_started(0);
        self.write_sector(0, scratch)?;
        self.advance(WriteState::ScratchChecksumWritten, monitor);

        for sector in plan.indices().rev().filter(|s| *s != 0) {
            *current = None;
            check_cancel(monitor)?;

            *current = Some(sector);
            self.advance(WriteState::OthersWriting(sector), monitor);

            let data = plan.get(sector).unwrap_or_default();
            monitor.sector_started(sector);
            let attempts = self.write_sector(sector, data)?;
            self.record(sector, SectorStatus::Written { attempts }, monitor);
        }
        self.advance(WriteState::OthersWritten, monitor);

        *current = None;
        check_cancel(monitor)?;

        *current = Some(0);
        let data = plan.get(0).unwrap_or_default();
        monitor.sector_started(0);
        let attempts = self.write_sector(0, data)?;
        self.record(0, SectorStatus::Written { attempts }, monitor);

        if !is_bootable(data) {
            warn!("Sector 0 vector table does not checksum");
        }

        self.advance(WriteState::FinalChecksumWritten, monitor);

        Ok(())
    }

    fn advance<M: Monitor + ?Sized>(&mut self, state: WriteState, monitor: &mut M) {
        debug!("Write state: {:?}", state);
        self.report.state = state;
        monitor.state_changed(&self.report.state);
    }

    fn record<M: Monitor + ?Sized>(&mut self, sector: usize, status: SectorStatus, monitor: &mut M) {
        monitor.sector_finished(sector, &status);

        match self.report.sectors.iter_mut().find(|(s, _)| *s == sector) {
            Some(entry) => entry.1 = status,
            None => self.report.sectors.push((sector, status)),
        }
    }

    /// Program one sector, retrying when verification fails
    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<u32, Error<E>> {
        let limit = self.session.options().sector_retries;

        bounded(limit, |attempt| {
            if attempt > 1 {
                warn!("Retrying sector {} (attempt {}/{})", sector, attempt, limit);
            }

            match self.program_sector(sector, data) {
                Ok(()) => Ok(Attempt::Done(attempt)),
                Err(e @ Error::VerifyFailed { .. }) => Ok(Attempt::Retry(e)),
                Err(e) => Err(e),
            }
        })
        .map_err(|e| match e {
            Error::VerifyFailed { sector } => Error::SectorWriteFailed { sector },
            e => e,
        })
    }

    fn program_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), Error<E>> {
        let (start, chunk) = match (
            self.geometry.sector_start(sector),
            self.geometry.copy_size(sector),
        ) {
            (Some(start), Some(chunk)) => (start, chunk),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "no sector {} on {}",
                    sector, self.geometry.name
                )))
            }
        };
        let ram = self.geometry.ram_buffer;

        debug!(
            "Sector {} at 0x{:08x}: {} bytes in {} byte blocks",
            sector,
            start,
            data.len(),
            chunk
        );

        self.session
            .prepare_sectors(sector, sector)
            .map_err(|e| erase_failure(e, sector))?;
        self.session
            .erase_sectors(sector, sector)
            .map_err(|e| erase_failure(e, sector))?;

        if let BlankCheck::NotBlank { offset, value } =
            self.session.blank_check_sectors(sector, sector)?
        {
            warn!(
                "Sector {} not blank after erase (0x{:08x} at +0x{:x})",
                sector, value, offset
            );
            return Err(Error::VerifyFailed { sector });
        }

        // The vector table block of sector 0 is committed last
        let mut blocks: Vec<(u32, &[u8])> = data
            .chunks(chunk as usize)
            .enumerate()
            .map(|(n, block)| (start + n as u32 * chunk, block))
            .collect();
        if sector == 0 {
            blocks.reverse();
        }

        for (flash, block) in blocks {
            let count = block.len() as u32;

            self.stage(sector, block)?;

            self.session.prepare_sectors(sector, sector)?;
            self.session.copy_ram_to_flash(flash, ram, count)?;

            if let Comparison::Mismatch { offset } = self.session.compare(flash, ram, count)? {
                warn!(
                    "Sector {} mismatch at 0x{:08x}",
                    sector,
                    flash + offset
                );
                return Err(Error::VerifyFailed { sector });
            }
        }

        Ok(())
    }

    /// Load a block into the RAM buffer, checking the device's CRC of it
    fn stage(&mut self, sector: usize, block: &[u8]) -> Result<(), Error<E>> {
        let ram = self.geometry.ram_buffer;
        let limit = self.session.options().crc_retries;

        bounded(limit, |attempt| {
            self.session.write_to_ram(ram, block)?;

            if !self.staging_crc {
                return Ok(Attempt::Done(()));
            }

            match self.session.read_crc(ram, block.len() as u32) {
                Ok(crc) if crc32::verify(block, crc) => Ok(Attempt::Done(())),
                Ok(crc) => {
                    warn!(
                        "Staging CRC 0x{:08x} mismatch for sector {} (attempt {}/{})",
                        crc, sector, attempt, limit
                    );
                    Ok(Attempt::Retry(Error::ChecksumMismatch { sector }))
                }
                Err(Error::CommandFailure {
                    cause: ReturnCode::InvalidCommand,
                    ..
                }) => {
                    warn!("Bootloader has no CRC command, relying on compare");
                    self.staging_crc = false;
                    Ok(Attempt::Done(()))
                }
                Err(e) => Err(e),
            }
        })
    }
}

fn check_cancel<M: Monitor + ?Sized, E>(monitor: &mut M) -> Result<(), Error<E>> {
    if monitor.cancel_requested() {
        info!("Write cancelled");
        return Err(Error::Aborted {
            reason: AbortReason::Cancelled,
        });
    }
    Ok(())
}

fn erase_failure<E>(e: Error<E>, sector: usize) -> Error<E> {
    match e {
        Error::CommandFailure { cause, .. } if cause != ReturnCode::Locked => {
            Error::EraseFailed { sector, cause }
        }
        e => e,
    }
}
