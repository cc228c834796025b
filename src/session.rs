//! ISP command protocol session.
//!
//! One [`Session`] per serial link. Commands are issued strictly one at a
//! time, each response is consumed before the next command is sent.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{
    parse_u32, Command, GoMode, Opcode, ReturnCode, SYNC_CHAR, SYNC_OK, SYNC_STRING, WORD_SIZE,
};
use crate::retry::{backoff_ms, bounded, Attempt};
use crate::transport::Transport;
use crate::{Error, Options, SerialPort};

/// Connection state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Synchronizing,
    /// Synchronized, flash mutating commands are refused
    Ready,
    Unlocked,
    /// The link failed, reconnect before further use
    Faulted,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct BootVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for BootVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 128-bit device serial number, as four words in the order sent
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Uid(pub [u32; 4]);

impl Uid {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|w| w.to_be_bytes().to_vec()).collect()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<String> = self.0.iter().map(|w| format!("0x{:08x}", w)).collect();
        write!(f, "{}", words.join(" "))
    }
}

/// Result of a blank check
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BlankCheck {
    Blank,
    /// First non-blank word, offset relative to the start of the range
    NotBlank { offset: u32, value: u32 },
}

impl BlankCheck {
    pub fn is_blank(&self) -> bool {
        *self == BlankCheck::Blank
    }
}

/// Result of a memory compare
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Comparison {
    Equal,
    Mismatch { offset: u32 },
}

impl Comparison {
    pub fn is_equal(&self) -> bool {
        *self == Comparison::Equal
    }
}

pub struct Session<P, D, E> {
    state: State,
    options: Options,
    transport: Transport<P, D, E>,
}

impl<P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Create a new session over an open port
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let transport = Transport::new(port, delay, options.poll_delay_ms);
        Self {
            state: State::Disconnected,
            options,
            transport,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn crystal_khz(&self) -> u32 {
        self.options.crystal_khz
    }

    pub fn transport(&mut self) -> &mut Transport<P, D, E> {
        &mut self.transport
    }

    /// Reset into ISP mode, synchronize and configure echo
    pub fn connect(&mut self) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            let r = self.reset();
            self.track(r)?;
        }

        if self.options.no_sync {
            info!("Skipping synchronization");
            self.transport.set_echo(self.options.echo);
            self.state = State::Ready;
            return Ok(());
        }

        self.synchronize()?;

        if !self.options.echo {
            self.set_echo(false)?;
        }

        Ok(())
    }

    /// Mark the session closed, the port stays with the session
    pub fn disconnect(&mut self) {
        debug!("Disconnecting");
        self.state = State::Disconnected;
    }

    fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device into ISP");

        let port = self.transport.port();
        port.set_rts(true).map_err(Error::Serial)?;
        port.set_dtr(true).map_err(Error::Serial)?;

        self.transport.delay_ms(100);

        self.transport.port().set_dtr(false).map_err(Error::Serial)?;
        self.transport.delay_ms(self.options.init_delay_ms);
        self.transport.port().set_rts(false).map_err(Error::Serial)?;

        Ok(())
    }

    /// Run the autobaud handshake and send the crystal frequency
    pub fn synchronize(&mut self) -> Result<(), Error<E>> {
        info!("Synchronizing");
        self.state = State::Synchronizing;

        let r = self.handshake();
        self.state = match r {
            Ok(_) => State::Ready,
            Err(_) => State::Faulted,
        };

        r
    }

    fn handshake(&mut self) -> Result<(), Error<E>> {
        let limit = self.options.sync_retries;
        let timeout = self.options.response_timeout_ms;

        self.transport.drain()?;

        bounded(limit, |attempt| {
            self.transport.send_bytes(&[SYNC_CHAR])?;

            match self.transport.read_line(timeout) {
                // The first characters may be lost while autobaud locks
                Ok(line) if line.contains(&SYNC_STRING[1..]) => Ok(Attempt::Done(())),
                Ok(line) => {
                    debug!("Unexpected sync response '{}'", line);
                    Ok(Attempt::Retry(Error::SyncFailed(attempt)))
                }
                Err(Error::Serial(e)) => Err(Error::Serial(e)),
                Err(_) => {
                    debug!("No sync response (attempt {}/{})", attempt, limit);
                    Ok(Attempt::Retry(Error::SyncFailed(attempt)))
                }
            }
        })?;

        debug!("Autobaud locked");

        self.transport.set_echo(true);
        self.transport.send_line(SYNC_STRING, timeout)?;
        self.expect_ok()?;

        let crystal = self.options.crystal_khz.to_string();
        self.transport.send_line(&crystal, timeout)?;
        self.expect_ok()?;

        info!("Synchronized ({} kHz)", self.options.crystal_khz);

        Ok(())
    }

    fn expect_ok(&mut self) -> Result<(), Error<E>> {
        let line = self.transport.read_line(self.options.response_timeout_ms)?;

        if line.trim() != SYNC_OK {
            error!("Expected {}, received '{}'", SYNC_OK, line);
            return Err(Error::SyncFailed(1));
        }

        Ok(())
    }

    /// Enable flash write, erase and go
    pub fn unlock(&mut self) -> Result<(), Error<E>> {
        self.execute(&Command::Unlock, &[])?;
        self.state = State::Unlocked;

        debug!("Unlocked");
        Ok(())
    }

    /// Change the link baud rate, on both ends
    pub fn set_baud_rate(&mut self, baud: u32, stop_bits: u8) -> Result<(), Error<E>> {
        self.execute(&Command::SetBaudRate { baud, stop_bits }, &[])?;

        let r = self.transport.port().set_baud_rate(baud).map_err(Error::Serial);
        self.track(r)?;

        info!("Baud rate set to {}", baud);
        Ok(())
    }

    pub fn set_echo(&mut self, on: bool) -> Result<(), Error<E>> {
        self.execute(&Command::Echo(on), &[])?;
        self.transport.set_echo(on);

        Ok(())
    }

    /// Download a word aligned block to RAM
    pub fn write_to_ram(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        check_words(address, data.len() as u32)?;

        let count = data.len() as u32;
        self.execute(&Command::WriteToRam { address, count }, &[])?;

        let r = self.transport.send_bytes(data);
        self.track(r)?;

        if self.transport.echo() {
            let timeout = self.options.response_timeout_ms;
            let r = self.transport.read_bytes(data.len(), timeout);
            self.track(r)?;
        }

        Ok(())
    }

    pub fn read_memory(&mut self, address: u32, count: u32) -> Result<Vec<u8>, Error<E>> {
        check_words(address, count)?;

        self.execute(&Command::ReadMemory { address, count }, &[])?;

        let timeout = self.options.response_timeout_ms;
        let r = self.transport.read_bytes(count as usize, timeout);
        self.track(r)
    }

    pub fn prepare_sectors(&mut self, start: usize, end: usize) -> Result<(), Error<E>> {
        self.execute(&Command::PrepareSectors { start, end }, &[])?;
        Ok(())
    }

    pub fn copy_ram_to_flash(&mut self, flash: u32, ram: u32, count: u32) -> Result<(), Error<E>> {
        self.execute(&Command::CopyRamToFlash { flash, ram, count }, &[])?;
        Ok(())
    }

    pub fn erase_sectors(&mut self, start: usize, end: usize) -> Result<(), Error<E>> {
        self.execute(&Command::EraseSectors { start, end }, &[])?;
        Ok(())
    }

    pub fn blank_check_sectors(&mut self, start: usize, end: usize) -> Result<BlankCheck, Error<E>> {
        let code = self.execute(
            &Command::BlankCheckSectors { start, end },
            &[ReturnCode::SectorNotBlank],
        )?;

        if code.is_success() {
            return Ok(BlankCheck::Blank);
        }

        let offset = self.read_number()?;
        let value = self.read_number()?;

        Ok(BlankCheck::NotBlank { offset, value })
    }

    pub fn compare(&mut self, first: u32, second: u32, count: u32) -> Result<Comparison, Error<E>> {
        let code = self.execute(
            &Command::Compare {
                first,
                second,
                count,
            },
            &[ReturnCode::CompareError],
        )?;

        if code.is_success() {
            return Ok(Comparison::Equal);
        }

        let offset = self.read_number()?;
        Ok(Comparison::Mismatch { offset })
    }

    /// Start execution. The device may jump before answering, a missing
    /// response is not an error. The session is closed afterwards.
    pub fn go(&mut self, address: u32, mode: GoMode) -> Result<(), Error<E>> {
        let command = Command::Go { address, mode };
        self.check(command.opcode())?;

        let timeout = self.options.response_timeout_ms;
        let r = self.transport.send_line(&command.line(), timeout);
        self.track(r)?;

        match self.transport.read_line(timeout) {
            Ok(line) => match ReturnCode::parse(&line) {
                Some(ReturnCode::Success) | None => (),
                Some(cause) => {
                    return Err(Error::CommandFailure {
                        command: Opcode::Go,
                        cause,
                    })
                }
            },
            Err(Error::TransportTimeout) => debug!("No response to go"),
            Err(e) => return self.track(Err(e)),
        }

        info!("Running from 0x{:08x}", address);
        self.state = State::Disconnected;

        Ok(())
    }

    pub fn read_part_id(&mut self) -> Result<u32, Error<E>> {
        self.execute(&Command::ReadPartId, &[])?;
        self.read_number()
    }

    /// Boot code version. Parts send the minor number first.
    pub fn read_boot_version(&mut self) -> Result<BootVersion, Error<E>> {
        self.execute(&Command::ReadBootVersion, &[])?;

        let minor = self.read_number()?;
        let major = self.read_number()?;

        Ok(BootVersion { major, minor })
    }

    pub fn read_uid(&mut self) -> Result<Uid, Error<E>> {
        self.execute(&Command::ReadUid, &[])?;

        let mut words = [0u32; 4];
        for w in words.iter_mut() {
            *w = self.read_number()?;
        }

        Ok(Uid(words))
    }

    /// CRC-32 of a block of RAM or flash, computed on the device
    pub fn read_crc(&mut self, address: u32, count: u32) -> Result<u32, Error<E>> {
        self.execute(&Command::ReadCrc { address, count }, &[])?;
        self.read_number()
    }

    /// Refuse commands the current state does not allow, without sending them
    fn check(&self, opcode: Opcode) -> Result<(), Error<E>> {
        match self.state {
            State::Ready | State::Unlocked => (),
            s => return Err(Error::NotReady(s)),
        }

        if opcode.requires_unlock() && self.state != State::Unlocked {
            return Err(Error::NotUnlocked(opcode));
        }

        Ok(())
    }

    /// Send a command and read its return code.
    ///
    /// Busy responses are retried with backoff, codes in `accept` are returned
    /// to the caller, anything else fails.
    fn execute(&mut self, command: &Command, accept: &[ReturnCode]) -> Result<ReturnCode, Error<E>> {
        let opcode = command.opcode();
        self.check(opcode)?;

        let line = command.line();
        let echo_timeout = self.options.response_timeout_ms;
        let timeout = if opcode.is_slow() {
            self.options.flash_timeout_ms
        } else {
            self.options.response_timeout_ms
        };
        let limit = self.options.busy_retries;
        let backoff = self.options.busy_backoff_ms;

        let r = bounded(limit, |attempt| {
            self.transport.send_line(&line, echo_timeout)?;

            let reply = self.transport.read_line(timeout)?;
            let code = ReturnCode::parse(&reply).ok_or_else(|| {
                Error::Framing(format!("expected return code, received '{}'", reply))
            })?;

            debug!("{} -> {}", line, code);

            match code {
                ReturnCode::Busy => {
                    warn!("Bootloader busy ({}, attempt {}/{})", line, attempt, limit);
                    if attempt < limit {
                        self.transport.delay_ms(backoff_ms(backoff, attempt));
                    }
                    Ok(Attempt::Retry(Error::CommandFailure {
                        command: opcode,
                        cause: code,
                    }))
                }
                c if c.is_success() || accept.contains(&c) => Ok(Attempt::Done(c)),
                c => Err(Error::CommandFailure {
                    command: opcode,
                    cause: c,
                }),
            }
        });

        if let Err(Error::CommandFailure {
            cause: ReturnCode::Locked,
            ..
        }) = r
        {
            warn!("Bootloader locked, unlock required");
            self.state = State::Ready;
        }

        self.track(r)
    }

    fn read_number(&mut self) -> Result<u32, Error<E>> {
        let r = self
            .transport
            .read_line(self.options.response_timeout_ms)
            .and_then(|line| {
                parse_u32(&line)
                    .ok_or_else(|| Error::Framing(format!("expected number, received '{}'", line)))
            });

        self.track(r)
    }

    /// Fault the session on link errors
    fn track<T>(&mut self, r: Result<T, Error<E>>) -> Result<T, Error<E>> {
        if let Err(e) = &r {
            if e.is_transport() {
                error!("Link failure: {}", e);
                self.state = State::Faulted;
            }
        }
        r
    }
}

fn check_words<E>(address: u32, count: u32) -> Result<(), Error<E>> {
    if address % WORD_SIZE != 0 || count % WORD_SIZE != 0 || count == 0 {
        return Err(Error::InvalidArgument(format!(
            "{} bytes at 0x{:08x} is not a whole number of aligned words",
            count, address
        )));
    }
    Ok(())
}
