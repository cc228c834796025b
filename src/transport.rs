//! Line and payload framing over a non-blocking serial port.
//!
//! Reads are polled with the configured delay between attempts, every read is
//! bounded by a timeout in milliseconds.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::NEWLINE;
use crate::Error;

/// Longest line the bootloader sends, anything longer is noise
pub const MAX_LINE: usize = 256;

/// Consecutive empty lines tolerated before a response
pub const MAX_BLANK_LINES: usize = 32;

pub struct Transport<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    echo: bool,
    _err: PhantomData<E>,
}

impl<P, D, E> Transport<P, D, E>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new transport, the bootloader starts with echo enabled
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
            echo: true,
            _err: PhantomData,
        }
    }

    /// Whether the device currently echoes received lines
    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn set_echo(&mut self, on: bool) {
        self.echo = on;
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Write raw bytes and flush
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b)).map_err(Error::Serial)?;
        }
        block!(self.port.flush()).map_err(Error::Serial)?;

        Ok(())
    }

    /// Write a line and, with echo enabled, consume the device's copy of it
    pub fn send_line(&mut self, text: &str, timeout_ms: u32) -> Result<(), Error<E>> {
        trace!("> {}", text);

        self.send_bytes(text.as_bytes())?;
        self.send_bytes(NEWLINE.as_bytes())?;

        if self.echo {
            let echoed = self.read_line(timeout_ms)?;
            if echoed.trim() != text.trim() {
                return Err(Error::Framing(format!(
                    "expected echo of '{}', received '{}'",
                    text, echoed
                )));
            }
        }

        Ok(())
    }

    /// Read one line, without terminator. Empty lines are skipped.
    pub fn read_line(&mut self, timeout_ms: u32) -> Result<String, Error<E>> {
        let mut line = Vec::new();
        let mut waited = 0;
        let mut blank = 0;

        loop {
            let b = match self.poll(&mut waited, timeout_ms)? {
                Some(b) => b,
                None if line.is_empty() => return Err(Error::TransportTimeout),
                None => {
                    return Err(Error::Framing(format!(
                        "unterminated line '{}'",
                        String::from_utf8_lossy(&line)
                    )))
                }
            };

            match b {
                b'\n' => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.is_empty() {
                        blank += 1;
                        if blank > MAX_BLANK_LINES {
                            return Err(Error::Framing(format!(
                                "more than {} empty lines",
                                MAX_BLANK_LINES
                            )));
                        }
                        continue;
                    }

                    let text = String::from_utf8(line)
                        .map_err(|e| Error::Framing(format!("invalid line: {}", e)))?;
                    trace!("< {}", text);

                    return Ok(text);
                }
                _ if line.len() >= MAX_LINE => {
                    return Err(Error::Framing(format!("line exceeds {} bytes", MAX_LINE)))
                }
                _ => line.push(b),
            }
        }
    }

    /// Read exactly `n` bytes, the timeout applies between bytes
    pub fn read_bytes(&mut self, n: usize, timeout_ms: u32) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::with_capacity(n);

        while data.len() < n {
            let mut waited = 0;
            match self.poll(&mut waited, timeout_ms)? {
                Some(b) => data.push(b),
                None => {
                    debug!("Read timeout after {}/{} bytes", data.len(), n);
                    return Err(Error::TransportTimeout);
                }
            }
        }

        Ok(data)
    }

    /// Discard anything pending in the receive buffer
    pub fn drain(&mut self) -> Result<usize, Error<E>> {
        let mut n = 0;

        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }
        }

        if n > 0 {
            debug!("Discarded {} pending bytes", n);
        }

        Ok(n)
    }

    fn poll(&mut self, waited: &mut u32, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
                Ok(v) => return Ok(Some(v)),
            };

            if *waited >= timeout_ms {
                return Ok(None);
            }

            self.delay.delay_ms(self.poll_delay_ms);
            *waited += self.poll_delay_ms;
        }
    }
}
