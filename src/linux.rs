use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, SerialPort, Session};

fn kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        ErrorKind::NoDevice => IoErrorKind::NotFound,
        ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        ErrorKind::Io(k) => k,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(kind)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(kind)?;
        settings
            .set_baud_rate(BaudRate::from_speed(baud as usize))
            .map_err(kind)?;
        self.0.write_settings(&settings).map_err(kind)
    }
}

impl Session<Serial, Delay, IoErrorKind> {
    /// Open a linux serial port for an ISP session (8N1, no flow control)
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads return WouldBlock after one poll period
        port.0
            .set_timeout(Duration::from_millis(options.poll_delay_ms.max(1) as u64))?;

        debug!("Opened serial port at {} baud", baud);

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
