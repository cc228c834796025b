//! Simulated LPC ISP bootloader behind an `embedded_hal` serial port.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use nxp_uart_isp::{crc32, ChipGeometry, Options, SerialPort, Session};

#[derive(Copy, Clone, PartialEq, Debug)]
enum Link {
    Autobaud,
    AwaitSyncEcho,
    AwaitCrystal,
    Command,
}

pub struct Device {
    pub geometry: ChipGeometry,
    pub flash: Vec<u8>,
    pub ram: Vec<u8>,

    pub part_id: u32,
    pub boot_version: (u32, u32),
    pub uid: [u32; 4],

    /// Command lines received after synchronization
    pub log: Vec<String>,
    /// Flash address and data of every copy to flash
    pub copies: Vec<(u32, Vec<u8>)>,
    pub baud: u32,
    pub echo: bool,
    pub unlocked: bool,

    /// Ignore this many sync characters
    pub sync_silence: u32,
    /// Busy replies still to send, by opcode
    pub busy: HashMap<char, u32>,
    /// Stop responding once this many commands have been answered
    pub drop_after: Option<usize>,
    /// Flip a byte in this many upcoming RAM writes
    pub corrupt_staging: u32,
    /// Mis-program this many upcoming copies
    pub failing_copies: u32,
    pub supports_crc: bool,
    /// Link is down, all input is ignored
    pub dead: bool,

    link: Link,
    prepared: Option<(usize, usize)>,
    line: Vec<u8>,
    pending: Option<(u32, usize)>,
    tx: VecDeque<u8>,
}

impl Device {
    pub fn new(geometry: ChipGeometry) -> Self {
        let flash = vec![0xFF; geometry.flash_size as usize];
        let ram = vec![0; geometry.ram_size as usize];

        Self {
            part_id: geometry.part_id,
            geometry,
            flash,
            ram,
            boot_version: (1, 13),
            uid: [0x0102_0304, 0x0506_0708, 0x090a_0b0c, 0x0d0e_0f10],
            log: vec![],
            copies: vec![],
            baud: 0,
            echo: true,
            unlocked: false,
            sync_silence: 0,
            busy: HashMap::new(),
            drop_after: None,
            corrupt_staging: 0,
            failing_copies: 0,
            supports_crc: true,
            dead: false,
            link: Link::Autobaud,
            prepared: None,
            line: vec![],
            pending: None,
            tx: VecDeque::new(),
        }
    }

    /// Command lines starting with an opcode
    pub fn commands(&self, opcode: char) -> Vec<&String> {
        self.log
            .iter()
            .filter(|l| l.starts_with(opcode))
            .collect()
    }

    /// Sector indices of every copy to flash, in order
    pub fn copied_sectors(&self) -> Vec<usize> {
        self.copies
            .iter()
            .filter_map(|(a, _)| self.geometry.sector_of(*a))
            .collect()
    }

    pub fn sector(&self, index: usize) -> &[u8] {
        let start = self.geometry.sector_start(index).unwrap() as usize;
        let size = self.geometry.sector_size(index).unwrap() as usize;
        &self.flash[start..start + size]
    }

    fn send(&mut self, text: &str) {
        self.tx.extend(text.as_bytes());
        self.tx.extend(b"\r\n");
    }

    fn receive(&mut self, b: u8) {
        if self.dead {
            return;
        }

        if let Some((address, remaining)) = self.pending {
            let mut v = b;
            if remaining == 1 && self.corrupt_staging > 0 {
                self.corrupt_staging -= 1;
                v ^= 0x55;
            }
            let o = (address - self.geometry.ram_base) as usize;
            self.ram[o] = v;

            if self.echo {
                self.tx.push_back(b);
            }

            self.pending = match remaining {
                1 => None,
                n => Some((address + 1, n - 1)),
            };
            return;
        }

        if self.link == Link::Autobaud {
            if b == b'?' {
                if self.sync_silence > 0 {
                    self.sync_silence -= 1;
                } else {
                    self.send("Synchronized");
                    self.link = Link::AwaitSyncEcho;
                }
            }
            return;
        }

        match b {
            b'\r' => (),
            b'\n' => {
                let line = String::from_utf8_lossy(&self.line).to_string();
                self.line.clear();
                self.handle_line(&line);
            }
            _ => self.line.push(b),
        }
    }

    fn handle_line(&mut self, line: &str) {
        if self.echo {
            self.send(line);
        }

        match self.link {
            Link::Autobaud => (),
            Link::AwaitSyncEcho if line == "Synchronized" => {
                self.send("OK");
                self.link = Link::AwaitCrystal;
            }
            Link::AwaitSyncEcho => self.link = Link::Autobaud,
            Link::AwaitCrystal => {
                if line.parse::<u32>().is_ok() {
                    self.send("OK");
                    self.link = Link::Command;
                }
            }
            Link::Command => {
                self.log.push(line.to_string());

                if let Some(n) = self.drop_after {
                    if self.log.len() > n {
                        self.dead = true;
                        return;
                    }
                }

                self.command(line);
            }
        }
    }

    fn code(&mut self, code: u32) {
        self.send(&code.to_string());
    }

    fn command(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let op = match parts.next().and_then(|p| p.chars().next()) {
            Some(c) => c,
            None => return self.code(1),
        };
        let args: Vec<u32> = parts.filter_map(|p| p.parse().ok()).collect();

        if let Some(n) = self.busy.get_mut(&op) {
            if *n > 0 {
                *n -= 1;
                return self.code(11);
            }
        }

        let arg = |i: usize| args.get(i).cloned().unwrap_or(u32::MAX);

        match op {
            'U' if arg(0) == 23130 => {
                self.unlocked = true;
                self.code(0)
            }
            'U' => self.code(16),
            'A' => {
                self.echo = arg(0) == 1;
                self.code(0)
            }
            'B' => {
                self.baud = arg(0);
                self.code(0)
            }
            'W' => {
                let (address, count) = (arg(0), arg(1));
                if !self.in_ram(address, count) {
                    return self.code(3);
                }
                if count % 4 != 0 {
                    return self.code(6);
                }
                self.code(0);
                if count > 0 {
                    self.pending = Some((address, count as usize));
                }
            }
            'R' => {
                let (address, count) = (arg(0), arg(1));
                match self.memory(address, count) {
                    Some(data) => {
                        self.code(0);
                        self.tx.extend(data);
                    }
                    None => self.code(2),
                }
            }
            'P' => {
                let (start, end) = (arg(0) as usize, arg(1) as usize);
                if start > end || end >= self.geometry.sector_count() {
                    return self.code(7);
                }
                self.prepared = Some((start, end));
                self.code(0)
            }
            'E' => {
                let (start, end) = (arg(0) as usize, arg(1) as usize);
                if !self.unlocked {
                    return self.code(15);
                }
                if !self.is_prepared(start, end) {
                    return self.code(9);
                }
                for s in start..=end {
                    let a = self.geometry.sector_start(s).unwrap() as usize;
                    let n = self.geometry.sector_size(s).unwrap() as usize;
                    for b in &mut self.flash[a..a + n] {
                        *b = 0xFF;
                    }
                }
                self.prepared = None;
                self.code(0)
            }
            'I' => {
                let (start, end) = (arg(0) as usize, arg(1) as usize);
                if start > end || end >= self.geometry.sector_count() {
                    return self.code(7);
                }
                let a = self.geometry.sector_start(start).unwrap() as usize;
                let b = (self.geometry.sector_start(end).unwrap()
                    + self.geometry.sector_size(end).unwrap()) as usize;

                let found = self.flash[a..b]
                    .chunks(4)
                    .position(|w| w.iter().any(|v| *v != 0xFF));
                match found {
                    None => self.code(0),
                    Some(i) => {
                        let o = a + i * 4;
                        let w = &self.flash[o..o + 4];
                        let value = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
                        self.code(8);
                        self.send(&(i * 4).to_string());
                        self.send(&value.to_string());
                    }
                }
            }
            'C' => {
                let (flash, ram, count) = (arg(0), arg(1), arg(2));
                if !self.unlocked {
                    return self.code(15);
                }
                if ![64, 128, 256, 512, 1024, 4096].contains(&count) {
                    return self.code(6);
                }
                if !self.in_ram(ram, count) {
                    return self.code(2);
                }
                let sector = match self.geometry.sector_of(flash) {
                    Some(s) if flash as u64 + count as u64 <= self.geometry.flash_end() as u64 => s,
                    _ => return self.code(3),
                };
                if !self.is_prepared(sector, sector) {
                    return self.code(9);
                }

                let r = (ram - self.geometry.ram_base) as usize;
                let mut data = self.ram[r..r + count as usize].to_vec();
                if self.failing_copies > 0 {
                    self.failing_copies -= 1;
                    data[0] = !data[0];
                }

                // Programming only clears bits
                let f = flash as usize;
                for (i, v) in data.iter().enumerate() {
                    self.flash[f + i] &= *v;
                }

                self.copies.push((flash, self.ram[r..r + count as usize].to_vec()));
                self.prepared = None;
                self.code(0)
            }
            'G' => {
                if !self.unlocked {
                    return self.code(15);
                }
                self.code(0);
                self.dead = true;
            }
            'J' => {
                self.code(0);
                let id = self.part_id.to_string();
                self.send(&id);
            }
            'K' => {
                let (major, minor) = self.boot_version;
                self.code(0);
                self.send(&minor.to_string());
                self.send(&major.to_string());
            }
            'M' => {
                let (first, second, count) = (arg(0), arg(1), arg(2));
                match (self.memory(first, count), self.memory(second, count)) {
                    (Some(a), Some(b)) => match a.iter().zip(&b).position(|(x, y)| x != y) {
                        None => self.code(0),
                        Some(i) => {
                            self.code(10);
                            self.send(&(i & !3).to_string());
                        }
                    },
                    _ => self.code(2),
                }
            }
            'N' => {
                let uid = self.uid;
                self.code(0);
                for w in uid.iter() {
                    self.send(&w.to_string());
                }
            }
            'S' if self.supports_crc => match self.memory(arg(0), arg(1)) {
                Some(data) => {
                    let crc = crc32::checksum(&data);
                    self.code(0);
                    self.send(&crc.to_string());
                }
                None => self.code(2),
            },
            _ => self.code(1),
        }
    }

    fn in_ram(&self, address: u32, count: u32) -> bool {
        let base = self.geometry.ram_base as u64;
        let end = base + self.geometry.ram_size as u64;
        address as u64 >= base && address as u64 + count as u64 <= end
    }

    fn is_prepared(&self, start: usize, end: usize) -> bool {
        match self.prepared {
            Some((s, e)) => s <= start && end <= e,
            None => false,
        }
    }

    fn memory(&self, address: u32, count: u32) -> Option<Vec<u8>> {
        let a = address as usize;
        let n = count as usize;

        let end = address as u64 + count as u64;
        if end <= self.geometry.flash_end() as u64 {
            return Some(self.flash[a..a + n].to_vec());
        }
        if self.in_ram(address, count) {
            let o = (address - self.geometry.ram_base) as usize;
            return Some(self.ram[o..o + n].to_vec());
        }
        None
    }
}

/// Port handle onto a shared simulated device
#[derive(Clone)]
pub struct SimPort {
    pub device: Rc<RefCell<Device>>,
    pub rts: bool,
    pub dtr: bool,
    pub baud: u32,
}

impl Write<u8> for SimPort {
    type Error = ();

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.device.borrow_mut().receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for SimPort {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.device
            .borrow_mut()
            .tx
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<()> for SimPort {
    fn set_rts(&mut self, level: bool) -> Result<(), ()> {
        self.rts = level;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), ()> {
        self.dtr = level;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ()> {
        self.baud = baud;
        Ok(())
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

pub type SimSession = Session<SimPort, NoDelay, ()>;

/// Two 4 KiB sectors with a 4 KiB staging buffer
pub fn two_sectors() -> ChipGeometry {
    ChipGeometry::uniform("SIM2", 0x0000_8002, 4096, 2, 0x1000_0000, 0x2000, 0x1000_1000, 4096)
        .unwrap()
}

/// LPC810 sized part, 1 KiB sectors copied in 256 byte blocks
pub fn lpc810() -> ChipGeometry {
    ChipGeometry::uniform(
        "LPC810M021FN8",
        0x0000_8100,
        1024,
        4,
        0x1000_0000,
        0x400,
        0x1000_0300,
        256,
    )
    .unwrap()
}

/// LPC845 sized part, 64 x 1 KiB sectors
pub fn lpc845() -> ChipGeometry {
    ChipGeometry::uniform(
        "LPC845M301JBD64",
        0x0000_8451,
        1024,
        64,
        0x1000_0000,
        0x4000,
        0x1000_0800,
        1024,
    )
    .unwrap()
}

/// Short timeouts so dead links fail quickly
pub fn options() -> Options {
    Options {
        response_timeout_ms: 20,
        flash_timeout_ms: 20,
        ..Options::default()
    }
}

pub fn device(geometry: ChipGeometry) -> Rc<RefCell<Device>> {
    Rc::new(RefCell::new(Device::new(geometry)))
}

pub fn session(device: &Rc<RefCell<Device>>, options: Options) -> SimSession {
    let port = SimPort {
        device: device.clone(),
        rts: false,
        dtr: false,
        baud: 0,
    };
    Session::new(port, NoDelay, options)
}

/// Synchronized session over a fresh device
pub fn connected(geometry: ChipGeometry) -> (Rc<RefCell<Device>>, SimSession) {
    let d = device(geometry);
    let mut s = session(&d, options());
    s.connect().unwrap();
    (d, s)
}

/// Image data with a recognisable pattern
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}
